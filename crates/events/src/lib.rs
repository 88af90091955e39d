//! Structured event system for the taskforge engine.
//!
//! The engine posts typed [`EngineEvent`]s to an [`EventBus`]; any number of
//! subscribers (progress streams, monitors, tests) consume them through
//! broadcast receivers. Each receiver carries its own [`EventFilter`] and a
//! count of events lost to lag, so slow or narrow subscribers never block
//! the engine and their losses stay observable.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventReceiver, EventSender, SendError};
pub use event::{
    EngineEvent, EventCategory, EventFilter, PersistenceEvent, QueueEvent, ResourceEvent,
    SystemEvent, TaskEvent,
};
