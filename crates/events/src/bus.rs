//! Event distribution.
//!
//! taskforge has exactly one producer, the scheduler task, and any number
//! of consumers (progress streams, monitors, tests). Events therefore go
//! straight into a tokio broadcast channel: posting never blocks and never
//! allocates a queue, and a consumer that falls behind loses its own
//! events, not the engine's time. Each receiver carries its subscription
//! filter and a running count of what it lost to lag.

use crate::event::{EngineEvent, EventFilter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus for engine events.
///
/// Shutdown is a flag, not a channel teardown: posting handles start
/// failing immediately, while events already in the channel stay readable
/// by subscribers that have not drained them yet.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    open: Arc<AtomicBool>,
}

impl EventBus {
    /// Bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with an explicit capacity. Oldest events are dropped per
    /// subscriber once it falls this far behind.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Post an event. Returns the number of subscribers it reached; posts
    /// to a shut-down bus are dropped and return zero.
    pub fn post(&self, event: EngineEvent) -> usize {
        if !self.open.load(Ordering::Acquire) {
            return 0;
        }
        self.tx.send(event).unwrap_or(0)
    }

    /// A cheap posting handle for the scheduler task.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
            open: Arc::clone(&self.open),
        }
    }

    /// Stop accepting events. Safe to call more than once.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Whether the bus still accepts events.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Subscribe to every event posted after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribe_filtered(EventFilter::all())
    }

    /// Subscribe through a filter. Non-matching events are discarded on
    /// the receiving side, so a narrow subscription costs the engine
    /// nothing extra.
    #[must_use]
    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
            filter,
            skipped: 0,
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Posting handle handed to the scheduler task.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<EngineEvent>,
    open: Arc<AtomicBool>,
}

impl EventSender {
    /// Post an event through this handle. Returns the number of
    /// subscribers it reached.
    ///
    /// # Errors
    ///
    /// [`SendError::Closed`] once the bus has shut down.
    pub fn send(&self, event: EngineEvent) -> Result<usize, SendError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        Ok(self.tx.send(event).unwrap_or(0))
    }

    /// Whether the bus has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }
}

/// A filtered subscription to the event stream.
#[derive(Debug)]
pub struct EventReceiver {
    rx: broadcast::Receiver<EngineEvent>,
    filter: EventFilter,
    skipped: u64,
}

impl EventReceiver {
    /// Next matching event, or `None` once the bus and every posting
    /// handle are gone. A receiver that falls behind loses the oldest
    /// events; the loss is counted and logged, and the stream continues.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(lost)) => {
                    self.skipped += lost;
                    tracing::warn!(
                        lost,
                        total_lost = self.skipped,
                        "subscriber lagged behind the event bus"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event without waiting, or `None` when the stream is
    /// currently empty or gone.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(lost)) => {
                    self.skipped += lost;
                    tracing::warn!(
                        lost,
                        total_lost = self.skipped,
                        "subscriber lagged behind the event bus"
                    );
                }
                Err(
                    broadcast::error::TryRecvError::Empty
                    | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }

    /// Events this subscription lost to lag so far.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// The subscription's filter.
    #[must_use]
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

/// Error returned when posting to a shut-down bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The bus has shut down.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "event bus is closed"),
        }
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCategory, SystemEvent, TaskEvent};
    use uuid::Uuid;

    fn health_event() -> EngineEvent {
        EngineEvent::new(EventCategory::System(SystemEvent::HealthCheck {
            overall: "healthy".into(),
        }))
    }

    fn progress_event(task_id: Uuid) -> EngineEvent {
        EngineEvent::new(EventCategory::Task(TaskEvent::Progress {
            task_id,
            progress: 50.0,
        }))
    }

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        assert_eq!(bus.post(health_event()), 2);

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a.name(), "system.health_check");
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn subscription_starts_at_the_present() {
        let bus = EventBus::new();
        // Nobody is listening yet; the event reaches zero subscribers.
        assert_eq!(bus.post(health_event()), 0);

        let mut rx = bus.subscribe();
        bus.post(health_event());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn filtered_receiver_discards_non_matching() {
        let bus = EventBus::new();
        let task_id = Uuid::new_v4();
        let mut rx = bus.subscribe_filtered(EventFilter::for_task(task_id));

        bus.post(progress_event(Uuid::new_v4()));
        bus.post(health_event());
        bus.post(progress_event(task_id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), Some(task_id));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn shutdown_fails_senders_and_drops_posts() {
        let bus = EventBus::new();
        let sender = bus.sender();
        assert!(!sender.is_closed());

        bus.shutdown();
        assert!(!bus.is_open());
        assert!(sender.is_closed());
        assert_eq!(sender.send(health_event()), Err(SendError::Closed));
        assert_eq!(bus.post(health_event()), 0);
        // Calling again is harmless.
        bus.shutdown();
    }

    #[tokio::test]
    async fn lagging_receiver_counts_its_losses() {
        let bus = EventBus::with_capacity(1);
        let mut rx = bus.subscribe();

        for _ in 0..3 {
            bus.post(health_event());
        }

        // Only the newest event survived; the other two are accounted for.
        assert!(rx.recv().await.is_some());
        assert_eq!(rx.skipped(), 2);
        assert!(rx.try_recv().is_none());
    }
}
