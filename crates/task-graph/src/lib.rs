//! Dependency graph primitives for the taskforge engine.
//!
//! This crate holds the pure DAG layer: typed dependency edges over opaque
//! task ids, hard-cycle rejection, topological ordering with priority
//! tie-breaks, parallel-group derivation, and critical-path analysis.
//! It knows nothing about scheduling, lifecycles, or persistence; callers
//! supply priorities and durations per query.

pub mod error;
pub mod graph;

pub use error::{Error, Result};
pub use graph::{DependencyEdge, DependencyGraph, DependencyImpact, EdgeKind, GraphMetadata};
