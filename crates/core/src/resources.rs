//! Counted resource pool.
//!
//! The pool is owned and mutated by the scheduler task only; workers ask for
//! reservation by message. A task consumes one unit of each named resource
//! for its whole run. Reservation is all-or-nothing.

use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Capacity and current reservations of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Total units.
    pub capacity: u32,
    /// Units currently reserved. Always `<= capacity`.
    pub reserved: u32,
}

impl ResourceState {
    /// Free units.
    #[must_use]
    pub fn available(self) -> u32 {
        self.capacity.saturating_sub(self.reserved)
    }
}

/// Named, counted resource pool with per-task reservation tracking.
#[derive(Debug, Default)]
pub struct ResourcePool {
    pools: BTreeMap<String, ResourceState>,
    holders: HashMap<TaskId, BTreeSet<String>>,
}

impl ResourcePool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool seeded from capacity entries.
    #[must_use]
    pub fn with_capacities(capacities: &BTreeMap<String, u32>) -> Self {
        let mut pool = Self::new();
        for (name, &capacity) in capacities {
            pool.set_capacity(name, capacity);
        }
        pool
    }

    /// Install or update the capacity of a resource. Never lowers the
    /// capacity below the currently reserved amount.
    pub fn set_capacity(&mut self, name: &str, capacity: u32) {
        let entry = self.pools.entry(name.to_string()).or_insert(ResourceState {
            capacity: 0,
            reserved: 0,
        });
        entry.capacity = capacity.max(entry.reserved);
    }

    /// Free units of a resource. Unknown resources have zero capacity.
    #[must_use]
    pub fn available(&self, name: &str) -> u32 {
        self.pools.get(name).map_or(0, |s| s.available())
    }

    /// Whether every named resource has at least one free unit.
    #[must_use]
    pub fn can_reserve(&self, resources: &BTreeSet<String>) -> bool {
        resources.iter().all(|r| self.available(r) >= 1)
    }

    /// Reserve one unit of every named resource for a task, atomically.
    ///
    /// Returns the name of the first unavailable resource on failure; the
    /// pool is left untouched in that case.
    pub fn reserve(&mut self, task: TaskId, resources: &BTreeSet<String>) -> Result<(), String> {
        if let Some(short) = resources.iter().find(|r| self.available(r) < 1) {
            return Err(short.clone());
        }
        for name in resources {
            if let Some(state) = self.pools.get_mut(name) {
                state.reserved += 1;
            }
        }
        if !resources.is_empty() {
            self.holders.insert(task, resources.clone());
            debug!(task = %task, count = resources.len(), "reserved resources");
        }
        Ok(())
    }

    /// Release everything a task holds. Returns the released names.
    pub fn release(&mut self, task: TaskId) -> Vec<String> {
        let Some(held) = self.holders.remove(&task) else {
            return Vec::new();
        };
        for name in &held {
            if let Some(state) = self.pools.get_mut(name) {
                state.reserved = state.reserved.saturating_sub(1);
            }
        }
        debug!(task = %task, count = held.len(), "released resources");
        held.into_iter().collect()
    }

    /// Fraction of total capacity currently reserved, in `[0, 1]`.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let (reserved, capacity) = self
            .pools
            .values()
            .fold((0u64, 0u64), |(r, c), s| {
                (r + u64::from(s.reserved), c + u64::from(s.capacity))
            });
        if capacity == 0 {
            0.0
        } else {
            reserved as f64 / capacity as f64
        }
    }

    /// Current state of every pool.
    #[must_use]
    pub fn states(&self) -> &BTreeMap<String, ResourceState> {
        &self.pools
    }

    /// Resources currently held by a task.
    #[must_use]
    pub fn held_by(&self, task: TaskId) -> Option<&BTreeSet<String>> {
        self.holders.get(&task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let mut pool = ResourcePool::new();
        pool.set_capacity("cpu", 2);
        pool.set_capacity("network", 1);

        let task = Uuid::new_v4();
        pool.reserve(task, &set(&["cpu", "network"])).unwrap();
        assert_eq!(pool.available("cpu"), 1);
        assert_eq!(pool.available("network"), 0);

        let released = pool.release(task);
        assert_eq!(released, vec!["cpu".to_string(), "network".to_string()]);
        assert_eq!(pool.available("cpu"), 2);
        assert_eq!(pool.available("network"), 1);
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let mut pool = ResourcePool::new();
        pool.set_capacity("cpu", 1);
        // "gpu" has no pool, so capacity is zero.
        let task = Uuid::new_v4();
        let err = pool.reserve(task, &set(&["cpu", "gpu"])).unwrap_err();
        assert_eq!(err, "gpu");
        assert_eq!(pool.available("cpu"), 1);
        assert!(pool.held_by(task).is_none());
    }

    #[test]
    fn reserved_never_exceeds_capacity() {
        let mut pool = ResourcePool::new();
        pool.set_capacity("cpu", 1);
        pool.reserve(Uuid::new_v4(), &set(&["cpu"])).unwrap();
        assert!(pool.reserve(Uuid::new_v4(), &set(&["cpu"])).is_err());
        assert_eq!(pool.states()["cpu"].reserved, 1);
    }

    #[test]
    fn release_of_unknown_task_is_a_no_op() {
        let mut pool = ResourcePool::new();
        pool.set_capacity("cpu", 1);
        assert!(pool.release(Uuid::new_v4()).is_empty());
        assert_eq!(pool.available("cpu"), 1);
    }

    #[test]
    fn utilization_reflects_reservations() {
        let mut pool = ResourcePool::new();
        assert_eq!(pool.utilization(), 0.0);
        pool.set_capacity("cpu", 4);
        pool.reserve(Uuid::new_v4(), &set(&["cpu"])).unwrap();
        assert!((pool.utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_capacity_resource_is_never_reservable() {
        let mut pool = ResourcePool::new();
        pool.set_capacity("license", 0);
        assert!(!pool.can_reserve(&set(&["license"])));
        assert!(pool.reserve(Uuid::new_v4(), &set(&["license"])).is_err());
    }
}
