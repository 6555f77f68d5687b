//! Idle-instance pool.
//!
//! An unbounded multi-producer/multi-consumer bag of idle guest instances.
//! An instance is in the pool exactly when no `handle` call is executing on
//! it; the pool is what serializes access to each instance's linear memory.

use std::sync::{Mutex, PoisonError};

use crate::runtime::Guest;

/// LIFO bag of idle instances. No fairness guarantee.
pub(crate) struct InstancePool<C> {
    idle: Mutex<Vec<Guest<C>>>,
}

impl<C> InstancePool<C> {
    pub(crate) fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Pop an idle instance, if any.
    pub(crate) fn acquire(&self) -> Option<Guest<C>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    /// Return an instance to the pool.
    ///
    /// Callers must only release instances whose `handle` call returned
    /// cleanly; a trapped instance is dropped instead.
    pub(crate) fn release(&self, guest: Guest<C>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(guest);
    }

    /// Number of idle instances currently pooled.
    pub(crate) fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
