//! Bounded free list of event records.
//!
//! Join actions hold one [`EventRecord`] per required event. Records are
//! checked out with [`EventPool::obtain`] when an action is registered and
//! handed back with [`EventPool::recycle`] when the action goes away, so a
//! host that registers and drops actions at a high rate reuses the same
//! allocations (including each record's name buffer).
//!
//! The pool never fails: when the free list is empty a fresh record is
//! allocated, and when it is full a recycled record is simply dropped.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{EventSnapshot, EventStatus};

/// Default number of records kept on the free list.
pub const DEFAULT_POOL_CAPACITY: usize = 50;

/// A named event slot owned by exactly one join action while checked out.
#[derive(Default)]
pub struct EventRecord {
    name: String,
    status: EventStatus,
    extra: i32,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl EventRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn extra(&self) -> i32 {
        self.extra
    }

    /// Record an observation of this event.
    pub fn observe(
        &mut self,
        success: bool,
        extra: i32,
        payload: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        self.status = EventStatus::from_success(success);
        self.extra = extra;
        self.payload = payload;
    }

    /// Forget any observation, keeping the name.
    pub fn reset(&mut self) {
        self.status = EventStatus::Waiting;
        self.extra = 0;
        self.payload = None;
    }

    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            name: self.name.clone(),
            status: self.status,
            extra: self.extra,
            payload: self.payload.clone(),
        }
    }
}

impl std::fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecord")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

/// Shared pool of [`EventRecord`]s.
///
/// Owned by an engine (and shareable through `Arc`); there is no process-wide
/// instance.
pub struct EventPool {
    free: Mutex<Vec<EventRecord>>,
    capacity: usize,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a record for `name`, reset to [`EventStatus::Waiting`].
    pub fn obtain(&self, name: &str) -> EventRecord {
        let recycled = self.lock().pop();
        let mut record = recycled.unwrap_or_default();
        record.name.clear();
        record.name.push_str(name);
        record.reset();
        record
    }

    /// Return a record to the free list. Dropped if the list is full.
    pub fn recycle(&self, mut record: EventRecord) {
        // Release the payload now rather than when the record is reused.
        record.payload = None;
        let mut free = self.lock();
        if free.len() < self.capacity {
            free.push(record);
        }
    }

    /// Drop every pooled record.
    pub fn release(&self) {
        let mut free = self.lock();
        free.clear();
        free.shrink_to_fit();
    }

    /// Number of records ready for reuse.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EventRecord>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .finish()
    }
}
