//! # Task Scheduler
//!
//! Named, cancellable one-shot timers driven by a monotonic millisecond clock.
//!
//! Every protocol component owns one `Scheduler` keyed by its own task enum.
//! The owning event loop feeds the current time in and runs whatever
//! `take_due` hands back, so state machines stay deterministic under test.

use std::fmt::Debug;

/// Monotonic time in milliseconds
pub type Millis = u64;

#[derive(Debug, Clone)]
struct Entry<T> {
    tag: T,
    deadline: Millis,
}

/// Single-owner timer queue with one pending entry per tag
#[derive(Debug, Clone)]
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: Copy + PartialEq + Debug> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `tag` to fire `delay_ms` after `now`
    ///
    /// A pending entry with the same tag is replaced.
    pub fn schedule(&mut self, tag: T, delay_ms: Millis, now: Millis) {
        self.cancel(tag);
        self.entries.push(Entry {
            tag,
            deadline: now.saturating_add(delay_ms),
        });
    }

    /// Remove a pending task, returns true if one was pending
    pub fn cancel(&mut self, tag: T) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.tag != tag);
        before != self.entries.len()
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_scheduled(&self, tag: T) -> bool {
        self.entries.iter().any(|e| e.tag == tag)
    }

    /// Deadline of a pending task
    pub fn deadline(&self, tag: T) -> Option<Millis> {
        self.entries.iter().find(|e| e.tag == tag).map(|e| e.deadline)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Millis> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Remove and return every task whose deadline is at or before `now`
    ///
    /// Tasks are returned in deadline order; ties keep scheduling order.
    pub fn take_due(&mut self, now: Millis) -> Vec<T> {
        let mut due: Vec<Entry<T>> = Vec::new();
        self.entries.retain(|e| {
            if e.deadline <= now {
                due.push(e.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|e| e.deadline);
        due.into_iter().map(|e| e.tag).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
