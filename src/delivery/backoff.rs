//! Retry backoff for one server
//!
//! Each ACK-required send starts the next delay from the server's delay
//! table. A table entry of 0 waits for a connectivity change instead of a
//! timer. Any inbound message from the server clears the backoff.

use tracing::{trace, warn};

use crate::scheduler::Millis;

/// Delay used when a table entry is missing or not a number
pub const DEFAULT_BACKOFF_MS: Millis = 10_000;

/// What the next backoff period waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffWait {
    Timer(Millis),
    Connectivity,
}

#[derive(Debug, Default, Clone)]
pub struct Backoff {
    index: usize,
    until_timer: bool,
    until_connectivity: bool,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_backed_off(&self) -> bool {
        self.until_timer || self.until_connectivity
    }

    /// Start the next backoff period
    ///
    /// # Arguments
    ///
    /// * `delays` - Delay table in seconds, as read from the server's setting
    ///
    /// # Returns
    ///
    /// * `BackoffWait` - The caller schedules the timer for `Timer`
    pub fn next(&mut self, delays: &[String]) -> BackoffWait {
        let delay_ms = match delays.get(self.index) {
            Some(entry) => match entry.trim().parse::<Millis>() {
                Ok(seconds) => seconds * 1000,
                Err(_) => {
                    warn!(index = self.index, "Backoff delay is not a number: {}", entry);
                    DEFAULT_BACKOFF_MS
                }
            },
            None => DEFAULT_BACKOFF_MS,
        };

        if self.index + 1 < delays.len() {
            self.index += 1;
        } else {
            self.index = 0;
        }

        if delay_ms > 0 {
            self.until_timer = true;
            BackoffWait::Timer(delay_ms)
        } else {
            self.until_connectivity = true;
            BackoffWait::Connectivity
        }
    }

    pub fn timer_expired(&mut self) {
        self.until_timer = false;
    }

    pub fn connectivity_changed(&mut self) {
        self.until_connectivity = false;
    }

    /// Stop any backoff and restart the table; the caller cancels the timer
    pub fn clear(&mut self) {
        trace!("Backoff cleared");
        *self = Self::default();
    }
}
