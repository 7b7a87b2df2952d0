//! Exponential backoff for transient queue errors.
//!
//! Delay starts at a base, doubles on each failure, caps at a maximum,
//! and resets on success.

use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_millis(100);
const DEFAULT_MAX: Duration = Duration::from_secs(10);
const MULTIPLIER: f64 = 2.0;

/// Per-task retry delay state.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The delay to wait before the next retry. Grows the window for the
    /// following failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * MULTIPLIER);
        self.current = grown.min(self.max);
        delay
    }

    /// Reset to the base delay after a success.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}
