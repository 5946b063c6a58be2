//! Trailing-edge debounce
//!
//! Scheduling again before the deadline pushes the deadline back, so a burst
//! of calls fires once, `delay` after the last call. The owner drives it by
//! passing the current time; the session task sleeps until [`Debouncer::deadline`].

use std::time::Duration;

use tokio::time::Instant;

/// Default selection broadcast delay
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or re-arm) the timer
    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm and return true if the deadline has passed
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_fires_once_after_last_call() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100));

        debouncer.schedule(start);
        debouncer.schedule(start + Duration::from_millis(60));
        assert!(!debouncer.fire_if_due(start + Duration::from_millis(120)));
        assert!(debouncer.fire_if_due(start + Duration::from_millis(160)));
        assert!(!debouncer.fire_if_due(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut debouncer = Debouncer::default();
        debouncer.schedule(start);
        assert!(debouncer.is_armed());

        debouncer.cancel();
        assert!(debouncer.deadline().is_none());
        assert!(!debouncer.fire_if_due(start + Duration::from_secs(1)));
    }
}
