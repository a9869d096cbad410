//! Deadline values for the worker's single timer arm.
//!
//! Nothing here sleeps. Owners ask for a deadline, the worker sleeps until
//! the earliest one, then calls `fire` with the current instant.

use std::time::Duration;

use tokio::time::Instant;

/// Trailing-edge debounce: every `arm` pushes the deadline out again
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once per arming, when the deadline has passed
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Periodic {
    interval: Duration,
    next: Instant,
}

impl Periodic {
    pub fn new(first: Instant, interval: Duration) -> Self {
        Self {
            interval,
            next: first,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    pub fn fire(&mut self, now: Instant) -> bool {
        if self.next <= now {
            self.next = now + self.interval;
            true
        } else {
            false
        }
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debouncer_trailing_edge() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(5));
        assert!(!debouncer.fire(start + Duration::from_secs(60)));

        debouncer.arm(start);
        debouncer.arm(start + Duration::from_secs(3));
        assert!(!debouncer.fire(start + Duration::from_secs(5)));
        assert!(debouncer.fire(start + Duration::from_secs(8)));
        assert!(!debouncer.fire(start + Duration::from_secs(9)));
        assert!(!debouncer.is_armed());
    }

    #[test]
    fn test_periodic_rearms_from_fire_time() {
        let start = Instant::now();
        let mut periodic = Periodic::new(start + Duration::from_secs(15), Duration::from_secs(100));
        assert!(!periodic.fire(start));
        assert!(periodic.fire(start + Duration::from_secs(20)));
        assert_eq!(periodic.deadline(), start + Duration::from_secs(120));
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest([None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest([None, None]), None);
    }
}
