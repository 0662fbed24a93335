//! A small time abstraction so that checkpoint-flush cadence and backoff
//! delays can be driven deterministically in tests.
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A point in time, as produced by a [`TimeProvider`].
pub type Time = DateTime<Utc>;

/// Anything that can tell you what time it is.
///
/// Abstracting this away from `Utc::now()` lets tests advance the clock
/// explicitly instead of sleeping on wall time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new [`SystemProvider`].
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Utc::now()
    }
}

/// A [`TimeProvider`] whose value is set explicitly by the test driving it.
#[derive(Debug, Clone)]
pub struct MockProvider {
    now: Arc<Mutex<Time>>,
}

impl MockProvider {
    /// Create a new [`MockProvider`] starting at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: Time) {
        *self.now.lock() = now;
    }

    /// Advance the current time by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).expect("duration too large");
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances_explicitly() {
        let start = Utc::now();
        let mock = MockProvider::new(start);
        assert_eq!(mock.now(), start);

        mock.advance(Duration::from_secs(10));
        assert_eq!(mock.now(), start + chrono::Duration::seconds(10));
    }

    #[test]
    fn system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let t0 = provider.now();
        std::thread::sleep(Duration::from_millis(5));
        let t1 = provider.now();
        assert!(t1 >= t0);
    }
}
