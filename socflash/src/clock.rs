//! Time source and polling schedule primitives.
//!
//! Every bounded wait in this crate (serial polling, subprocess draining,
//! diagnostic retries) reads time and sleeps through a [`Clock`]. Production
//! code uses [`SystemClock`]; tests use [`ManualClock`], whose `sleep` only
//! advances a virtual offset, so timeout behaviour can be asserted without
//! real delays.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A monotonic time source that can also block the current thread.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Shared clock handle passed into component constructors.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by [`Instant::now`] and [`thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock.
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Virtual clock for tests: `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a shared manual clock.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move time forward without sleeping.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.offset
            .lock()
            .map(|o| *o)
            .unwrap_or_default()
    }

    /// The instant this clock started at.
    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// An absolute time limit for one bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a deadline of `budget` from `now`.
    pub fn after(now: Instant, budget: Duration) -> Self {
        Self { start: now, budget }
    }

    /// Time elapsed since the deadline was started.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    /// Whether the budget has been used up.
    pub fn expired(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.budget
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.budget
            .saturating_sub(self.elapsed(now))
    }

    /// The full budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// Fires at most once per `interval`, measured from the last [`Ticker::mark`].
///
/// A fresh ticker is due immediately.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    interval: Duration,
    last: Option<Instant>,
}

impl Ticker {
    /// Create a ticker that is due immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a full interval has passed since the last mark.
    pub fn is_due(&self, now: Instant) -> bool {
        self.last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Time since the last mark, or `None` if never marked.
    pub fn since_last(&self, now: Instant) -> Option<Duration> {
        self.last
            .map(|last| now.saturating_duration_since(last))
    }

    /// Record that the ticker fired at `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.sleep(Duration::from_secs(3));
        assert_eq!(clock.now() - t0, Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_deadline_expiry() {
        let clock = ManualClock::new();
        let deadline = Deadline::after(clock.now(), Duration::from_secs(60));
        assert!(!deadline.expired(clock.now()));
        clock.advance(Duration::from_secs(59));
        assert_eq!(deadline.remaining(clock.now()), Duration::from_secs(1));
        clock.advance(Duration::from_secs(1));
        assert!(deadline.expired(clock.now()));
        assert_eq!(deadline.remaining(clock.now()), Duration::ZERO);
    }

    #[test]
    fn test_ticker_due_immediately_then_after_interval() {
        let clock = ManualClock::new();
        let mut ticker = Ticker::new(Duration::from_secs(10));
        assert!(ticker.is_due(clock.now()));
        assert!(ticker.since_last(clock.now()).is_none());

        ticker.mark(clock.now());
        clock.advance(Duration::from_millis(9_990));
        assert!(!ticker.is_due(clock.now()));

        clock.advance(Duration::from_millis(10));
        assert!(ticker.is_due(clock.now()));
    }
}
