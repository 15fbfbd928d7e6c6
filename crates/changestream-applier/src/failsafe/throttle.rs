//! Rate-limited success and failure summaries.
//!
//! A busy partition can process thousands of events per second, so outcomes
//! are counted and summarized at most once per interval instead of logged one
//! by one. Time comes from an injected [`Clock`] so the windowing can be
//! driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Default summary interval.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

#[derive(Debug, Default)]
struct Window {
    count: u64,
    last_logged: Option<Instant>,
}

impl Window {
    /// Count one outcome; return the number to report if a summary is due.
    fn record(&mut self, now: Instant, interval: Duration) -> Option<u64> {
        self.count += 1;
        let due = match self.last_logged {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        };
        if !due {
            return None;
        }
        self.last_logged = Some(now);
        Some(std::mem::take(&mut self.count))
    }
}

/// Counts outcomes and logs a summary at most once per interval for each
/// of successes and failures.
#[derive(Debug)]
pub struct ThrottledLogger<C: Clock = SystemClock> {
    clock: C,
    interval: Duration,
    successes: Window,
    failures: Window,
}

impl Default for ThrottledLogger<SystemClock> {
    fn default() -> Self {
        Self::new(SystemClock, DEFAULT_LOG_INTERVAL)
    }
}

impl<C: Clock> ThrottledLogger<C> {
    pub fn new(clock: C, interval: Duration) -> Self {
        Self {
            clock,
            interval,
            successes: Window::default(),
            failures: Window::default(),
        }
    }

    /// Count a success. Returns the summarized count when a line was logged.
    pub fn record_success(&mut self) -> Option<u64> {
        let summary = self.successes.record(self.clock.now(), self.interval);
        if let Some(count) = summary {
            info!("Applied {} change events since the last report", count);
        }
        summary
    }

    /// Count a failure. Returns the summarized count when a line was logged.
    pub fn record_failure(&mut self) -> Option<u64> {
        let summary = self.failures.record(self.clock.now(), self.interval);
        if let Some(count) = summary {
            warn!("{} change events failed since the last report", count);
        }
        summary
    }
}
