//! Minute-granularity clocks for ban windows

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current minute
pub trait Clock: Send + Sync {
    /// Minutes since the Unix epoch
    fn now_minute(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_minute(&self) -> i64 {
        chrono::Utc::now().timestamp().div_euclid(60)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    minute: AtomicI64,
}

impl ManualClock {
    pub fn new(minute: i64) -> Self {
        Self {
            minute: AtomicI64::new(minute),
        }
    }

    pub fn set(&self, minute: i64) {
        self.minute.store(minute, Ordering::SeqCst);
    }

    pub fn advance(&self, minutes: i64) {
        self.minute.fetch_add(minutes, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_minute(&self) -> i64 {
        self.minute.load(Ordering::SeqCst)
    }
}
