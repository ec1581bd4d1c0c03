//! Time sources and periodic deadlines.
//!
//! The core never reads the wall clock directly. Production code uses
//! [`SystemClock`]; tests drive a [`VirtualClock`] so retry and timeout logic
//! is deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic millisecond time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Milliseconds elapsed since the clock was created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // Offset by one so a fresh clock never reports the "never" timestamp.
        self.start.elapsed().as_millis() as u64 + 1
    }
}

/// A manually advanced clock shared between clones.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A periodic deadline.
#[derive(Debug, Clone)]
pub struct Ticker {
    interval: u64,
    next: u64,
}

impl Ticker {
    pub fn new(interval: Duration, now: u64) -> Self {
        let interval = (interval.as_millis() as u64).max(1);
        Self {
            interval,
            next: now + interval,
        }
    }

    /// Returns true once per elapsed interval; missed ticks are skipped.
    pub fn due(&mut self, now: u64) -> bool {
        if now < self.next {
            return false;
        }
        let missed = (now - self.next) / self.interval;
        self.next += (missed + 1) * self.interval;
        true
    }

    pub fn next_deadline(&self) -> u64 {
        self.next
    }
}
