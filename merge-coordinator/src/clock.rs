//! Monotonic-enough clock abstraction, so the extend-timeout path is
//! reachable in tests without a real multi-minute sleep — the async
//! equivalent of the original system's
//! `monkeypatch.setattr(time, "monotonic", ...)`.
//!
//! Must be a true epoch, not a process-relative offset: `Job.extend_started`
//! is persisted and read back by a *different* process after a crash, so
//! `now_secs()` has to mean the same thing across that restart.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Wall-clock time, seconds since the Unix epoch.
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs()
    }
}
