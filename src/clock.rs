//! Commit timestamps.
//!
//! Every revision interval and branch head is expressed in milliseconds since
//! the Unix epoch. The store needs strictly increasing values: two commits
//! issued in the same millisecond must still be ordered.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Source of commit timestamps.
pub trait Clock: Send + Sync {
    /// Return a timestamp strictly greater than any previously returned one.
    fn now(&self) -> Timestamp;
}

/// Wall clock that never repeats or goes backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known floor, e.g. the highest head found in an existing index.
    pub fn starting_after(floor: Timestamp) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    /// Make sure future timestamps are greater than `floor`.
    pub fn observe(&self, floor: Timestamp) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(wall.max(last + 1)))
            .unwrap_or_else(|last| last);
        wall.max(previous + 1)
    }
}
