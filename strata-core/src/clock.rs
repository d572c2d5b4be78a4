//! Injectable time source.
//!
//! Every freshness decision in the engine flows through a [`Clock`] so that
//! expiry and staleness behavior can be driven deterministically in tests.

use chrono::{DateTime, Utc};

/// Time source for the cache engine.
///
/// Implementations must be cheap to call; `now` sits on the hot read path.
pub trait Clock: Send + Sync {
    /// Get the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
