//! STRATA Test Utilities
//!
//! Centralized test infrastructure for the STRATA workspace:
//! - A manual clock for deterministic expiry and staleness
//! - An instrumented layer wrapper for fault injection
//! - A recording extension for pipeline-order assertions

// Re-export core types for convenience
pub use strata_core::{
    CacheEntry, CacheEntryStatus, CacheSettings, CacheUpdateType, Clock, LayerError, RefreshError,
    StrataError, StrataResult, SystemClock,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use strata_stack::{CacheExtension, CacheLayer, CacheValue, RefreshJob};

// ============================================================================
// MANUAL CLOCK
// ============================================================================

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so a clock handed to a stack
/// and its layers stays in sync with the test driving it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock pinned at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock pinned at 2024-01-01T00:00:00Z, the scenario epoch.
    pub fn at_epoch() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let delta = ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX);
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    /// Pin the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// FAULT-INJECTING LAYER
// ============================================================================

/// Wraps a layer with switchable failure and availability behavior.
pub struct FlakyLayer<T: CacheValue> {
    inner: Arc<dyn CacheLayer<T>>,
    available: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<T: CacheValue> FlakyLayer<T> {
    /// Wrap `inner`; starts healthy.
    pub fn new(inner: impl CacheLayer<T> + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            available: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Toggle what `is_available` reports.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every `get` fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every `set` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn backend_error(operation: &'static str) -> StrataError {
        LayerError::Backend {
            operation,
            reason: "injected failure".to_string(),
        }
        .into()
    }
}

#[async_trait]
impl<T: CacheValue> CacheLayer<T> for FlakyLayer<T> {
    async fn get(&self, key: &str) -> StrataResult<Option<CacheEntry<T>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::backend_error("get"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: CacheEntry<T>) -> StrataResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::backend_error("set"));
        }
        self.inner.set(key, entry).await
    }

    async fn evict(&self, key: &str) -> StrataResult<()> {
        self.inner.evict(key).await
    }

    async fn flush(&self) -> StrataResult<()> {
        self.inner.flush().await
    }

    async fn cleanup(&self) -> StrataResult<()> {
        self.inner.cleanup().await
    }

    async fn is_available(&self, _key: &str) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

// ============================================================================
// RECORDING EXTENSION
// ============================================================================

/// One observed extension hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionEvent {
    Attached,
    RefreshStarted { key: String },
    RefreshFinished { key: String, succeeded: bool },
    Updated { key: String, update_type: CacheUpdateType },
    Evicted { key: String },
    Flushed,
    TornDown,
}

/// Extension that records every hook call for later assertions.
#[derive(Default)]
pub struct RecordingExtension {
    events: Mutex<Vec<ExtensionEvent>>,
}

impl RecordingExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the events observed so far.
    pub fn events(&self) -> Vec<ExtensionEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: ExtensionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl<T: CacheValue> CacheExtension<T> for RecordingExtension {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn on_attach(&self, _stack: &strata_stack::CacheStack<T>) {
        self.record(ExtensionEvent::Attached);
    }

    async fn with_refresh<'a>(
        &'a self,
        key: &'a str,
        next: RefreshJob<'a, T>,
        _settings: &'a CacheSettings,
    ) -> StrataResult<CacheEntry<T>> {
        self.record(ExtensionEvent::RefreshStarted {
            key: key.to_string(),
        });
        let result = next().await;
        self.record(ExtensionEvent::RefreshFinished {
            key: key.to_string(),
            succeeded: result.is_ok(),
        });
        result
    }

    async fn on_update(
        &self,
        key: &str,
        _expiry: DateTime<Utc>,
        update_type: CacheUpdateType,
    ) -> StrataResult<()> {
        self.record(ExtensionEvent::Updated {
            key: key.to_string(),
            update_type,
        });
        Ok(())
    }

    async fn on_eviction(&self, key: &str) -> StrataResult<()> {
        self.record(ExtensionEvent::Evicted {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn on_flush(&self) -> StrataResult<()> {
        self.record(ExtensionEvent::Flushed);
        Ok(())
    }

    async fn on_teardown(&self) -> StrataResult<()> {
        self.record(ExtensionEvent::TornDown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();

        clock.advance(Duration::from_secs(50));
        assert_eq!(clock.now(), start + ChronoDuration::seconds(50));

        let twin = clock.clone();
        twin.advance(Duration::from_secs(10));
        assert_eq!(clock.now(), start + ChronoDuration::seconds(60));
    }

    #[test]
    fn recording_extension_accumulates_events() {
        let extension = RecordingExtension::new();
        extension.record(ExtensionEvent::Flushed);
        extension.record(ExtensionEvent::Evicted {
            key: "k".to_string(),
        });
        assert_eq!(extension.events().len(), 2);
    }
}
