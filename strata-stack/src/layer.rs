//! Cache layer trait and cacheable value marker.
//!
//! A layer is one storage backend in the ordered stack. The stack only ever
//! talks to layers through this trait; in-memory, on-disk, and remote
//! backends all plug in here.

use async_trait::async_trait;
use strata_core::{CacheEntry, StrataResult};

/// Marker trait for values the stack can cache.
///
/// Entries are cloned when fanned out to key-lock waiters and when written
/// to multiple layers, so payloads must be `Clone`. Payloads cross task
/// boundaries during background refresh, hence `Send + Sync + 'static`.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// One storage backend in the ordered stack.
///
/// # Failure contract
///
/// During a read probe, a failing `get` (or a `false` from `is_available`)
/// means "layer unavailable for this key": the stack falls through to the
/// next layer and never turns a transient fault into a miss-driven refresh
/// storm. Write failures are the caller's problem and propagate.
///
/// # Keys
///
/// Keys are opaque UTF-8 strings. The stack imposes no length limit; a
/// backend may impose its own and report violations as `LayerError::Backend`.
#[async_trait]
pub trait CacheLayer<T: CacheValue>: Send + Sync {
    /// Read the entry stored under `key`, expired or not.
    ///
    /// Layers do not filter by expiry; freshness policy lives in the stack.
    /// A layer MAY drop expired entries on its own schedule and report them
    /// as absent.
    async fn get(&self, key: &str) -> StrataResult<Option<CacheEntry<T>>>;

    /// Store `entry` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, entry: CacheEntry<T>) -> StrataResult<()>;

    /// Remove the entry stored under `key`, if any.
    async fn evict(&self, key: &str) -> StrataResult<()>;

    /// Remove every entry in the layer.
    async fn flush(&self) -> StrataResult<()>;

    /// Opportunistically remove expired entries.
    async fn cleanup(&self) -> StrataResult<()>;

    /// Fast health/partition check.
    ///
    /// A remote layer may report `false` during a network outage; the stack
    /// skips it for the current operation.
    async fn is_available(&self, key: &str) -> bool;

    /// Release backend resources. Called once during stack teardown.
    async fn teardown(&self) -> StrataResult<()> {
        Ok(())
    }
}
