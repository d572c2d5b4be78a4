//! Cache stack orchestration: layered reads, writes, back-population, refresh.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use strata_core::{
    CacheEntry, CacheEntryStatus, CacheSettings, CacheUpdateType, Clock, LayerError, RefreshError,
    StateError, StrataResult, SystemClock, ValidationError,
};

use crate::extension::{CacheExtension, ExtensionContainer, RefreshJob};
use crate::keylock::{KeyLockTable, LockAttempt, WaiterResult};
use crate::layer::{CacheLayer, CacheValue};
use crate::stats::{StackStats, StatsSnapshot};

/// Why a refresh is running; decides blocking behavior and the update tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    Miss,
    Expired,
    Stale,
}

struct StackInner<T: CacheValue> {
    /// Index 0 is highest priority. Immutable after construction.
    layers: Vec<Arc<dyn CacheLayer<T>>>,
    extensions: ExtensionContainer<T>,
    clock: Arc<dyn Clock>,
    key_locks: KeyLockTable<T>,
    stats: StackStats,
    disposed: AtomicBool,
}

/// A coordinated stack of cache layers.
///
/// Cloning is cheap (shared internals); background refresh and
/// back-population tasks hold clones. Construct through
/// [`CacheStack::builder`].
///
/// # Freshness protocol
///
/// [`get`] is a raw probe for diagnostics and administration: it returns the
/// first entry any available layer holds, expired or not. All freshness
/// policy lives in [`get_or_set`], which classifies the probe result as
/// fresh, stale, expired, or missing and refreshes accordingly.
///
/// [`get`]: CacheStack::get
/// [`get_or_set`]: CacheStack::get_or_set
pub struct CacheStack<T: CacheValue> {
    inner: Arc<StackInner<T>>,
}

impl<T: CacheValue> Clone for CacheStack<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: CacheValue> fmt::Debug for CacheStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStack").finish_non_exhaustive()
    }
}

/// Releases the key lock exactly once, delivering a cancellation error to
/// waiters if the owner's future is dropped before completing.
struct OwnerGuard<'a, T: CacheValue> {
    stack: &'a CacheStack<T>,
    key: &'a str,
    armed: bool,
}

impl<'a, T: CacheValue> OwnerGuard<'a, T> {
    fn new(stack: &'a CacheStack<T>, key: &'a str) -> Self {
        Self {
            stack,
            key,
            armed: true,
        }
    }

    fn complete(mut self, result: WaiterResult<T>) {
        self.armed = false;
        self.stack.inner.key_locks.release(self.key, result);
    }
}

impl<T: CacheValue> Drop for OwnerGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.stack.inner.key_locks.release(
                self.key,
                Err(RefreshError::Cancelled {
                    key: self.key.to_string(),
                }
                .into()),
            );
        }
    }
}

impl<T: CacheValue> CacheStack<T> {
    /// Start building a stack.
    pub fn builder() -> CacheStackBuilder<T> {
        CacheStackBuilder::new()
    }

    /// Read the raw entry for `key`, consulting layers top to bottom.
    ///
    /// No freshness filtering: an expired entry is returned as-is. A layer
    /// that is unavailable or fails the read is skipped.
    pub async fn get(&self, key: &str) -> StrataResult<Option<CacheEntry<T>>> {
        self.ensure_live("get")?;
        Self::validate_key(key)?;
        Ok(self.probe(key).await.map(|(_, entry)| entry))
    }

    /// Get a fresh value for `key`, computing one when needed.
    ///
    /// - Fresh hit: returns the cached value.
    /// - Hit in a lower layer: returns the value and back-populates the
    ///   layers above it in the background.
    /// - Stale hit (`settings.stale_after`): returns the value and refreshes
    ///   in the background.
    /// - Miss or expired: refreshes before returning. Concurrent callers for
    ///   the same key share one factory invocation; the rest park on the key
    ///   lock and receive the winner's entry (or its error).
    ///
    /// The factory receives the previous value when one exists.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        settings: &CacheSettings,
    ) -> StrataResult<T>
    where
        F: FnOnce(Option<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.ensure_live("get_or_set")?;
        Self::validate_key(key)?;
        settings.validate()?;

        let now = self.inner.clock.now();

        match self.probe(key).await {
            None => {
                self.inner.stats.record_miss();
                self.refresh_blocking(key, factory, settings, None, RefreshMode::Miss, now)
                    .await
            }
            Some((layer_index, entry)) => {
                if entry.is_expired(now) {
                    self.inner.stats.record_expiration();
                    self.refresh_blocking(
                        key,
                        factory,
                        settings,
                        Some(entry),
                        RefreshMode::Expired,
                        now,
                    )
                    .await
                } else if entry.is_stale(now, settings) {
                    self.inner.stats.record_stale_hit();
                    self.spawn_background_refresh(key, factory, settings, entry.clone(), now);
                    Ok(entry.value)
                } else if layer_index > 0 {
                    self.inner.stats.record_hit();
                    self.spawn_back_population(key, entry.clone(), layer_index);
                    Ok(entry.value)
                } else {
                    self.inner.stats.record_hit();
                    Ok(entry.value)
                }
            }
        }
    }

    /// Write `value` to every layer with the given lifetime.
    ///
    /// Caller-initiated overwrites are authoritative: they do not take the
    /// key lock, and the last writer wins per layer.
    pub async fn set(&self, key: &str, value: T, ttl: Duration) -> StrataResult<CacheEntry<T>> {
        self.ensure_live("set")?;
        Self::validate_key(key)?;
        if ttl.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "time_to_live",
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        let entry = CacheEntry::with_ttl(value, self.inner.clock.now(), ttl);
        self.set_entry(key, entry.clone()).await?;
        Ok(entry)
    }

    /// Write a pre-built entry to every layer, top to bottom.
    pub async fn set_entry(&self, key: &str, entry: CacheEntry<T>) -> StrataResult<()> {
        self.ensure_live("set_entry")?;
        Self::validate_key(key)?;
        self.write_through(key, &entry).await?;
        self.inner
            .extensions
            .on_update(key, entry.expiry, CacheUpdateType::AddOrUpdateEntry)
            .await
    }

    /// Remove `key` from every layer; the first layer failure aborts.
    pub async fn evict(&self, key: &str) -> StrataResult<()> {
        self.ensure_live("evict")?;
        Self::validate_key(key)?;
        for (index, layer) in self.inner.layers.iter().enumerate() {
            layer.evict(key).await.map_err(|err| LayerError::OperationFailed {
                layer_index: index,
                operation: "evict",
                reason: err.to_string(),
            })?;
        }
        self.inner.extensions.on_eviction(key).await
    }

    /// Empty every layer; the first layer failure aborts.
    pub async fn flush(&self) -> StrataResult<()> {
        self.ensure_live("flush")?;
        for (index, layer) in self.inner.layers.iter().enumerate() {
            layer.flush().await.map_err(|err| LayerError::OperationFailed {
                layer_index: index,
                operation: "flush",
                reason: err.to_string(),
            })?;
        }
        self.inner.extensions.on_flush().await
    }

    /// Ask every layer to drop expired entries.
    pub async fn cleanup(&self) -> StrataResult<()> {
        self.ensure_live("cleanup")?;
        for (index, layer) in self.inner.layers.iter().enumerate() {
            layer.cleanup().await.map_err(|err| LayerError::OperationFailed {
                layer_index: index,
                operation: "cleanup",
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }

    /// The layers, highest priority first.
    pub fn layers(&self) -> &[Arc<dyn CacheLayer<T>>] {
        &self.inner.layers
    }

    /// The extension pipeline.
    pub fn extensions(&self) -> &ExtensionContainer<T> {
        &self.inner.extensions
    }

    /// Point-in-time hit statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// True once [`dispose`](CacheStack::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Tear the stack down: layers first, then extensions. Idempotent.
    ///
    /// Teardown always runs to completion; individual layer or extension
    /// teardown failures are logged and skipped.
    pub async fn dispose(&self) -> StrataResult<()> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for (index, layer) in self.inner.layers.iter().enumerate() {
            if let Err(err) = layer.teardown().await {
                warn!(layer = index, error = %err, "layer teardown failed");
            }
        }
        self.inner.extensions.teardown().await;
        debug!("cache stack disposed");
        Ok(())
    }

    // ========================================================================
    // Read path internals
    // ========================================================================

    /// Walk layers top to bottom; first available layer with an entry wins.
    ///
    /// A read failure in any layer is treated as "unavailable for this key"
    /// and falls through, so a faulted middle layer never aborts the probe
    /// and a faulted top layer never manufactures a refresh stampede.
    async fn probe(&self, key: &str) -> Option<(usize, CacheEntry<T>)> {
        for (index, layer) in self.inner.layers.iter().enumerate() {
            if !layer.is_available(key).await {
                debug!(key, layer = index, "cache layer unavailable, skipping");
                continue;
            }
            match layer.get(key).await {
                Ok(Some(entry)) => return Some((index, entry)),
                Ok(None) => {}
                Err(err) => {
                    warn!(key, layer = index, error = %err, "cache layer read failed, treating as unavailable");
                }
            }
        }
        None
    }

    // ========================================================================
    // Refresh path
    // ========================================================================

    /// Blocking refresh for a miss or expired entry.
    async fn refresh_blocking<F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        settings: &CacheSettings,
        prior: Option<CacheEntry<T>>,
        mode: RefreshMode,
        now: DateTime<Utc>,
    ) -> StrataResult<T>
    where
        F: FnOnce(Option<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        loop {
            match self.inner.key_locks.try_acquire(key) {
                LockAttempt::Acquired => {
                    return self
                        .refresh_as_owner(key, factory, settings, prior, mode, now)
                        .await;
                }
                LockAttempt::AlreadyHeld => {
                    // Another writer may have finished while we classified;
                    // a usable entry means we never need to park.
                    if let Some((_, entry)) = self.probe(key).await {
                        if entry.status(now, settings) == CacheEntryStatus::Hit {
                            return Ok(entry.value);
                        }
                    }
                    match self.inner.key_locks.wait(key) {
                        Some(receiver) => {
                            return match receiver.await {
                                Ok(result) => result.map(|entry| entry.value),
                                // The owner vanished without releasing; the
                                // guard should make this unreachable, but a
                                // parked caller must never hang.
                                Err(_) => Err(RefreshError::Cancelled {
                                    key: key.to_string(),
                                }
                                .into()),
                            };
                        }
                        // Released between the probe and wait; retry the
                        // acquire, most likely winning it this time.
                        None => continue,
                    }
                }
            }
        }
    }

    /// Refresh while holding the key lock. Always releases, delivering the
    /// produced entry or error to every parked waiter.
    async fn refresh_as_owner<F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        settings: &CacheSettings,
        prior: Option<CacheEntry<T>>,
        mode: RefreshMode,
        now: DateTime<Utc>,
    ) -> StrataResult<T>
    where
        F: FnOnce(Option<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let guard = OwnerGuard::new(self, key);

        // Race recovery: between the classifying probe and winning the lock,
        // another writer may have produced a fresh entry.
        if mode == RefreshMode::Miss {
            if let Some((_, existing)) = self.probe(key).await {
                if !existing.is_expired(now) {
                    let value = existing.value.clone();
                    guard.complete(Ok(existing));
                    return Ok(value);
                }
            }
        }

        let prior_value = prior.map(|entry| entry.value);
        let stack = self.clone();
        let key_owned = key.to_string();
        let settings_owned = settings.clone();
        let job: RefreshJob<'_, T> = Box::new(move || {
            Box::pin(async move {
                stack
                    .run_refresh(&key_owned, factory, &settings_owned, prior_value, mode, now)
                    .await
            })
        });

        match self.inner.extensions.with_refresh(key, job, settings).await {
            Ok(entry) => {
                self.inner.stats.record_refresh();
                let value = entry.value.clone();
                guard.complete(Ok(entry));
                Ok(value)
            }
            Err(err) => {
                self.inner.stats.record_refresh_failure();
                guard.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// The innermost refresh job: run the factory, build the entry, write it
    /// through every layer, fire `on_update`.
    async fn run_refresh<F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        settings: &CacheSettings,
        prior_value: Option<T>,
        mode: RefreshMode,
        now: DateTime<Utc>,
    ) -> StrataResult<CacheEntry<T>>
    where
        F: FnOnce(Option<T>) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: fmt::Display,
    {
        let new_value = factory(prior_value)
            .await
            .map_err(|err| RefreshError::FactoryFailed {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        let entry = CacheEntry::with_ttl(new_value, now, settings.time_to_live);
        self.write_through(key, &entry).await?;
        let update_type = match mode {
            RefreshMode::Miss => CacheUpdateType::AddEntry,
            RefreshMode::Expired | RefreshMode::Stale => CacheUpdateType::AddOrUpdateEntry,
        };
        self.inner
            .extensions
            .on_update(key, entry.expiry, update_type)
            .await?;
        Ok(entry)
    }

    /// Write an entry to every layer in priority order. Failures propagate;
    /// partial writes are not rolled back.
    async fn write_through(&self, key: &str, entry: &CacheEntry<T>) -> StrataResult<()> {
        for (index, layer) in self.inner.layers.iter().enumerate() {
            layer
                .set(key, entry.clone())
                .await
                .map_err(|err| LayerError::OperationFailed {
                    layer_index: index,
                    operation: "set",
                    reason: err.to_string(),
                })?;
        }
        Ok(())
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Fire-and-forget refresh for a stale hit. If the key lock is already
    /// held a refresh is in flight and this one is dropped.
    fn spawn_background_refresh<F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        settings: &CacheSettings,
        prior: CacheEntry<T>,
        now: DateTime<Utc>,
    ) where
        F: FnOnce(Option<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let stack = self.clone();
        let key = key.to_string();
        let settings = settings.clone();
        tokio::spawn(async move {
            if stack.inner.key_locks.try_acquire(&key) != LockAttempt::Acquired {
                return;
            }
            if let Err(err) = stack
                .refresh_as_owner(&key, factory, &settings, Some(prior), RefreshMode::Stale, now)
                .await
            {
                warn!(key = %key, error = %err, "background refresh failed");
            }
        });
    }

    /// Copy a lower-layer hit into every layer above it.
    ///
    /// Piggy-backs on the key lock so it cannot clash with a concurrent
    /// refresh or another back-population; if the lock is held, the active
    /// writer will populate every layer itself.
    fn spawn_back_population(&self, key: &str, entry: CacheEntry<T>, hit_layer_index: usize) {
        let stack = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if stack.inner.key_locks.try_acquire(&key) != LockAttempt::Acquired {
                return;
            }
            for index in (0..hit_layer_index).rev() {
                let layer = &stack.inner.layers[index];
                if !layer.is_available(&key).await {
                    continue;
                }
                if let Err(err) = layer.set(&key, entry.clone()).await {
                    warn!(key = %key, layer = index, error = %err, "back-population write failed");
                }
            }
            stack.inner.stats.record_back_population();
            stack.inner.key_locks.release(&key, Ok(entry));
        });
    }

    // ========================================================================
    // Guards
    // ========================================================================

    fn ensure_live(&self, operation: &'static str) -> StrataResult<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            Err(StateError::Disposed { operation }.into())
        } else {
            Ok(())
        }
    }

    fn validate_key(key: &str) -> StrataResult<()> {
        if key.is_empty() {
            Err(ValidationError::EmptyKey.into())
        } else {
            Ok(())
        }
    }
}

/// Builder for [`CacheStack`].
pub struct CacheStackBuilder<T: CacheValue> {
    layers: Vec<Arc<dyn CacheLayer<T>>>,
    extensions: Vec<Arc<dyn CacheExtension<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T: CacheValue> CacheStackBuilder<T> {
    /// Start with no layers, no extensions, and the system clock.
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            extensions: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Append a layer. The first appended layer is the highest priority.
    pub fn layer(mut self, layer: impl CacheLayer<T> + 'static) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    /// Append an already-shared layer.
    pub fn shared_layer(mut self, layer: Arc<dyn CacheLayer<T>>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Register an extension. Registration order is pipeline order.
    pub fn extension(mut self, extension: impl CacheExtension<T> + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Register an already-shared extension.
    pub fn shared_extension(mut self, extension: Arc<dyn CacheExtension<T>>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Replace the clock. Tests inject a manual clock here.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the stack. Fails when no layers were added.
    pub fn build(self) -> StrataResult<CacheStack<T>> {
        if self.layers.is_empty() {
            return Err(ValidationError::NoLayers.into());
        }
        let stack = CacheStack {
            inner: Arc::new(StackInner {
                layers: self.layers,
                extensions: ExtensionContainer::new(self.extensions),
                clock: self.clock,
                key_locks: KeyLockTable::new(),
                stats: StackStats::default(),
                disposed: AtomicBool::new(false),
            }),
        };
        stack.inner.extensions.attach(&stack);
        Ok(stack)
    }
}

impl<T: CacheValue> Default for CacheStackBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
