//! Extension pipeline: refresh wrappers and lifecycle listeners.
//!
//! Extensions intercept the act of refreshing a value (distributed locking,
//! metrics, timeouts) and observe stack-wide writes, evictions, and flushes.
//! The container composes all registered extensions into a single pipeline:
//! refresh wrappers nest in registration order (the first registered
//! extension is outermost), listener hooks fan out to every extension.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use strata_core::{CacheEntry, CacheSettings, CacheUpdateType, ExtensionError, StrataResult};

use crate::layer::CacheValue;
use crate::stack::CacheStack;

/// Boxed future produced by a refresh job or wrapper.
pub type RefreshFuture<'a, T> = BoxFuture<'a, StrataResult<CacheEntry<T>>>;

/// The continuation handed to a refresh wrapper.
///
/// Invoking it runs the rest of the pipeline: inner wrappers, the user's
/// value factory, the write-through, and the update hooks. A wrapper may
/// call it at most once, and may decline to call it at all (returning its
/// own entry or error instead).
pub type RefreshJob<'a, T> = Box<dyn FnOnce() -> RefreshFuture<'a, T> + Send + 'a>;

/// Pluggable interceptor around refresh and stack lifecycle events.
///
/// All hooks have no-op defaults; implement only what the extension needs.
/// An extension is registered with exactly one stack and must not be shared
/// across stacks.
#[async_trait]
pub trait CacheExtension<T: CacheValue>: Send + Sync {
    /// Short identifier used in logs and error attribution.
    fn name(&self) -> &'static str;

    /// Called once when the owning stack is built.
    ///
    /// The stack is cheaply clonable; an extension that needs to call back
    /// into it (eviction broadcasts, scheduled cleanup) keeps a clone.
    fn on_attach(&self, _stack: &CacheStack<T>) {}

    /// Wrap the act of computing and storing a fresh value.
    ///
    /// The default runs `next` directly. Wrappers compose: an extension
    /// registered earlier wraps one registered later.
    async fn with_refresh<'a>(
        &'a self,
        _key: &'a str,
        next: RefreshJob<'a, T>,
        _settings: &'a CacheSettings,
    ) -> StrataResult<CacheEntry<T>> {
        next().await
    }

    /// Fires after a successful stack-wide write.
    async fn on_update(
        &self,
        _key: &str,
        _expiry: DateTime<Utc>,
        _update_type: CacheUpdateType,
    ) -> StrataResult<()> {
        Ok(())
    }

    /// Fires after an eviction completes on every layer.
    async fn on_eviction(&self, _key: &str) -> StrataResult<()> {
        Ok(())
    }

    /// Fires after a flush completes on every layer.
    async fn on_flush(&self) -> StrataResult<()> {
        Ok(())
    }

    /// Called once during stack teardown.
    async fn on_teardown(&self) -> StrataResult<()> {
        Ok(())
    }
}

/// Composes zero or more extensions into a single pipeline.
pub struct ExtensionContainer<T> {
    extensions: Vec<Arc<dyn CacheExtension<T>>>,
}

impl<T: CacheValue> ExtensionContainer<T> {
    /// Build a container over the given extensions, in registration order.
    pub fn new(extensions: Vec<Arc<dyn CacheExtension<T>>>) -> Self {
        Self { extensions }
    }

    /// The registered extensions, in registration order.
    pub fn as_slice(&self) -> &[Arc<dyn CacheExtension<T>>] {
        &self.extensions
    }

    /// True when no extensions are registered.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Notify every extension that the stack is built.
    pub(crate) fn attach(&self, stack: &CacheStack<T>) {
        for extension in &self.extensions {
            extension.on_attach(stack);
        }
    }

    /// Run `job` through every refresh wrapper.
    ///
    /// With zero extensions this degenerates to invoking `job` directly.
    pub async fn with_refresh<'a>(
        &'a self,
        key: &'a str,
        job: RefreshJob<'a, T>,
        settings: &'a CacheSettings,
    ) -> StrataResult<CacheEntry<T>> {
        self.wrap(0, key, job, settings).await
    }

    fn wrap<'a>(
        &'a self,
        index: usize,
        key: &'a str,
        job: RefreshJob<'a, T>,
        settings: &'a CacheSettings,
    ) -> RefreshFuture<'a, T> {
        match self.extensions.get(index) {
            None => job(),
            Some(extension) => Box::pin(async move {
                let next: RefreshJob<'a, T> =
                    Box::new(move || self.wrap(index + 1, key, job, settings));
                extension.with_refresh(key, next, settings).await
            }),
        }
    }

    /// Fan `on_update` out to every extension; first failure propagates.
    pub async fn on_update(
        &self,
        key: &str,
        expiry: DateTime<Utc>,
        update_type: CacheUpdateType,
    ) -> StrataResult<()> {
        for extension in &self.extensions {
            if let Err(err) = extension.on_update(key, expiry, update_type).await {
                warn!(extension = extension.name(), key, error = %err, "on_update hook failed");
                return Err(ExtensionError::HookFailed {
                    extension: extension.name().to_string(),
                    hook: "on_update",
                    reason: err.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Fan `on_eviction` out to every extension; first failure propagates.
    pub async fn on_eviction(&self, key: &str) -> StrataResult<()> {
        for extension in &self.extensions {
            if let Err(err) = extension.on_eviction(key).await {
                warn!(extension = extension.name(), key, error = %err, "on_eviction hook failed");
                return Err(ExtensionError::HookFailed {
                    extension: extension.name().to_string(),
                    hook: "on_eviction",
                    reason: err.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Fan `on_flush` out to every extension; first failure propagates.
    pub async fn on_flush(&self) -> StrataResult<()> {
        for extension in &self.extensions {
            if let Err(err) = extension.on_flush().await {
                warn!(extension = extension.name(), error = %err, "on_flush hook failed");
                return Err(ExtensionError::HookFailed {
                    extension: extension.name().to_string(),
                    hook: "on_flush",
                    reason: err.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Tear down every extension. Failures are logged, never propagated;
    /// teardown always runs to completion.
    pub(crate) async fn teardown(&self) {
        for extension in &self.extensions {
            if let Err(err) = extension.on_teardown().await {
                warn!(extension = extension.name(), error = %err, "extension teardown failed");
            }
        }
    }
}

impl<T: CacheValue> Default for ExtensionContainer<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Extension that logs refresh and lifecycle activity through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExtension;

#[async_trait]
impl<T: CacheValue> CacheExtension<T> for TracingExtension {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn with_refresh<'a>(
        &'a self,
        key: &'a str,
        next: RefreshJob<'a, T>,
        settings: &'a CacheSettings,
    ) -> StrataResult<CacheEntry<T>> {
        debug!(key, ttl = ?settings.time_to_live, "cache refresh starting");
        match next().await {
            Ok(entry) => {
                debug!(key, expiry = %entry.expiry, "cache refresh succeeded");
                Ok(entry)
            }
            Err(err) => {
                warn!(key, error = %err, "cache refresh failed");
                Err(err)
            }
        }
    }

    async fn on_update(
        &self,
        key: &str,
        expiry: DateTime<Utc>,
        update_type: CacheUpdateType,
    ) -> StrataResult<()> {
        debug!(key, %expiry, ?update_type, "cache updated");
        Ok(())
    }

    async fn on_eviction(&self, key: &str) -> StrataResult<()> {
        debug!(key, "cache key evicted");
        Ok(())
    }

    async fn on_flush(&self) -> StrataResult<()> {
        debug!("cache flushed");
        Ok(())
    }
}
