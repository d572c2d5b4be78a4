//! STRATA Stack - Layered Cache Engine
//!
//! A [`CacheStack`] fronts an ordered list of cache layers (fastest/smallest
//! first, slowest/largest last) with a coordinated get-or-compute protocol:
//!
//! - **Stale-while-revalidate**: unexpired-but-stale entries are served
//!   immediately while a background task refreshes them.
//! - **Single-flight**: concurrent callers for the same missing or expired
//!   key share one value-factory invocation through a per-key lock table.
//! - **Back-population**: a hit in a lower-priority layer is copied up into
//!   every higher-priority layer in the background.
//! - **Extensions**: pluggable interceptors wrap refreshes and observe
//!   updates, evictions, and flushes.
//!
//! Storage backends implement [`CacheLayer`]; [`MemoryCacheLayer`] is the
//! in-tree reference implementation and test substrate.

pub mod extension;
pub mod keylock;
pub mod layer;
pub mod memory;
pub mod stack;
pub mod stats;

pub use extension::{CacheExtension, ExtensionContainer, RefreshFuture, RefreshJob, TracingExtension};
pub use keylock::{KeyLockTable, LockAttempt};
pub use layer::{CacheLayer, CacheValue};
pub use memory::MemoryCacheLayer;
pub use stack::{CacheStack, CacheStackBuilder};
pub use stats::{StackStats, StatsSnapshot};

// Re-export core types for downstream convenience
pub use strata_core::{
    CacheEntry, CacheEntryStatus, CacheSettings, CacheUpdateType, Clock, ExtensionError,
    LayerError, RefreshError, StateError, StrataError, StrataResult, SystemClock, ValidationError,
};
