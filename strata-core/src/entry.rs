//! Cache entry and read/write classification types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::CacheSettings;

/// An immutable value/expiry pair stored under a key.
///
/// An entry never changes after construction; refreshes replace it wholesale.
/// The payload may itself be an absent-value (`Option`, empty collection);
/// nullability is the payload's concern, not the entry's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The stored value.
    pub value: T,
    /// Absolute moment after which the entry must not be served as a hit.
    pub expiry: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Create an entry with an explicit expiry instant.
    pub fn new(value: T, expiry: DateTime<Utc>) -> Self {
        Self { value, expiry }
    }

    /// Create an entry expiring `ttl` after `now`.
    pub fn with_ttl(value: T, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        Self {
            value,
            expiry: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// True once the expiry instant has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// The instant this entry becomes stale, when the settings enable SWR.
    ///
    /// Defined as `expiry - stale_after`; `None` when `stale_after` is unset.
    pub fn stale_at(&self, settings: &CacheSettings) -> Option<DateTime<Utc>> {
        let stale_after = settings.stale_after?;
        let stale_after = ChronoDuration::from_std(stale_after).unwrap_or(ChronoDuration::MAX);
        Some(
            self.expiry
                .checked_sub_signed(stale_after)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }

    /// True when the entry is unexpired but past its staleness threshold.
    pub fn is_stale(&self, now: DateTime<Utc>, settings: &CacheSettings) -> bool {
        !self.is_expired(now)
            && self
                .stale_at(settings)
                .map(|stale_at| stale_at < now)
                .unwrap_or(false)
    }

    /// Classify this entry for a read at `now`.
    ///
    /// `Miss` is never produced here; an absent entry is the stack's concern.
    pub fn status(&self, now: DateTime<Utc>, settings: &CacheSettings) -> CacheEntryStatus {
        if self.is_expired(now) {
            CacheEntryStatus::Expired
        } else if self.is_stale(now, settings) {
            CacheEntryStatus::Stale
        } else {
            CacheEntryStatus::Hit
        }
    }

    /// Map the stored value to a new type, preserving the expiry.
    pub fn map<U, F>(self, f: F) -> CacheEntry<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheEntry {
            value: f(self.value),
            expiry: self.expiry,
        }
    }
}

/// Outcome classification for a stack read; drives refresh dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheEntryStatus {
    /// Fresh entry, no action needed.
    Hit,
    /// Unexpired but past the staleness threshold; refresh in background.
    Stale,
    /// Past expiry; refresh before returning.
    Expired,
    /// No entry in any layer; refresh before returning.
    Miss,
}

/// Tags write events for extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheUpdateType {
    /// The prior state was a true miss.
    AddEntry,
    /// The write replaced or may have replaced an existing entry.
    AddOrUpdateEntry,
}
