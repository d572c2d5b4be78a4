//! Freshness configuration for get-or-set operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{StrataResult, ValidationError};

/// Per-call cache settings.
///
/// `time_to_live` bounds the lifetime of entries produced by a refresh.
/// `stale_after`, when set, enables stale-while-revalidate: an unexpired
/// entry older than `time_to_live - stale_after` is served immediately while
/// a background refresh replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Lifetime of entries created by refreshes.
    pub time_to_live: Duration,
    /// Threshold for background refresh; `None` disables SWR.
    pub stale_after: Option<Duration>,
}

impl CacheSettings {
    /// Create settings with the given time-to-live and no staleness window.
    pub fn new(time_to_live: Duration) -> Self {
        Self {
            time_to_live,
            stale_after: None,
        }
    }

    /// Enable stale-while-revalidate with the given window.
    ///
    /// Must satisfy `0 < stale_after < time_to_live` for [`validate`] to pass.
    ///
    /// [`validate`]: CacheSettings::validate
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// Validate the settings.
    pub fn validate(&self) -> StrataResult<()> {
        if self.time_to_live.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "time_to_live",
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if let Some(stale_after) = self.stale_after {
            if stale_after.is_zero() {
                return Err(ValidationError::InvalidValue {
                    field: "stale_after",
                    reason: "must be greater than zero".to_string(),
                }
                .into());
            }
            if stale_after >= self.time_to_live {
                return Err(ValidationError::InvalidValue {
                    field: "stale_after",
                    reason: format!(
                        "must be shorter than time_to_live ({:?} >= {:?})",
                        stale_after, self.time_to_live
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}
