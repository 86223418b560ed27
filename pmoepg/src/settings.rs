//! Tuning of the live refresh cycle.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Floor of the wake delay (seconds)
pub const DEFAULT_MIN_REFRESH_SECS: u64 = 60;

/// Ceiling of the wake delay (seconds)
pub const DEFAULT_MAX_REFRESH_SECS: u64 = 3600;

/// Fixed delay before retrying a failed fetch (seconds)
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// How long finished programmes stay cached for time-shifted queries
/// (seconds)
pub const DEFAULT_RETENTION_SECS: u64 = 3 * 3600;

/// Added to the time left of the nearest programme so the wake-up lands
/// strictly after it ends (seconds)
pub const DEFAULT_EXPIRY_MARGIN_SECS: u64 = 1;

/// Delays used by the refresh coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub min_refresh_secs: u64,
    pub max_refresh_secs: u64,
    pub retry_delay_secs: u64,
    pub expiry_margin_secs: u64,
    pub retention_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            min_refresh_secs: DEFAULT_MIN_REFRESH_SECS,
            max_refresh_secs: DEFAULT_MAX_REFRESH_SECS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            expiry_margin_secs: DEFAULT_EXPIRY_MARGIN_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl RefreshSettings {
    pub fn validate(&self) -> Result<()> {
        if self.min_refresh_secs == 0 {
            return Err(Error::other("min_refresh_secs must be positive"));
        }
        if self.min_refresh_secs > self.max_refresh_secs {
            return Err(Error::other(format!(
                "min_refresh_secs ({}) exceeds max_refresh_secs ({})",
                self.min_refresh_secs, self.max_refresh_secs
            )));
        }
        if self.retry_delay_secs == 0 {
            return Err(Error::other("retry_delay_secs must be positive"));
        }
        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_refresh_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_refresh_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        // Far beyond any useful horizon, and small enough for DateTime math
        const CAP_SECS: u64 = 100 * 365 * 24 * 3600;
        chrono::Duration::seconds(self.retention_secs.min(CAP_SECS) as i64)
    }

    /// Wake delay for a nearest expiry `seconds_left` away (negative when
    /// already expired); the ceiling when nothing is cached.
    pub fn wake_delay(&self, seconds_left: Option<i64>) -> Duration {
        let Some(left) = seconds_left else {
            return self.max_delay();
        };
        let wanted = left.saturating_add(self.expiry_margin_secs as i64);
        let secs = wanted.clamp(self.min_refresh_secs as i64, self.max_refresh_secs as i64);
        Duration::from_secs(secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RefreshSettings::default();
        assert_eq!(s.min_delay(), Duration::from_secs(60));
        assert_eq!(s.max_delay(), Duration::from_secs(3600));
        assert_eq!(s.retry_delay(), Duration::from_secs(60));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_wake_delay_is_clamped() {
        let s = RefreshSettings::default();
        assert_eq!(s.wake_delay(Some(10)), Duration::from_secs(60));
        assert_eq!(s.wake_delay(Some(-500)), Duration::from_secs(60));
        assert_eq!(s.wake_delay(Some(2 * 3600)), Duration::from_secs(3600));
        assert_eq!(s.wake_delay(Some(599)), Duration::from_secs(600));
        assert_eq!(s.wake_delay(None), Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let s = RefreshSettings {
            min_refresh_secs: 600,
            max_refresh_secs: 60,
            ..Default::default()
        };
        assert!(s.validate().is_err());

        let s = RefreshSettings {
            min_refresh_secs: 0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_retention() {
        let s = RefreshSettings::default();
        assert_eq!(s.retention(), chrono::Duration::hours(3));
        let s = RefreshSettings {
            retention_secs: u64::MAX,
            ..Default::default()
        };
        assert!(s.retention() > chrono::Duration::days(365));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let s: RefreshSettings = serde_yaml::from_str("max_refresh_secs: 900\n").unwrap();
        assert_eq!(s.max_refresh_secs, 900);
        assert_eq!(s.min_refresh_secs, DEFAULT_MIN_REFRESH_SECS);
    }
}
