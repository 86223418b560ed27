//! Time source shared by the schedules and the live cache.
//!
//! The clock reads wall-clock time (or a manually driven base time) and
//! applies an adjustable offset, so the whole EPG layer can follow a
//! provider's server time or a time-shifted playback position.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
enum Base {
    System,
    Manual(DateTime<Utc>),
}

#[derive(Debug)]
struct ClockState {
    base: Base,
    offset: Duration,
}

/// Cloneable "now" source with an adjustable offset.
///
/// Clones share their state: changing the offset through one handle is
/// seen by every schedule and cache built from the same clock.
#[derive(Debug, Clone)]
pub struct Clock {
    state: Arc<RwLock<ClockState>>,
}

impl Clock {
    /// Clock following the system time
    pub fn system() -> Self {
        Self::with_base(Base::System)
    }

    /// Clock frozen at `at` until moved with [`Clock::advance`]
    pub fn manual(at: DateTime<Utc>) -> Self {
        Self::with_base(Base::Manual(at))
    }

    fn with_base(base: Base) -> Self {
        Self {
            state: Arc::new(RwLock::new(ClockState {
                base,
                offset: Duration::zero(),
            })),
        }
    }

    /// Current time, offset applied
    pub fn now(&self) -> DateTime<Utc> {
        let state = self.state.read();
        let base = match state.base {
            Base::System => Utc::now(),
            Base::Manual(t) => t,
        };
        base + state.offset
    }

    pub fn offset(&self) -> Duration {
        self.state.read().offset
    }

    pub fn set_offset(&self, offset: Duration) {
        debug!(offset_secs = offset.num_seconds(), "Clock offset changed");
        self.state.write().offset = offset;
    }

    /// Adjusts the offset so that [`Clock::now`] currently reads `t`
    pub fn sync_to(&self, t: DateTime<Utc>) {
        let mut state = self.state.write();
        let base = match state.base {
            Base::System => Utc::now(),
            Base::Manual(b) => b,
        };
        state.offset = t - base;
        debug!(offset_secs = state.offset.num_seconds(), "Clock synchronised");
    }

    /// Moves a manual clock forward. No effect on a system clock.
    pub fn advance(&self, delta: Duration) {
        let mut state = self.state.write();
        if let Base::Manual(ref mut t) = state.base {
            *t += delta;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_manual_clock_applies_offset() {
        let clock = Clock::manual(t0());
        assert_eq!(clock.now(), t0());

        clock.set_offset(Duration::seconds(90));
        assert_eq!(clock.now(), t0() + Duration::seconds(90));
        assert_eq!(clock.offset(), Duration::seconds(90));
    }

    #[test]
    fn test_clones_share_offset() {
        let clock = Clock::manual(t0());
        let other = clock.clone();
        other.set_offset(Duration::minutes(-5));
        assert_eq!(clock.now(), t0() - Duration::minutes(5));
    }

    #[test]
    fn test_sync_to_and_advance() {
        let clock = Clock::manual(t0());
        let target = t0() + Duration::hours(2);
        clock.sync_to(target);
        assert_eq!(clock.now(), target);

        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), target + Duration::seconds(30));
        assert_eq!(clock.offset(), Duration::hours(2));
    }

    #[test]
    fn test_system_clock_is_close_to_utc_now() {
        let clock = Clock::system();
        clock.advance(Duration::hours(5));
        let drift = (clock.now() - Utc::now()).num_seconds().abs();
        assert!(drift < 5);
    }
}
