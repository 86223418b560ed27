//! Programme guide (EPG) store and live refresh cache for IPTV front-ends
//!
//! This crate keeps per-channel programme timelines and a background
//! coordinator that refreshes "now / next" information right after the
//! programmes currently airing end.
//!
//! # Features
//!
//! - **Channel schedules**: ordered, non-overlapping timelines with
//!   binary-searched lookups, a cached "current" position and a record of
//!   which calendar days were fully loaded
//! - **Live cache**: a single tokio task that wakes when the nearest
//!   programme ends (clamped between one minute and one hour), retries
//!   failed fetches after a fixed delay and coalesces overlapping triggers
//! - **Notifications**: subscribers receive the channels whose current
//!   programme changed after each cycle
//! - **Configuration Extension**: refresh delays and clock offset read from
//!   pmoconfig
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use chrono::{DateTime, FixedOffset};
//! use pmoepg::{
//!     ChannelId, Clock, CurrentProgrammes, EpgProvider, LiveEpgCache, ProgrammeRecord,
//!     RefreshSettings, Result,
//! };
//!
//! struct NoGuide;
//!
//! #[async_trait]
//! impl EpgProvider for NoGuide {
//!     async fn current_programmes(&self, _channels: &[ChannelId]) -> Result<CurrentProgrammes> {
//!         Ok(CurrentProgrammes::new())
//!     }
//!
//!     async fn day_programmes(
//!         &self,
//!         _channel: ChannelId,
//!         _day_start: DateTime<FixedOffset>,
//!     ) -> Result<Vec<ProgrammeRecord>> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut cache = LiveEpgCache::new(Arc::new(NoGuide), [1, 2], Clock::system(), RefreshSettings::default());
//! cache.start();
//! println!("{:?}", cache.current(1));
//! cache.stop().await;
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod entry;
pub mod error;
pub mod live;
pub mod provider;
pub mod schedule;
pub mod settings;
pub mod subscribers;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

// Re-exports
pub use cache::LiveEpgCache;
pub use clock::Clock;
pub use entry::{ChannelId, ProgrammeEntry, ProgrammeRecord};
pub use error::{Error, Result};
pub use live::{CycleReport, LiveEpgState, RefreshPlan, RefreshState};
pub use provider::{CurrentProgrammes, EpgProvider};
pub use schedule::{ChannelSchedule, DayLookup};
pub use settings::RefreshSettings;
pub use subscribers::{EpgUpdate, EpgUpdateCallback, Subscribers, SubscriptionId};

#[cfg(feature = "pmoconfig")]
pub use config_ext::EpgConfigExt;
