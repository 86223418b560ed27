//! Provider port: what the EPG core expects from a provider adapter.

use crate::entry::{ChannelId, ProgrammeRecord};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;

/// Response of a batch "what is on now" request.
///
/// Each channel maps to its records, the currently airing one first; an
/// empty list means the provider has nothing for that channel. Channels
/// missing from the map are treated the same way.
pub type CurrentProgrammes = HashMap<ChannelId, Vec<ProgrammeRecord>>;

/// Source of programme data, implemented by provider adapters.
///
/// Implementations perform network I/O and may fail; the cache treats any
/// error as transient and retries later.
#[async_trait]
pub trait EpgProvider: Send + Sync {
    /// Currently airing programmes for `channels`
    async fn current_programmes(&self, channels: &[ChannelId]) -> Result<CurrentProgrammes>;

    /// Every programme of the local day starting at `day_start`, in any
    /// order
    async fn day_programmes(
        &self,
        channel: ChannelId,
        day_start: DateTime<FixedOffset>,
    ) -> Result<Vec<ProgrammeRecord>>;
}
