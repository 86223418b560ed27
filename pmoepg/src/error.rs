//! Error types for the EPG store and live cache

use crate::entry::ChannelId;

/// Result type alias for EPG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fetching or merging programme data
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or provider failure; retried on a fixed backoff
    #[error("EPG fetch failed: {0}")]
    TransientFetch(String),

    /// A record could not be normalized into a programme entry
    #[error("Malformed EPG data for channel {channel}: {reason}")]
    MalformedData { channel: ChannelId, reason: String },

    /// Channel id the cache has never been told about
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    /// The refresh coordinator is not running
    #[error("EPG cache is stopped")]
    Stopped,

    /// The EPG source is switched off in the configuration
    #[error("EPG is disabled in the configuration")]
    Disabled,

    /// Configuration error (from pmoconfig/anyhow)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transient fetch error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientFetch(msg.into())
    }

    /// Create a malformed data error for one channel
    pub fn malformed(channel: ChannelId, reason: impl Into<String>) -> Self {
        Self::MalformedData {
            channel,
            reason: reason.into(),
        }
    }

    /// Create a generic error from a string
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
