//! Programme entries: one slot of a channel's guide.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-scoped channel identifier
pub type ChannelId = u32;

/// Normalized record handed over by a provider adapter.
///
/// Times are unix timestamps in seconds. Records are not trusted: they
/// become [`ProgrammeEntry`] values through [`ProgrammeRecord::into_entry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammeRecord {
    pub begin: i64,
    pub end: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ProgrammeRecord {
    pub fn new(begin: i64, end: i64, title: impl Into<String>) -> Self {
        Self {
            begin,
            end,
            title: title.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validates the record for `channel`.
    ///
    /// Fails when a timestamp is out of range or the slot ends before it
    /// begins. Zero-length slots are accepted.
    pub fn into_entry(self, channel: ChannelId) -> Result<ProgrammeEntry> {
        let begin = DateTime::from_timestamp(self.begin, 0)
            .ok_or_else(|| Error::malformed(channel, format!("invalid begin {}", self.begin)))?;
        let end = DateTime::from_timestamp(self.end, 0)
            .ok_or_else(|| Error::malformed(channel, format!("invalid end {}", self.end)))?;
        if end < begin {
            return Err(Error::malformed(
                channel,
                format!("programme ends before it begins ({} < {})", self.end, self.begin),
            ));
        }

        let entry = ProgrammeEntry::new(begin, end, self.title);
        Ok(match self.description {
            Some(desc) if !desc.is_empty() => entry.with_description(desc),
            _ => entry,
        })
    }
}

/// One scheduled programme. Immutable once built; identified by `begin`.
///
/// Only built through [`ProgrammeEntry::new`] or
/// [`ProgrammeRecord::into_entry`], so it can be serialized but not
/// deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgrammeEntry {
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    title: String,
    description: Option<String>,
}

impl ProgrammeEntry {
    /// Builds an entry. The title is cut to its first line and an `end`
    /// before `begin` is raised to `begin`.
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>, title: impl Into<String>) -> Self {
        let title: String = title.into();
        let title = match title.lines().next() {
            Some(first) if first.len() != title.len() => first.trim_end().to_string(),
            _ => title,
        };
        Self {
            begin,
            end: end.max(begin),
            title,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn begin_timestamp(&self) -> i64 {
        self.begin.timestamp()
    }

    pub fn end_timestamp(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Length of the slot in whole seconds
    pub fn duration(&self) -> i64 {
        (self.end - self.begin).num_seconds()
    }

    /// Signed seconds since the programme began
    pub fn time_elapsed(&self, t: DateTime<Utc>) -> i64 {
        (t - self.begin).num_seconds()
    }

    /// Signed seconds until the programme ends
    pub fn time_left(&self, t: DateTime<Utc>) -> i64 {
        (self.end - t).num_seconds()
    }

    /// Milliseconds until the end, plus one so a timer armed with it
    /// fires strictly after the boundary.
    pub fn time_left_millis(&self, t: DateTime<Utc>) -> i64 {
        (self.end - t).num_milliseconds() + 1
    }

    /// Elapsed share of the programme on a `0..=scale` axis.
    ///
    /// The result is not clamped. A zero-length entry counts as finished
    /// and yields `scale`.
    pub fn percent(&self, t: DateTime<Utc>, scale: i64) -> i64 {
        let duration = self.duration();
        if duration == 0 {
            return scale;
        }
        (scale * self.time_elapsed(t)).div_euclid(duration)
    }

    /// Elapsed fraction, `1.0` for a zero-length entry
    pub fn progress(&self, t: DateTime<Utc>) -> f64 {
        let duration = self.duration();
        if duration == 0 {
            return 1.0;
        }
        self.time_elapsed(t) as f64 / duration as f64
    }

    /// `begin <= t < end`
    pub fn is_active(&self, t: DateTime<Utc>) -> bool {
        self.begin <= t && t < self.end
    }
}

impl fmt::Display for ProgrammeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}|{}",
            self.begin.format("%H:%M"),
            self.end.format("%H:%M"),
            self.title
        )
    }
}
