//! Example: Follow "now / next" for a few fake channels
//!
//! Run with: cargo run -p pmoepg --example live_epg
//! Or for a given number of seconds: cargo run -p pmoepg --example live_epg -- 600

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use pmoconfig::get_config;
use pmoepg::{
    ChannelId, CurrentProgrammes, EpgProvider, EpgUpdate, LiveEpgCache, ProgrammeRecord, Result,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Every channel airs back-to-back programmes of `slot_secs * channel` seconds
struct RollingGuide {
    slot_secs: i64,
}

impl RollingGuide {
    fn slot_at(&self, channel: ChannelId, t: i64) -> ProgrammeRecord {
        let len = self.slot_secs * channel as i64;
        let begin = t - t.rem_euclid(len);
        ProgrammeRecord::new(begin, begin + len, format!("Show {} on {}", begin / len % 100, channel))
    }
}

#[async_trait]
impl EpgProvider for RollingGuide {
    async fn current_programmes(&self, channels: &[ChannelId]) -> Result<CurrentProgrammes> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let now = Utc::now().timestamp();
        Ok(channels
            .iter()
            .map(|&channel| {
                let current = self.slot_at(channel, now);
                let next = self.slot_at(channel, current.end);
                (channel, vec![current, next])
            })
            .collect())
    }

    async fn day_programmes(
        &self,
        channel: ChannelId,
        day_start: DateTime<FixedOffset>,
    ) -> Result<Vec<ProgrammeRecord>> {
        let start = day_start.timestamp();
        let mut records = Vec::new();
        let mut t = start;
        while t < start + 24 * 3600 {
            let record = self.slot_at(channel, t);
            t = record.end;
            records.push(record);
        }
        Ok(records)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = get_config();
    let level = config.get_log_min_level()?.to_lowercase();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let run_for = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);

    let provider = Arc::new(RollingGuide { slot_secs: 90 });
    let mut cache = LiveEpgCache::from_config(provider, [1, 2, 3], &config)?;

    cache.subscribe(Arc::new(|updates: &[EpgUpdate]| {
        for (channel, entry) in updates {
            println!("[{channel}] {entry}");
        }
    }));
    cache.start();

    let today = cache.load_local_day(1, chrono::Local::now().date_naive()).await?;
    println!("Channel 1 airs {} programmes today", today.len());

    tokio::time::sleep(Duration::from_secs(run_for)).await;

    for channel in [1, 2, 3] {
        match (cache.current(channel), cache.next(channel)) {
            (Some(now), Some(next)) => println!("{channel}: {now} then {next}"),
            (Some(now), None) => println!("{channel}: {now}"),
            _ => println!("{channel}: no data"),
        }
    }

    cache.stop().await;
    Ok(())
}
