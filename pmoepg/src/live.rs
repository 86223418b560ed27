//! Refresh state machine behind the live cache.
//!
//! [`LiveEpgState`] owns the schedules of every tracked channel and
//! decides, cycle after cycle, which channels are stale, how fetched
//! records are merged and when the next wake-up is due. It performs no
//! I/O: the coordinator in [`crate::cache`] feeds it provider results.

use crate::clock::Clock;
use crate::entry::{ChannelId, ProgrammeEntry, ProgrammeRecord};
use crate::error::Result;
use crate::provider::CurrentProgrammes;
use crate::schedule::{ChannelSchedule, DayLookup};
use crate::settings::RefreshSettings;
use crate::subscribers::EpgUpdate;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Where the refresh cycle stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    /// Last fetch failed; waiting for the retry delay
    BackedOff,
}

/// Channels selected for one refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPlan {
    pub channels: Vec<ChannelId>,
    /// The cache held no data when the cycle began
    pub first_cycle: bool,
}

impl RefreshPlan {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Result of a completed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Delay to arm the wake timer with
    pub wake_in: Duration,
    /// Channels whose entry changed, in channel order
    pub updates: Vec<EpgUpdate>,
}

/// Schedules of the tracked channels plus refresh bookkeeping
#[derive(Debug)]
pub struct LiveEpgState {
    schedules: HashMap<ChannelId, ChannelSchedule>,
    tracked: BTreeSet<ChannelId>,
    state: RefreshState,
    /// A trigger was coalesced into the running cycle
    pending_refresh: bool,
    clock: Clock,
    settings: RefreshSettings,
}

impl LiveEpgState {
    pub fn new(
        channels: impl IntoIterator<Item = ChannelId>,
        clock: Clock,
        settings: RefreshSettings,
    ) -> Self {
        let mut state = Self {
            schedules: HashMap::new(),
            tracked: BTreeSet::new(),
            state: RefreshState::Idle,
            pending_refresh: false,
            clock,
            settings,
        };
        state.track(channels);
        state
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    pub fn is_tracked(&self, channel: ChannelId) -> bool {
        self.tracked.contains(&channel)
    }

    pub fn tracked(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.tracked.iter().copied()
    }

    /// Starts tracking `channels`; returns `true` if any was new
    pub fn track(&mut self, channels: impl IntoIterator<Item = ChannelId>) -> bool {
        let mut added = false;
        for channel in channels {
            if self.tracked.insert(channel) {
                self.schedules
                    .insert(channel, ChannelSchedule::new(self.clock.clone()));
                added = true;
            }
        }
        added
    }

    /// Whether no tracked channel holds any entry
    pub fn is_empty(&self) -> bool {
        self.schedules.values().all(ChannelSchedule::is_empty)
    }

    pub fn schedule(&self, channel: ChannelId) -> Option<&ChannelSchedule> {
        self.schedules.get(&channel)
    }

    /// Forgets every cached entry; the next cycle refreshes everything
    pub fn reset(&mut self) {
        for schedule in self.schedules.values_mut() {
            schedule.clear();
        }
    }

    // ------------------------------------------------------------------
    // UI queries
    // ------------------------------------------------------------------

    pub fn current(&self, channel: ChannelId) -> Option<ProgrammeEntry> {
        self.schedules.get(&channel)?.current().cloned()
    }

    pub fn current_at(&self, channel: ChannelId, t: DateTime<Utc>) -> Option<ProgrammeEntry> {
        self.schedules.get(&channel)?.current_at(t).cloned()
    }

    pub fn next(&self, channel: ChannelId) -> Option<ProgrammeEntry> {
        self.schedules.get(&channel)?.next().cloned()
    }

    pub fn next_at(&self, channel: ChannelId, t: DateTime<Utc>) -> Option<ProgrammeEntry> {
        self.schedules.get(&channel)?.next_at(t).cloned()
    }

    pub fn day_entries(&self, channel: ChannelId, date: NaiveDate) -> DayLookup {
        self.schedules
            .get(&channel)
            .map_or(DayLookup::NotCached, |s| s.day_entries(date))
    }

    // ------------------------------------------------------------------
    // Refresh cycle
    // ------------------------------------------------------------------

    /// Enters `Refreshing` and selects the stale channels.
    ///
    /// Returns `None` while a cycle is already in flight; the trigger is
    /// then remembered and reported by [`Self::take_pending_refresh`].
    pub fn begin_refresh(&mut self) -> Option<RefreshPlan> {
        if self.state == RefreshState::Refreshing {
            self.pending_refresh = true;
            return None;
        }
        self.state = RefreshState::Refreshing;
        self.pending_refresh = false;

        let now = self.clock.now();
        let first_cycle = self.is_empty();
        let channels: Vec<ChannelId> = if first_cycle {
            self.tracked.iter().copied().collect()
        } else {
            self.tracked
                .iter()
                .copied()
                .filter(|cid| {
                    self.schedules
                        .get(cid)
                        .and_then(|s| s.current_at(now))
                        .is_none()
                })
                .collect()
        };

        debug!(
            first_cycle,
            count = channels.len(),
            "EPG refresh cycle started"
        );
        Some(RefreshPlan {
            channels,
            first_cycle,
        })
    }

    /// Leaves `Refreshing` without applying anything
    pub fn abort_refresh(&mut self) {
        if self.state == RefreshState::Refreshing {
            self.state = RefreshState::Idle;
        }
        self.pending_refresh = false;
    }

    /// Whether a trigger arrived during the cycle that just completed.
    ///
    /// Clears the flag. Always `false` while backed off: the retry timer
    /// picks the work up.
    pub fn take_pending_refresh(&mut self) -> bool {
        if self.state != RefreshState::Idle {
            return false;
        }
        std::mem::take(&mut self.pending_refresh)
    }

    /// Applies the outcome of the provider call made for `plan`.
    ///
    /// `result` is `None` when the plan was empty and no call was made.
    pub fn complete_refresh(
        &mut self,
        plan: &RefreshPlan,
        result: Option<Result<CurrentProgrammes>>,
    ) -> CycleReport {
        let now = self.clock.now();
        self.evict_expired(now);

        let batch = match result {
            None => {
                debug!("EPG already up to date");
                self.state = RefreshState::Idle;
                return self.report(now, Vec::new());
            }
            Some(Err(err)) => {
                warn!("EPG fetch failed, retrying later: {err}");
                self.state = RefreshState::BackedOff;
                return CycleReport {
                    wake_in: self.settings.retry_delay(),
                    updates: Vec::new(),
                };
            }
            Some(Ok(batch)) => batch,
        };

        self.state = RefreshState::Idle;
        let mut changed = BTreeSet::new();
        let mut first_merged = HashMap::new();

        for (channel, records) in batch {
            if !self.is_tracked(channel) {
                debug!(channel, "Ignoring EPG for untracked channel");
                continue;
            }
            if let Some((entry, dirty)) = self.merge_current(channel, records) {
                first_merged.insert(channel, entry);
                if dirty {
                    changed.insert(channel);
                }
            }
        }

        if !plan.is_empty() && self.is_empty() {
            debug!("EPG provider returned no data");
            return CycleReport {
                wake_in: self.settings.max_delay(),
                updates: Vec::new(),
            };
        }

        let updates = plan
            .channels
            .iter()
            .filter(|cid| changed.contains(*cid))
            .filter_map(|&cid| {
                self.current_at(cid, now)
                    .or_else(|| first_merged.remove(&cid))
                    .map(|entry| (cid, entry))
            })
            .collect();

        self.report(now, updates)
    }

    /// Merges the records of one channel.
    ///
    /// Returns the first merged entry and whether anything changed, or
    /// `None` when no record was usable.
    fn merge_current(
        &mut self,
        channel: ChannelId,
        records: Vec<ProgrammeRecord>,
    ) -> Option<(ProgrammeEntry, bool)> {
        let schedule = self.schedules.get_mut(&channel)?;
        let mut entries: Vec<ProgrammeEntry> = records
            .into_iter()
            .filter_map(|record| match record.into_entry(channel) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(channel, "Skipping EPG record: {err}");
                    None
                }
            })
            .collect();
        let first = entries.first().cloned()?;
        entries.sort_by_key(ProgrammeEntry::begin);

        let mut dirty = false;
        let mut hint = None;
        for entry in entries {
            dirty |= !schedule.contains(&entry);
            hint = Some(schedule.insert(entry, hint));
        }
        Some((first, dirty))
    }

    /// Drops entries that ended longer ago than the retention period
    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.settings.retention();
        for schedule in self.schedules.values_mut() {
            schedule.evict_before(horizon);
        }
    }

    fn report(&self, now: DateTime<Utc>, updates: Vec<EpgUpdate>) -> CycleReport {
        let wake_in = self.settings.wake_delay(self.nearest_expiry(now));
        debug!(delay_secs = wake_in.as_secs(), "Next EPG refresh scheduled");
        CycleReport { wake_in, updates }
    }

    /// Seconds until the first tracked programme ends.
    ///
    /// A channel holding entries but none airing counts as expired.
    /// Channels without any entry are ignored.
    pub fn nearest_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.tracked
            .iter()
            .filter_map(|cid| self.schedules.get(cid))
            .filter(|s| !s.is_empty())
            .map(|s| s.current_at(now).map_or(0, |e| e.time_left(now)))
            .min()
    }

    /// Next wake delay computed from the cached data
    pub fn next_wake_delay(&self) -> Duration {
        self.settings
            .wake_delay(self.nearest_expiry(self.clock.now()))
    }

    // ------------------------------------------------------------------
    // Day loading
    // ------------------------------------------------------------------

    /// Stores a fetched day for `channel` and returns its entries.
    ///
    /// Malformed records are skipped. An untracked channel starts being
    /// tracked.
    pub fn merge_day<Tz: TimeZone>(
        &mut self,
        channel: ChannelId,
        day_start: DateTime<Tz>,
        records: Vec<ProgrammeRecord>,
    ) -> Vec<ProgrammeEntry> {
        self.track([channel]);
        let date = day_start.date_naive();
        let entries: Vec<ProgrammeEntry> = records
            .into_iter()
            .filter_map(|record| match record.into_entry(channel) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(channel, "Skipping EPG day record: {err}");
                    None
                }
            })
            .collect();
        debug!(channel, %date, count = entries.len(), "Merging EPG day");

        let Some(schedule) = self.schedules.get_mut(&channel) else {
            return Vec::new();
        };
        schedule.insert_day(day_start, entries);
        match schedule.day_entries(date) {
            DayLookup::Entries(list) => list,
            DayLookup::NotCached => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::{Duration as ChronoDuration, FixedOffset};

    const NOW: i64 = 1_700_000_000;

    fn clock() -> Clock {
        Clock::manual(DateTime::from_timestamp(NOW, 0).unwrap())
    }

    fn rec(begin: i64, end: i64, title: &str) -> ProgrammeRecord {
        ProgrammeRecord::new(NOW + begin, NOW + end, title)
    }

    fn batch(items: Vec<(ChannelId, Vec<ProgrammeRecord>)>) -> CurrentProgrammes {
        items.into_iter().collect()
    }

    fn titles(updates: &[EpgUpdate]) -> Vec<(ChannelId, &str)> {
        updates.iter().map(|(c, e)| (*c, e.title())).collect()
    }

    fn state_with(channels: &[ChannelId]) -> LiveEpgState {
        LiveEpgState::new(channels.iter().copied(), clock(), RefreshSettings::default())
    }

    #[test]
    fn test_first_cycle_refreshes_all_channels() {
        let mut state = state_with(&[3, 1, 2]);
        let plan = state.begin_refresh().unwrap();
        assert!(plan.first_cycle);
        assert_eq!(plan.channels, vec![1, 2, 3]);
        assert_eq!(state.state(), RefreshState::Refreshing);
    }

    #[test]
    fn test_cycles_do_not_overlap() {
        let mut state = state_with(&[1]);
        assert!(state.begin_refresh().is_some());
        assert!(state.begin_refresh().is_none());
        state.abort_refresh();
        assert_eq!(state.state(), RefreshState::Idle);
        assert!(!state.take_pending_refresh());
        assert!(state.begin_refresh().is_some());
    }

    #[test]
    fn test_coalesced_trigger_is_remembered() {
        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        assert!(state.begin_refresh().is_none());
        state.track([7]);

        state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(-10, 7200, "X")])]))));
        assert!(state.take_pending_refresh());
        assert!(!state.take_pending_refresh());

        let follow_up = state.begin_refresh().unwrap();
        assert_eq!(follow_up.channels, vec![7]);
    }

    #[test]
    fn test_pending_trigger_waits_for_retry_after_failure() {
        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        assert!(state.begin_refresh().is_none());

        state.complete_refresh(&plan, Some(Err(Error::transient("down"))));
        assert_eq!(state.state(), RefreshState::BackedOff);
        assert!(!state.take_pending_refresh());

        // The retry cycle absorbs the pending trigger
        assert!(state.begin_refresh().is_some());
        state.abort_refresh();
        assert!(!state.take_pending_refresh());
    }

    #[test]
    fn test_schedule_length_stays_bounded() {
        let mut state = state_with(&[1]);
        let slot = 60;
        for cycle in 0..1_000i64 {
            let plan = state.begin_refresh().unwrap();
            let begin = cycle * (slot + 1);
            let records = vec![rec(begin, begin + slot, "Slot")];
            state.complete_refresh(&plan, Some(Ok(batch(vec![(1, records)]))));
            state.clock().advance(ChronoDuration::seconds(slot + 1));
        }

        let retention = RefreshSettings::default().retention_secs as usize;
        let bound = retention / (slot as usize + 1) + 2;
        let len = state.schedule(1).unwrap().len();
        assert!(len <= bound, "{len} entries kept, expected at most {bound}");
        let newest = state.schedule(1).unwrap().entries().last().unwrap().begin();
        assert_eq!(newest, DateTime::from_timestamp(NOW + 999 * (slot + 1), 0).unwrap());
    }

    #[test]
    fn test_end_to_end_merge() {
        let mut state = state_with(&[1, 2]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(-10, 50, "X")]),
                (2, vec![rec(-5, 55, "Y")]),
            ]))),
        );

        assert_eq!(state.current(1).unwrap().title(), "X");
        assert_eq!(state.current(2).unwrap().title(), "Y");
        assert_eq!(report.wake_in, Duration::from_secs(60));
        assert_eq!(titles(&report.updates), vec![(1, "X"), (2, "Y")]);
        assert_eq!(state.state(), RefreshState::Idle);
    }

    #[test]
    fn test_wake_delay_floor_and_ceiling() {
        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(-100, 10, "Soon")])]))));
        assert_eq!(report.wake_in, Duration::from_secs(60));

        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![(1, vec![rec(-100, 2 * 3600, "Long")])]))),
        );
        assert_eq!(report.wake_in, Duration::from_secs(3600));

        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(0, 899, "Mid")])]))));
        assert_eq!(report.wake_in, Duration::from_secs(900));
    }

    #[test]
    fn test_failure_keeps_data_and_backs_off() {
        let mut state = state_with(&[1, 2]);
        let plan = state.begin_refresh().unwrap();
        state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(-10, 50, "X")]),
                (2, vec![rec(-5, 55, "Y")]),
            ]))),
        );

        state.clock().advance(ChronoDuration::seconds(52));
        let plan = state.begin_refresh().unwrap();
        assert_eq!(plan.channels, vec![1]);
        let report = state.complete_refresh(&plan, Some(Err(Error::transient("timeout"))));

        assert_eq!(report.wake_in, Duration::from_secs(60));
        assert!(report.updates.is_empty());
        assert_eq!(state.state(), RefreshState::BackedOff);
        assert_eq!(state.schedule(1).unwrap().len(), 1);
        assert_eq!(state.current(2).unwrap().title(), "Y");
    }

    #[test]
    fn test_only_expired_channels_are_refreshed() {
        let mut state = state_with(&[1, 2, 3]);
        let plan = state.begin_refresh().unwrap();
        state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(-10, 50, "X")]),
                (2, vec![rec(-10, 500, "Y")]),
            ]))),
        );

        state.clock().advance(ChronoDuration::seconds(60));
        let plan = state.begin_refresh().unwrap();
        assert!(!plan.first_cycle);
        // 1 expired, 3 never had data
        assert_eq!(plan.channels, vec![1, 3]);
    }

    #[test]
    fn test_unchanged_channels_are_not_reported() {
        let mut state = state_with(&[1, 2]);
        let plan = state.begin_refresh().unwrap();
        state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(-10, 50, "X")])]))));

        // Channel 2 is refreshed again; provider repeats channel 1 unchanged.
        let plan = state.begin_refresh().unwrap();
        assert_eq!(plan.channels, vec![2]);
        let report = state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(-10, 50, "X")]),
                (2, vec![rec(0, 30, "Z")]),
            ]))),
        );
        assert_eq!(titles(&report.updates), vec![(2, "Z")]);
    }

    #[test]
    fn test_replaced_entry_is_reported() {
        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(-10, 50, "X")])]))));

        state.clock().advance(ChronoDuration::seconds(50));
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(50, 120, "X2")])]))));
        assert_eq!(titles(&report.updates), vec![(1, "X2")]);
    }

    #[test]
    fn test_malformed_channel_is_isolated() {
        let mut state = state_with(&[1, 2]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(50, -10, "Broken")]),
                (2, vec![rec(-5, 55, "Y")]),
            ]))),
        );
        assert_eq!(titles(&report.updates), vec![(2, "Y")]);
        assert!(state.current(1).is_none());
    }

    #[test]
    fn test_current_and_next_records_are_merged() {
        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![(1, vec![rec(-10, 50, "Now"), rec(50, 110, "Later")])]))),
        );
        assert_eq!(titles(&report.updates), vec![(1, "Now")]);
        assert_eq!(state.next(1).unwrap().title(), "Later");

        // The next programme is already known: nothing is stale after the switch.
        state.clock().advance(ChronoDuration::seconds(60));
        let plan = state.begin_refresh().unwrap();
        assert!(plan.is_empty());
        let report = state.complete_refresh(&plan, None);
        assert_eq!(report.wake_in, Duration::from_secs(60));
        assert!(report.updates.is_empty());
    }

    #[test]
    fn test_empty_provider_answer() {
        let mut state = state_with(&[1, 2]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(&plan, Some(Ok(CurrentProgrammes::new())));
        assert_eq!(report.wake_in, Duration::from_secs(3600));
        assert!(report.updates.is_empty());
        assert_eq!(state.state(), RefreshState::Idle);
    }

    #[test]
    fn test_untracked_channels_in_batch_are_ignored() {
        let mut state = state_with(&[1]);
        let plan = state.begin_refresh().unwrap();
        let report = state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(-10, 50, "X")]),
                (9, vec![rec(-10, 50, "Stray")]),
            ]))),
        );
        assert_eq!(report.updates.len(), 1);
        assert!(state.schedule(9).is_none());
        assert!(state.current(9).is_none());
    }

    #[test]
    fn test_expired_entry_pulls_wake_to_floor() {
        let mut state = state_with(&[1, 2]);
        let plan = state.begin_refresh().unwrap();
        state.complete_refresh(
            &plan,
            Some(Ok(batch(vec![
                (1, vec![rec(-10, 5000, "Long")]),
                (2, vec![rec(-10, 4000, "Other")]),
            ]))),
        );
        assert_eq!(state.next_wake_delay(), Duration::from_secs(3600));

        state.clock().advance(ChronoDuration::seconds(4001));
        assert_eq!(state.nearest_expiry(state.clock().now()), Some(0));
        assert_eq!(state.next_wake_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_track_and_reset() {
        let mut state = state_with(&[1]);
        assert!(state.track([2, 1]));
        assert!(!state.track([2]));
        assert_eq!(state.tracked().collect::<Vec<_>>(), vec![1, 2]);

        let plan = state.begin_refresh().unwrap();
        state.complete_refresh(&plan, Some(Ok(batch(vec![(1, vec![rec(-10, 50, "X")])]))));
        assert!(!state.is_empty());

        state.reset();
        assert!(state.is_empty());
        assert!(state.begin_refresh().unwrap().first_cycle);
    }

    #[test]
    fn test_merge_day() {
        let tz = FixedOffset::east_opt(0).unwrap();
        let day_start = DateTime::from_timestamp(NOW, 0).unwrap().with_timezone(&tz);
        let mut state = state_with(&[1]);
        let entries = state.merge_day(
            5,
            day_start,
            vec![
                rec(3600, 7200, "Second"),
                rec(0, 3600, "First"),
                rec(100, 50, "Broken"),
            ],
        );
        let names: Vec<_> = entries.iter().map(ProgrammeEntry::title).collect();
        assert_eq!(names, vec!["First", "Second"]);
        assert!(state.is_tracked(5));
        assert!(state.day_entries(5, day_start.date_naive()).is_cached());
        assert_eq!(state.day_entries(1, day_start.date_naive()), DayLookup::NotCached);
        assert_eq!(state.day_entries(42, day_start.date_naive()), DayLookup::NotCached);
    }
}
