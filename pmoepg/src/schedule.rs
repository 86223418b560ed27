//! Per-channel programme timeline.
//!
//! A [`ChannelSchedule`] keeps the entries of one channel sorted by
//! `begin`, resolves overlapping announcements at insertion time and
//! answers point and day-range queries by binary search.
//!
//! # Conflict policy
//!
//! When a new entry lands right after an entry that starts at the same
//! instant or is still running at the new entry's `begin`, the new entry
//! replaces that predecessor in place. Only the immediate predecessor is
//! examined: a corrected slot spanning several older ones leaves the
//! later ones in place.

use crate::clock::Clock;
use crate::entry::ProgrammeEntry;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Answer of a calendar-day query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayLookup {
    /// The day was never fetched for this channel
    NotCached,
    /// The day was fetched; the list may legitimately be empty
    Entries(Vec<ProgrammeEntry>),
}

impl DayLookup {
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Entries(_))
    }

    pub fn entries(&self) -> Option<&[ProgrammeEntry]> {
        match self {
            Self::Entries(list) => Some(list),
            Self::NotCached => None,
        }
    }
}

/// Ordered programme store for a single channel
#[derive(Debug)]
pub struct ChannelSchedule {
    entries: Vec<ProgrammeEntry>,
    /// Local calendar day -> start of the fetched window
    days: HashMap<NaiveDate, DateTime<Utc>>,
    /// Position just after the last "now" hit. Pure hint.
    last: AtomicUsize,
    clock: Clock,
}

impl ChannelSchedule {
    pub fn new(clock: Clock) -> Self {
        Self {
            entries: Vec::new(),
            days: HashMap::new(),
            last: AtomicUsize::new(0),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ProgrammeEntry] {
        &self.entries
    }

    /// Whether an identical entry is stored at the same `begin`
    pub fn contains(&self, entry: &ProgrammeEntry) -> bool {
        self.entries
            .binary_search_by_key(&entry.begin(), ProgrammeEntry::begin)
            .map(|i| self.entries[i] == *entry)
            .unwrap_or(false)
    }

    /// Drops every entry and every populated-day marker
    pub fn clear(&mut self) {
        self.entries.clear();
        self.days.clear();
        self.last.store(0, Ordering::Relaxed);
    }

    /// Drops entries that ended at or before `t`.
    ///
    /// Populated days whose window closed by `t` are forgotten; entries
    /// beginning inside a day still populated are kept. Returns the number
    /// of entries removed.
    pub fn evict_before(&mut self, t: DateTime<Utc>) -> usize {
        self.days.retain(|_, start| *start + Duration::days(1) > t);
        let windows: Vec<(DateTime<Utc>, DateTime<Utc>)> = self
            .days
            .values()
            .map(|&start| (start, start + Duration::days(1)))
            .collect();

        let before = self.entries.len();
        self.entries.retain(|e| {
            e.end() > t
                || windows
                    .iter()
                    .any(|&(start, end)| start <= e.begin() && e.begin() < end)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            self.last.store(0, Ordering::Relaxed);
            debug!(removed, "Evicted expired EPG entries");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Number of entries with `begin <= t`; the rightmost such entry sits
    /// just before the returned index.
    fn at_or_before(&self, t: DateTime<Utc>) -> usize {
        self.entries.partition_point(|e| e.begin() <= t)
    }

    /// Index of the leftmost entry with `begin >= t`, searching from `lo`
    fn at_or_after(&self, t: DateTime<Utc>, lo: usize) -> usize {
        let lo = lo.min(self.entries.len());
        lo + self.entries[lo..].partition_point(|e| e.begin() < t)
    }

    /// Whether `i` is exactly what [`Self::at_or_before`] would return for `t`
    fn is_insertion_point(&self, i: usize, t: DateTime<Utc>) -> bool {
        i <= self.entries.len()
            && (i == 0 || self.entries[i - 1].begin() <= t)
            && (i == self.entries.len() || t < self.entries[i].begin())
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts `entry`, replacing an overlapping predecessor.
    ///
    /// `hint` is used as the insertion index when it is still valid for
    /// the entry's `begin`. Returns the index following the inserted or
    /// replaced entry, which is the hint for the next entry of a sorted
    /// batch.
    pub fn insert(&mut self, entry: ProgrammeEntry, hint: Option<usize>) -> usize {
        let t = entry.begin();
        let i = match hint {
            Some(h) if self.is_insertion_point(h, t) => h,
            _ => self.at_or_before(t),
        };

        if i > 0 {
            let prev = &self.entries[i - 1];
            if prev.begin() == t || prev.end() > t {
                if *prev != entry {
                    debug!(replaced = %prev, by = %entry, "EPG conflict, replacing entry");
                }
                self.entries[i - 1] = entry;
                return i;
            }
        }

        self.entries.insert(i, entry);
        let last = self.last.load(Ordering::Relaxed);
        if last >= i {
            self.last.store(last + 1, Ordering::Relaxed);
        }
        i + 1
    }

    /// Inserts a batch already sorted by `begin`, threading the hint
    pub fn insert_sorted<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = ProgrammeEntry>,
    {
        let mut hint = None;
        for entry in entries {
            hint = Some(self.insert(entry, hint));
        }
    }

    /// Records that the local day of `window_start` has been fetched
    pub fn mark_day_populated<Tz: TimeZone>(&mut self, window_start: DateTime<Tz>) {
        let day = window_start.date_naive();
        self.days.insert(day, window_start.with_timezone(&Utc));
    }

    pub fn is_day_populated(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    /// Stores a full day as returned by a provider, in any order
    pub fn insert_day<Tz: TimeZone>(
        &mut self,
        window_start: DateTime<Tz>,
        mut entries: Vec<ProgrammeEntry>,
    ) {
        entries.sort_by_key(ProgrammeEntry::begin);
        self.mark_day_populated(window_start);
        self.insert_sorted(entries);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn active_before(&self, t: DateTime<Utc>, i: usize) -> Option<usize> {
        if i == 0 || i > self.entries.len() {
            return None;
        }
        self.entries[i - 1].is_active(t).then_some(i - 1)
    }

    fn find(&self, at: Option<DateTime<Utc>>) -> Option<usize> {
        let Some(t) = at else {
            let t = self.clock.now();
            let last = self.last.load(Ordering::Relaxed);
            let found = [last, last + 1]
                .into_iter()
                .filter(|&i| self.is_insertion_point(i, t))
                .find_map(|i| self.active_before(t, i))
                .or_else(|| self.active_before(t, self.at_or_before(t)));
            if let Some(idx) = found {
                self.last.store(idx + 1, Ordering::Relaxed);
            }
            return found;
        };
        self.active_before(t, self.at_or_before(t))
    }

    /// Entry airing now, according to the schedule's clock
    pub fn current(&self) -> Option<&ProgrammeEntry> {
        self.find(None).map(|i| &self.entries[i])
    }

    /// Entry airing at `t`
    pub fn current_at(&self, t: DateTime<Utc>) -> Option<&ProgrammeEntry> {
        self.find(Some(t)).map(|i| &self.entries[i])
    }

    /// Entry following the current one, when it starts exactly as the
    /// current one ends
    pub fn next(&self) -> Option<&ProgrammeEntry> {
        self.find(None).and_then(|i| self.contiguous_after(i))
    }

    pub fn next_at(&self, t: DateTime<Utc>) -> Option<&ProgrammeEntry> {
        self.find(Some(t)).and_then(|i| self.contiguous_after(i))
    }

    fn contiguous_after(&self, i: usize) -> Option<&ProgrammeEntry> {
        let current = &self.entries[i];
        self.entries
            .get(i + 1)
            .filter(|next| next.begin() == current.end())
    }

    /// Entries beginning within the populated day `date`
    pub fn day_entries(&self, date: NaiveDate) -> DayLookup {
        let Some(&start) = self.days.get(&date) else {
            return DayLookup::NotCached;
        };
        let end = start + Duration::days(1);
        let first = self.at_or_after(start, 0);
        let last = self.at_or_after(end, first);
        DayLookup::Entries(self.entries[first..last].to_vec())
    }
}
