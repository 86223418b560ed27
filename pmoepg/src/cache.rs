//! Live EPG cache: the refresh coordinator and its UI-facing handle.
//!
//! The coordinator is a single tokio task. It owns the wake timer, starts
//! refresh cycles, dispatches provider calls to worker tasks and merges
//! their results when they come back through its result queue. Schedules
//! are only written from that task; the UI reads them through
//! [`LiveEpgCache`] without waiting on the network.

use crate::clock::Clock;
use crate::entry::{ChannelId, ProgrammeEntry, ProgrammeRecord};
use crate::error::{Error, Result};
use crate::live::{CycleReport, LiveEpgState, RefreshPlan, RefreshState};
use crate::provider::{CurrentProgrammes, EpgProvider};
use crate::schedule::DayLookup;
use crate::settings::RefreshSettings;
use crate::subscribers::{EpgUpdateCallback, Subscribers, SubscriptionId};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

/// Commands sent to the coordinator task.
enum Command {
    Refresh,
    Track(Vec<ChannelId>),
    Resync,
    LoadDay {
        channel: ChannelId,
        day_start: DateTime<FixedOffset>,
        reply: oneshot::Sender<Result<Vec<ProgrammeEntry>>>,
    },
    Shutdown,
}

/// Results coming back from worker tasks.
enum Fetched {
    Current {
        plan: RefreshPlan,
        result: Result<CurrentProgrammes>,
    },
    Day {
        channel: ChannelId,
        day_start: DateTime<FixedOffset>,
        result: Result<Vec<ProgrammeRecord>>,
        reply: oneshot::Sender<Result<Vec<ProgrammeEntry>>>,
    },
}

struct CacheWorker {
    tx: mpsc::UnboundedSender<Command>,
    join_handle: JoinHandle<()>,
}

/// Keeps "now / next" programme data fresh for every tracked channel.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use pmoepg::{Clock, EpgProvider, EpgUpdate, LiveEpgCache, RefreshSettings};
/// # async fn demo(provider: Arc<dyn EpgProvider>) {
/// let mut cache = LiveEpgCache::new(provider, [1, 2, 3], Clock::system(), RefreshSettings::default());
/// cache.subscribe(Arc::new(|updates: &[EpgUpdate]| {
///     for (channel, entry) in updates {
///         println!("{channel}: {entry}");
///     }
/// }));
/// cache.start();
/// if let Some(entry) = cache.current(1) {
///     println!("now on 1: {}", entry.title());
/// }
/// cache.stop().await;
/// # }
/// ```
pub struct LiveEpgCache {
    state: Arc<RwLock<LiveEpgState>>,
    subscribers: Subscribers,
    provider: Arc<dyn EpgProvider>,
    clock: Clock,
    worker: Option<CacheWorker>,
}

impl LiveEpgCache {
    pub fn new(
        provider: Arc<dyn EpgProvider>,
        channels: impl IntoIterator<Item = ChannelId>,
        clock: Clock,
        settings: RefreshSettings,
    ) -> Self {
        let state = LiveEpgState::new(channels, clock.clone(), settings);
        Self {
            state: Arc::new(RwLock::new(state)),
            subscribers: Subscribers::new(),
            provider,
            clock,
            worker: None,
        }
    }

    /// Builds a cache whose delays and clock offset come from the
    /// `sources.epg` section of the configuration.
    ///
    /// Fails with [`Error::Disabled`] when `sources.epg.enabled` is off.
    #[cfg(feature = "pmoconfig")]
    pub fn from_config(
        provider: Arc<dyn EpgProvider>,
        channels: impl IntoIterator<Item = ChannelId>,
        config: &pmoconfig::Config,
    ) -> Result<Self> {
        use crate::config_ext::EpgConfigExt;

        if !config.get_epg_enabled()? {
            info!("EPG disabled in configuration");
            return Err(Error::Disabled);
        }

        let settings = config.get_epg_refresh_settings()?;
        let clock = Clock::system();
        clock.set_offset(config.get_epg_time_offset()?);
        Ok(Self::new(provider, channels, clock, settings))
    }

    /// Spawns the coordinator and runs a first refresh cycle.
    ///
    /// Must be called from within a tokio runtime. Does nothing when
    /// already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            self.state.clone(),
            self.subscribers.clone(),
            self.provider.clone(),
        );
        let join_handle = tokio::spawn(coordinator.run(rx));
        self.worker = Some(CacheWorker { tx, join_handle });
    }

    /// Stops the coordinator and waits for it to exit.
    ///
    /// The wake timer is cancelled; fetches still in flight run to
    /// completion but their results are dropped.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.tx.send(Command::Shutdown);
        if let Err(err) = worker.join_handle.await {
            warn!("EPG coordinator ended abnormally: {err}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.join_handle.is_finished())
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn state(&self) -> RefreshState {
        self.state.read().state()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Programme airing now on `channel`.
    ///
    /// An unknown channel yields `None` and starts being tracked.
    pub fn current(&self, channel: ChannelId) -> Option<ProgrammeEntry> {
        if !self.ensure_tracked(channel) {
            return None;
        }
        self.state.read().current(channel)
    }

    pub fn current_at(&self, channel: ChannelId, t: DateTime<Utc>) -> Option<ProgrammeEntry> {
        self.state.read().current_at(channel, t)
    }

    /// Programme following the current one, when it starts right as the
    /// current one ends.
    pub fn next(&self, channel: ChannelId) -> Option<ProgrammeEntry> {
        if !self.ensure_tracked(channel) {
            return None;
        }
        self.state.read().next(channel)
    }

    pub fn next_at(&self, channel: ChannelId, t: DateTime<Utc>) -> Option<ProgrammeEntry> {
        self.state.read().next_at(channel, t)
    }

    /// Cached programmes of a calendar day, without any network call
    pub fn day_entries(&self, channel: ChannelId, date: NaiveDate) -> DayLookup {
        self.state.read().day_entries(channel, date)
    }

    /// Programmes of the day starting at `day_start`, fetched through the
    /// provider unless already cached.
    pub async fn load_day(
        &self,
        channel: ChannelId,
        day_start: DateTime<FixedOffset>,
    ) -> Result<Vec<ProgrammeEntry>> {
        if let DayLookup::Entries(list) = self.day_entries(channel, day_start.date_naive()) {
            return Ok(list);
        }

        let (reply, response) = oneshot::channel();
        self.send(Command::LoadDay {
            channel,
            day_start,
            reply,
        })?;
        response.await.map_err(|_| Error::Stopped)?
    }

    /// [`Self::load_day`] for a day of the host's local calendar
    pub async fn load_local_day(
        &self,
        channel: ChannelId,
        date: NaiveDate,
    ) -> Result<Vec<ProgrammeEntry>> {
        let day_start = Local
            .from_local_datetime(&date.and_time(NaiveTime::MIN))
            .earliest()
            .ok_or_else(|| Error::other(format!("no local midnight on {date}")))?;
        self.load_day(channel, day_start.fixed_offset()).await
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn subscribe(&self, callback: EpgUpdateCallback) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Requests an immediate refresh cycle (e.g. after resume).
    ///
    /// Ignored while a cycle is already running.
    pub fn refresh_now(&self) {
        if self.send(Command::Refresh).is_err() {
            debug!("EPG cache not running, refresh request ignored");
        }
    }

    /// Adds channels to the tracked set and refreshes the new ones
    pub fn track(&self, channels: impl IntoIterator<Item = ChannelId>) {
        let channels: Vec<ChannelId> = channels.into_iter().collect();
        match &self.worker {
            Some(worker) if !worker.join_handle.is_finished() => {
                let _ = worker.tx.send(Command::Track(channels));
            }
            _ => {
                self.state.write().track(channels);
            }
        }
    }

    /// Drops all cached programmes and refetches everything
    pub fn resync(&self) {
        if self.send(Command::Resync).is_err() {
            self.state.write().reset();
        }
    }

    /// Shifts the clock and refreshes against the new "now"
    pub fn set_time_offset(&self, offset: chrono::Duration) {
        self.clock.set_offset(offset);
        self.refresh_now();
    }

    fn ensure_tracked(&self, channel: ChannelId) -> bool {
        if self.state.read().is_tracked(channel) {
            return true;
        }
        debug!("{}", Error::UnknownChannel(channel));
        self.track([channel]);
        false
    }

    fn send(&self, cmd: Command) -> Result<()> {
        let worker = self.worker.as_ref().ok_or(Error::Stopped)?;
        worker.tx.send(cmd).map_err(|_| Error::Stopped)
    }
}

impl Drop for LiveEpgCache {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.tx.send(Command::Shutdown);
        }
    }
}

// ============================================================================
// Coordinator task
// ============================================================================

struct Coordinator {
    state: Arc<RwLock<LiveEpgState>>,
    subscribers: Subscribers,
    provider: Arc<dyn EpgProvider>,
    results_tx: mpsc::UnboundedSender<Fetched>,
    results_rx: mpsc::UnboundedReceiver<Fetched>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Coordinator {
    fn new(
        state: Arc<RwLock<LiveEpgState>>,
        subscribers: Subscribers,
        provider: Arc<dyn EpgProvider>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            state,
            subscribers,
            provider,
            results_tx,
            results_rx,
            timer: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Starting live EPG coordinator");
        self.start_refresh();

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(fetched) = self.results_rx.recv() => {
                    self.handle_fetched(fetched);
                }
                _ = wait_timer(&mut self.timer) => {
                    self.timer = None;
                    debug!("EPG wake timer fired");
                    self.start_refresh();
                }
            }
        }

        self.timer = None;
        self.state.write().abort_refresh();
        info!("Live EPG coordinator stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Refresh => self.start_refresh(),
            Command::Track(channels) => {
                if self.state.write().track(channels) {
                    self.start_refresh();
                }
            }
            Command::Resync => {
                info!("EPG resync requested");
                self.state.write().reset();
                self.start_refresh();
            }
            Command::LoadDay {
                channel,
                day_start,
                reply,
            } => self.start_day_load(channel, day_start, reply),
            Command::Shutdown => {}
        }
    }

    fn start_refresh(&mut self) {
        let Some(plan) = self.state.write().begin_refresh() else {
            debug!("EPG refresh already in flight, trigger deferred");
            return;
        };

        if plan.is_empty() {
            let report = self.state.write().complete_refresh(&plan, None);
            self.finish_cycle(report);
            return;
        }

        let provider = self.provider.clone();
        let channels = plan.channels.clone();
        self.dispatch(
            async move { provider.current_programmes(&channels).await },
            move |result| Fetched::Current { plan, result },
        );
    }

    fn start_day_load(
        &mut self,
        channel: ChannelId,
        day_start: DateTime<FixedOffset>,
        reply: oneshot::Sender<Result<Vec<ProgrammeEntry>>>,
    ) {
        if let DayLookup::Entries(list) = self
            .state
            .read()
            .day_entries(channel, day_start.date_naive())
        {
            let _ = reply.send(Ok(list));
            return;
        }

        debug!(channel, day = %day_start.date_naive(), "Fetching EPG day");
        let provider = self.provider.clone();
        self.dispatch(
            async move { provider.day_programmes(channel, day_start).await },
            move |result| Fetched::Day {
                channel,
                day_start,
                result,
                reply,
            },
        );
    }

    /// Runs `fetch` on a worker task; its result comes back through the
    /// result queue.
    fn dispatch<T, F, M>(&self, fetch: F, into_message: M)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        M: FnOnce(Result<T>) -> Fetched + Send + 'static,
    {
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::spawn(fetch).await {
                Ok(result) => result,
                Err(err) => Err(Error::transient(format!("EPG fetch task failed: {err}"))),
            };
            if results.send(into_message(result)).is_err() {
                debug!("EPG cache stopped, fetch result discarded");
            }
        });
    }

    fn handle_fetched(&mut self, fetched: Fetched) {
        match fetched {
            Fetched::Current { plan, result } => {
                let report = self.state.write().complete_refresh(&plan, Some(result));
                self.finish_cycle(report);
            }
            Fetched::Day {
                channel,
                day_start,
                result,
                reply,
            } => {
                let answer = match result {
                    Ok(records) => Ok(self.state.write().merge_day(channel, day_start, records)),
                    Err(err) => {
                        warn!(channel, "EPG day fetch failed: {err}");
                        Err(err)
                    }
                };
                if reply.send(answer).is_err() {
                    debug!(channel, "EPG day requester went away");
                }
            }
        }
    }

    fn finish_cycle(&mut self, report: CycleReport) {
        self.arm_timer(report.wake_in);
        if !report.updates.is_empty() {
            debug!(count = report.updates.len(), "Publishing EPG updates");
        }
        self.subscribers.publish(&report.updates);

        let pending = self.state.write().take_pending_refresh();
        if pending {
            debug!("Running EPG refresh coalesced during the last cycle");
            self.start_refresh();
        }
    }

    fn arm_timer(&mut self, delay: Duration) {
        debug!(delay_secs = delay.as_secs(), "Arming EPG wake timer");
        self.timer = Some(Box::pin(sleep(delay)));
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
