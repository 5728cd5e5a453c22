//! Playback synchronizer: keeps the player on whatever the schedule says is
//! live right now.
//!
//! Single-threaded polling loop. Channel changes and shutdown arrive on an
//! mpsc channel (`TunerHandle` wraps the sender) and are observed during every
//! wait, so a channel change abandons the current program at once. Each cycle
//! re-resolves from wall-clock time, which is also how drift is corrected.

use crate::builder::ScheduleBuilder;
use crate::catalog::Catalog;
use crate::chapters::ChapterIndex;
use crate::config::{ChannelProfile, TunerState};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::media::Kind;
use crate::player::MediaPlayer;
use crate::schedule::{ScheduleEntry, ScheduleStore};
use crate::status::ChannelStatus;
use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Player poll interval while seeking and playing.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Pause before re-resolving after a gap, a stall or a missing file.
pub const BACKOFF: Duration = Duration::from_secs(1);

// ── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerCommand {
    ChannelUp,
    ChannelDown,
    Tune(u32),
    Shutdown,
}

/// Cloneable sender side of the tuner channel.
#[derive(Clone, Debug)]
pub struct TunerHandle {
    tx: Sender<TunerCommand>,
}

impl TunerHandle {
    pub fn send(&self, cmd: TunerCommand) {
        let _ = self.tx.send(cmd);
    }

    pub fn channel_up(&self) {
        self.send(TunerCommand::ChannelUp);
    }

    pub fn channel_down(&self) {
        self.send(TunerCommand::ChannelDown);
    }

    pub fn tune(&self, channel: u32) {
        self.send(TunerCommand::Tune(channel));
    }

    pub fn shutdown(&self) {
        self.send(TunerCommand::Shutdown);
    }
}

pub fn tuner_channel() -> (TunerHandle, Receiver<TunerCommand>) {
    let (tx, rx) = mpsc::channel();
    (TunerHandle { tx }, rx)
}

// ── Clocks ───────────────────────────────────────────────────────────────────

pub trait Clock {
    fn now(&self) -> NaiveDateTime;
    /// Block for up to `timeout`, returning early with a command if one arrives.
    fn wait(&self, rx: &Receiver<TunerCommand>, timeout: Duration) -> Option<TunerCommand>;
}

/// Local wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    fn wait(&self, rx: &Receiver<TunerCommand>, timeout: Duration) -> Option<TunerCommand> {
        match rx.recv_timeout(timeout) {
            Ok(cmd) => Some(cmd),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

/// Clock that only moves when waited on or advanced by hand. Clones share the
/// same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait(&self, rx: &Receiver<TunerCommand>, timeout: Duration) -> Option<TunerCommand> {
        match rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                self.advance(TimeDelta::from_std(timeout).unwrap_or(TimeDelta::zero()));
                None
            }
        }
    }
}

// ── Pure helpers ─────────────────────────────────────────────────────────────

/// Position inside the file that is live at `now`: time since the entry
/// started plus the chapter's start offset, never negative.
pub fn compute_offset(entry: &ScheduleEntry, chapter_start: TimeDelta, now: NaiveDateTime) -> TimeDelta {
    let into_entry = (now - entry.showtime).max(TimeDelta::zero());
    (into_entry + chapter_start).max(TimeDelta::zero())
}

/// Neighbouring channel in `channels` (sorted), wrapping at either end.
pub fn step_channel(channels: &[u32], current: u32, delta: i64) -> u32 {
    if channels.is_empty() {
        return current;
    }
    let idx = channels.iter().position(|c| *c == current).unwrap_or(0) as i64;
    let len = channels.len() as i64;
    channels[(idx + delta).rem_euclid(len) as usize]
}

/// Channel to start on: the last one watched if it still exists, then the
/// configured default, then the lowest number.
pub fn initial_channel(state: &TunerState, default: u32, channels: &[u32]) -> Option<u32> {
    state
        .last_channel
        .filter(|c| channels.contains(c))
        .or_else(|| channels.contains(&default).then_some(default))
        .or_else(|| channels.first().copied())
}

fn secs_f64(d: TimeDelta) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

// ── Synchronizer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Resolving,
    Seeking,
    Playing,
}

/// How one play cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The entry's end time was reached.
    Ended,
    ChannelChanged,
    /// Player stopped advancing or ran out of file.
    Stalled,
    /// Nothing scheduled right now.
    Gap,
    /// File missing on disk or chapter unknown to the catalog.
    Unplayable,
    Shutdown,
}

pub struct Synchronizer<P: MediaPlayer, C: Clock> {
    player: P,
    clock: C,
    rx: Receiver<TunerCommand>,
    store: ScheduleStore,
    chapters: ChapterIndex,
    catalog: Catalog,
    channels: Vec<u32>,
    channel: u32,
    phase: Phase,
    state_file: Option<PathBuf>,
    status_file: Option<PathBuf>,
    stall_timeout: Duration,
    check_files: bool,
    rebuilder: Option<(ScheduleBuilder, Vec<ChannelProfile>)>,
}

impl<P: MediaPlayer, C: Clock> Synchronizer<P, C> {
    pub fn new(
        db: &Database,
        player: P,
        clock: C,
        rx: Receiver<TunerCommand>,
        mut channels: Vec<u32>,
        start_channel: u32,
    ) -> Self {
        channels.sort_unstable();
        channels.dedup();
        Synchronizer {
            player,
            clock,
            rx,
            store: ScheduleStore::new(db.clone()),
            chapters: ChapterIndex::new(db.clone()),
            catalog: Catalog::new(db.clone()),
            channels,
            channel: start_channel,
            phase: Phase::Idle,
            state_file: None,
            status_file: None,
            stall_timeout: Duration::from_secs(3),
            check_files: true,
            rebuilder: None,
        }
    }

    /// Persist the channel to this file on every change.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Write a `ChannelStatus` JSON snapshot here on every load.
    pub fn with_status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_file = Some(path.into());
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Extend the schedule with `builder` whenever the tuned channel runs
    /// out of future entries.
    pub fn with_rebuilder(mut self, builder: ScheduleBuilder, profiles: Vec<ChannelProfile>) -> Self {
        self.rebuilder = Some((builder, profiles));
        self
    }

    /// Skip the on-disk existence check for scheduled files.
    pub fn without_file_check(mut self) -> Self {
        self.check_files = false;
        self
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    /// Play cycles until shutdown. Errors are logged and retried after a
    /// backoff; the loop only ends on [`TunerCommand::Shutdown`].
    pub fn run(&mut self) {
        info!("tuner starting on channel {}", self.channel);
        loop {
            let outcome = match self.cycle() {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("channel {}: {}", self.channel, e);
                    self.backoff(Outcome::Stalled)
                }
            };
            debug!("channel {}: cycle ended: {:?}", self.channel, outcome);
            if outcome == Outcome::Shutdown {
                break;
            }
        }
        self.phase = Phase::Idle;
        info!("tuner stopped");
    }

    /// Resolve the live entry, join it at the right offset and play it until
    /// it ends, the channel changes or playback stalls.
    pub fn cycle(&mut self) -> Result<Outcome> {
        self.phase = Phase::Resolving;
        let now = self.clock.now();
        self.extend_schedule(now)?;
        let entry = match self.store.current_and_next(self.channel, now) {
            Ok((entry, _)) => entry,
            Err(e @ Error::ScheduleGap { .. }) => {
                warn!("{}", e);
                return Ok(self.backoff(Outcome::Gap));
            }
            Err(e) => return Err(e),
        };

        if self.check_files && !Path::new(&entry.content_ref).exists() {
            warn!("channel {}: file missing: {}", self.channel, entry.content_ref);
            return Ok(self.backoff(Outcome::Unplayable));
        }

        let chapter_start = match entry.chapter {
            Some(index) => match self.chapters.chapter_start(&entry.content_ref, index) {
                Ok(start) => start,
                Err(e @ Error::DataIntegrity(_)) => {
                    error!("channel {}: {}", self.channel, e);
                    return Ok(self.backoff(Outcome::Unplayable));
                }
                Err(e) => return Err(e),
            },
            None => TimeDelta::zero(),
        };

        self.phase = Phase::Seeking;
        info!(
            "channel {}: {} ({} -> {})",
            self.channel, entry.content_ref, entry.showtime, entry.end
        );
        self.player.load(Path::new(&entry.content_ref))?;
        self.update_overlay(&entry)?;
        self.export_status(now);

        if let Some(outcome) = self.wait_until_ready()? {
            return Ok(outcome);
        }

        // Re-read the clock: loading may have taken a while.
        let offset = compute_offset(&entry, chapter_start, self.clock.now());
        if offset > TimeDelta::zero() {
            debug!("seeking to {:.1}s", secs_f64(offset));
            self.player.seek(secs_f64(offset), true)?;
        }
        if self.player.is_paused()? {
            self.player.set_pause(false)?;
        }

        self.phase = Phase::Playing;
        self.play_until_end(&entry)
    }

    /// Build due channels when the tuned one has nothing left to air.
    fn extend_schedule(&self, now: NaiveDateTime) -> Result<()> {
        let Some((builder, profiles)) = &self.rebuilder else {
            return Ok(());
        };
        if !self.store.needs_rebuild(self.channel, now)? {
            return Ok(());
        }
        info!("channel {}: schedule exhausted, rebuilding", self.channel);
        for outcome in builder.rebuild_due_channels(profiles, now)? {
            if let Err(e) = outcome.result {
                error!("channel {}: rebuild failed: {}", outcome.channel, e);
            }
        }
        Ok(())
    }

    /// Polls until the player reports a duration and a seekable file, with no
    /// deadline. `Some` when a command cut the wait short.
    fn wait_until_ready(&mut self) -> Result<Option<Outcome>> {
        loop {
            if self.player.duration_secs()?.is_some() && self.player.is_seekable()? {
                return Ok(None);
            }
            if let Some(cmd) = self.clock.wait(&self.rx, POLL_INTERVAL) {
                return Ok(Some(self.apply(cmd)));
            }
        }
    }

    fn play_until_end(&mut self, entry: &ScheduleEntry) -> Result<Outcome> {
        let stall_after = TimeDelta::from_std(self.stall_timeout).unwrap_or(TimeDelta::seconds(3));
        let mut last_pos: Option<f64> = None;
        let mut last_progress = self.clock.now();

        loop {
            if let Some(cmd) = self.clock.wait(&self.rx, POLL_INTERVAL) {
                return Ok(self.apply(cmd));
            }
            let now = self.clock.now();
            if now >= entry.end {
                return Ok(Outcome::Ended);
            }

            let Some(pos) = self.player.position_secs()? else {
                return Ok(self.stalled(entry, now, "position unavailable"));
            };
            if let Some(duration) = self.player.duration_secs()? {
                if pos >= duration {
                    return Ok(self.stalled(entry, now, "reached end of file"));
                }
            }

            if last_pos.is_none_or(|last| pos > last) {
                last_pos = Some(pos);
                last_progress = now;
            } else if now - last_progress >= stall_after {
                return Ok(self.stalled(entry, now, "position stopped advancing"));
            }
        }
    }

    fn stalled(&mut self, entry: &ScheduleEntry, now: NaiveDateTime, reason: &str) -> Outcome {
        let e = Error::PlaybackStalled(format!("{}: {}", entry.content_ref, reason));
        // Running out of file within the chapter tail pad is expected.
        if entry.end - now <= TimeDelta::from_std(BACKOFF).unwrap_or(TimeDelta::seconds(1)) {
            debug!("channel {}: {}", self.channel, e);
        } else {
            warn!("channel {}: {}", self.channel, e);
        }
        self.backoff(Outcome::Stalled)
    }

    /// Interruptible pause before the next resolve.
    fn backoff(&mut self, outcome: Outcome) -> Outcome {
        self.phase = Phase::Idle;
        match self.clock.wait(&self.rx, BACKOFF) {
            Some(cmd) => self.apply(cmd),
            None => outcome,
        }
    }

    fn apply(&mut self, cmd: TunerCommand) -> Outcome {
        let target = match cmd {
            TunerCommand::Shutdown => return Outcome::Shutdown,
            TunerCommand::ChannelUp => step_channel(&self.channels, self.channel, 1),
            TunerCommand::ChannelDown => step_channel(&self.channels, self.channel, -1),
            TunerCommand::Tune(n) if self.channels.contains(&n) => n,
            TunerCommand::Tune(n) => {
                warn!("channel {} is not in the lineup", n);
                self.channel
            }
        };
        if target != self.channel {
            info!("tuning {} -> {}", self.channel, target);
            self.channel = target;
            self.save_state();
        }
        Outcome::ChannelChanged
    }

    fn save_state(&self) {
        let Some(path) = &self.state_file else { return };
        let state = TunerState {
            last_channel: Some(self.channel),
        };
        if let Err(e) = state.save(path) {
            warn!("could not save tuner state to {}: {}", path.display(), e);
        }
    }

    /// `artist | title` over music videos, nothing over anything else.
    fn update_overlay(&mut self, entry: &ScheduleEntry) -> Result<()> {
        let is_music = self
            .catalog
            .get(&entry.content_ref)?
            .is_some_and(|item| item.kind() == Kind::Music);
        if is_music {
            let (artist, title) = self.catalog.music_credit(&entry.content_ref)?;
            self.player.show_overlay(&format!("{artist} | {title}"))
        } else {
            self.player.clear_overlay()
        }
    }

    fn export_status(&self, now: NaiveDateTime) {
        let Some(path) = &self.status_file else { return };
        let result = ChannelStatus::snapshot(&self.store, &self.catalog, self.channel, now)
            .and_then(|status| status.export_json(path));
        if let Err(e) = result {
            warn!("could not write status to {}: {}", path.display(), e);
        }
    }
}
