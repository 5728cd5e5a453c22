//! Schedule builder: lays out each channel's day from its profile.
//!
//! Every step takes a [`BuildCursor`] and returns the advanced one; entries
//! are written as they are placed, one transaction per row. Channels are
//! independent and build on parallel threads, each writing only its own rows.

use crate::break_filler::BreakFiller;
use crate::catalog::{Catalog, PickFilter};
use crate::chapters::{self, ChapterIndex};
use crate::config::{ChannelProfile, Strategy};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::media::{ContentItem, Kind};
use crate::schedule::{ScheduleEntry, ScheduleStore};
use crate::slots::{self, next_half_hour, next_quarter_showtime};
use chrono::{Days, NaiveDateTime, NaiveTime, TimeDelta};
use log::{debug, error, info, warn};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

/// Added to every chapter segment so the cut to commercials is not abrupt.
pub const CHAPTER_TAIL_PAD_SECS: i64 = 1;

/// Consecutive unusable picks before a slot is padded with filler instead.
const MAX_CONSECUTIVE_FAILURES: usize = 8;

/// Where the next entry on a channel starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCursor {
    pub channel: u32,
    pub marker: NaiveDateTime,
}

impl BuildCursor {
    pub fn new(channel: u32, marker: NaiveDateTime) -> Self {
        BuildCursor { channel, marker }
    }
}

/// Writes entries for one build pass and counts them.
pub struct Timeline<'a> {
    store: &'a ScheduleStore,
    placed: Cell<usize>,
}

impl<'a> Timeline<'a> {
    pub fn new(store: &'a ScheduleStore) -> Self {
        Timeline {
            store,
            placed: Cell::new(0),
        }
    }

    /// Insert `content_ref` at the cursor and return the cursor after it.
    pub fn place(
        &self,
        cursor: BuildCursor,
        content_ref: &str,
        chapter: Option<u32>,
        runtime: TimeDelta,
    ) -> Result<BuildCursor> {
        let entry = ScheduleEntry::new(cursor.channel, cursor.marker, content_ref, chapter, runtime);
        self.store.insert(&entry)?;
        self.placed.set(self.placed.get() + 1);
        Ok(BuildCursor::new(cursor.channel, entry.end))
    }

    pub fn placed(&self) -> usize {
        self.placed.get()
    }
}

/// Result of building one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub channel: u32,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub entries: usize,
}

#[derive(Debug)]
pub struct ChannelOutcome {
    pub channel: u32,
    pub result: Result<BuildReport>,
}

/// Build window for a channel: from the end of its last entry (never before
/// today's midnight) to the next midnight or the profile's `run_until`,
/// whichever comes first and still lies ahead of both the start and `now`.
pub fn build_window(
    profile: &ChannelProfile,
    last_end: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> (NaiveDateTime, NaiveDateTime) {
    let midnight = now.date().and_time(NaiveTime::MIN);
    let start = last_end.map_or(midnight, |end| end.max(midnight));
    let floor = start.max(now);

    let mut day = start.date();
    loop {
        let end = match profile.run_until {
            Some(t) => day.and_time(t),
            None => next_day(day.and_time(NaiveTime::MIN)),
        };
        if end > floor {
            return (start, end);
        }
        day = next_day(day.and_time(NaiveTime::MIN)).date();
    }
}

fn next_day(t: NaiveDateTime) -> NaiveDateTime {
    t.checked_add_days(Days::new(1))
        .unwrap_or(t + TimeDelta::days(1))
}

#[derive(Clone)]
pub struct ScheduleBuilder {
    catalog: Catalog,
    chapters: ChapterIndex,
    store: ScheduleStore,
    filler_path: String,
    seed: Option<u64>,
}

impl ScheduleBuilder {
    pub fn new(db: &Database, filler_path: impl Into<String>) -> Self {
        ScheduleBuilder {
            catalog: Catalog::new(db.clone()),
            chapters: ChapterIndex::new(db.clone()),
            store: ScheduleStore::new(db.clone()),
            filler_path: filler_path.into(),
            seed: None,
        }
    }

    /// Deterministic builds: every channel's RNG derives from `seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    fn rng_for(&self, channel: u32) -> fastrand::Rng {
        match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed ^ u64::from(channel).rotate_left(32)),
            None => fastrand::Rng::new(),
        }
    }

    /// Build every channel with no future coverage. A no-op for channels
    /// that are already covered; one channel failing or panicking never
    /// stops the others.
    pub fn rebuild_due_channels(
        &self,
        profiles: &[ChannelProfile],
        now: NaiveDateTime,
    ) -> Result<Vec<ChannelOutcome>> {
        let numbers: Vec<u32> = profiles.iter().map(|p| p.number).collect();
        let due = self.store.channels_needing_rebuild(&numbers, now)?;
        if due.is_empty() {
            info!("all {} channels have future coverage", profiles.len());
            return Ok(Vec::new());
        }

        let due_profiles: Vec<&ChannelProfile> =
            profiles.iter().filter(|p| due.contains(&p.number)).collect();
        Ok(self.build_parallel(&due_profiles, now))
    }

    /// Drop entries that have not started yet and build again from the end
    /// of whatever is airing now.
    pub fn force_rebuild(
        &self,
        profiles: &[ChannelProfile],
        now: NaiveDateTime,
    ) -> Result<Vec<ChannelOutcome>> {
        for profile in profiles {
            let removed = self.store.clear_after(profile.number, now)?;
            info!("channel {}: cleared {} upcoming entries", profile.number, removed);
        }
        let all: Vec<&ChannelProfile> = profiles.iter().collect();
        Ok(self.build_parallel(&all, now))
    }

    fn build_parallel(&self, profiles: &[&ChannelProfile], now: NaiveDateTime) -> Vec<ChannelOutcome> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = profiles
                .iter()
                .map(|profile| {
                    let profile = *profile;
                    let handle = std::thread::Builder::new()
                        .name(format!("build-ch{}", profile.number))
                        .spawn_scoped(scope, move || {
                            panic::catch_unwind(AssertUnwindSafe(|| {
                                let mut rng = self.rng_for(profile.number);
                                self.build_channel(profile, now, &mut rng)
                            }))
                        });
                    (profile.number, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(channel, handle)| {
                    let result = match handle {
                        Ok(h) => match h.join() {
                            Ok(Ok(result)) => result,
                            Ok(Err(_)) | Err(_) => Err(Error::BuildPanicked(channel)),
                        },
                        Err(e) => Err(Error::Io(e)),
                    };
                    match &result {
                        Ok(report) => info!(
                            "channel {}: built {} entries {} -> {}",
                            channel, report.entries, report.start, report.end
                        ),
                        Err(e) => error!("channel {}: build failed: {}", channel, e),
                    }
                    ChannelOutcome { channel, result }
                })
                .collect()
        })
    }

    /// Fill one channel's build window.
    pub fn build_channel(
        &self,
        profile: &ChannelProfile,
        now: NaiveDateTime,
        rng: &mut fastrand::Rng,
    ) -> Result<BuildReport> {
        let last_end = self.store.last_end(profile.number)?;
        let (start, end) = build_window(profile, last_end, now);
        info!(
            "channel {} ({}, {}): building {} -> {}",
            profile.number, profile.name, profile.strategy, start, end
        );

        let timeline = Timeline::new(&self.store);
        let filler = BreakFiller::new(
            &self.catalog,
            &timeline,
            &self.filler_path,
            profile.commercials,
            now,
        );
        let run = ChannelRun {
            builder: self,
            profile,
            timeline: &timeline,
            filler: &filler,
            now,
            end,
        };

        let cursor = BuildCursor::new(profile.number, start);
        let cursor = match profile.strategy {
            Strategy::TagRotation => run.tag_rotation(cursor, rng)?,
            Strategy::NonstopMusic => run.nonstop_music(cursor, rng)?,
            Strategy::NonstopMovie => run.nonstop_movie(cursor, rng)?,
            Strategy::SingleMovieLoop => run.single_movie_loop(cursor, rng)?,
        };

        Ok(BuildReport {
            channel: profile.number,
            start,
            end: cursor.marker,
            entries: timeline.placed(),
        })
    }
}

/// State shared by the strategy steps of one channel build.
struct ChannelRun<'a> {
    builder: &'a ScheduleBuilder,
    profile: &'a ChannelProfile,
    timeline: &'a Timeline<'a>,
    filler: &'a BreakFiller<'a>,
    now: NaiveDateTime,
    end: NaiveDateTime,
}

impl ChannelRun<'_> {
    fn filter_at(&self, kinds: &[Kind], cursor: BuildCursor) -> PickFilter {
        PickFilter::kinds(kinds).with_tags(self.profile.tags_at(cursor.marker.time()))
    }

    /// Nothing schedulable: keep the timeline gap-free with filler up to the
    /// next half hour and try again from there.
    fn pad_slot(&self, cursor: BuildCursor, reason: &Error) -> Result<BuildCursor> {
        let until = next_half_hour(cursor.marker);
        warn!(
            "channel {}: {} at {}, padding to {}",
            cursor.channel, reason, cursor.marker, until
        );
        self.filler.pad(cursor, until)
    }

    fn tag_rotation(&self, mut cursor: BuildCursor, rng: &mut fastrand::Rng) -> Result<BuildCursor> {
        let mut failures = 0;
        while cursor.marker < self.end {
            let filter = self.filter_at(&[Kind::Episode, Kind::Movie], cursor);
            let step = self
                .builder
                .catalog
                .pick(&filter, self.now, rng)
                .and_then(|item| match item.kind() {
                    Kind::Episode => self.place_episode(cursor, &item, rng),
                    _ => self.place_movie(cursor, &item, rng),
                });

            cursor = match step {
                Ok(next) => {
                    failures = 0;
                    next
                }
                Err(e @ Error::NoContentAvailable(_)) => self.pad_slot(cursor, &e)?,
                Err(Error::DataIntegrity(msg)) => {
                    warn!("channel {}: skipping item: {}", cursor.channel, msg);
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        failures = 0;
                        self.pad_slot(cursor, &Error::DataIntegrity(msg))?
                    } else {
                        cursor
                    }
                }
                Err(e) => return Err(e),
            };
        }
        Ok(cursor)
    }

    /// Chapters as separate entries with commercial breaks between them,
    /// then the end-of-program break up to the aligned slot boundary.
    fn place_episode(
        &self,
        cursor: BuildCursor,
        item: &ContentItem,
        rng: &mut fastrand::Rng,
    ) -> Result<BuildCursor> {
        check_runtime(item)?;
        let segments = chapters::segments(&self.builder.chapters.chapters_for(&item.filepath)?);

        if segments.is_empty() {
            let slot = slots::plan_slot(cursor.marker, item.runtime);
            debug!("{} unsegmented, slot ends {}", item.label(), slot.deadline);
            let cursor = self.timeline.place(cursor, &item.filepath, None, item.runtime)?;
            return self.filler.end_of_program(cursor, slot.deadline, rng);
        }

        let pad = TimeDelta::seconds(CHAPTER_TAIL_PAD_SECS);
        let airtime = segments
            .iter()
            .fold(TimeDelta::zero(), |acc, s| acc + s.duration() + pad);
        let slot = slots::plan_slot(cursor.marker, airtime);
        let budget = TimeDelta::seconds(
            (slot.block() - airtime).num_seconds().max(0) / segments.len() as i64,
        );
        debug!(
            "{}: {} segments, slot ends {}, {}s per break",
            item.label(),
            segments.len(),
            slot.deadline,
            budget.num_seconds()
        );

        let mut cursor = cursor;
        for (i, segment) in segments.iter().enumerate() {
            cursor = self.timeline.place(
                cursor,
                &item.filepath,
                Some(segment.index),
                segment.duration() + pad,
            )?;
            if i + 1 < segments.len() {
                cursor = self.filler.mid_program(cursor, budget, rng)?;
            }
        }
        self.filler.end_of_program(cursor, slot.deadline, rng)
    }

    /// Whole movie, then web shorts to the next half hour.
    fn place_movie(
        &self,
        cursor: BuildCursor,
        item: &ContentItem,
        rng: &mut fastrand::Rng,
    ) -> Result<BuildCursor> {
        check_runtime(item)?;
        let cursor = self.timeline.place(cursor, &item.filepath, None, item.runtime)?;
        let next_show = next_half_hour(cursor.marker);
        self.filler.post_movie(cursor, next_show, rng)
    }

    /// Shuffled music videos with an ident after every second one.
    fn nonstop_music(&self, mut cursor: BuildCursor, rng: &mut fastrand::Rng) -> Result<BuildCursor> {
        let catalog = &self.builder.catalog;
        let mut videos: Vec<ContentItem> = Vec::new();
        let mut idents: Vec<ContentItem> = Vec::new();
        let mut aired = 0usize;

        while cursor.marker < self.end {
            if videos.is_empty() {
                videos = playable(catalog.search_by_tags(Some(Kind::Music), self.profile.tags_at(cursor.marker.time()))?);
                if videos.is_empty() {
                    let e = Error::NoContentAvailable(format!("music on channel {}", cursor.channel));
                    cursor = self.pad_slot(cursor, &e)?;
                    continue;
                }
                rng.shuffle(&mut videos);
            }

            let Some(video) = videos.pop() else { continue };
            cursor = self.timeline.place(cursor, &video.filepath, None, video.runtime)?;
            catalog.mark_played(&video.filepath, self.now)?;
            aired += 1;

            if aired % 2 == 0 && cursor.marker < self.end {
                if idents.is_empty() {
                    idents = playable(catalog.search_by_tags::<&str>(Some(Kind::Ident), &[])?);
                    rng.shuffle(&mut idents);
                }
                if let Some(ident) = idents.pop() {
                    cursor = self.timeline.place(cursor, &ident.filepath, None, ident.runtime)?;
                }
            }
        }
        Ok(cursor)
    }

    /// Weighted movies, each followed by web shorts up to the next
    /// quarter-hour showtime.
    fn nonstop_movie(&self, mut cursor: BuildCursor, rng: &mut fastrand::Rng) -> Result<BuildCursor> {
        let mut failures = 0;
        while cursor.marker < self.end {
            let filter = self.filter_at(&[Kind::Movie], cursor);
            let picked = self
                .builder
                .catalog
                .pick(&filter, self.now, rng)
                .and_then(|movie| check_runtime(&movie).map(|_| movie));

            let movie = match picked {
                Ok(movie) => movie,
                Err(e @ Error::NoContentAvailable(_)) => {
                    cursor = self.pad_slot(cursor, &e)?;
                    continue;
                }
                Err(e @ Error::DataIntegrity(_)) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        failures = 0;
                        cursor = self.pad_slot(cursor, &e)?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            failures = 0;

            cursor = self.timeline.place(cursor, &movie.filepath, None, movie.runtime)?;
            if cursor.marker >= self.end {
                break;
            }
            let showtime = next_quarter_showtime(cursor.marker);
            cursor = self.filler.post_movie(cursor, showtime, rng)?;
        }
        Ok(cursor)
    }

    /// One uniformly chosen movie, back to back until the window closes.
    fn single_movie_loop(&self, mut cursor: BuildCursor, rng: &mut fastrand::Rng) -> Result<BuildCursor> {
        let mut filter = self.filter_at(&[Kind::Movie], cursor);
        let movie = loop {
            match self.builder.catalog.pick_uniform(&filter, self.now, rng) {
                Ok(movie) if movie.runtime > TimeDelta::zero() => break movie,
                Ok(movie) => {
                    warn!("skipping {} with empty runtime", movie.filepath);
                    filter.exclude.insert(movie.filepath);
                }
                Err(e @ Error::NoContentAvailable(_)) => {
                    // Nothing to loop: pad the whole window.
                    while cursor.marker < self.end {
                        cursor = self.pad_slot(cursor, &e)?;
                    }
                    return Ok(cursor);
                }
                Err(e) => return Err(e),
            }
        };

        info!("channel {}: looping {}", cursor.channel, movie.label());
        while cursor.marker < self.end {
            cursor = self.timeline.place(cursor, &movie.filepath, None, movie.runtime)?;
        }
        Ok(cursor)
    }
}

fn check_runtime(item: &ContentItem) -> Result<()> {
    if item.runtime <= TimeDelta::zero() {
        return Err(Error::DataIntegrity(format!(
            "{} has no usable runtime",
            item.filepath
        )));
    }
    Ok(())
}

fn playable(items: Vec<ContentItem>) -> Vec<ContentItem> {
    items
        .into_iter()
        .filter(|i| i.runtime > TimeDelta::zero())
        .collect()
}
