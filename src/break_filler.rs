//! Break filler: packs commercials (or web shorts) into a gap and closes it
//! with exactly one filler entry ending on the deadline.

use crate::builder::{BuildCursor, Timeline};
use crate::catalog::{Catalog, FILLER_TAG, PickFilter};
use crate::error::{Error, Result};
use crate::media::Kind;
use crate::slots::next_half_hour;
use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, warn};

/// Mid-program breaks stop once this much budget or less is left.
pub const MID_BREAK_MIN_SECS: i64 = 14;

/// End-of-program breaks hand over to the filler at this remaining time.
pub const END_BREAK_FILLER_SECS: i64 = 60;

pub struct BreakFiller<'a> {
    catalog: &'a Catalog,
    timeline: &'a Timeline<'a>,
    filler_path: &'a str,
    commercials: bool,
    now: NaiveDateTime,
}

impl<'a> BreakFiller<'a> {
    /// `now` is the wall-clock time used for play weighting; `commercials`
    /// false leaves only the filler in every break.
    pub fn new(
        catalog: &'a Catalog,
        timeline: &'a Timeline<'a>,
        filler_path: &'a str,
        commercials: bool,
        now: NaiveDateTime,
    ) -> Self {
        BreakFiller {
            catalog,
            timeline,
            filler_path,
            commercials,
            now,
        }
    }

    /// Commercials between chapters, up to `budget`. No filler is added.
    pub fn mid_program(
        &self,
        cursor: BuildCursor,
        budget: TimeDelta,
        rng: &mut fastrand::Rng,
    ) -> Result<BuildCursor> {
        if !self.commercials {
            return Ok(cursor);
        }
        debug!("mid-program break of {}s at {}", budget.num_seconds(), cursor.marker);
        let (cursor, _) = self.pack(
            cursor,
            budget,
            TimeDelta::seconds(MID_BREAK_MIN_SECS),
            Kind::Commercial,
            rng,
        )?;
        Ok(cursor)
    }

    /// Commercials until a minute or less remains before `deadline`, then the
    /// filler. The returned cursor sits exactly on the deadline.
    pub fn end_of_program(
        &self,
        cursor: BuildCursor,
        deadline: NaiveDateTime,
        rng: &mut fastrand::Rng,
    ) -> Result<BuildCursor> {
        let deadline = self.realign(cursor, deadline);
        let mut cursor = cursor;
        if self.commercials {
            (cursor, _) = self.pack(
                cursor,
                deadline - cursor.marker,
                TimeDelta::seconds(END_BREAK_FILLER_SECS),
                Kind::Commercial,
                rng,
            )?;
        }
        self.close(cursor, deadline)
    }

    /// Web shorts and trailers that fit before `deadline`, then the filler.
    pub fn post_movie(
        &self,
        cursor: BuildCursor,
        deadline: NaiveDateTime,
        rng: &mut fastrand::Rng,
    ) -> Result<BuildCursor> {
        let deadline = self.realign(cursor, deadline);
        let (cursor, _) = self.pack(
            cursor,
            deadline - cursor.marker,
            TimeDelta::zero(),
            Kind::Web,
            rng,
        )?;
        self.close(cursor, deadline)
    }

    /// Pad from the cursor to `deadline` with the filler alone.
    pub fn pad(&self, cursor: BuildCursor, deadline: NaiveDateTime) -> Result<BuildCursor> {
        let deadline = self.realign(cursor, deadline);
        self.close(cursor, deadline)
    }

    /// A deadline already behind the cursor moves to the next half hour.
    fn realign(&self, cursor: BuildCursor, deadline: NaiveDateTime) -> NaiveDateTime {
        if deadline < cursor.marker {
            let moved = next_half_hour(cursor.marker);
            warn!(
                "channel {}: break deadline {} is behind marker {}, moving to {}",
                cursor.channel, deadline, cursor.marker, moved
            );
            moved
        } else {
            deadline
        }
    }

    /// Weighted-pick items of `kind` that fit the remaining budget, each at
    /// most once, while more than `stop_at` remains.
    fn pack(
        &self,
        mut cursor: BuildCursor,
        budget: TimeDelta,
        stop_at: TimeDelta,
        kind: Kind,
        rng: &mut fastrand::Rng,
    ) -> Result<(BuildCursor, TimeDelta)> {
        let mut remaining = budget;
        let mut filter = PickFilter::kinds(&[kind]);
        filter.exclude_tags = vec![FILLER_TAG.to_string()];
        filter.exclude.insert(self.filler_path.to_string());

        while remaining > stop_at {
            filter.max_runtime = Some(remaining);
            let item = match self.catalog.pick(&filter, self.now, rng) {
                Ok(item) => item,
                Err(Error::NoContentAvailable(_)) => {
                    debug!("no {kind} fits {}s, closing break", remaining.num_seconds());
                    break;
                }
                Err(e) => return Err(e),
            };
            filter.exclude.insert(item.filepath.clone());

            if item.runtime <= TimeDelta::zero() {
                warn!("skipping {} with empty runtime", item.filepath);
                continue;
            }

            cursor = self.timeline.place(cursor, &item.filepath, None, item.runtime)?;
            remaining -= item.runtime;
        }
        Ok((cursor, remaining))
    }

    /// The filler entry: its end is the deadline, its runtime the padding.
    /// A break the commercials already filled to the second gets none, since
    /// a zero-length entry cannot be stored.
    fn close(&self, cursor: BuildCursor, deadline: NaiveDateTime) -> Result<BuildCursor> {
        let padding = deadline - cursor.marker;
        if padding <= TimeDelta::zero() {
            return Ok(cursor);
        }
        self.timeline.place(cursor, self.filler_path, None, padding)
    }
}
