//! Chapter index: per-episode segment boundaries.

use crate::db::{Database, from_secs};
use crate::error::{Error, Result};
use crate::media::Chapter;
use chrono::TimeDelta;
use rusqlite::{OptionalExtension, params};

/// A trailing chapter shorter than this is folded into the one before it.
pub const SHORT_TAIL_SECS: i64 = 90;

/// Split an episode's chapters into schedulable segments.
///
/// When the final chapter is shorter than [`SHORT_TAIL_SECS`] it is merged
/// with the second-to-last one; the merged segment keeps the second-to-last
/// chapter's index so playback seeks to its start. An empty list stays empty
/// and the caller schedules the episode as a single block.
pub fn segments(chapters: &[Chapter]) -> Vec<Chapter> {
    let mut out = chapters.to_vec();
    out.sort_by_key(|c| c.start);

    if out.len() >= 2 {
        let last = out[out.len() - 1];
        if last.duration() < TimeDelta::seconds(SHORT_TAIL_SECS) {
            out.pop();
            if let Some(prev) = out.last_mut() {
                prev.end = last.end;
            }
        }
    }
    out
}

#[derive(Clone)]
pub struct ChapterIndex {
    db: Database,
}

impl ChapterIndex {
    pub fn new(db: Database) -> Self {
        ChapterIndex { db }
    }

    /// Chapters of `filepath` ordered by start offset. Unknown files and
    /// files without chapter data both yield an empty list.
    pub fn chapters_for(&self, filepath: &str) -> Result<Vec<Chapter>> {
        self.db.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.idx, c.start_secs, c.end_secs
                 FROM chapters c JOIN media m ON m.id = c.media_id
                 WHERE m.filepath = ?1
                 ORDER BY c.start_secs ASC",
            )?;
            let mut rows = stmt.query(params![filepath])?;
            let mut chapters = Vec::new();
            while let Some(row) = rows.next()? {
                chapters.push(Chapter {
                    index: row.get(0)?,
                    start: from_secs(row.get(1)?),
                    end: from_secs(row.get(2)?),
                });
            }
            Ok(chapters)
        })
    }

    /// Start offset of chapter `index` within `filepath`.
    pub fn chapter_start(&self, filepath: &str, index: u32) -> Result<TimeDelta> {
        let start: Option<i64> = self.db.execute(|conn| {
            Ok(conn
                .query_row(
                    "SELECT c.start_secs
                     FROM chapters c JOIN media m ON m.id = c.media_id
                     WHERE m.filepath = ?1 AND c.idx = ?2",
                    params![filepath, index],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        start.map(from_secs).ok_or_else(|| {
            Error::DataIntegrity(format!("chapter {index} of '{filepath}' is not in the catalog"))
        })
    }
}
