//! Catalog store: tag search over the media library and least-recently-played
//! weighted selection.

use crate::db::{Database, from_secs, parse_stored_timestamp, to_secs};
use crate::error::{Error, Result};
use crate::media::{Chapter, ContentItem, Kind, MediaDetails};
use crate::timecode::format_timestamp;
use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Weight of an item that has never been played.
pub const NEVER_PLAYED_WEIGHT: u64 = 10_000;

/// Tag that keeps an item out of every commercial pool.
pub const FILLER_TAG: &str = "filler";

const MEDIA_COLUMNS: &str = "filepath, kind, title, show_name, season, episode, year, artist, tags, runtime_secs, last_played";

/// Constraints applied when picking an item.
#[derive(Debug, Clone, Default)]
pub struct PickFilter {
    /// Allowed kinds; empty means any kind.
    pub kinds: Vec<Kind>,
    /// Every tag must match (see [`ContentItem::matches_tags`]).
    pub tags: Vec<String>,
    /// Items tagged with any of these are skipped.
    pub exclude_tags: Vec<String>,
    /// Items longer than this are skipped.
    pub max_runtime: Option<TimeDelta>,
    /// Filepaths already used by the caller.
    pub exclude: HashSet<String>,
}

impl PickFilter {
    pub fn kinds(kinds: &[Kind]) -> Self {
        PickFilter {
            kinds: kinds.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_tags<S: AsRef<str>>(mut self, tags: &[S]) -> Self {
        self.tags = tags.iter().map(|t| t.as_ref().to_string()).collect();
        self
    }

    fn admits(&self, item: &ContentItem) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&item.kind()))
            && item.matches_tags(&self.tags)
            && !self.exclude_tags.iter().any(|t| item.has_tag(t))
            && self.max_runtime.is_none_or(|max| item.runtime <= max)
            && !self.exclude.contains(&item.filepath)
    }

    fn describe(&self) -> String {
        let kinds: Vec<&str> = self.kinds.iter().map(|k| k.as_str()).collect();
        format!("kinds [{}] tags [{}]", kinds.join(", "), self.tags.join(", "))
    }
}

/// Pick one candidate with probability proportional to the time since it was
/// last played. Never-played items weigh [`NEVER_PLAYED_WEIGHT`]; every item
/// weighs at least 1 so nothing is starved outright.
pub fn select_weighted<'a>(
    candidates: &'a [ContentItem],
    now: NaiveDateTime,
    rng: &mut fastrand::Rng,
) -> Option<&'a ContentItem> {
    if candidates.is_empty() {
        return None;
    }

    let weights: Vec<u64> = candidates.iter().map(|c| play_weight(c, now)).collect();
    let total: u64 = weights.iter().sum();
    let mut roll = rng.u64(0..total);

    for (item, weight) in candidates.iter().zip(&weights) {
        if roll < *weight {
            return Some(item);
        }
        roll -= weight;
    }
    candidates.last()
}

pub fn play_weight(item: &ContentItem, now: NaiveDateTime) -> u64 {
    match item.last_played {
        None => NEVER_PLAYED_WEIGHT,
        Some(at) => (now - at).num_seconds().max(1) as u64,
    }
}

#[derive(Clone)]
pub struct Catalog {
    db: Database,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Catalog { db }
    }

    /// Items of `kind` (any kind when `None`) matching every query tag.
    pub fn search_by_tags<S: AsRef<str>>(
        &self,
        kind: Option<Kind>,
        tags: &[S],
    ) -> Result<Vec<ContentItem>> {
        let kinds: Vec<Kind> = kind.into_iter().collect();
        self.db.execute(|conn| {
            let items = load_items(conn, &kinds, None)?;
            Ok(items.into_iter().filter(|i| i.matches_tags(tags)).collect())
        })
    }

    pub fn get(&self, filepath: &str) -> Result<Option<ContentItem>> {
        self.db.execute(|conn| {
            let sql = format!("SELECT {MEDIA_COLUMNS} FROM media WHERE filepath = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![filepath])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_item(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn mark_played(&self, filepath: &str, now: NaiveDateTime) -> Result<()> {
        self.db.execute(|conn| {
            let updated = conn.execute(
                "UPDATE media SET last_played = ?1 WHERE filepath = ?2",
                params![format_timestamp(now), filepath],
            )?;
            if updated == 0 {
                return Err(Error::DataIntegrity(format!(
                    "cannot mark unknown item '{filepath}' as played"
                )));
            }
            Ok(())
        })
    }

    /// Weighted pick that records the play in the same transaction, so two
    /// channels building concurrently never see the same stale weights.
    pub fn pick(
        &self,
        filter: &PickFilter,
        now: NaiveDateTime,
        rng: &mut fastrand::Rng,
    ) -> Result<ContentItem> {
        self.pick_with(filter, now, |candidates| {
            select_weighted(candidates, now, rng)
        })
    }

    /// Uniform pick, also recorded as played.
    pub fn pick_uniform(
        &self,
        filter: &PickFilter,
        now: NaiveDateTime,
        rng: &mut fastrand::Rng,
    ) -> Result<ContentItem> {
        self.pick_with(filter, now, |candidates| {
            if candidates.is_empty() {
                None
            } else {
                candidates.get(rng.usize(0..candidates.len()))
            }
        })
    }

    fn pick_with<F>(&self, filter: &PickFilter, now: NaiveDateTime, choose: F) -> Result<ContentItem>
    where
        F: for<'a> FnOnce(&'a [ContentItem]) -> Option<&'a ContentItem>,
    {
        self.db.execute(|conn| {
            let tx = conn.transaction()?;
            let candidates: Vec<ContentItem> = load_items(&tx, &filter.kinds, filter.max_runtime)?
                .into_iter()
                .filter(|i| filter.admits(i))
                .collect();

            let mut chosen = choose(&candidates)
                .cloned()
                .ok_or_else(|| Error::NoContentAvailable(filter.describe()))?;

            tx.execute(
                "UPDATE media SET last_played = ?1 WHERE filepath = ?2",
                params![format_timestamp(now), chosen.filepath],
            )?;
            tx.commit()?;

            debug!(
                "picked {} from {} candidates",
                chosen.filepath,
                candidates.len()
            );
            chosen.last_played = Some(now);
            Ok(chosen)
        })
    }

    /// `(artist, title)` for a music item, with placeholders when unknown.
    pub fn music_credit(&self, filepath: &str) -> Result<(String, String)> {
        Ok(match self.get(filepath)? {
            Some(ContentItem {
                title,
                details: MediaDetails::Music { artist },
                ..
            }) => (artist, title),
            _ => ("Unknown Artist".to_string(), "Unknown Title".to_string()),
        })
    }

    /// Load an ingestion result into the catalog. Existing items are updated
    /// in place and keep their play history; their chapters are replaced.
    pub fn import(&self, file: &CatalogFile) -> Result<ImportSummary> {
        self.db.execute(|conn| {
            let tx = conn.transaction()?;
            let mut summary = ImportSummary::default();

            for record in &file.items {
                let item = &record.item;
                let (show, season, episode, year, artist) = detail_columns(&item.details);
                tx.execute(
                    "INSERT INTO media (filepath, kind, title, show_name, season, episode, year, artist, tags, runtime_secs, last_played)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(filepath) DO UPDATE SET
                        kind = excluded.kind,
                        title = excluded.title,
                        show_name = excluded.show_name,
                        season = excluded.season,
                        episode = excluded.episode,
                        year = excluded.year,
                        artist = excluded.artist,
                        tags = excluded.tags,
                        runtime_secs = excluded.runtime_secs,
                        last_played = COALESCE(excluded.last_played, media.last_played)",
                    params![
                        item.filepath,
                        item.kind().as_str(),
                        item.title,
                        show,
                        season,
                        episode,
                        year,
                        artist,
                        serde_json::to_string(&item.tags)?,
                        to_secs(item.runtime),
                        item.last_played.map(format_timestamp),
                    ],
                )?;
                summary.items += 1;

                let media_id: i64 = tx.query_row(
                    "SELECT id FROM media WHERE filepath = ?1",
                    params![item.filepath],
                    |row| row.get(0),
                )?;
                tx.execute("DELETE FROM chapters WHERE media_id = ?1", params![media_id])?;

                for chapter in &record.chapters {
                    if chapter.end <= chapter.start {
                        warn!(
                            "skipping chapter {} of {}: end is not after start",
                            chapter.index, item.filepath
                        );
                        summary.skipped_chapters += 1;
                        continue;
                    }
                    tx.execute(
                        "INSERT OR REPLACE INTO chapters (media_id, idx, start_secs, end_secs)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            media_id,
                            chapter.index,
                            to_secs(chapter.start),
                            to_secs(chapter.end)
                        ],
                    )?;
                    summary.chapters += 1;
                }
            }

            tx.commit()?;
            info!(
                "imported {} items and {} chapters",
                summary.items, summary.chapters
            );
            Ok(summary)
        })
    }

    /// Item counts per kind, in [`Kind::ALL`] order.
    pub fn stats(&self) -> Result<Vec<(Kind, usize)>> {
        self.db.execute(|conn| {
            let mut out = Vec::with_capacity(Kind::ALL.len());
            for kind in Kind::ALL {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM media WHERE kind = ?1",
                    params![kind.as_str()],
                    |row| row.get(0),
                )?;
                out.push((kind, count as usize));
            }
            Ok(out)
        })
    }

}

/// On-disk result of the external ingestion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub items: Vec<CatalogRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(flatten)]
    pub item: ContentItem,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub items: usize,
    pub chapters: usize,
    pub skipped_chapters: usize,
}

type DetailColumns<'a> = (
    Option<&'a str>,
    Option<u32>,
    Option<u32>,
    Option<i32>,
    Option<&'a str>,
);

fn detail_columns(details: &MediaDetails) -> DetailColumns<'_> {
    match details {
        MediaDetails::Episode {
            show,
            season,
            episode,
        } => (Some(show.as_str()), Some(*season), Some(*episode), None, None),
        MediaDetails::Movie { year } => (None, None, None, *year, None),
        MediaDetails::Music { artist } => (None, None, None, None, Some(artist.as_str())),
        MediaDetails::Ident | MediaDetails::Commercial | MediaDetails::Web => {
            (None, None, None, None, None)
        }
    }
}

/// Rows of the given kinds (all kinds when empty) no longer than
/// `max_runtime`, in filepath order.
fn load_items(
    conn: &Connection,
    kinds: &[Kind],
    max_runtime: Option<TimeDelta>,
) -> Result<Vec<ContentItem>> {
    let mut clauses = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if !kinds.is_empty() {
        let marks = vec!["?"; kinds.len()].join(", ");
        clauses.push(format!("kind IN ({marks})"));
        args.extend(kinds.iter().map(|k| Value::Text(k.as_str().to_string())));
    }
    if let Some(max) = max_runtime {
        clauses.push("runtime_secs <= ?".to_string());
        args.push(Value::Integer(max.num_seconds()));
    }
    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = format!("SELECT {MEDIA_COLUMNS} FROM media{filter} ORDER BY filepath");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(args))?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(row_to_item(row)?);
    }
    Ok(items)
}

fn row_to_item(row: &Row) -> Result<ContentItem> {
    let filepath: String = row.get("filepath")?;
    let kind_raw: String = row.get("kind")?;
    let kind = Kind::from_str_loose(&kind_raw).map_err(Error::DataIntegrity)?;

    let details = match kind {
        Kind::Episode => MediaDetails::Episode {
            show: row.get::<_, Option<String>>("show_name")?.unwrap_or_default(),
            season: row.get::<_, Option<u32>>("season")?.unwrap_or_default(),
            episode: row.get::<_, Option<u32>>("episode")?.unwrap_or_default(),
        },
        Kind::Movie => MediaDetails::Movie {
            year: row.get("year")?,
        },
        Kind::Music => MediaDetails::Music {
            artist: row
                .get::<_, Option<String>>("artist")?
                .unwrap_or_else(|| "Unknown Artist".to_string()),
        },
        Kind::Ident => MediaDetails::Ident,
        Kind::Commercial => MediaDetails::Commercial,
        Kind::Web => MediaDetails::Web,
    };

    let tags_raw: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw)
        .map_err(|e| Error::DataIntegrity(format!("bad tags for {filepath}: {e}")))?;

    let last_played = match row.get::<_, Option<String>>("last_played")? {
        Some(raw) => Some(parse_stored_timestamp(&raw, "last_played")?),
        None => None,
    };

    Ok(ContentItem {
        title: row.get("title")?,
        tags,
        runtime: from_secs(row.get("runtime_secs")?),
        last_played,
        details,
        filepath,
    })
}
