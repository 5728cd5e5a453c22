//! Schedule store: the per-channel timeline the builder writes and the
//! synchronizer reads.

use crate::db::{Database, from_secs, parse_stored_timestamp, to_secs};
use crate::error::{Error, Result};
use crate::timecode::format_timestamp;
use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

/// Elapsed entries are kept this long before pruning.
pub const DEFAULT_RETENTION_HOURS: i64 = 3;

const ENTRY_COLUMNS: &str = "channel, showtime, end_time, filepath, chapter, runtime_secs";

/// One contiguous airing of a file (or one chapter of it) on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub channel: u32,
    pub showtime: NaiveDateTime,
    pub end: NaiveDateTime,
    pub content_ref: String,
    pub chapter: Option<u32>,
    #[serde(serialize_with = "serialize_secs")]
    pub runtime: TimeDelta,
}

fn serialize_secs<S: serde::Serializer>(d: &TimeDelta, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_seconds())
}

impl ScheduleEntry {
    pub fn new(
        channel: u32,
        showtime: NaiveDateTime,
        content_ref: impl Into<String>,
        chapter: Option<u32>,
        runtime: TimeDelta,
    ) -> Self {
        ScheduleEntry {
            channel,
            showtime,
            end: showtime + runtime,
            content_ref: content_ref.into(),
            chapter,
            runtime,
        }
    }

    pub fn covers(&self, at: NaiveDateTime) -> bool {
        self.showtime <= at && at < self.end
    }

    /// Time elapsed since the entry started, clamped to its runtime.
    pub fn elapsed_at(&self, at: NaiveDateTime) -> TimeDelta {
        (at - self.showtime).clamp(TimeDelta::zero(), self.runtime)
    }
}

#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        ScheduleStore { db }
    }

    /// Append one entry in its own transaction.
    pub fn insert(&self, entry: &ScheduleEntry) -> Result<()> {
        if entry.runtime <= TimeDelta::zero() || entry.end != entry.showtime + entry.runtime {
            return Err(Error::DataIntegrity(format!(
                "refusing malformed entry for {} at {} ({}s)",
                entry.content_ref,
                entry.showtime,
                entry.runtime.num_seconds()
            )));
        }

        self.db.execute(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO schedule (channel, showtime, end_time, filepath, chapter, runtime_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.channel,
                    format_timestamp(entry.showtime),
                    format_timestamp(entry.end),
                    entry.content_ref,
                    entry.chapter,
                    to_secs(entry.runtime),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn entries_for_channel(&self, channel: u32) -> Result<Vec<ScheduleEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM schedule WHERE channel = ?1 ORDER BY showtime ASC"
            ),
            params![channel],
        )
    }

    /// True when the channel has no entry ending after `now`.
    pub fn needs_rebuild(&self, channel: u32, now: NaiveDateTime) -> Result<bool> {
        let future: i64 = self.db.execute(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM schedule WHERE channel = ?1 AND end_time > ?2",
                params![channel, format_timestamp(now)],
                |row| row.get(0),
            )?)
        })?;
        debug!("channel {channel}: {future} entries end after {now}");
        Ok(future == 0)
    }

    pub fn channels_needing_rebuild(&self, channels: &[u32], now: NaiveDateTime) -> Result<Vec<u32>> {
        let mut due = Vec::new();
        for &channel in channels {
            if self.needs_rebuild(channel, now)? {
                due.push(channel);
            }
        }
        Ok(due)
    }

    /// Delete entries that ended more than `retention` before `now`.
    pub fn prune_elapsed(&self, now: NaiveDateTime, retention: TimeDelta) -> Result<usize> {
        let cutoff = format_timestamp(now - retention);
        let removed = self.db.execute(|conn| {
            Ok(conn.execute("DELETE FROM schedule WHERE end_time < ?1", params![cutoff])?)
        })?;
        info!("pruned {removed} schedule entries that ended before {cutoff}");
        Ok(removed)
    }

    /// The entry airing at `now` and the one after it.
    pub fn current_and_next(
        &self,
        channel: u32,
        now: NaiveDateTime,
    ) -> Result<(ScheduleEntry, Option<ScheduleEntry>)> {
        let stamp = format_timestamp(now);
        self.db.execute(|conn| {
            let current = query_one(
                conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM schedule
                     WHERE channel = ?1 AND showtime <= ?2 AND end_time > ?2
                     ORDER BY showtime DESC LIMIT 1"
                ),
                params![channel, stamp],
            )?
            .ok_or(Error::ScheduleGap { channel, at: now })?;

            let next = query_one(
                conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM schedule
                     WHERE channel = ?1 AND showtime >= ?2
                     ORDER BY showtime ASC LIMIT 1"
                ),
                params![channel, format_timestamp(current.end)],
            )?;

            Ok((current, next))
        })
    }

    /// End of the channel's last entry, if any.
    pub fn last_end(&self, channel: u32) -> Result<Option<NaiveDateTime>> {
        let raw: Option<String> = self.db.execute(|conn| {
            Ok(conn
                .query_row(
                    "SELECT MAX(end_time) FROM schedule WHERE channel = ?1",
                    params![channel],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })?;
        raw.map(|r| parse_stored_timestamp(&r, "end_time")).transpose()
    }

    /// Remove entries on `channel` starting after `after`.
    pub fn clear_after(&self, channel: u32, after: NaiveDateTime) -> Result<usize> {
        self.db.execute(|conn| {
            Ok(conn.execute(
                "DELETE FROM schedule WHERE channel = ?1 AND showtime > ?2",
                params![channel, format_timestamp(after)],
            )?)
        })
    }

    fn query_entries(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ScheduleEntry>> {
        self.db.execute(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(args)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_entry(row)?);
            }
            Ok(out)
        })
    }
}

fn query_one(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Option<ScheduleEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_entry(row)?)),
        None => Ok(None),
    }
}

fn row_to_entry(row: &Row) -> Result<ScheduleEntry> {
    let showtime: String = row.get("showtime")?;
    let end: String = row.get("end_time")?;
    Ok(ScheduleEntry {
        channel: row.get("channel")?,
        showtime: parse_stored_timestamp(&showtime, "showtime")?,
        end: parse_stored_timestamp(&end, "end_time")?,
        content_ref: row.get("filepath")?,
        chapter: row.get("chapter")?,
        runtime: from_secs(row.get("runtime_secs")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn make_store() -> ScheduleStore {
        ScheduleStore::new(Database::open_in_memory().unwrap())
    }

    fn push(store: &ScheduleStore, channel: u32, start: NaiveDateTime, mins: i64, path: &str) {
        store
            .insert(&ScheduleEntry::new(
                channel,
                start,
                path,
                None,
                TimeDelta::minutes(mins),
            ))
            .unwrap();
    }

    #[test]
    fn new_entry_end_is_showtime_plus_runtime() {
        let e = ScheduleEntry::new(2, at(20, 0, 0), "/a.mkv", Some(1), TimeDelta::seconds(301));
        assert_eq!(e.end, at(20, 5, 1));
        assert!(e.covers(at(20, 0, 0)));
        assert!(!e.covers(at(20, 5, 1)));
    }

    #[test]
    fn insert_rejects_malformed_entries() {
        let store = make_store();
        let mut e = ScheduleEntry::new(2, at(20, 0, 0), "/a.mkv", None, TimeDelta::minutes(5));
        e.end = at(20, 4, 0);
        assert!(matches!(store.insert(&e), Err(Error::DataIntegrity(_))));

        let zero = ScheduleEntry::new(2, at(20, 0, 0), "/a.mkv", None, TimeDelta::zero());
        assert!(store.insert(&zero).is_err());
    }

    #[test]
    fn entries_round_trip_through_sqlite() {
        let store = make_store();
        let e = ScheduleEntry::new(4, at(9, 15, 0), "/tv/x.mkv", Some(2), TimeDelta::seconds(601));
        store.insert(&e).unwrap();
        assert_eq!(store.entries_for_channel(4).unwrap(), vec![e]);
        assert!(store.entries_for_channel(5).unwrap().is_empty());
    }

    #[test]
    fn needs_rebuild_tracks_future_coverage() {
        let store = make_store();
        assert!(store.needs_rebuild(2, at(12, 0, 0)).unwrap());

        push(&store, 2, at(11, 30, 0), 60, "/a.mkv");
        assert!(!store.needs_rebuild(2, at(12, 0, 0)).unwrap());
        // Entry ends exactly now: no future coverage
        assert!(store.needs_rebuild(2, at(12, 30, 0)).unwrap());
        assert_eq!(
            store.channels_needing_rebuild(&[2, 3], at(12, 0, 0)).unwrap(),
            vec![3]
        );
    }

    #[test]
    fn current_and_next_resolves_live_entry() {
        let store = make_store();
        push(&store, 2, at(20, 0, 0), 30, "/a.mkv");
        push(&store, 2, at(20, 30, 0), 30, "/b.mkv");
        push(&store, 3, at(20, 0, 0), 60, "/other.mkv");

        let (now, next) = store.current_and_next(2, at(20, 10, 0)).unwrap();
        assert_eq!(now.content_ref, "/a.mkv");
        assert_eq!(next.unwrap().content_ref, "/b.mkv");

        let (now, next) = store.current_and_next(2, at(20, 30, 0)).unwrap();
        assert_eq!(now.content_ref, "/b.mkv");
        assert!(next.is_none());
    }

    #[test]
    fn current_and_next_gap_is_error() {
        let store = make_store();
        push(&store, 2, at(20, 0, 0), 30, "/a.mkv");
        let err = store.current_and_next(2, at(21, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::ScheduleGap { channel: 2, .. }));
    }

    #[test]
    fn prune_keeps_retention_window() {
        let store = make_store();
        push(&store, 2, at(6, 0, 0), 30, "/old.mkv");
        push(&store, 2, at(9, 0, 0), 30, "/recent.mkv");
        let removed = store
            .prune_elapsed(at(12, 0, 0), TimeDelta::hours(DEFAULT_RETENTION_HOURS))
            .unwrap();
        assert_eq!(removed, 1);
        let left = store.entries_for_channel(2).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content_ref, "/recent.mkv");
    }

    #[test]
    fn last_end_and_clear_after() {
        let store = make_store();
        assert_eq!(store.last_end(2).unwrap(), None);
        push(&store, 2, at(20, 0, 0), 30, "/a.mkv");
        push(&store, 2, at(20, 30, 0), 30, "/b.mkv");
        assert_eq!(store.last_end(2).unwrap(), Some(at(21, 0, 0)));

        assert_eq!(store.clear_after(2, at(20, 10, 0)).unwrap(), 1);
        assert_eq!(store.last_end(2).unwrap(), Some(at(20, 30, 0)));
    }
}
