//! Now-playing snapshot for one channel, exported as JSON for the dashboard.

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::schedule::{ScheduleEntry, ScheduleStore};
use crate::timecode::{format_duration, format_timestamp};
use chrono::{NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramStatus {
    pub label: String,
    pub content_ref: String,
    pub chapter: Option<u32>,
    pub showtime: String,
    pub end: String,
    pub elapsed_secs: i64,
    pub remaining_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub channel: u32,
    pub generated_at: String,
    /// `None` when nothing is scheduled right now.
    pub current: Option<ProgramStatus>,
    pub next: Option<ProgramStatus>,
}

impl ChannelStatus {
    /// Snapshot of what airs on `channel` at `now`. A gap in the schedule is
    /// reported as an empty status rather than an error.
    pub fn snapshot(
        store: &ScheduleStore,
        catalog: &Catalog,
        channel: u32,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let (current, next) = match store.current_and_next(channel, now) {
            Ok((current, next)) => (Some(current), next),
            Err(Error::ScheduleGap { .. }) => (None, None),
            Err(e) => return Err(e),
        };

        Ok(ChannelStatus {
            channel,
            generated_at: format_timestamp(now),
            current: current
                .map(|e| program_status(catalog, &e, now))
                .transpose()?,
            next: next.map(|e| program_status(catalog, &e, now)).transpose()?,
        })
    }

    /// One-line summary for the CLI.
    pub fn summary(&self) -> String {
        match (&self.current, &self.next) {
            (Some(cur), next) => {
                let mut line = format!(
                    "ch {}: {} ({} left)",
                    self.channel,
                    cur.label,
                    format_duration(TimeDelta::seconds(cur.remaining_secs))
                );
                if let Some(next) = next {
                    line.push_str(&format!(", next {} at {}", next.label, next.showtime));
                }
                line
            }
            (None, _) => format!("ch {}: off air", self.channel),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn export_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

fn program_status(catalog: &Catalog, entry: &ScheduleEntry, now: NaiveDateTime) -> Result<ProgramStatus> {
    let label = match catalog.get(&entry.content_ref)? {
        Some(item) => item.label(),
        None => Path::new(&entry.content_ref)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.content_ref.clone()),
    };
    let elapsed = entry.elapsed_at(now);
    Ok(ProgramStatus {
        label,
        content_ref: entry.content_ref.clone(),
        chapter: entry.chapter,
        showtime: format_timestamp(entry.showtime),
        end: format_timestamp(entry.end),
        elapsed_secs: elapsed.num_seconds(),
        remaining_secs: (entry.runtime - elapsed).num_seconds().max(0),
    })
}
