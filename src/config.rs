//! Settings, channel lineup, and persisted tuner state.

use crate::error::{Error, Result};
use crate::timecode::{option_time_of_day_serde, time_of_day_serde};
use chrono::NaiveTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "solostation";

pub const ENV_DB: &str = "SOLOSTATION_DB";
pub const ENV_CHANNELS: &str = "SOLOSTATION_CHANNELS";
pub const ENV_FILLER: &str = "SOLOSTATION_FILLER";
pub const ENV_STATE: &str = "SOLOSTATION_STATE";

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

fn default_db_path() -> PathBuf {
    app_dir(dirs::data_dir()).join("solostation.db")
}

fn default_channel_file() -> PathBuf {
    app_dir(dirs::config_dir()).join("channels.json")
}

fn default_state_file() -> PathBuf {
    app_dir(dirs::data_dir()).join("tuner_state.json")
}

fn default_filler_path() -> String {
    app_dir(dirs::video_dir()).join("filler.mp4").to_string_lossy().to_string()
}

fn default_mpv_binary() -> String {
    "mpv".to_string()
}

fn default_mpv_socket() -> PathBuf {
    std::env::temp_dir().join("solostation-mpv.sock")
}

fn default_retention_hours() -> i64 {
    crate::schedule::DEFAULT_RETENTION_HOURS
}

fn default_stall_timeout_secs() -> u64 {
    3
}

fn default_channel() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// Application settings, read from `settings.json` with environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_channel_file")]
    pub channel_file: PathBuf,
    /// Always-available clip that closes every break.
    #[serde(default = "default_filler_path")]
    pub filler_path: String,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Where `watch` writes the live status snapshot, if anywhere.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    #[serde(default = "default_mpv_binary")]
    pub mpv_binary: String,
    #[serde(default = "default_mpv_socket")]
    pub mpv_socket: PathBuf,
    /// Elapsed schedule rows are pruned after this many hours.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    /// Seconds without position progress before playback counts as stalled.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Channel tuned when no state file exists.
    #[serde(default = "default_channel")]
    pub default_channel: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: default_db_path(),
            channel_file: default_channel_file(),
            filler_path: default_filler_path(),
            state_file: default_state_file(),
            status_file: None,
            mpv_binary: default_mpv_binary(),
            mpv_socket: default_mpv_socket(),
            retention_hours: default_retention_hours(),
            stall_timeout_secs: default_stall_timeout_secs(),
            default_channel: default_channel(),
        }
    }
}

impl Settings {
    pub fn default_path() -> PathBuf {
        app_dir(dirs::config_dir()).join("settings.json")
    }

    /// Load settings from `path`, falling back to defaults when the file does
    /// not exist. A file that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let data = fs::read_to_string(path)?;
            serde_json::from_str(&data).map_err(|e| {
                Error::Config(format!("invalid settings file {}: {}", path.display(), e))
            })?
        } else {
            debug!("no settings at {}, using defaults", path.display());
            Settings::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Override paths from the environment (`SOLOSTATION_*`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_DB) {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_CHANNELS) {
            self.channel_file = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_FILLER) {
            self.filler_path = v;
        }
        if let Some(v) = lookup(ENV_STATE) {
            self.state_file = PathBuf::from(v);
        }
    }

    pub fn retention(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::hours(self.retention_hours.max(0))
    }
}

/// How a channel's day is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Episodes and movies by tag, aligned to half-hour slots with breaks.
    #[default]
    TagRotation,
    /// Music videos back to back, an ident after every second video.
    NonstopMusic,
    /// Weighted movies with trailers up to the next quarter-hour showtime.
    NonstopMovie,
    /// One randomly chosen movie repeated all day.
    SingleMovieLoop,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::TagRotation => write!(f, "tag-rotation"),
            Strategy::NonstopMusic => write!(f, "nonstop-music"),
            Strategy::NonstopMovie => write!(f, "nonstop-movie"),
            Strategy::SingleMovieLoop => write!(f, "single-movie-loop"),
        }
    }
}

/// Tags that replace the channel's defaults from `from` onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRule {
    #[serde(with = "time_of_day_serde")]
    pub from: NaiveTime,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub tags: Vec<String>,
    /// When false, breaks skip commercials and go straight to filler.
    #[serde(default = "default_true")]
    pub commercials: bool,
    /// Daily slot map; the latest rule at or before a time of day applies.
    #[serde(default)]
    pub slots: Vec<SlotRule>,
    /// Time of day at which the channel's build window closes.
    #[serde(default, with = "option_time_of_day_serde")]
    pub run_until: Option<NaiveTime>,
}

impl ChannelProfile {
    /// Tags in force at time of day `t`. Before the first rule of the day the
    /// last rule of the previous day still applies.
    pub fn tags_at(&self, t: NaiveTime) -> &[String] {
        if self.slots.is_empty() {
            return &self.tags;
        }
        self.slots
            .iter()
            .filter(|r| r.from <= t)
            .max_by_key(|r| r.from)
            .or_else(|| self.slots.iter().max_by_key(|r| r.from))
            .map(|r| r.tags.as_slice())
            .unwrap_or(self.tags.as_slice())
    }
}

/// The channel lineup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineup {
    pub channels: Vec<ChannelProfile>,
}

impl Lineup {
    /// Load and validate the lineup. Any failure here is fatal to the caller.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read channel file {}: {}", path.display(), e))
        })?;
        let lineup: Lineup = serde_json::from_str(&data).map_err(|e| {
            Error::Config(format!("invalid channel file {}: {}", path.display(), e))
        })?;
        lineup.validate()?;
        Ok(lineup)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::Config("channel lineup is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.number) {
                return Err(Error::Config(format!(
                    "channel number {} is defined twice",
                    ch.number
                )));
            }
        }
        Ok(())
    }

    /// Channel numbers in ascending order.
    pub fn numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.channels.iter().map(|c| c.number).collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn get(&self, number: u32) -> Option<&ChannelProfile> {
        self.channels.iter().find(|c| c.number == number)
    }
}

/// What the tuner remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerState {
    #[serde(default)]
    pub last_channel: Option<u32>,
}

impl TunerState {
    /// Load the state file, or start fresh when missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(state) => return state,
                    Err(e) => warn!("corrupt tuner state file, starting fresh: {}", e),
                },
                Err(e) => warn!("could not read tuner state file: {}", e),
            }
        }
        TunerState::default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
