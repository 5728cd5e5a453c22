//! `HH:MM:SS` text at the edges, `TimeDelta` / `NaiveDateTime` everywhere else.

use crate::error::{Error, Result};
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};

/// Storage format for schedule timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a time of day in HH:MM or HH:MM:SS format.
pub fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| Error::InvalidTime(s.to_string()))
}

/// Parse a duration written as `H:MM:SS`, `MM:SS` or plain seconds.
/// Hours may exceed 23 (long movies, whole-day padding).
pub fn parse_duration(s: &str) -> Result<TimeDelta> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let nums = parts
        .iter()
        .map(|p| p.parse::<i64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidTime(s.to_string()))?;

    let secs = match nums.as_slice() {
        [s] => *s,
        [m, s] if (0..60).contains(s) => m * 60 + s,
        [h, m, s] if (0..60).contains(m) && (0..60).contains(s) => h * 3600 + m * 60 + s,
        _ => return Err(Error::InvalidTime(s.to_string())),
    };
    if secs < 0 {
        return Err(Error::InvalidTime(s.to_string()));
    }
    Ok(TimeDelta::seconds(secs))
}

/// Format a duration as `H:MM:SS`, negative durations clamp to zero.
pub fn format_duration(d: TimeDelta) -> String {
    let secs = d.num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map_err(|_| Error::InvalidTime(s.to_string()))
}

pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Serde adapter storing a `TimeDelta` as `"H:MM:SS"`.
pub mod hms_serde {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TimeDelta, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `NaiveTime` written as HH:MM or HH:MM:SS.
pub mod time_of_day_serde {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod option_time_of_day_serde {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_some(&t.format("%H:%M:%S").to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) => super::parse_time(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
