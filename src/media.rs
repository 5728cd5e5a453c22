use crate::timecode::hms_serde;
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Catalog category of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Episode,
    Movie,
    Music,
    Ident,
    Commercial,
    Web,
}

impl Kind {
    pub const ALL: [Kind; 6] = [
        Kind::Episode,
        Kind::Movie,
        Kind::Music,
        Kind::Ident,
        Kind::Commercial,
        Kind::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Episode => "episode",
            Kind::Movie => "movie",
            Kind::Music => "music",
            Kind::Ident => "ident",
            Kind::Commercial => "commercial",
            Kind::Web => "web",
        }
    }

    /// Parse a kind from a string (case-insensitive, accepts a few plurals).
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "episode" | "episodes" | "tv" => Ok(Kind::Episode),
            "movie" | "movies" => Ok(Kind::Movie),
            "music" => Ok(Kind::Music),
            "ident" | "idents" => Ok(Kind::Ident),
            "commercial" | "commercials" => Ok(Kind::Commercial),
            "web" => Ok(Kind::Web),
            _ => Err(format!(
                "Unknown kind '{}'. Expected: episode, movie, music, ident, commercial, web",
                s
            )),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific metadata. The variant determines the item's [`Kind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaDetails {
    Episode {
        show: String,
        season: u32,
        episode: u32,
    },
    Movie {
        #[serde(default)]
        year: Option<i32>,
    },
    Music {
        artist: String,
    },
    Ident,
    Commercial,
    Web,
}

impl MediaDetails {
    pub fn kind(&self) -> Kind {
        match self {
            MediaDetails::Episode { .. } => Kind::Episode,
            MediaDetails::Movie { .. } => Kind::Movie,
            MediaDetails::Music { .. } => Kind::Music,
            MediaDetails::Ident => Kind::Ident,
            MediaDetails::Commercial => Kind::Commercial,
            MediaDetails::Web => Kind::Web,
        }
    }
}

/// A schedulable file from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Unique identifier of the item.
    pub filepath: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "hms_serde")]
    pub runtime: TimeDelta,
    #[serde(default)]
    pub last_played: Option<NaiveDateTime>,
    #[serde(flatten)]
    pub details: MediaDetails,
}

impl ContentItem {
    pub fn kind(&self) -> Kind {
        self.details.kind()
    }

    /// True when every query tag is found, case-insensitively, inside one of
    /// the item's tags or its title / show name.
    pub fn matches_tags<S: AsRef<str>>(&self, query: &[S]) -> bool {
        let show = match &self.details {
            MediaDetails::Episode { show, .. } => show.to_lowercase(),
            _ => String::new(),
        };
        let title = self.title.to_lowercase();
        let tags: Vec<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();

        query.iter().all(|q| {
            let q = q.as_ref().trim().to_lowercase();
            q.is_empty()
                || tags.iter().any(|t| t.contains(&q))
                || title.contains(&q)
                || show.contains(&q)
        })
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Short human label, e.g. `Show S02E05` or the title.
    pub fn label(&self) -> String {
        match &self.details {
            MediaDetails::Episode {
                show,
                season,
                episode,
            } => format!("{} S{:02}E{:02}", show, season, episode),
            MediaDetails::Music { artist } => format!("{} | {}", artist, self.title),
            _ => self.title.clone(),
        }
    }
}

/// A contiguous segment of an episode, in offsets from the file start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based position within the episode.
    pub index: u32,
    #[serde(with = "hms_serde")]
    pub start: TimeDelta,
    #[serde(with = "hms_serde")]
    pub end: TimeDelta,
}

impl Chapter {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}
