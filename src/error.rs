/// Error types for solostation
use thiserror::Error;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The catalog has nothing matching the requested tags and kinds.
    #[error("no content available for {0}")]
    NoContentAvailable(String),

    /// No schedule entry covers the requested instant.
    #[error("schedule gap on channel {channel} at {at}")]
    ScheduleGap {
        channel: u32,
        at: chrono::NaiveDateTime,
    },

    /// The player never reported a duration / seekable state.
    #[error("player not ready: {0}")]
    PlayerNotReady(String),

    /// Position stopped advancing or ran past the file's duration.
    #[error("playback stalled: {0}")]
    PlaybackStalled(String),

    /// A scheduled entry references a chapter or file the catalog does not know.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("schedule build for channel {0} panicked")]
    BuildPanicked(u32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid time '{0}'")]
    InvalidTime(String),

    /// Media player IPC failure.
    #[error("player error: {0}")]
    Player(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
