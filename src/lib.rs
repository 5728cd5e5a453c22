//! solostation: a single-box broadcast TV simulator.
//!
//! Channels are built a day at a time from a tagged media catalog into a
//! SQLite schedule; the tuner joins whatever is live, mid-program if need be.
//! The CLI consumes this crate.

pub mod break_filler;
pub mod builder;
pub mod catalog;
pub mod chapters;
pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod player;
pub mod schedule;
pub mod slots;
pub mod status;
pub mod sync;
pub mod timecode;

pub use error::{Error, Result};
