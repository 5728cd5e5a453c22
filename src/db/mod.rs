//! SQLite persistence shared by the catalog and the schedule store.

use crate::error::{Error, Result};
use chrono::{NaiveDateTime, TimeDelta};
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

mod migrations;

use migrations::run_migrations;

/// Cloneable handle to a single SQLite connection.
///
/// Every operation runs inside [`Database::execute`], which holds the
/// connection lock for the whole closure. Multi-statement work that must be
/// atomic opens a transaction inside that closure.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }
        let db = Self::init(conn)?;
        info!("Database initialized at {}", db_path.display());
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `task` with exclusive access to the connection.
    pub fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.lock();
        task(&mut guard)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Database lock poisoned by a panicking thread; continuing");
                poisoned.into_inner()
            }
        }
    }
}

pub(crate) fn to_secs(d: TimeDelta) -> i64 {
    d.num_seconds()
}

pub(crate) fn from_secs(secs: i64) -> TimeDelta {
    TimeDelta::seconds(secs)
}

pub(crate) fn parse_stored_timestamp(value: &str, column: &str) -> Result<NaiveDateTime> {
    crate::timecode::parse_timestamp(value)
        .map_err(|_| Error::DataIntegrity(format!("invalid {column} '{value}'")))
}
