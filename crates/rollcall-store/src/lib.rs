//! rollcall-store — SQLite persistence for the roster, the attendance
//! ledger, daily verification tokens and the group-photo log.
//!
//! All access goes through one [`tokio_rusqlite::Connection`]. The unique
//! `(person_id, date)` index on `attendance` is what keeps concurrent marks
//! for the same student and day down to a single row.

mod ledger;
mod photo_log;
mod roster;
mod tokens;

pub use photo_log::NewPhotoLog;

use chrono::NaiveDate;
use rollcall_core::types::SignatureDefect;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("person not found: {0}")]
    PersonNotFound(String),
    #[error("roll number already enrolled: {0}")]
    DuplicateRoll(String),
    #[error("a person must keep at least one signature")]
    NoSignatures,
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureDefect),
    #[error("verification code rejected for {0}")]
    CodeRejected(NaiveDate),
    #[error("signature encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS persons (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    roll        TEXT NOT NULL UNIQUE,
    parent_name TEXT,
    phone       TEXT,
    enrolled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS signatures (
    person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    position  INTEGER NOT NULL,
    vector    TEXT NOT NULL,
    PRIMARY KEY (person_id, position)
);

CREATE TABLE IF NOT EXISTS attendance (
    person_id   TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    date        TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('auto', 'manual')),
    score       REAL,
    verification_code TEXT,
    recorded_at TEXT NOT NULL,
    UNIQUE (person_id, date)
);

CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance (date);

CREATE TABLE IF NOT EXISTS daily_tokens (
    date       TEXT PRIMARY KEY,
    code       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photo_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    date          TEXT NOT NULL,
    taken_at      TEXT NOT NULL,
    faces_found   INTEGER NOT NULL,
    auto_marked   INTEGER NOT NULL,
    ambiguous     INTEGER NOT NULL,
    processing_ms INTEGER NOT NULL,
    photo_path    TEXT
);
";

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn).await
    }

    /// In-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

/// Map a decode failure in column `idx` onto rusqlite's conversion error.
fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_file_and_parent_dir() {
        let dir = std::env::temp_dir().join(format!("rollcall-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("attendance.db");

        let store = Store::open(&path).await.unwrap();
        assert!(path.exists());
        assert!(store.roster().await.unwrap().is_empty());

        // Reopening keeps the schema intact.
        drop(store);
        let store = Store::open(&path).await.unwrap();
        assert!(store.roster().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }
}
