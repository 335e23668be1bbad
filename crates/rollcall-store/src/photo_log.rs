//! Log of processed group photos.

use crate::{Result, Store};
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::PhotoLog;
use rusqlite::{params, Row};

/// Counters for one processed photo.
#[derive(Debug, Clone)]
pub struct NewPhotoLog {
    pub date: NaiveDate,
    pub taken_at: DateTime<Utc>,
    pub faces_found: usize,
    pub auto_marked: usize,
    pub ambiguous: usize,
    pub processing_ms: u64,
    pub photo_path: Option<String>,
}

fn row_to_log(row: &Row) -> rusqlite::Result<PhotoLog> {
    Ok(PhotoLog {
        id: row.get(0)?,
        date: row.get(1)?,
        taken_at: row.get(2)?,
        faces_found: row.get::<_, i64>(3)? as usize,
        auto_marked: row.get::<_, i64>(4)? as usize,
        ambiguous: row.get::<_, i64>(5)? as usize,
        processing_ms: row.get::<_, i64>(6)? as u64,
        photo_path: row.get(7)?,
    })
}

impl Store {
    pub async fn record_photo(&self, log: NewPhotoLog) -> Result<i64> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO photo_log
                        (date, taken_at, faces_found, auto_marked, ambiguous, processing_ms,
                         photo_path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        log.date,
                        log.taken_at,
                        log.faces_found as i64,
                        log.auto_marked as i64,
                        log.ambiguous as i64,
                        log.processing_ms as i64,
                        log.photo_path,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Photos processed on `date`, most recent first.
    pub async fn photo_logs(&self, date: NaiveDate) -> Result<Vec<PhotoLog>> {
        let logs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, date, taken_at, faces_found, auto_marked, ambiguous,
                            processing_ms, photo_path
                     FROM photo_log WHERE date = ?1 ORDER BY taken_at DESC, id DESC",
                )?;
                let logs = stmt
                    .query_map([date], row_to_log)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(logs)
            })
            .await?;
        Ok(logs)
    }
}
