//! Attendance ledger: one entry per (person, date), first writer wins.

use crate::{conversion_error, Result, Store, StoreError};
use chrono::NaiveDate;
use rollcall_core::{
    AttendanceEntry, DaySummary, ExportRow, MarkOutcome, MarkRequest, MarkStatus, Person,
};
use rusqlite::{params, Row};
use std::collections::HashSet;

fn status_at(row: &Row, idx: usize) -> rusqlite::Result<MarkStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

const ENTRY_COLUMNS: &str = "person_id, date, status, score, verification_code, recorded_at";

fn row_to_entry(row: &Row) -> rusqlite::Result<AttendanceEntry> {
    Ok(AttendanceEntry {
        person_id: row.get(0)?,
        date: row.get(1)?,
        status: status_at(row, 2)?,
        score: row.get::<_, Option<f64>>(3)?.map(|s| s as f32),
        verification_code: row.get(4)?,
        recorded_at: row.get(5)?,
    })
}

fn row_to_export(row: &Row) -> rusqlite::Result<ExportRow> {
    Ok(ExportRow {
        roll: row.get(0)?,
        name: row.get(1)?,
        date: row.get(2)?,
        status: status_at(row, 3)?,
        score: row.get::<_, Option<f64>>(4)?.map(|s| s as f32),
        verified: row.get(5)?,
    })
}

/// What happened inside the mark transaction.
enum Write {
    UnknownPerson,
    CodeRejected,
    Done(MarkOutcome),
}

impl Store {
    /// Record attendance. A second mark for the same person and day leaves
    /// the first entry untouched and reports it as already marked.
    ///
    /// The unique index decides races between concurrent writers: the
    /// insert is `OR IGNORE`, and whichever row survived is read back.
    /// A request carrying a verification code is refused unless the code
    /// matches the token issued for that date.
    pub async fn mark(&self, mut request: MarkRequest) -> Result<MarkOutcome> {
        let person_id = request.person_id.clone();
        let date = request.date;
        if let Some(code) = request.verification_code.as_mut() {
            *code = code.trim().to_string();
        }

        let write = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM persons WHERE id = ?1)",
                    [&request.person_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(Write::UnknownPerson);
                }
                if let Some(code) = &request.verification_code {
                    let matches: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM daily_tokens WHERE date = ?1 AND code = ?2)",
                        params![request.date, code],
                        |row| row.get(0),
                    )?;
                    if !matches {
                        return Ok(Write::CodeRejected);
                    }
                }
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO attendance
                        (person_id, date, status, score, verification_code, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        request.person_id,
                        request.date,
                        request.status.as_str(),
                        request.score.map(f64::from),
                        request.verification_code,
                        request.recorded_at,
                    ],
                )?;
                let entry = tx.query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM attendance WHERE person_id = ?1 AND date = ?2"
                    ),
                    params![request.person_id, request.date],
                    row_to_entry,
                )?;
                tx.commit()?;
                Ok(Write::Done(if inserted > 0 {
                    MarkOutcome::Recorded(entry)
                } else {
                    MarkOutcome::AlreadyMarked(entry)
                }))
            })
            .await?;

        let outcome = match write {
            Write::Done(outcome) => outcome,
            Write::UnknownPerson => return Err(StoreError::PersonNotFound(person_id)),
            Write::CodeRejected => {
                tracing::warn!(
                    person = %person_id,
                    %date,
                    "mark refused: verification code mismatch"
                );
                return Err(StoreError::CodeRejected(date));
            }
        };
        match &outcome {
            MarkOutcome::Recorded(e) => tracing::info!(
                person = %e.person_id,
                date = %e.date,
                status = %e.status,
                score = ?e.score,
                verified = e.verification_code.is_some(),
                "attendance recorded"
            ),
            MarkOutcome::AlreadyMarked(e) => tracing::debug!(
                person = %e.person_id,
                date = %e.date,
                status = %e.status,
                "already marked; keeping first entry"
            ),
        }
        Ok(outcome)
    }

    /// All entries for one day.
    pub async fn entries_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>> {
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM attendance
                     WHERE date = ?1 ORDER BY recorded_at, person_id"
                ))?;
                let entries = stmt
                    .query_map([date], row_to_entry)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    /// IDs of everyone with an entry on `date`.
    pub async fn marked_on(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT person_id FROM attendance WHERE date = ?1")?;
                let ids = stmt
                    .query_map([date], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<HashSet<_>>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    /// Roster members with no entry on `date`, in roster order.
    pub async fn list_unmarked(&self, date: NaiveDate, roster: &[Person]) -> Result<Vec<Person>> {
        let marked = self.marked_on(date).await?;
        Ok(roster
            .iter()
            .filter(|p| !marked.contains(&p.id))
            .cloned()
            .collect())
    }

    /// Report rows for every entry between `from` and `to`, inclusive,
    /// ordered by date then roll number.
    pub async fn export(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ExportRow>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT p.roll, p.name, a.date, a.status, a.score,
                            a.verification_code IS NOT NULL
                     FROM attendance a JOIN persons p ON p.id = a.person_id
                     WHERE a.date BETWEEN ?1 AND ?2
                     ORDER BY a.date, p.roll",
                )?;
                let rows = stmt
                    .query_map([from, to], row_to_export)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        tracing::debug!(%from, %to, rows = rows.len(), "exported attendance");
        Ok(rows)
    }

    /// Present / absent counts for one day against the current roster.
    pub async fn day_summary(&self, date: NaiveDate) -> Result<DaySummary> {
        let (total, auto, manual) = self
            .conn
            .call(move |conn| {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM persons", [], |row| row.get(0))?;
                let (auto, manual): (i64, i64) = conn.query_row(
                    "SELECT
                        COALESCE(SUM(status = 'auto'), 0),
                        COALESCE(SUM(status = 'manual'), 0)
                     FROM attendance WHERE date = ?1",
                    [date],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok((total as usize, auto as usize, manual as usize))
            })
            .await?;

        let present = auto + manual;
        Ok(DaySummary {
            date,
            total,
            present,
            absent: total.saturating_sub(present),
            auto,
            manual,
        })
    }
}
