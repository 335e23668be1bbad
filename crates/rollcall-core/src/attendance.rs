//! Attendance ledger records shared by the store and the service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an attendance entry came to exist. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkStatus {
    /// Produced by group-photo reconciliation.
    Auto,
    /// Confirmed by a teacher in the manual backup pass.
    Manual,
}

impl MarkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkStatus::Auto => "auto",
            MarkStatus::Manual => "manual",
        }
    }
}

impl fmt::Display for MarkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mark status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MarkStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(MarkStatus::Auto),
            "manual" => Ok(MarkStatus::Manual),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One stored attendance mark. At most one per (person, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub person_id: String,
    pub date: NaiveDate,
    pub status: MarkStatus,
    /// Match score for auto marks.
    pub score: Option<f32>,
    /// Daily code the mark was confirmed with, if any.
    pub verification_code: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Input to a ledger write.
#[derive(Debug, Clone)]
pub struct MarkRequest {
    pub person_id: String,
    pub date: NaiveDate,
    pub status: MarkStatus,
    pub score: Option<f32>,
    pub verification_code: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MarkRequest {
    pub fn auto(person_id: impl Into<String>, date: NaiveDate, score: f32) -> Self {
        Self {
            person_id: person_id.into(),
            date,
            status: MarkStatus::Auto,
            score: Some(score),
            verification_code: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn manual(person_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            person_id: person_id.into(),
            date,
            status: MarkStatus::Manual,
            score: None,
            verification_code: None,
            recorded_at: Utc::now(),
        }
    }

    /// Manual mark confirmed with the day's verification code.
    pub fn verified(
        person_id: impl Into<String>,
        date: NaiveDate,
        code: impl Into<String>,
    ) -> Self {
        Self {
            verification_code: Some(code.into()),
            ..Self::manual(person_id, date)
        }
    }

    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

/// Result of a ledger write. A second mark for the same day is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "entry", rename_all = "snake_case")]
pub enum MarkOutcome {
    Recorded(AttendanceEntry),
    AlreadyMarked(AttendanceEntry),
}

impl MarkOutcome {
    /// The entry that survives in the ledger.
    pub fn entry(&self) -> &AttendanceEntry {
        match self {
            MarkOutcome::Recorded(e) | MarkOutcome::AlreadyMarked(e) => e,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, MarkOutcome::Recorded(_))
    }
}

/// Flat report row handed to reporting collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub roll: String,
    pub name: String,
    pub date: NaiveDate,
    pub status: MarkStatus,
    pub score: Option<f32>,
    /// Whether the entry was confirmed with the daily code.
    pub verified: bool,
}

/// Per-date verification code. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyToken {
    pub date: NaiveDate,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

/// Head counts for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub auto: usize,
    pub manual: usize,
}

/// Record of one processed group photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoLog {
    pub id: i64,
    pub date: NaiveDate,
    pub taken_at: DateTime<Utc>,
    pub faces_found: usize,
    pub auto_marked: usize,
    pub ambiguous: usize,
    pub processing_ms: u64,
    /// Stored copy of the photo, when it could be kept.
    pub photo_path: Option<String>,
}
