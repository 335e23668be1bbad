//! rollcall-core — Signature matching and group-photo reconciliation.
//!
//! Ranks face signatures against an enrolled roster and assigns the faces
//! of one classroom photo to students without double claims.

pub mod attendance;
pub mod extractor;
pub mod matcher;
pub mod reconcile;
pub mod types;

pub use attendance::{
    AttendanceEntry, DailyToken, DaySummary, ExportRow, MarkOutcome, MarkRequest, MarkStatus,
    PhotoLog,
};
pub use extractor::{DigestIndexExtractor, ExtractError, FaceExtractor};
pub use matcher::{MatchError, Matcher, Metric, SignatureMatcher};
pub use reconcile::{reconcile, AmbiguousFace, Claim, Reconciliation, Unresolved};
pub use types::{
    FaceObservation, FaceRegion, MatchCandidate, NewPerson, Person, PersonRef, Signature,
};
