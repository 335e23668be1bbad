//! Signature matching against the enrolled roster.

use crate::types::{MatchCandidate, Person, Signature, SignatureDefect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default acceptance threshold on the normalized [0, 1] score.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("roster is empty")]
    EmptyRoster,
    #[error("malformed probe signature: {0}")]
    Malformed(#[from] SignatureDefect),
}

/// How raw signature comparison is mapped onto a [0, 1] score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine similarity, negatives clamped to 0.
    #[default]
    Cosine,
    /// `1 - euclidean distance`, clamped to [0, 1].
    Euclidean,
}

impl Metric {
    pub fn score(&self, probe: &Signature, reference: &Signature) -> f32 {
        let raw = match self {
            Metric::Cosine => probe.similarity(reference),
            Metric::Euclidean => 1.0 - probe.euclidean_distance(reference),
        };
        raw.clamp(0.0, 1.0)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric: {other}")),
        }
    }
}

/// Strategy for ranking roster people against one observed signature.
pub trait Matcher {
    /// Candidates at or above the acceptance threshold, best first.
    fn rank(&self, probe: &Signature, roster: &[Person]) -> Result<Vec<MatchCandidate>, MatchError>;

    /// Like [`rank`](Self::rank), but reports failures as "no candidates".
    fn rank_or_empty(&self, probe: &Signature, roster: &[Person]) -> Vec<MatchCandidate> {
        match self.rank(probe, roster) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!(error = %e, "ranking failed; no candidates");
                Vec::new()
            }
        }
    }
}

/// Threshold matcher over a configurable metric.
///
/// A person's score is the best score over all of their reference
/// signatures, so extra enrollment photos can only help.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignatureMatcher {
    pub metric: Metric,
    pub threshold: f32,
    /// Expected signature length; `None` accepts any non-empty probe.
    pub dimension: Option<usize>,
}

impl Default for SignatureMatcher {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            threshold: DEFAULT_THRESHOLD,
            dimension: None,
        }
    }
}

impl SignatureMatcher {
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self {
            metric,
            threshold,
            dimension: None,
        }
    }

    pub fn with_dimension(mut self, dimension: Option<usize>) -> Self {
        self.dimension = dimension;
        self
    }

    /// Best score of `person` against `probe`, skipping references of a
    /// different length. `None` when no reference is comparable.
    pub fn person_score(&self, probe: &Signature, person: &Person) -> Option<f32> {
        person
            .signatures
            .iter()
            .filter(|reference| reference.len() == probe.len())
            .map(|reference| self.metric.score(probe, reference))
            .fold(None, |best, s| match best {
                Some(b) if b >= s => Some(b),
                _ => Some(s),
            })
    }
}

impl Matcher for SignatureMatcher {
    fn rank(
        &self,
        probe: &Signature,
        roster: &[Person],
    ) -> Result<Vec<MatchCandidate>, MatchError> {
        if roster.is_empty() {
            return Err(MatchError::EmptyRoster);
        }
        probe.check(self.dimension)?;

        let mut candidates: Vec<MatchCandidate> = roster
            .iter()
            .enumerate()
            .filter_map(|(i, person)| {
                let score = self.person_score(probe, person)?;
                (score >= self.threshold).then(|| MatchCandidate {
                    person: i,
                    person_id: person.id.clone(),
                    score,
                })
            })
            .collect();

        // Stable sort: equal scores keep roster order.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(candidates)
    }
}
