//! Group-photo reconciliation: assign detected faces to roster people.
//!
//! Every observation is ranked against the roster, then all
//! (face, person, score) pairs are walked from the globally best score down.
//! A pair is accepted only when neither its face nor its person has been
//! claimed yet, so one face never marks two students and one student is
//! never claimed by two faces.

use crate::matcher::{MatchError, Matcher};
use crate::types::{FaceObservation, Person};
use serde::Serialize;

/// Accepted pairing of a face with a roster person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Claim {
    /// Index into the observations passed to [`reconcile`].
    pub face: usize,
    /// Index into the roster passed to [`reconcile`].
    pub person: usize,
    pub score: f32,
}

/// Why a face ended up without a claim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Unresolved {
    /// No roster person cleared the acceptance threshold.
    NoCandidate,
    /// Every candidate was claimed by a higher-scoring face.
    Outranked,
    /// The signature could not be compared.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousFace {
    pub observation: FaceObservation,
    pub reason: Unresolved,
}

/// Partitioned result of one photo.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    /// Accepted claims, in acceptance order (best score first).
    pub auto: Vec<Claim>,
    pub ambiguous_faces: Vec<AmbiguousFace>,
    /// Roster indices nobody in the photo claimed, in roster order.
    pub unmatched_people: Vec<usize>,
}

/// One entry of the global candidate list.
struct Pair {
    face: usize,
    person: usize,
    rank: usize,
    score: f32,
}

/// Reconcile detected faces against the roster.
pub fn reconcile<M: Matcher + ?Sized>(
    observations: &[FaceObservation],
    roster: &[Person],
    matcher: &M,
) -> Reconciliation {
    if observations.is_empty() {
        return Reconciliation {
            auto: Vec::new(),
            ambiguous_faces: Vec::new(),
            unmatched_people: (0..roster.len()).collect(),
        };
    }

    let mut pairs = Vec::new();
    let mut malformed: Vec<Option<MatchError>> = vec![None; observations.len()];
    let mut had_candidates = vec![false; observations.len()];

    for (face, obs) in observations.iter().enumerate() {
        match matcher.rank(&obs.signature, roster) {
            Ok(candidates) => {
                had_candidates[face] = !candidates.is_empty();
                pairs.extend(candidates.into_iter().enumerate().map(|(rank, c)| Pair {
                    face,
                    person: c.person,
                    rank,
                    score: c.score,
                }));
            }
            Err(MatchError::EmptyRoster) => {}
            Err(e) => {
                tracing::warn!(face, error = %e, "observation cannot be matched");
                malformed[face] = Some(e);
            }
        }
    }

    // Best score first; ties by rank within the face's list, then face index.
    pairs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.rank.cmp(&b.rank))
            .then(a.face.cmp(&b.face))
    });

    let mut face_claimed = vec![false; observations.len()];
    let mut person_claimed = vec![false; roster.len()];
    let mut auto = Vec::new();

    for pair in pairs {
        if face_claimed[pair.face] || person_claimed[pair.person] {
            continue;
        }
        face_claimed[pair.face] = true;
        person_claimed[pair.person] = true;
        auto.push(Claim {
            face: pair.face,
            person: pair.person,
            score: pair.score,
        });
    }

    let ambiguous_faces = observations
        .iter()
        .enumerate()
        .filter(|(face, _)| !face_claimed[*face])
        .map(|(face, obs)| {
            let reason = match malformed[face].take() {
                Some(e) => Unresolved::Malformed(e.to_string()),
                None if had_candidates[face] => Unresolved::Outranked,
                None => Unresolved::NoCandidate,
            };
            AmbiguousFace {
                observation: obs.clone(),
                reason,
            }
        })
        .collect();

    let unmatched_people = (0..roster.len()).filter(|p| !person_claimed[*p]).collect();

    tracing::debug!(
        faces = observations.len(),
        roster = roster.len(),
        claimed = auto.len(),
        "reconciled photo"
    );

    Reconciliation {
        auto,
        ambiguous_faces,
        unmatched_people,
    }
}
