use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Region of a detected face within a submitted photo, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face signature vector (128-dimensional for dlib encodings, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute cosine similarity between two signatures.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Accumulates in f64
    /// so large-magnitude vectors do not overflow the norms.
    pub fn similarity(&self, other: &Signature) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(a), f64::from(b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom) as f32
        } else {
            0.0
        }
    }

    /// Compute Euclidean distance between two signatures.
    pub fn euclidean_distance(&self, other: &Signature) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
            .sum::<f64>()
            .sqrt() as f32
    }

    /// Check that the signature can be compared at all: non-empty, finite,
    /// non-zero, and of the expected dimension when one is given.
    pub fn check(&self, dimension: Option<usize>) -> Result<(), SignatureDefect> {
        if self.values.is_empty() {
            return Err(SignatureDefect::Empty);
        }
        if let Some(expected) = dimension {
            if self.values.len() != expected {
                return Err(SignatureDefect::Dimension {
                    expected,
                    actual: self.values.len(),
                });
            }
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(SignatureDefect::NonFinite);
        }
        if self.values.iter().all(|v| *v == 0.0) {
            return Err(SignatureDefect::ZeroNorm);
        }
        Ok(())
    }
}

/// Why a signature cannot be compared.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignatureDefect {
    #[error("signature is empty")]
    Empty,
    #[error("expected {expected}-dim signature, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("signature contains non-finite values")]
    NonFinite,
    #[error("signature has zero norm")]
    ZeroNorm,
}

/// One detected face in a submitted photo. Lives for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    /// Position of the face within the photo's detection output.
    pub index: usize,
    pub region: FaceRegion,
    pub signature: Signature,
}

/// An enrolled student with their reference signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    /// School roll number, unique across the roster.
    pub roll: String,
    pub parent_name: Option<String>,
    pub phone: Option<String>,
    /// One signature per enrollment photo, in enrollment order. Never empty.
    pub signatures: Vec<Signature>,
    pub enrolled_at: DateTime<Utc>,
}

impl Person {
    pub fn summary(&self) -> PersonRef {
        PersonRef {
            id: self.id.clone(),
            name: self.name.clone(),
            roll: self.roll.clone(),
        }
    }
}

/// Identity fields of a person, without signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: String,
    pub name: String,
    pub roll: String,
}

/// Fields supplied when enrolling a new person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPerson {
    pub name: String,
    pub roll: String,
    #[serde(default)]
    pub parent_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Pairing of one observation with one roster person.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    /// Index of the person in the roster slice that was ranked.
    pub person: usize,
    pub person_id: String,
    /// Normalized similarity in [0, 1], 1 = identical.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> Signature {
        Signature::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = sig(&[1.0, 0.0, 0.0]);
        let b = sig(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = sig(&[1.0, 0.0]);
        let b = sig(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = sig(&[1.0, 0.0]);
        let b = sig(&[-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_large_magnitude_signatures() {
        // Squares of these exceed f32::MAX.
        let a = sig(&[3.0e20, 4.0e20]);
        let b = sig(&[6.0e20, 8.0e20]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!((a.euclidean_distance(&b) - 5.0e20).abs() / 5.0e20 < 1e-6);
        assert!(a.check(None).is_ok());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_rejects_defects() {
        assert_eq!(sig(&[]).check(None), Err(SignatureDefect::Empty));
        assert_eq!(
            sig(&[1.0, 2.0]).check(Some(3)),
            Err(SignatureDefect::Dimension { expected: 3, actual: 2 })
        );
        assert_eq!(sig(&[1.0, f32::NAN]).check(None), Err(SignatureDefect::NonFinite));
        assert_eq!(sig(&[0.0, 0.0]).check(None), Err(SignatureDefect::ZeroNorm));
        assert!(sig(&[0.5, 0.5, 0.1]).check(Some(3)).is_ok());
    }

    #[test]
    fn test_signature_serializes_as_plain_array() {
        let json = serde_json::to_string(&sig(&[0.5, -1.0])).unwrap();
        assert_eq!(json, "[0.5,-1.0]");
        let back: Signature = serde_json::from_str("[1.0,2.0]").unwrap();
        assert_eq!(back.values, vec![1.0, 2.0]);
    }
}
