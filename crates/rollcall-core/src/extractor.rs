//! Face extraction boundary.
//!
//! Detection and signature generation are provided by an external
//! capability behind [`FaceExtractor`]. The bundled [`DigestIndexExtractor`]
//! serves observations precomputed by an upstream detection service, keyed
//! by the SHA-256 digest of the photo bytes.

use crate::types::{FaceObservation, FaceRegion, Signature};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("photo is not a readable image: {0}")]
    Unreadable(#[from] image::ImageError),
    #[error("extraction backend failed: {0}")]
    Backend(String),
    #[error("signature index {path}: {reason}")]
    Index { path: String, reason: String },
}

/// Produces face observations from raw photo bytes.
pub trait FaceExtractor: Send {
    fn extract(&mut self, photo: &[u8]) -> Result<Vec<FaceObservation>, ExtractError>;
}

/// Basic facts about a decodable photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotoInfo {
    pub width: u32,
    pub height: u32,
    pub format: image::ImageFormat,
}

impl PhotoInfo {
    /// File extension to store the photo under.
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }
}

/// Decode enough of `photo` to prove it is an image and read its size.
pub fn probe_photo(photo: &[u8]) -> Result<PhotoInfo, ExtractError> {
    let format = image::guess_format(photo)?;
    let decoded = image::load_from_memory_with_format(photo, format)?;
    Ok(PhotoInfo {
        width: decoded.width(),
        height: decoded.height(),
        format,
    })
}

/// Lowercase hex SHA-256 of the photo bytes.
pub fn photo_digest(photo: &[u8]) -> String {
    format!("{:x}", Sha256::digest(photo))
}

/// One face as written by the upstream detection service.
#[derive(Debug, Clone, Deserialize)]
struct IndexedFace {
    region: FaceRegion,
    signature: Signature,
}

/// Extractor backed by a JSON index of precomputed observations.
///
/// Index format: `{"<sha256 hex>": [{"region": {...}, "signature": [...]}]}`.
/// Photos missing from the index have no detectable faces.
#[derive(Debug, Default)]
pub struct DigestIndexExtractor {
    faces: HashMap<String, Vec<IndexedFace>>,
}

impl DigestIndexExtractor {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let faces: HashMap<String, Vec<IndexedFace>> = serde_json::from_str(json)?;
        let faces = faces
            .into_iter()
            .map(|(digest, list)| (digest.to_ascii_lowercase(), list))
            .collect();
        Ok(Self { faces })
    }

    /// Load the index file. A missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let index_err = |reason: String| ExtractError::Index {
            path: path.display().to_string(),
            reason,
        };

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "signature index not found; every photo will yield zero faces"
            );
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| index_err(e.to_string()))?;
        let extractor = Self::from_json(&json).map_err(|e| index_err(e.to_string()))?;
        tracing::info!(path = %path.display(), photos = extractor.len(), "loaded signature index");
        Ok(extractor)
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

impl FaceExtractor for DigestIndexExtractor {
    fn extract(&mut self, photo: &[u8]) -> Result<Vec<FaceObservation>, ExtractError> {
        let info = probe_photo(photo)?;
        let digest = photo_digest(photo);

        let observations: Vec<FaceObservation> = self
            .faces
            .get(&digest)
            .map(|faces| {
                faces
                    .iter()
                    .enumerate()
                    .map(|(index, f)| FaceObservation {
                        index,
                        region: f.region,
                        signature: f.signature.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(
            digest = %digest,
            width = info.width,
            height = info.height,
            faces = observations.len(),
            "extracted faces from index"
        );

        Ok(observations)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    /// Encode a small solid-colour PNG; `shade` makes distinct photos.
    pub(crate) fn png(shade: u8) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(4, 3, Rgb([shade, shade, shade]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_probe_photo_png() {
        let info = probe_photo(&png(10)).unwrap();
        assert_eq!((info.width, info.height), (4, 3));
        assert_eq!(info.format, image::ImageFormat::Png);
        assert_eq!(info.extension(), "png");
    }

    #[test]
    fn test_probe_photo_garbage() {
        let err = probe_photo(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ExtractError::Unreadable(_)));
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let d = photo_digest(b"abc");
        assert_eq!(
            d,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_index_lookup() {
        let photo = png(200);
        let json = format!(
            r#"{{"{}": [
                {{"region": {{"x": 1, "y": 2, "width": 30, "height": 30, "confidence": 0.9}},
                  "signature": [1.0, 0.0]}},
                {{"region": {{"x": 50, "y": 2, "width": 30, "height": 30}},
                  "signature": [0.0, 1.0]}}
            ]}}"#,
            photo_digest(&photo).to_uppercase()
        );
        let mut extractor = DigestIndexExtractor::from_json(&json).unwrap();

        let faces = extractor.extract(&photo).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1].index, 1);
        assert_eq!(faces[1].region.confidence, 1.0);
        assert_eq!(faces[0].signature.values, vec![1.0, 0.0]);

        assert!(extractor.extract(&png(201)).unwrap().is_empty());
    }

    #[test]
    fn test_index_rejects_unreadable_photo() {
        let mut extractor = DigestIndexExtractor::default();
        assert!(matches!(
            extractor.extract(&[0u8; 16]),
            Err(ExtractError::Unreadable(_))
        ));
    }

    #[test]
    fn test_load_missing_index_is_empty() {
        let path = std::env::temp_dir().join("rollcall-no-such-index.json");
        let extractor = DigestIndexExtractor::load(&path).unwrap();
        assert!(extractor.is_empty());
    }
}
