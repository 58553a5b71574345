//! Versioned model artifact encoding
//!
//! A model blob is a JSON envelope carrying the format name, the format
//! version, the feature width the model was fit on and a SHA-256 checksum
//! of the serialized model body. Decoding fails closed on any mismatch.

use super::LogisticModel;
use crate::error::ModelLoadError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ARTIFACT_FORMAT: &str = "flowguard-logreg";
pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    format_version: u32,
    feature_width: usize,
    checksum: String,
    model: LogisticModel,
}

/// Serialize a model into an artifact blob
pub fn encode(model: &LogisticModel) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(model)?;
    let envelope = Envelope {
        format: ARTIFACT_FORMAT.to_string(),
        format_version: ARTIFACT_VERSION,
        feature_width: model.weights.len(),
        checksum: compute_checksum(&body),
        model: model.clone(),
    };
    serde_json::to_vec_pretty(&envelope)
}

/// Validate and deserialize an artifact blob.
///
/// `expected_width` is the feature width the caller will score with; pass
/// `None` to accept whatever width the artifact declares.
pub fn decode(bytes: &[u8], expected_width: Option<usize>) -> Result<LogisticModel, ModelLoadError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| ModelLoadError::Format(e.to_string()))?;

    if envelope.format != ARTIFACT_FORMAT {
        return Err(ModelLoadError::UnknownFormat {
            found: envelope.format,
        });
    }
    if envelope.format_version != ARTIFACT_VERSION {
        return Err(ModelLoadError::UnsupportedVersion {
            found: envelope.format_version,
            supported: ARTIFACT_VERSION,
        });
    }

    let body = serde_json::to_vec(&envelope.model).map_err(|e| ModelLoadError::Format(e.to_string()))?;
    let computed = compute_checksum(&body);
    if computed != envelope.checksum {
        return Err(ModelLoadError::ChecksumMismatch {
            recorded: envelope.checksum,
            computed,
        });
    }

    let model = envelope.model;
    if !model.is_well_formed() {
        return Err(ModelLoadError::NonFinite);
    }
    if model.weights.len() != envelope.feature_width {
        return Err(ModelLoadError::InconsistentWidth {
            declared: envelope.feature_width,
            weights: model.weights.len(),
        });
    }
    if let Some(expected) = expected_width {
        if expected != envelope.feature_width {
            return Err(ModelLoadError::WidthMismatch {
                expected,
                found: envelope.feature_width,
            });
        }
    }

    Ok(model)
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> LogisticModel {
        LogisticModel {
            version: "v1".to_string(),
            means: vec![0.5, 100.25],
            scales: vec![1.0, 3.3333333333333335],
            weights: vec![0.1234567890123, -2.5e-7],
            bias: -0.75,
            validation_accuracy: Some(0.97),
        }
    }

    #[test]
    fn test_encode_decode() {
        let blob = encode(&model()).unwrap();
        assert_eq!(decode(&blob, Some(2)).unwrap(), model());
        assert_eq!(decode(&blob, None).unwrap(), model());
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let blob = encode(&model()).unwrap();
        assert!(matches!(
            decode(&blob, Some(3)),
            Err(ModelLoadError::WidthMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let blob = encode(&model()).unwrap();
        let text = String::from_utf8(blob).unwrap().replace("-0.75", "0.75");
        assert!(matches!(
            decode(text.as_bytes(), None),
            Err(ModelLoadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_format_and_version_rejected() {
        let blob = encode(&model()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();

        value["format_version"] = serde_json::json!(99);
        let bumped = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            decode(&bumped, None),
            Err(ModelLoadError::UnsupportedVersion { found: 99, .. })
        ));

        value["format_version"] = serde_json::json!(ARTIFACT_VERSION);
        value["format"] = serde_json::json!("pickle");
        let renamed = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            decode(&renamed, None),
            Err(ModelLoadError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn test_declared_width_must_match_weights() {
        let blob = encode(&model()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        value["feature_width"] = serde_json::json!(5);
        let relabelled = serde_json::to_vec(&value).unwrap();

        let err = decode(&relabelled, None).unwrap_err();
        assert!(matches!(
            err,
            ModelLoadError::InconsistentWidth { declared: 5, weights: 2 }
        ));
        assert_eq!(
            err.to_string(),
            "artifact declares 5 features but the model holds 2 weights"
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode(b"\x80\x04\x95pickle", None),
            Err(ModelLoadError::Format(_))
        ));
    }
}
