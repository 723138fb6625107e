//! Error types for the PoseNet training core.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading)
//! ├── ShapeMismatch (tensor dimensions disagree)
//! ├── NonFinite     (NaN / infinite coordinates)
//! └── Item          (any of the above, tagged with image id + stage)
//! ```
//!
//! Degenerate-but-valid inputs (no people in an image, empty pose sets,
//! zero true/false positive counts) are never reported as errors; the
//! functions that see them return documented fallback values instead.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used throughout the crate.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for loss, matching and metric computations.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A shape mismatch was detected between two arrays or tensors.
    #[error("Shape mismatch in {stage}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Computation stage that detected the mismatch (e.g. `"offset_loss"`).
        stage: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Two sequences that must be paired element-wise have different lengths.
    #[error("Length mismatch in {stage}: {left} vs {right}")]
    LengthMismatch {
        /// Computation stage that detected the mismatch.
        stage: &'static str,
        /// Length of the first sequence.
        left: usize,
        /// Length of the second sequence.
        right: usize,
    },

    /// More poses were supplied than the configured per-image capacity.
    #[error("Too many poses: {count} exceeds max_num_poses = {max}")]
    TooManyPoses {
        /// Number of poses supplied.
        count: usize,
        /// Configured capacity.
        max: usize,
    },

    /// A per-image computation failed; carries the image id and stage so the
    /// caller can skip or log the item.
    #[error("Image `{image_id}` failed during {stage}: {source}")]
    Item {
        /// Identifier of the image being processed.
        image_id: String,
        /// Pipeline stage (`"matching"`, `"loss"`, ...).
        stage: &'static str,
        /// Underlying error.
        #[source]
        source: Box<TrainError>,
    },

    /// An input contained NaN or infinite values where finite ones are required.
    #[error("Non-finite value in {stage}")]
    NonFinite {
        /// Computation stage that detected the value.
        stage: &'static str,
    },

    /// A libtorch operation failed.
    #[cfg(feature = "tch-backend")]
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

impl TrainError {
    /// Construct a [`TrainError::ShapeMismatch`].
    pub fn shape_mismatch(stage: &'static str, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        TrainError::ShapeMismatch { stage, expected, actual }
    }

    /// Construct a [`TrainError::LengthMismatch`].
    pub fn length_mismatch(stage: &'static str, left: usize, right: usize) -> Self {
        TrainError::LengthMismatch { stage, left, right }
    }

    /// Wrap this error with the image id and stage it occurred in.
    pub fn for_item<S: Into<String>>(self, image_id: S, stage: &'static str) -> Self {
        TrainError::Item { image_id: image_id.into(), stage, source: Box::new(self) }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`PoseTrainConfig`].
///
/// [`PoseTrainConfig`]: crate::config::PoseTrainConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from or written to disk.
    #[error("Cannot access config file `{path}`: {source}")]
    FileRead {
        /// Path that was being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_error_mentions_image_and_stage() {
        let err = TrainError::shape_mismatch("offset_loss", vec![17, 33, 33, 2], vec![17, 2, 33, 33])
            .for_item("img_0042.jpg", "loss");
        let msg = err.to_string();
        assert!(msg.contains("img_0042.jpg"), "{msg}");
        assert!(msg.contains("loss"), "{msg}");
    }

    #[test]
    fn config_error_converts_into_train_error() {
        let err: TrainError = ConfigError::invalid_value("radius", "must be > 0").into();
        assert!(matches!(err, TrainError::Config(ConfigError::InvalidValue { field: "radius", .. })));
    }
}
