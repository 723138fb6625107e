//! Configuration for PoseNet loss computation and evaluation.
//!
//! [`PoseTrainConfig`] is the single source of truth for the loss constants
//! and the evaluation parameters. It is serializable via [`serde`] so it can
//! be stored next to a training run and restored from JSON.
//!
//! # Example
//!
//! ```rust
//! use posenet_train::config::PoseTrainConfig;
//!
//! let cfg = PoseTrainConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.loss.radius, 3);
//! assert_eq!(cfg.eval.num_thresholds, 50);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::metrics::{linspace_thresholds, OksMode, POSENET_SIGMAS};
use crate::pose::NUM_KEYPOINTS;

// ---------------------------------------------------------------------------
// LossConfig
// ---------------------------------------------------------------------------

/// Constants of the heatmap + offset aggregation loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Disk radius of the binary target and half-width of the dilation
    /// window, in heatmap cells. Default: **3**.
    pub radius: usize,

    /// Weight of the heatmap (classification) term. Default: **4.0**.
    pub heatmap_weight: f64,

    /// Weight of the offset (regression) term. Default: **1.0**.
    pub offset_weight: f64,

    /// Weight each keypoint channel by whether the keypoint is labelled in the
    /// pose being scored. Default: **false**.
    pub use_target_weight: bool,

    /// Number of pose slots per image. Default: **15**.
    pub max_num_poses: usize,

    /// Raw ground-truth heatmap cutoff seeding the dilation mask. Default: **0.1**.
    pub mask_threshold: f32,

    /// Ratio of input image resolution to heatmap resolution. Default: **8**.
    pub output_stride: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            radius: 3,
            heatmap_weight: 4.0,
            offset_weight: 1.0,
            use_target_weight: false,
            max_num_poses: 15,
            mask_threshold: 0.1,
            output_stride: 8,
        }
    }
}

impl LossConfig {
    /// Check that the loss constants are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.heatmap_weight.is_finite() || self.heatmap_weight < 0.0 {
            return Err(ConfigError::invalid_value("loss.heatmap_weight", "must be finite and >= 0.0"));
        }
        if !self.offset_weight.is_finite() || self.offset_weight < 0.0 {
            return Err(ConfigError::invalid_value("loss.offset_weight", "must be finite and >= 0.0"));
        }
        if self.heatmap_weight + self.offset_weight <= 0.0 {
            return Err(ConfigError::invalid_value(
                "loss.heatmap_weight / loss.offset_weight",
                "at least one loss weight must be > 0.0",
            ));
        }
        if self.max_num_poses == 0 {
            return Err(ConfigError::invalid_value("loss.max_num_poses", "must be > 0"));
        }
        if self.output_stride == 0 {
            return Err(ConfigError::invalid_value("loss.output_stride", "must be > 0"));
        }
        if !self.mask_threshold.is_finite() {
            return Err(ConfigError::invalid_value("loss.mask_threshold", "must be finite"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EvalConfig
// ---------------------------------------------------------------------------

/// Parameters of the per-image evaluation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Per-keypoint OKS sigmas. Default: [`POSENET_SIGMAS`].
    pub sigmas: Vec<f32>,

    /// Decoded poses scoring below this are discarded. Default: **0.25**.
    pub score_threshold: f32,

    /// First distance threshold of the precision/recall sweep. Default: **0.0**.
    pub threshold_start: f64,

    /// Last distance threshold of the sweep (inclusive). Default: **10.0**.
    pub threshold_end: f64,

    /// Number of sweep thresholds. Default: **50**.
    pub num_thresholds: usize,

    /// What the reported OKS means. Default: [`OksMode::Similarity`].
    pub oks_mode: OksMode,

    /// Number of ground-truth pose slots per image. Default: **15**.
    pub max_num_poses: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            sigmas: POSENET_SIGMAS.to_vec(),
            score_threshold: 0.25,
            threshold_start: 0.0,
            threshold_end: 10.0,
            num_thresholds: 50,
            oks_mode: OksMode::Similarity,
            max_num_poses: 15,
        }
    }
}

impl EvalConfig {
    /// The distance thresholds swept for the precision-recall curve.
    pub fn thresholds(&self) -> Vec<f64> {
        linspace_thresholds(self.threshold_start, self.threshold_end, self.num_thresholds)
    }

    /// Check that the evaluation parameters are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sigmas.len() != NUM_KEYPOINTS {
            return Err(ConfigError::invalid_value(
                "eval.sigmas",
                format!("expected {NUM_KEYPOINTS} values, got {}", self.sigmas.len()),
            ));
        }
        if self.sigmas.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ConfigError::invalid_value("eval.sigmas", "every sigma must be > 0.0"));
        }
        if self.num_thresholds == 0 {
            return Err(ConfigError::invalid_value("eval.num_thresholds", "must be > 0"));
        }
        if self.threshold_start < 0.0 || self.threshold_end < self.threshold_start {
            return Err(ConfigError::invalid_value(
                "eval.threshold_start / eval.threshold_end",
                "must satisfy 0.0 <= start <= end",
            ));
        }
        if self.max_num_poses == 0 {
            return Err(ConfigError::invalid_value("eval.max_num_poses", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PoseTrainConfig
// ---------------------------------------------------------------------------

/// Complete configuration: loss constants plus evaluation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseTrainConfig {
    /// Loss constants.
    pub loss: LossConfig,
    /// Evaluation parameters.
    pub eval: EvalConfig,
}

impl PoseTrainConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be read and
    /// [`ConfigError::ParseError`] if the JSON is malformed.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: PoseTrainConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::ParseError { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the directory cannot be created or
    /// the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate both sections, plus the constraints that span them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.loss.validate()?;
        self.eval.validate()?;
        if self.loss.max_num_poses != self.eval.max_num_poses {
            return Err(ConfigError::invalid_value(
                "eval.max_num_poses",
                "must equal loss.max_num_poses",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
