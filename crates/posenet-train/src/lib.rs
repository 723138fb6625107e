//! # PoseNet Training Core
//!
//! This crate provides the matching, metric and loss engine used to train and
//! evaluate a multi-person PoseNet-style pose estimator that predicts dense
//! keypoint heatmaps and offset fields. Heatmap decoding, the network itself
//! and the training loop live elsewhere; this crate consumes their outputs.
//!
//! ## Architecture
//!
//! ```text
//! PoseTrainConfig ──► LossAggregator ◄── OffsetMapBuilder
//!       │                  │
//!       │             targets (disk heatmaps, dilation masks)
//!       │
//!       └──► PoseEvaluator ──► matching (Kuhn-Munkres)
//!                  │
//!                  └──► metrics (OKS, precision/recall, mAP) ──► MetricsAccumulator
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::Array2;
//! use posenet_train::config::EvalConfig;
//! use posenet_train::evaluator::PoseEvaluator;
//! use posenet_train::pose::{pad_pose_set, DecodedPoses, NUM_KEYPOINTS};
//!
//! let pose = Array2::from_shape_fn((NUM_KEYPOINTS, 2), |(k, c)| 10.0 + (k * 3 + c) as f32);
//! let ground_truth = pad_pose_set(&[pose.clone()], 15).unwrap();
//! let decoded = DecodedPoses::from_coords(pose.insert_axis(ndarray::Axis(0))).unwrap();
//!
//! let evaluator = PoseEvaluator::new(EvalConfig::default()).unwrap();
//! let metrics = evaluator
//!     .evaluate_image("img_0001", &decoded, &ground_truth.view(), 257.0)
//!     .unwrap();
//! assert_eq!(metrics.assignment.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
#[cfg(feature = "tch-backend")]
pub mod context;
pub mod error;
pub mod evaluator;
pub mod losses;
pub mod matching;
pub mod metrics;
pub mod offsets;
pub mod pose;
pub mod targets;

// Convenient re-exports at the crate root.
pub use config::{EvalConfig, LossConfig, PoseTrainConfig};
#[cfg(feature = "tch-backend")]
pub use context::ComputeContext;
pub use error::{ConfigError, TrainError, TrainResult};
pub use evaluator::{EvalItem, ImageMetrics, PoseEvaluator};
pub use losses::{LossAggregator, LossInputs, LossOutput};
pub use matching::{hungarian_assignment, match_poses, Assignment};
pub use metrics::{MetricsAccumulator, MetricsResult, OksMode};
pub use offsets::OffsetMapBuilder;
pub use pose::DecodedPoses;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
