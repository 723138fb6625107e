//! Per-image evaluation: score filtering, matching and metrics in one pass.
//!
//! [`PoseEvaluator::evaluate_image`] takes the decoder output and the padded
//! ground-truth pose set of one image and produces an [`ImageMetrics`].
//! Failures are wrapped with the image id and the stage that failed, so a
//! caller iterating over a dataset can log and skip the item.

use ndarray::ArrayView3;
use tracing::{debug, warn};

use crate::config::EvalConfig;
use crate::error::{TrainError, TrainResult};
use crate::matching::{match_poses, Assignment};
use crate::metrics::{
    mean_average_precision, object_keypoint_similarity, precision_recall_sweep, MetricsAccumulator,
    MetricsResult,
};
use crate::pose::{ensure_pose_set_shape, present_poses, DecodedPoses};

/// Metrics of a single image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetrics {
    /// Identifier of the evaluated image.
    pub image_id: String,
    /// Prediction-to-ground-truth matching, indexed into the score-filtered
    /// predictions and the present ground-truth poses.
    pub assignment: Assignment,
    /// OKS of the assignment (or the pair count, see [`crate::metrics::OksMode`]).
    pub oks: f64,
    /// Precision at each sweep threshold.
    pub precisions: Vec<f64>,
    /// Recall at each sweep threshold.
    pub recalls: Vec<f64>,
    /// Interpolated area under the precision-recall curve.
    pub map: f64,
    /// Predictions left after score filtering.
    pub num_predictions: usize,
    /// Present ground-truth poses.
    pub num_ground_truth: usize,
}

/// One image handed to [`PoseEvaluator::evaluate_images`].
#[derive(Debug, Clone, Copy)]
pub struct EvalItem<'a> {
    /// Identifier used in logs and errors.
    pub image_id: &'a str,
    /// Decoder output.
    pub decoded: &'a DecodedPoses,
    /// Ground-truth pose set `[P, K, 2]`, sentinel-padded.
    pub ground_truth: ArrayView3<'a, f32>,
    /// Side length used to normalise OKS distances.
    pub image_size: f32,
}

/// Evaluates decoded poses against ground truth.
#[derive(Debug, Clone)]
pub struct PoseEvaluator {
    config: EvalConfig,
    thresholds: Vec<f64>,
}

impl PoseEvaluator {
    /// Create an evaluator, validating `config`.
    pub fn new(config: EvalConfig) -> TrainResult<Self> {
        config.validate()?;
        let thresholds = config.thresholds();
        Ok(PoseEvaluator { config, thresholds })
    }

    /// The evaluation parameters.
    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// The distance thresholds of the precision-recall sweep.
    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Evaluate one image.
    ///
    /// # Errors
    ///
    /// [`TrainError::Item`] wrapping the underlying shape or capacity error,
    /// tagged with `image_id` and the failing stage.
    pub fn evaluate_image(
        &self,
        image_id: &str,
        decoded: &DecodedPoses,
        ground_truth: &ArrayView3<'_, f32>,
        image_size: f32,
    ) -> TrainResult<ImageMetrics> {
        ensure_pose_set_shape("ground_truth", ground_truth).map_err(|e| e.for_item(image_id, "ground_truth"))?;
        let slots = ground_truth.dim().0;
        if slots > self.config.max_num_poses {
            return Err(TrainError::TooManyPoses { count: slots, max: self.config.max_num_poses }
                .for_item(image_id, "ground_truth"));
        }

        let kept = decoded.retain_above(self.config.score_threshold);
        let preds = kept.keypoint_coords().view();
        let gts = present_poses(ground_truth);
        let gts = gts.view();

        let assignment = match_poses(&preds, &gts).map_err(|e| e.for_item(image_id, "matching"))?;
        let oks = object_keypoint_similarity(
            &assignment,
            &preds,
            &gts,
            &self.config.sigmas,
            image_size,
            self.config.oks_mode,
        )
        .map_err(|e| e.for_item(image_id, "oks"))?;
        let (precisions, recalls) = precision_recall_sweep(&assignment, &preds, &gts, &self.thresholds);
        let map = mean_average_precision(&precisions, &recalls).map_err(|e| e.for_item(image_id, "map"))?;

        debug!(
            image_id,
            num_predictions = kept.len(),
            num_ground_truth = gts.dim().0,
            matched = assignment.len(),
            oks,
            map,
            "evaluated image"
        );

        Ok(ImageMetrics {
            image_id: image_id.to_owned(),
            num_predictions: kept.len(),
            num_ground_truth: gts.dim().0,
            assignment,
            oks,
            precisions,
            recalls,
            map,
        })
    }

    /// Evaluate a sequence of images and aggregate the results.
    ///
    /// Images that fail are logged, skipped and returned alongside the
    /// aggregate, which is `None` when no image succeeded.
    pub fn evaluate_images<'a, I>(&self, items: I) -> (Option<MetricsResult>, Vec<TrainError>)
    where
        I: IntoIterator<Item = EvalItem<'a>>,
    {
        let mut acc = MetricsAccumulator::new();
        let mut failures = Vec::new();
        for item in items {
            match self.evaluate_image(item.image_id, item.decoded, &item.ground_truth, item.image_size) {
                Ok(metrics) => acc.update(&metrics),
                Err(err) => {
                    warn!(image_id = item.image_id, error = %err, "skipping image");
                    failures.push(err);
                }
            }
        }
        let result = acc.finalize();
        if let Some(r) = &result {
            debug!(summary = %r.summary(), "evaluation pass finished");
        }
        (result, failures)
    }
}
