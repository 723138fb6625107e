//! Evaluation metrics for multi-person pose estimation.
//!
//! This module provides:
//!
//! - **OKS** (Object Keypoint Similarity): per matched pair, the mean over
//!   keypoints of an exponential kernel scaled by a per-keypoint sigma.
//! - **Precision / recall** at a distance threshold, counted per keypoint
//!   over the matched pairs after per-pose z-score normalisation.
//! - **mAP**: interpolated area under the precision-recall curve obtained by
//!   sweeping the distance threshold.
//!
//! Results are accumulated over images via [`MetricsAccumulator`] and
//! finalized into a [`MetricsResult`] at the end of an evaluation pass.
//!
//! Sentinel keypoints (`(0, 0)` / `(-1, -1)`) never count as true positives.

use ndarray::{Array2, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};
use crate::evaluator::ImageMetrics;
use crate::matching::{match_poses, Assignment};
use crate::pose::{is_sentinel, NUM_KEYPOINTS};

// ---------------------------------------------------------------------------
// Keypoint sigmas (17 joints)
// ---------------------------------------------------------------------------

/// Per-joint sigma values from the COCO keypoint evaluation standard.
pub const COCO_SIGMAS: [f32; NUM_KEYPOINTS] = [
    0.026, // 0  nose
    0.025, // 1  left_eye
    0.025, // 2  right_eye
    0.035, // 3  left_ear
    0.035, // 4  right_ear
    0.079, // 5  left_shoulder
    0.079, // 6  right_shoulder
    0.072, // 7  left_elbow
    0.072, // 8  right_elbow
    0.062, // 9  left_wrist
    0.062, // 10 right_wrist
    0.107, // 11 left_hip
    0.107, // 12 right_hip
    0.087, // 13 left_knee
    0.087, // 14 right_knee
    0.089, // 15 left_ankle
    0.089, // 16 right_ankle
];

/// COCO sigmas scaled by ten, the values used by the PoseNet training runs.
pub const POSENET_SIGMAS: [f32; NUM_KEYPOINTS] = [
    0.26, 0.25, 0.25, 0.35, 0.35, 0.79, 0.79, 0.72, 0.72, 0.62, 0.62, 1.07, 1.07, 0.87, 0.87,
    0.89, 0.89,
];

// ---------------------------------------------------------------------------
// OKS
// ---------------------------------------------------------------------------

/// What [`object_keypoint_similarity`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OksMode {
    /// Mean exponential keypoint similarity over matched pairs, in `[0, 1]`.
    #[default]
    Similarity,
    /// Number of matched pairs. Kept for comparison with historical runs,
    /// whose logged "oks" was this count.
    MatchCount,
}

/// Object Keypoint Similarity of an assignment.
///
/// For every matched pair and every keypoint whose ground truth is not a
/// sentinel:
///
/// ```text
/// s_k = exp(-d_k² / (2 · var_k · σ_k²)),   var_k = σ_k²,   d_k = ‖p_k − g_k‖ / image_size
/// ```
///
/// The pair score is the mean of `s_k`; the result is the mean pair score.
/// Pairs whose ground truth has no labelled keypoint are skipped. Returns
/// `0.0` when nothing contributes.
pub fn object_keypoint_similarity(
    assignment: &Assignment,
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    sigmas: &[f32],
    image_size: f32,
    mode: OksMode,
) -> TrainResult<f64> {
    if mode == OksMode::MatchCount {
        return Ok(assignment.len() as f64);
    }
    let k = gts.dim().1;
    if sigmas.len() != k {
        return Err(TrainError::length_mismatch("oks_sigmas", sigmas.len(), k));
    }
    let scale = if image_size > 0.0 { image_size as f64 } else { 1.0 };

    let mut pair_sum = 0.0_f64;
    let mut pair_count = 0_usize;
    for (pi, gi) in assignment.iter() {
        let pred = preds.index_axis(ndarray::Axis(0), pi);
        let gt = gts.index_axis(ndarray::Axis(0), gi);

        let mut num = 0.0_f64;
        let mut den = 0_usize;
        for (j, &sigma) in sigmas.iter().enumerate() {
            if is_sentinel(gt[[j, 0]], gt[[j, 1]]) {
                continue;
            }
            let dx = (pred[[j, 0]] - gt[[j, 0]]) as f64 / scale;
            let dy = (pred[[j, 1]] - gt[[j, 1]]) as f64 / scale;
            let sigma_sq = (sigma as f64).powi(2);
            let variance = sigma_sq;
            let exp_arg = -(dx * dx + dy * dy) / (2.0 * variance * sigma_sq + 1e-12);
            num += exp_arg.exp();
            den += 1;
        }
        if den > 0 {
            pair_sum += num / den as f64;
            pair_count += 1;
        }
    }

    Ok(if pair_count > 0 { pair_sum / pair_count as f64 } else { 0.0 })
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Z-score normalise a `[K, 2]` pose per coordinate axis.
///
/// Mean and sample standard deviation are taken over the non-sentinel
/// keypoints only. An axis with fewer than two labelled keypoints or a
/// vanishing spread is divided by one instead.
pub fn normalize_keypoints(pose: &ArrayView2<'_, f32>) -> Array2<f64> {
    let labelled: Vec<usize> = (0..pose.nrows())
        .filter(|&k| !is_sentinel(pose[[k, 0]], pose[[k, 1]]))
        .collect();
    let n = labelled.len();

    let mut out = pose.mapv(|v| v as f64);
    for axis in 0..2 {
        let mean = if n > 0 {
            labelled.iter().map(|&k| pose[[k, axis]] as f64).sum::<f64>() / n as f64
        } else {
            0.0
        };
        let std = if n > 1 {
            let var = labelled
                .iter()
                .map(|&k| (pose[[k, axis]] as f64 - mean).powi(2))
                .sum::<f64>()
                / (n - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };
        let std = if std < 1e-12 { 1.0 } else { std };
        out.column_mut(axis).mapv_inplace(|v| (v - mean) / std);
    }
    out
}

// ---------------------------------------------------------------------------
// Precision / recall
// ---------------------------------------------------------------------------

/// Per-keypoint outcome counts over the pairs of an assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeypointCounts {
    /// Predicted keypoints within threshold of a labelled ground truth.
    pub true_positives: usize,
    /// Predictions beyond threshold, or predictions where nothing is labelled.
    pub false_positives: usize,
    /// Labelled keypoints that were missed or predicted beyond threshold.
    pub false_negatives: usize,
}

impl KeypointCounts {
    /// `TP / (TP + FP)`, or `0.0` when the denominator is zero.
    pub fn precision(&self) -> f64 {
        let den = self.true_positives + self.false_positives;
        if den > 0 {
            self.true_positives as f64 / den as f64
        } else {
            0.0
        }
    }

    /// `TP / (TP + FN)`, or `0.0` when the denominator is zero.
    pub fn recall(&self) -> f64 {
        let den = self.true_positives + self.false_negatives;
        if den > 0 {
            self.true_positives as f64 / den as f64
        } else {
            0.0
        }
    }
}

/// Count true positives, false positives and false negatives over the
/// matched pairs at the given normalised distance `threshold`.
///
/// Sentinel tests use raw coordinates; distances use coordinates normalised
/// by [`normalize_keypoints`].
pub fn count_keypoints(
    assignment: &Assignment,
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    threshold: f64,
) -> KeypointCounts {
    let mut counts = KeypointCounts::default();
    for (pi, gi) in assignment.iter() {
        let pred = preds.index_axis(ndarray::Axis(0), pi);
        let gt = gts.index_axis(ndarray::Axis(0), gi);
        let pred_n = normalize_keypoints(&pred);
        let gt_n = normalize_keypoints(&gt);

        for k in 0..gt.nrows() {
            let gt_absent = is_sentinel(gt[[k, 0]], gt[[k, 1]]);
            let pred_absent = is_sentinel(pred[[k, 0]], pred[[k, 1]]);
            if gt_absent {
                if !pred_absent {
                    counts.false_positives += 1;
                }
                continue;
            }
            if pred_absent {
                counts.false_negatives += 1;
                continue;
            }
            let dx = pred_n[[k, 0]] - gt_n[[k, 0]];
            let dy = pred_n[[k, 1]] - gt_n[[k, 1]];
            if (dx * dx + dy * dy).sqrt() <= threshold {
                counts.true_positives += 1;
            } else {
                counts.false_positives += 1;
                counts.false_negatives += 1;
            }
        }
    }
    counts
}

/// Keypoint precision of an existing assignment.
pub fn precision_for_assignment(
    assignment: &Assignment,
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    threshold: f64,
) -> f64 {
    count_keypoints(assignment, preds, gts, threshold).precision()
}

/// Keypoint recall of an existing assignment.
pub fn recall_for_assignment(
    assignment: &Assignment,
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    threshold: f64,
) -> f64 {
    count_keypoints(assignment, preds, gts, threshold).recall()
}

/// Match `preds` to `gts` and return keypoint precision at `threshold`.
pub fn precision(
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    threshold: f64,
) -> TrainResult<f64> {
    let assignment = match_poses(preds, gts)?;
    Ok(precision_for_assignment(&assignment, preds, gts, threshold))
}

/// Match `preds` to `gts` and return keypoint recall at `threshold`.
pub fn recall(
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    threshold: f64,
) -> TrainResult<f64> {
    let assignment = match_poses(preds, gts)?;
    Ok(recall_for_assignment(&assignment, preds, gts, threshold))
}

// ---------------------------------------------------------------------------
// Precision-recall curve and mAP
// ---------------------------------------------------------------------------

/// `n` evenly spaced values from `start` to `end` inclusive.
pub fn linspace_thresholds(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Precision and recall of one assignment at every threshold.
///
/// Returns `(precisions, recalls)` in threshold order.
pub fn precision_recall_sweep(
    assignment: &Assignment,
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
    thresholds: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    thresholds
        .iter()
        .map(|&t| {
            let counts = count_keypoints(assignment, preds, gts, t);
            (counts.precision(), counts.recall())
        })
        .unzip()
}

/// Interpolated average precision of a precision-recall curve.
///
/// Points are sorted by recall, framed by `(recall 0, precision 0)` and
/// `(recall 1, precision 0)`, each precision is replaced by the maximum
/// precision at equal or higher recall, and the result is
/// `Σ (r_{i+1} − r_i) · p_i`.
///
/// # Errors
///
/// [`TrainError::LengthMismatch`] when the two slices differ in length.
pub fn mean_average_precision(precisions: &[f64], recalls: &[f64]) -> TrainResult<f64> {
    if precisions.len() != recalls.len() {
        return Err(TrainError::length_mismatch("mean_average_precision", precisions.len(), recalls.len()));
    }

    let mut order: Vec<usize> = (0..recalls.len()).collect();
    // Stable sort so equal recalls keep their input order.
    order.sort_by(|&a, &b| recalls[a].total_cmp(&recalls[b]));

    let mut p = Vec::with_capacity(precisions.len() + 2);
    let mut r = Vec::with_capacity(recalls.len() + 2);
    p.push(0.0);
    r.push(0.0);
    for &i in &order {
        p.push(precisions[i]);
        r.push(recalls[i]);
    }
    p.push(0.0);
    r.push(1.0);

    for i in (1..p.len()).rev() {
        p[i - 1] = p[i - 1].max(p[i]);
    }

    Ok(r.windows(2).zip(&p).map(|(w, &pi)| (w[1] - w[0]) * pi).sum())
}

// ---------------------------------------------------------------------------
// MetricsResult
// ---------------------------------------------------------------------------

/// Aggregated evaluation metrics over a set of images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    /// Mean per-image OKS.
    pub oks: f64,
    /// Mean per-image mAP.
    pub map: f64,
    /// Mean per-image precision at the largest sweep threshold.
    pub mean_precision: f64,
    /// Mean per-image recall at the largest sweep threshold.
    pub mean_recall: f64,
    /// Total number of matched pose pairs.
    pub matched_pairs: usize,
    /// Number of images evaluated.
    pub num_images: usize,
}

impl MetricsResult {
    /// `true` when this result is strictly better than `other` on mAP.
    pub fn is_better_than(&self, other: &MetricsResult) -> bool {
        self.map > other.map
    }

    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        format!(
            "mAP={:.4}  OKS={:.4}  P={:.4}  R={:.4}  (n_images={}  n_pairs={})",
            self.map, self.oks, self.mean_precision, self.mean_recall, self.num_images, self.matched_pairs
        )
    }
}

// ---------------------------------------------------------------------------
// MetricsAccumulator
// ---------------------------------------------------------------------------

/// Running accumulator for per-image metrics across an evaluation pass.
///
/// Call [`MetricsAccumulator::update`] for each image, then
/// [`MetricsAccumulator::finalize`] to obtain a [`MetricsResult`].
///
/// Create one accumulator per evaluation pass; it is not meant to be shared.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    oks_sum: f64,
    map_sum: f64,
    precision_sum: f64,
    recall_sum: f64,
    matched_pairs: usize,
    num_images: usize,
}

impl MetricsAccumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one image's metrics.
    pub fn update(&mut self, image: &ImageMetrics) {
        self.oks_sum += image.oks;
        self.map_sum += image.map;
        self.precision_sum += image.precisions.last().copied().unwrap_or(0.0);
        self.recall_sum += image.recalls.last().copied().unwrap_or(0.0);
        self.matched_pairs += image.assignment.len();
        self.num_images += 1;
    }

    /// Finalize and return aggregated metrics.
    ///
    /// Returns `None` if no image has been accumulated yet.
    pub fn finalize(&self) -> Option<MetricsResult> {
        if self.num_images == 0 {
            return None;
        }
        let n = self.num_images as f64;
        Some(MetricsResult {
            oks: self.oks_sum / n,
            map: self.map_sum / n,
            mean_precision: self.precision_sum / n,
            mean_recall: self.recall_sum / n,
            matched_pairs: self.matched_pairs,
            num_images: self.num_images,
        })
    }

    /// Number of images accumulated so far.
    pub fn num_images(&self) -> usize {
        self.num_images
    }

    /// Reset the accumulator to the empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
