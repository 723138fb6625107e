//! Keypoint, pose and pose-set representation.
//!
//! Poses use a fixed 17-keypoint COCO topology. Coordinates are stored as
//! `[x, y]` (column, row) in input-image pixels:
//!
//! - a single pose is an `Array2<f32>` of shape `[K, 2]`;
//! - a pose set for one image is an `Array3<f32>` of shape `[P, K, 2]`,
//!   where `P <= max_num_poses` and unused slots hold sentinel poses.
//!
//! The coordinates `(0, 0)` and `(-1, -1)` are reserved sentinels meaning
//! "keypoint absent / unlabelled". A real keypoint that happens to sit at the
//! origin is therefore treated as absent.

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{TrainError, TrainResult};

/// Number of keypoints per pose.
pub const NUM_KEYPOINTS: usize = 17;

/// Keypoint names in index order.
pub const KEYPOINT_NAMES: [&str; NUM_KEYPOINTS] = [
    "nose",
    "leftEye",
    "rightEye",
    "leftEar",
    "rightEar",
    "leftShoulder",
    "rightShoulder",
    "leftElbow",
    "rightElbow",
    "leftWrist",
    "rightWrist",
    "leftHip",
    "rightHip",
    "leftKnee",
    "rightKnee",
    "leftAnkle",
    "rightAnkle",
];

/// Coordinate value used to fill unused pose slots.
pub const ABSENT: f32 = -1.0;

/// Returns `true` when `(x, y)` is one of the absent-keypoint sentinels.
#[inline]
pub fn is_sentinel(x: f32, y: f32) -> bool {
    (x == 0.0 && y == 0.0) || (x == -1.0 && y == -1.0)
}

/// Returns `true` when keypoint `k` of `pose` is a sentinel.
#[inline]
pub fn keypoint_is_sentinel(pose: &ArrayView2<'_, f32>, k: usize) -> bool {
    is_sentinel(pose[[k, 0]], pose[[k, 1]])
}

/// A pose counts as present when any of its keypoints is not a sentinel.
pub fn is_pose_present(pose: &ArrayView2<'_, f32>) -> bool {
    (0..pose.nrows()).any(|k| !keypoint_is_sentinel(pose, k))
}

/// Number of present poses in a `[P, K, 2]` pose set.
pub fn count_people(pose_set: &ArrayView3<'_, f32>) -> usize {
    pose_set
        .outer_iter()
        .filter(|pose| is_pose_present(pose))
        .count()
}

/// Indices of the present poses in a `[P, K, 2]` pose set, in slot order.
pub fn present_pose_indices(pose_set: &ArrayView3<'_, f32>) -> Vec<usize> {
    pose_set
        .outer_iter()
        .enumerate()
        .filter(|(_, pose)| is_pose_present(pose))
        .map(|(p, _)| p)
        .collect()
}

/// Copy only the present poses of a pose set, preserving order.
pub fn present_poses(pose_set: &ArrayView3<'_, f32>) -> Array3<f32> {
    let idx = present_pose_indices(pose_set);
    pose_set.select(Axis(0), &idx)
}

/// Build a `[max_num_poses, K, 2]` pose set from individual `[K, 2]` poses,
/// filling unused slots with [`ABSENT`].
///
/// # Errors
///
/// [`TrainError::TooManyPoses`] when more than `max_num_poses` poses are
/// given, [`TrainError::ShapeMismatch`] when a pose is not `[K, 2]`.
pub fn pad_pose_set(poses: &[Array2<f32>], max_num_poses: usize) -> TrainResult<Array3<f32>> {
    if poses.len() > max_num_poses {
        return Err(TrainError::TooManyPoses { count: poses.len(), max: max_num_poses });
    }
    let mut set = Array3::from_elem((max_num_poses, NUM_KEYPOINTS, 2), ABSENT);
    for (p, pose) in poses.iter().enumerate() {
        if pose.dim() != (NUM_KEYPOINTS, 2) {
            return Err(TrainError::shape_mismatch(
                "pad_pose_set",
                vec![NUM_KEYPOINTS, 2],
                pose.shape().to_vec(),
            ));
        }
        set.index_axis_mut(Axis(0), p).assign(pose);
    }
    Ok(set)
}

/// Check that `pose_set` is `[P, K, 2]` with `K == NUM_KEYPOINTS`.
pub(crate) fn ensure_pose_set_shape(
    stage: &'static str,
    pose_set: &ArrayView3<'_, f32>,
) -> TrainResult<()> {
    let (p, k, c) = pose_set.dim();
    if k != NUM_KEYPOINTS || c != 2 {
        return Err(TrainError::shape_mismatch(stage, vec![p, NUM_KEYPOINTS, 2], vec![p, k, c]));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DecodedPoses
// ---------------------------------------------------------------------------

/// Poses produced by the external heatmap decoder for one image.
///
/// Holds `N` candidate poses with a pose score, per-keypoint scores and
/// `[x, y]` keypoint coordinates.
#[derive(Debug, Clone)]
pub struct DecodedPoses {
    pose_scores: Array1<f32>,
    keypoint_scores: Array2<f32>,
    keypoint_coords: Array3<f32>,
}

impl DecodedPoses {
    /// Bundle decoder output, validating that all three arrays agree on `N`
    /// and that every pose has [`NUM_KEYPOINTS`] keypoints.
    pub fn new(
        pose_scores: Array1<f32>,
        keypoint_scores: Array2<f32>,
        keypoint_coords: Array3<f32>,
    ) -> TrainResult<Self> {
        let n = pose_scores.len();
        if keypoint_scores.dim() != (n, NUM_KEYPOINTS) {
            return Err(TrainError::shape_mismatch(
                "decoded_poses",
                vec![n, NUM_KEYPOINTS],
                keypoint_scores.shape().to_vec(),
            ));
        }
        if keypoint_coords.dim() != (n, NUM_KEYPOINTS, 2) {
            return Err(TrainError::shape_mismatch(
                "decoded_poses",
                vec![n, NUM_KEYPOINTS, 2],
                keypoint_coords.shape().to_vec(),
            ));
        }
        Ok(DecodedPoses { pose_scores, keypoint_scores, keypoint_coords })
    }

    /// Decoded poses with unit scores, for callers that only have coordinates.
    pub fn from_coords(keypoint_coords: Array3<f32>) -> TrainResult<Self> {
        let n = keypoint_coords.shape()[0];
        Self::new(
            Array1::ones(n),
            Array2::ones((n, NUM_KEYPOINTS)),
            keypoint_coords,
        )
    }

    /// Number of decoded poses.
    pub fn len(&self) -> usize {
        self.pose_scores.len()
    }

    /// `true` when no pose was decoded.
    pub fn is_empty(&self) -> bool {
        self.pose_scores.is_empty()
    }

    /// Per-pose scores `[N]`.
    pub fn pose_scores(&self) -> &Array1<f32> {
        &self.pose_scores
    }

    /// Per-keypoint scores `[N, K]`.
    pub fn keypoint_scores(&self) -> &Array2<f32> {
        &self.keypoint_scores
    }

    /// Keypoint coordinates `[N, K, 2]`.
    pub fn keypoint_coords(&self) -> &Array3<f32> {
        &self.keypoint_coords
    }

    /// Keep only the poses whose score is at least `score_threshold`.
    pub fn retain_above(&self, score_threshold: f32) -> DecodedPoses {
        let keep: Vec<usize> = self
            .pose_scores
            .iter()
            .enumerate()
            .filter(|(_, s)| **s >= score_threshold)
            .map(|(i, _)| i)
            .collect();
        DecodedPoses {
            pose_scores: self.pose_scores.select(Axis(0), &keep),
            keypoint_scores: self.keypoint_scores.select(Axis(0), &keep),
            keypoint_coords: self.keypoint_coords.select(Axis(0), &keep),
        }
    }
}
