//! Integration tests for [`posenet_train::metrics`].
//!
//! All inputs are fixed, deterministic arrays; no `rand`, no OS entropy.

use approx::assert_abs_diff_eq;
use ndarray::Array3;
use posenet_train::matching::{match_poses, Assignment};
use posenet_train::metrics::{
    count_keypoints, linspace_thresholds, mean_average_precision, object_keypoint_similarity, precision,
    precision_recall_sweep, recall, MetricsAccumulator, OksMode, COCO_SIGMAS, POSENET_SIGMAS,
};
use posenet_train::pose::{pad_pose_set, NUM_KEYPOINTS};
use posenet_train::{DecodedPoses, EvalConfig, PoseEvaluator};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn poses(n: usize, shift: f32) -> Array3<f32> {
    Array3::from_shape_fn((n, NUM_KEYPOINTS, 2), |(p, k, c)| {
        let wobble = ((k * 5 + c * 3) % 7) as f32;
        30.0 + shift + p as f32 * 120.0 + k as f32 * 6.0 + wobble + c as f32 * 2.0
    })
}

/// Shift keypoints by amounts that are not affine in their coordinates, so
/// per-pose normalisation cannot undo the change.
fn perturbed(base: &Array3<f32>) -> Array3<f32> {
    let mut out = base.clone();
    for mut pose in out.outer_iter_mut() {
        for k in 0..NUM_KEYPOINTS {
            pose[[k, 0]] += ((k * k) % 5) as f32 * 6.0;
            pose[[k, 1]] += ((k * 3) % 4) as f32 * 5.0;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// OKS
// ---------------------------------------------------------------------------

#[test]
fn oks_of_identical_sets_is_one_for_both_sigma_tables() {
    let gts = poses(4, 0.0);
    let a = match_poses(&gts.view(), &gts.view()).unwrap();
    for sigmas in [&COCO_SIGMAS[..], &POSENET_SIGMAS[..]] {
        let oks = object_keypoint_similarity(&a, &gts.view(), &gts.view(), sigmas, 257.0, OksMode::Similarity).unwrap();
        assert_abs_diff_eq!(oks, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn oks_stays_in_unit_interval() {
    let gts = poses(3, 0.0);
    for shift in [0.5_f32, 3.0, 12.0, 80.0, 400.0] {
        let preds = poses(3, shift);
        let a = match_poses(&preds.view(), &gts.view()).unwrap();
        let oks = object_keypoint_similarity(&a, &preds.view(), &gts.view(), &COCO_SIGMAS, 257.0, OksMode::Similarity).unwrap();
        assert!((0.0..=1.0).contains(&oks), "shift {shift}: oks {oks} outside [0, 1]");
    }
}

#[test]
fn oks_ignores_unlabelled_ground_truth_keypoints() {
    let gts = poses(1, 0.0);
    let mut preds = gts.clone();
    let mut gts_partial = gts.clone();
    // Keypoint 3 is unlabelled in the ground truth; its prediction is far off.
    gts_partial[[0, 3, 0]] = 0.0;
    gts_partial[[0, 3, 1]] = 0.0;
    preds[[0, 3, 0]] = 250.0;
    let a = Assignment { pairs: vec![(0, 0)], total_cost: 0.0 };
    let oks = object_keypoint_similarity(&a, &preds.view(), &gts_partial.view(), &POSENET_SIGMAS, 257.0, OksMode::Similarity).unwrap();
    assert_abs_diff_eq!(oks, 1.0, epsilon = 1e-12);
}

// ---------------------------------------------------------------------------
// Precision / recall
// ---------------------------------------------------------------------------

#[test]
fn identical_sets_have_unit_precision_and_recall_at_every_threshold() {
    let gts = poses(3, 0.0);
    for t in linspace_thresholds(0.0, 10.0, 50) {
        assert_abs_diff_eq!(precision(&gts.view(), &gts.view(), t).unwrap(), 1.0);
        assert_abs_diff_eq!(recall(&gts.view(), &gts.view(), t).unwrap(), 1.0);
    }
}

#[test]
fn translation_does_not_change_normalised_precision() {
    // Per-pose normalisation removes a pure translation.
    let gts = poses(2, 0.0);
    let preds = poses(2, 7.0);
    assert_abs_diff_eq!(precision(&preds.view(), &gts.view(), 1e-3).unwrap(), 1.0, epsilon = 1e-12);
}

#[test]
fn precision_and_recall_grow_with_threshold() {
    let gts = poses(2, 0.0);
    let preds = perturbed(&gts);
    let a = match_poses(&preds.view(), &gts.view()).unwrap();
    let thresholds = linspace_thresholds(0.0, 10.0, 50);
    let (ps, rs) = precision_recall_sweep(&a, &preds.view(), &gts.view(), &thresholds);

    assert!(ps[0] < 1.0, "a perturbed pose cannot be perfect at threshold 0");
    assert!(ps.windows(2).all(|w| w[0] <= w[1] + 1e-12));
    assert!(rs.windows(2).all(|w| w[0] <= w[1] + 1e-12));
    assert_abs_diff_eq!(*ps.last().unwrap(), 1.0);
}

#[test]
fn sentinel_keypoints_are_never_true_positives() {
    let mut gts = poses(1, 0.0);
    let mut preds = gts.clone();
    for k in 0..NUM_KEYPOINTS {
        gts[[0, k, 0]] = -1.0;
        gts[[0, k, 1]] = -1.0;
    }
    for k in 0..4 {
        preds[[0, k, 0]] = -1.0;
        preds[[0, k, 1]] = -1.0;
    }
    let a = Assignment { pairs: vec![(0, 0)], total_cost: 0.0 };
    let counts = count_keypoints(&a, &preds.view(), &gts.view(), 100.0);
    assert_eq!(counts.true_positives, 0);
    assert_eq!(counts.false_positives, NUM_KEYPOINTS - 4);
    assert_eq!(counts.precision(), 0.0);
    assert_eq!(counts.recall(), 0.0);
}

// ---------------------------------------------------------------------------
// mAP
// ---------------------------------------------------------------------------

#[test]
fn map_is_bounded_by_one() {
    let curves: [(&[f64], &[f64]); 3] = [
        (&[1.0, 0.9, 0.7], &[0.2, 0.6, 1.0]),
        (&[0.3, 0.3], &[0.1, 0.4]),
        (&[0.0], &[0.0]),
    ];
    for (p, r) in curves {
        let map = mean_average_precision(p, r).unwrap();
        assert!((0.0..=1.0).contains(&map), "map {map} outside [0, 1]");
    }
}

#[test]
fn map_of_empty_curve_is_zero() {
    assert_eq!(mean_average_precision(&[], &[]).unwrap(), 0.0);
}

// ---------------------------------------------------------------------------
// Evaluation pass
// ---------------------------------------------------------------------------

#[test]
fn accumulated_metrics_over_images() {
    let evaluator = PoseEvaluator::new(EvalConfig::default()).unwrap();
    let mut acc = MetricsAccumulator::new();

    let gt_set = poses(2, 0.0);
    let gt_list: Vec<_> = gt_set.outer_iter().map(|p| p.to_owned()).collect();
    let padded = pad_pose_set(&gt_list, 15).unwrap();

    let exact = DecodedPoses::from_coords(gt_set.clone()).unwrap();
    let off = DecodedPoses::from_coords(perturbed(&gt_set)).unwrap();
    for (id, decoded) in [("exact", &exact), ("off", &off)] {
        let m = evaluator.evaluate_image(id, decoded, &padded.view(), 257.0).unwrap();
        assert_eq!(m.num_ground_truth, 2);
        acc.update(&m);
    }

    let r = acc.finalize().unwrap();
    assert_eq!(r.num_images, 2);
    assert_eq!(r.matched_pairs, 4);
    assert!(r.map > 0.0 && r.map <= 1.0);
    assert!(r.oks < 1.0);
}
