//! Multi-person heatmap + offset aggregation loss.
//!
//! For every present pose `p` of an image:
//!
//! - **Heatmap term**: binary cross-entropy (with logits, mean-reduced)
//!   between the predicted heatmap logits and a disk-shaped binary target
//!   built from pose `p`'s keypoints.
//! - **Offset term**: smooth-L1 (β = 1, mean-reduced) between predicted and
//!   ground-truth offsets, both multiplied by a dilation mask grown from
//!   pose `p`'s raw ground-truth heatmap and restricted to the keypoints
//!   labelled in pose `p`.
//!
//! Both terms are summed over present poses and divided by the number of
//! people, then combined:
//!
//! ```text
//! L_total = (w_h · L_heatmap + w_o · L_offset) / (w_h + w_o)
//! ```
//!
//! An image without people yields zero losses.
//!
//! [`LossAggregator::compute`] runs on host arrays and is used for
//! validation and logging. With the `tch-backend` feature,
//! [`LossAggregator::forward`] computes the same quantities on tensors and
//! returns a differentiable scalar.

use ndarray::{Array1, Array4, ArrayView2, ArrayView3, ArrayView4, ArrayView5, Axis, Zip};
use tracing::debug;

use crate::config::LossConfig;
use crate::error::{TrainError, TrainResult};
use crate::offsets::OffsetMapBuilder;
use crate::pose::{count_people, ensure_pose_set_shape, keypoint_is_sentinel, present_pose_indices, NUM_KEYPOINTS};
use crate::targets::{binary_disk_heatmap, dilation_mask};

#[cfg(feature = "tch-backend")]
use crate::context::ComputeContext;
#[cfg(feature = "tch-backend")]
use tch::{Kind, Reduction, Tensor};

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Model outputs and ground truth for one image.
///
/// # Shapes
/// - `pred_heatmaps`: `[K, H, W]` heatmap logits
/// - `target_heatmaps`: `[P, K, H, W]` raw ground-truth heatmaps
/// - `target_keypoints`: `[P, K, 2]` ground-truth pose set, `[x, y]`
/// - `pred_offsets`: `[K, 2, H, W]` raw offset regression output
/// - `target_offsets`: `[P, K, H, W, 2]` ground-truth offset field
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Predicted heatmap logits.
    pub pred_heatmaps: ArrayView3<'a, f32>,
    /// Raw ground-truth heatmaps, one stack per pose slot.
    pub target_heatmaps: ArrayView4<'a, f32>,
    /// Ground-truth keypoints.
    pub target_keypoints: ArrayView3<'a, f32>,
    /// Predicted offsets.
    pub pred_offsets: ArrayView4<'a, f32>,
    /// Ground-truth offset field.
    pub target_offsets: ArrayView5<'a, f32>,
}

/// Scalar loss values plus the binary targets that produced them.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Weighted combination of the two terms.
    pub total: f64,
    /// Per-person heatmap BCE.
    pub heatmap: f64,
    /// Per-person masked offset smooth-L1.
    pub offset: f64,
    /// Number of present poses the losses were averaged over.
    pub num_people: usize,
    /// Disk targets `[P, K, H, W]`; slots of absent poses are all-zero.
    pub binary_targets: Array4<f32>,
}

/// Tensor counterpart of [`LossOutput`].
///
/// The scalars are detached copies for logging; back-propagate through the
/// tensor returned alongside it.
#[cfg(feature = "tch-backend")]
#[derive(Debug)]
pub struct TensorLossOutput {
    /// Weighted combination of the two terms.
    pub total: f64,
    /// Per-person heatmap BCE.
    pub heatmap: f64,
    /// Per-person masked offset smooth-L1.
    pub offset: f64,
    /// Number of present poses.
    pub num_people: usize,
    /// Disk targets `[P, K, H, W]`.
    pub binary_targets: Tensor,
}

// ─────────────────────────────────────────────────────────────────────────────
// Element-wise terms
// ─────────────────────────────────────────────────────────────────────────────

/// Binary cross-entropy of logit `x` against target `z`, in the
/// `max(x, 0) − x·z + ln(1 + e^{−|x|})` form that does not overflow.
#[inline]
pub fn bce_with_logits(x: f32, z: f32) -> f64 {
    let x = x as f64;
    let z = z as f64;
    x.max(0.0) - x * z + (-x.abs()).exp().ln_1p()
}

/// Smooth-L1 (Huber) with β = 1.
#[inline]
pub fn smooth_l1(d: f64) -> f64 {
    let a = d.abs();
    if a < 1.0 {
        0.5 * d * d
    } else {
        a - 0.5
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LossAggregator
// ─────────────────────────────────────────────────────────────────────────────

/// 1.0 for each labelled keypoint of `pose`, 0.0 for sentinels.
fn labelled_flags(pose: &ArrayView2<'_, f32>) -> Array1<f64> {
    Array1::from_shape_fn(pose.nrows(), |k| if keypoint_is_sentinel(pose, k) { 0.0 } else { 1.0 })
}

/// Per-person heatmap + offset loss.
///
/// Holds only configuration, so one aggregator can be shared by reference
/// across threads.
#[derive(Debug, Clone, Default)]
pub struct LossAggregator {
    config: LossConfig,
}

impl LossAggregator {
    /// Create an aggregator with the given constants.
    ///
    /// # Errors
    ///
    /// [`TrainError::Config`] when `config` fails [`LossConfig::validate`].
    pub fn new(config: LossConfig) -> TrainResult<Self> {
        config.validate()?;
        Ok(LossAggregator { config })
    }

    /// The loss constants.
    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    fn combine(&self, heatmap: f64, offset: f64) -> f64 {
        let (wh, wo) = (self.config.heatmap_weight, self.config.offset_weight);
        (wh * heatmap + wo * offset) / (wh + wo)
    }

    /// Validate shapes and return `(P, K, H, W)`.
    fn check_shapes(&self, inputs: &LossInputs<'_>) -> TrainResult<(usize, usize, usize, usize)> {
        let (k, h, w) = inputs.pred_heatmaps.dim();
        if k != NUM_KEYPOINTS {
            return Err(TrainError::shape_mismatch(
                "loss_pred_heatmaps",
                vec![NUM_KEYPOINTS, h, w],
                vec![k, h, w],
            ));
        }
        ensure_pose_set_shape("loss_target_keypoints", &inputs.target_keypoints)?;
        let p = inputs.target_keypoints.dim().0;
        if p > self.config.max_num_poses {
            return Err(TrainError::TooManyPoses { count: p, max: self.config.max_num_poses });
        }

        let check = |stage: &'static str, expected: Vec<usize>, actual: &[usize]| {
            if actual == expected.as_slice() {
                Ok(())
            } else {
                Err(TrainError::shape_mismatch(stage, expected, actual.to_vec()))
            }
        };
        check("loss_target_heatmaps", vec![p, k, h, w], inputs.target_heatmaps.shape())?;
        check("loss_pred_offsets", vec![k, 2, h, w], inputs.pred_offsets.shape())?;
        check("loss_target_offsets", vec![p, k, h, w, 2], inputs.target_offsets.shape())?;
        Ok((p, k, h, w))
    }

    /// Per-keypoint channel weights of pose `p`: 1 everywhere, or 1/0 by
    /// labelled-ness when `use_target_weight` is set.
    fn channel_weights(&self, labelled: &Array1<f64>) -> Array1<f64> {
        if self.config.use_target_weight {
            labelled.clone()
        } else {
            Array1::ones(labelled.len())
        }
    }

    /// Compute the aggregated loss on host arrays.
    ///
    /// # Errors
    ///
    /// [`TrainError::ShapeMismatch`] naming the offending input when the
    /// shapes listed on [`LossInputs`] disagree, and
    /// [`TrainError::TooManyPoses`] when `P > max_num_poses`.
    pub fn compute(&self, inputs: LossInputs<'_>) -> TrainResult<LossOutput> {
        let (p, k, h, w) = self.check_shapes(&inputs)?;
        let mut binary_targets = Array4::zeros((p, k, h, w));

        let num_people = count_people(&inputs.target_keypoints);
        if num_people == 0 {
            debug!("no people in target keypoints; loss is zero");
            return Ok(LossOutput { total: 0.0, heatmap: 0.0, offset: 0.0, num_people, binary_targets });
        }

        let pred_offsets = inputs.pred_offsets.permuted_axes([0, 2, 3, 1]); // [K, H, W, 2]
        let hm_elems = (k * h * w) as f64;
        let off_elems = (k * h * w * 2) as f64;
        let cfg = &self.config;

        let (heatmap_sum, offset_sum) = present_pose_indices(&inputs.target_keypoints).into_iter().fold(
            (0.0_f64, 0.0_f64),
            |(hm_acc, off_acc), pi| {
                let keypoints = inputs.target_keypoints.index_axis(Axis(0), pi);
                let labelled = labelled_flags(&keypoints);
                let weights = self.channel_weights(&labelled);

                let target = binary_disk_heatmap(&keypoints, h, w, cfg.radius, cfg.output_stride);
                let mut bce = 0.0_f64;
                Zip::indexed(&inputs.pred_heatmaps).and(&target).for_each(|(kk, _, _), &x, &z| {
                    bce += weights[kk] * bce_with_logits(x, z);
                });

                let mask = dilation_mask(
                    &inputs.target_heatmaps.index_axis(Axis(0), pi),
                    cfg.mask_threshold,
                    cfg.radius,
                );
                let mut huber = 0.0_f64;
                Zip::indexed(&pred_offsets)
                    .and(&inputs.target_offsets.index_axis(Axis(0), pi))
                    .for_each(|(kk, r, c, _), &po, &to| {
                        // Sentinel keypoints never reach the offset term.
                        let m = mask[[kk, r, c]] * labelled[kk] as f32;
                        huber += weights[kk] * smooth_l1((po * m - to * m) as f64);
                    });

                binary_targets.index_axis_mut(Axis(0), pi).assign(&target);
                (hm_acc + bce / hm_elems, off_acc + huber / off_elems)
            },
        );

        let heatmap = heatmap_sum / num_people as f64;
        let offset = offset_sum / num_people as f64;
        let total = self.combine(heatmap, offset);
        debug!(num_people, heatmap, offset, total, "aggregated pose loss");

        Ok(LossOutput { total, heatmap, offset, num_people, binary_targets })
    }

    /// Build the ground-truth offset field from `target_keypoints` with
    /// [`OffsetMapBuilder`] and then run [`LossAggregator::compute`].
    pub fn compute_from_keypoints(
        &self,
        pred_heatmaps: ArrayView3<'_, f32>,
        target_heatmaps: ArrayView4<'_, f32>,
        target_keypoints: ArrayView3<'_, f32>,
        pred_offsets: ArrayView4<'_, f32>,
    ) -> TrainResult<LossOutput> {
        let (_, h, w) = pred_heatmaps.dim();
        let p = target_keypoints.dim().0;
        if p > self.config.max_num_poses {
            return Err(TrainError::TooManyPoses { count: p, max: self.config.max_num_poses });
        }
        let target_offsets =
            OffsetMapBuilder::new(h, w, self.config.output_stride, p).build(&target_keypoints)?;
        self.compute(LossInputs {
            pred_heatmaps: pred_heatmaps.view(),
            target_heatmaps: target_heatmaps.view(),
            target_keypoints: target_keypoints.view(),
            pred_offsets: pred_offsets.view(),
            target_offsets: target_offsets.view(),
        })
    }

    // ── Tensor backend ───────────────────────────────────────────────────────

    /// Differentiable version of [`LossAggregator::compute_from_keypoints`].
    ///
    /// All poses are processed in one batched pass; absent pose slots are
    /// multiplied out, which is equivalent to folding over present poses.
    ///
    /// # Shapes
    /// - `pred_heatmaps`: `[K, H, W]` logits
    /// - `target_heatmaps`: `[P, K, H, W]`
    /// - `target_keypoints`: `[P, K, 2]`
    /// - `pred_offsets`: `[K, 2, H, W]`
    ///
    /// Returns `(total_loss_tensor, TensorLossOutput)`.
    #[cfg(feature = "tch-backend")]
    pub fn forward(
        &self,
        pred_heatmaps: &Tensor,
        target_heatmaps: &Tensor,
        target_keypoints: &Tensor,
        pred_offsets: &Tensor,
        ctx: &ComputeContext,
    ) -> TrainResult<(Tensor, TensorLossOutput)> {
        let dims = |t: &Tensor| t.size().iter().map(|&d| d as usize).collect::<Vec<_>>();
        let hm = pred_heatmaps.size();
        if hm.len() != 3 || hm[0] != NUM_KEYPOINTS as i64 {
            return Err(TrainError::shape_mismatch("loss_pred_heatmaps", vec![NUM_KEYPOINTS, 0, 0], dims(pred_heatmaps)));
        }
        let (k, h, w) = (hm[0], hm[1], hm[2]);
        let kp = target_keypoints.size();
        if kp.len() != 3 || kp[1] != k || kp[2] != 2 {
            return Err(TrainError::shape_mismatch("loss_target_keypoints", vec![0, k as usize, 2], dims(target_keypoints)));
        }
        let p = kp[0];
        if p as usize > self.config.max_num_poses {
            return Err(TrainError::TooManyPoses { count: p as usize, max: self.config.max_num_poses });
        }
        let (pu, ku, hu, wu) = (p as usize, k as usize, h as usize, w as usize);
        if target_heatmaps.size() != [p, k, h, w] {
            return Err(TrainError::shape_mismatch("loss_target_heatmaps", vec![pu, ku, hu, wu], dims(target_heatmaps)));
        }
        if pred_offsets.size() != [k, 2, h, w] {
            return Err(TrainError::shape_mismatch("loss_pred_offsets", vec![ku, 2, hu, wu], dims(pred_offsets)));
        }

        let cfg = &self.config;
        let opts = ctx.float_options();
        let device = ctx.device();
        let keypoints = target_keypoints.to_device(device).to_kind(Kind::Float);

        // Labelled keypoints [P, K] and present poses [P].
        let xs = keypoints.select(2, 0);
        let ys = keypoints.select(2, 1);
        let at_origin = xs.eq(0.0).logical_and(&ys.eq(0.0));
        let at_absent = xs.eq(-1.0).logical_and(&ys.eq(-1.0));
        let labelled = at_origin.logical_or(&at_absent).logical_not().to_kind(Kind::Float);
        let present = labelled.amax([1], false);
        let num_people = present.sum(Kind::Int64).int64_value(&[]) as usize;

        // Disk targets [P, K, H, W].
        let stride = cfg.output_stride as f64;
        let cx = (&xs / stride).trunc().view([p, k, 1, 1]);
        let cy = (&ys / stride).trunc().view([p, k, 1, 1]);
        let cols = Tensor::arange(w, opts).view([1, 1, 1, w]);
        let rows = Tensor::arange(h, opts).view([1, 1, h, 1]);
        let dist = ((&cols - &cx).square() + (&rows - &cy).square()).sqrt();
        let binary_targets = dist.le(cfg.radius as f64).to_kind(Kind::Float) * labelled.view([p, k, 1, 1]);

        if num_people == 0 {
            debug!("no people in target keypoints; loss is zero");
            let zero = pred_heatmaps.sum(Kind::Float) * 0.0 + pred_offsets.sum(Kind::Float) * 0.0;
            let out = TensorLossOutput { total: 0.0, heatmap: 0.0, offset: 0.0, num_people, binary_targets };
            return Ok((zero, out));
        }

        let channel_weight = if cfg.use_target_weight {
            labelled.view([p, k, 1, 1])
        } else {
            Tensor::ones([p, k, 1, 1], opts)
        };

        // Heatmap term, one value per pose slot.
        let bce = pred_heatmaps
            .unsqueeze(0)
            .expand_as(&binary_targets)
            .f_binary_cross_entropy_with_logits::<Tensor>(&binary_targets, None, None, Reduction::None)?
            * &channel_weight;
        let bce_per_pose = bce.mean_dim(&[1_i64, 2, 3][..], false, Kind::Float);

        // Offset term.
        let target_offsets = OffsetMapBuilder::new(hu, wu, cfg.output_stride, pu).build_tensor(&keypoints, ctx)?;
        let dilated = target_heatmaps
            .to_device(device)
            .gt(cfg.mask_threshold as f64)
            .to_kind(Kind::Float)
            .max_pool2d([2 * cfg.radius as i64 + 1; 2], [1, 1], [cfg.radius as i64; 2], [1, 1], false);
        // Sentinel keypoints never reach the offset term.
        let mask = (dilated * labelled.view([p, k, 1, 1])).unsqueeze(-1);
        let pred = pred_offsets.permute([0, 2, 3, 1]).unsqueeze(0);
        let huber = (&pred * &mask).f_smooth_l1_loss(&(&target_offsets * &mask), Reduction::None, 1.0)?
            * channel_weight.unsqueeze(-1);
        let huber_per_pose = huber.mean_dim(&[1_i64, 2, 3, 4][..], false, Kind::Float);

        let n = num_people as f64;
        let heatmap_t = (bce_per_pose * &present).sum(Kind::Float) / n;
        let offset_t = (huber_per_pose * &present).sum(Kind::Float) / n;
        let total_t = (&heatmap_t * cfg.heatmap_weight + &offset_t * cfg.offset_weight)
            / (cfg.heatmap_weight + cfg.offset_weight);

        let heatmap = heatmap_t.double_value(&[]);
        let offset = offset_t.double_value(&[]);
        let total = total_t.double_value(&[]);
        debug!(num_people, heatmap, offset, total, "aggregated pose loss (tensor)");

        Ok((total_t, TensorLossOutput { total, heatmap, offset, num_people, binary_targets }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::ABSENT;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, Array5};

    const H: usize = 9;
    const W: usize = 9;

    struct Fixture {
        pred_heatmaps: Array3<f32>,
        target_heatmaps: Array4<f32>,
        target_keypoints: Array3<f32>,
        pred_offsets: Array4<f32>,
        target_offsets: Array5<f32>,
    }

    impl Fixture {
        fn new(poses: usize) -> Self {
            Fixture {
                pred_heatmaps: Array3::zeros((NUM_KEYPOINTS, H, W)),
                target_heatmaps: Array4::zeros((poses, NUM_KEYPOINTS, H, W)),
                target_keypoints: Array3::from_elem((poses, NUM_KEYPOINTS, 2), ABSENT),
                pred_offsets: Array4::zeros((NUM_KEYPOINTS, 2, H, W)),
                target_offsets: Array5::zeros((poses, NUM_KEYPOINTS, H, W, 2)),
            }
        }

        fn inputs(&self) -> LossInputs<'_> {
            LossInputs {
                pred_heatmaps: self.pred_heatmaps.view(),
                target_heatmaps: self.target_heatmaps.view(),
                target_keypoints: self.target_keypoints.view(),
                pred_offsets: self.pred_offsets.view(),
                target_offsets: self.target_offsets.view(),
            }
        }
    }

    fn unit_stride() -> LossAggregator {
        LossAggregator::new(LossConfig { output_stride: 1, ..LossConfig::default() }).unwrap()
    }

    #[test]
    fn bce_with_logits_matches_naive_form() {
        for &(x, z) in &[(0.3_f32, 1.0_f32), (-1.2, 0.0), (2.0, 0.5)] {
            let s = 1.0 / (1.0 + (-(x as f64)).exp());
            let naive = -(z as f64 * s.ln() + (1.0 - z as f64) * (1.0 - s).ln());
            assert_abs_diff_eq!(bce_with_logits(x, z), naive, epsilon = 1e-9);
        }
        assert!(bce_with_logits(1e4, 0.0).is_finite());
        assert!(bce_with_logits(-1e4, 1.0).is_finite());
    }

    #[test]
    fn smooth_l1_is_quadratic_then_linear() {
        assert_abs_diff_eq!(smooth_l1(0.5), 0.125);
        assert_abs_diff_eq!(smooth_l1(-3.0), 2.5);
        assert_abs_diff_eq!(smooth_l1(1.0), 0.5);
    }

    #[test]
    fn no_people_gives_zero_loss() {
        let fx = Fixture::new(15);
        let out = unit_stride().compute(fx.inputs()).unwrap();
        assert_eq!(out.num_people, 0);
        assert_eq!(out.total, 0.0);
        assert_eq!(out.heatmap, 0.0);
        assert_eq!(out.offset, 0.0);
        assert_eq!(out.binary_targets.dim(), (15, NUM_KEYPOINTS, H, W));
        assert_eq!(out.binary_targets.sum(), 0.0);
    }

    #[test]
    fn zero_logits_give_ln2_heatmap_loss() {
        let mut fx = Fixture::new(3);
        fx.target_keypoints[[0, 2, 0]] = 4.0;
        fx.target_keypoints[[0, 2, 1]] = 4.0;
        let out = unit_stride().compute(fx.inputs()).unwrap();

        assert_eq!(out.num_people, 1);
        assert_abs_diff_eq!(out.heatmap, std::f64::consts::LN_2, epsilon = 1e-9);
        // Empty raw heatmap => empty mask => no offset loss.
        assert_eq!(out.offset, 0.0);
        assert_abs_diff_eq!(out.total, 4.0 * std::f64::consts::LN_2 / 5.0, epsilon = 1e-9);
        assert_eq!(out.binary_targets.index_axis(Axis(0), 0).sum(), 29.0);
    }

    #[test]
    fn loss_is_averaged_per_person() {
        let mut one = Fixture::new(2);
        one.pred_heatmaps.fill(1.5);
        one.target_keypoints[[0, 0, 0]] = 3.0;
        one.target_keypoints[[0, 0, 1]] = 3.0;
        let single = unit_stride().compute(one.inputs()).unwrap();

        let mut two = Fixture::new(2);
        two.pred_heatmaps.fill(1.5);
        for p in 0..2 {
            two.target_keypoints[[p, 0, 0]] = 3.0;
            two.target_keypoints[[p, 0, 1]] = 3.0;
        }
        let double = unit_stride().compute(two.inputs()).unwrap();

        assert_eq!(double.num_people, 2);
        assert_abs_diff_eq!(single.heatmap, double.heatmap, epsilon = 1e-12);
    }

    #[test]
    fn loss_is_symmetric_in_pose_order() {
        let mut a = Fixture::new(2);
        a.pred_heatmaps.fill(-0.5);
        a.target_keypoints[[0, 1, 0]] = 2.0;
        a.target_keypoints[[0, 1, 1]] = 6.0;
        a.target_keypoints[[1, 7, 0]] = 5.0;
        a.target_keypoints[[1, 7, 1]] = 1.0;
        a.target_heatmaps[[0, 1, 6, 2]] = 1.0;
        a.target_heatmaps[[1, 7, 1, 5]] = 1.0;
        a.target_offsets.fill(0.75);
        a.target_offsets.index_axis_mut(Axis(0), 1).fill(-2.0);

        let mut b = Fixture::new(2);
        b.pred_heatmaps.fill(-0.5);
        for p in 0..2 {
            b.target_keypoints.index_axis_mut(Axis(0), p).assign(&a.target_keypoints.index_axis(Axis(0), 1 - p));
            b.target_heatmaps.index_axis_mut(Axis(0), p).assign(&a.target_heatmaps.index_axis(Axis(0), 1 - p));
            b.target_offsets.index_axis_mut(Axis(0), p).assign(&a.target_offsets.index_axis(Axis(0), 1 - p));
        }

        let la = unit_stride().compute(a.inputs()).unwrap();
        let lb = unit_stride().compute(b.inputs()).unwrap();
        assert_abs_diff_eq!(la.total, lb.total, epsilon = 1e-12);
        assert_abs_diff_eq!(la.offset, lb.offset, epsilon = 1e-12);
    }

    #[test]
    fn offset_loss_counts_masked_cells_only() {
        let agg = LossAggregator::new(LossConfig { radius: 0, output_stride: 1, ..LossConfig::default() }).unwrap();
        let mut fx = Fixture::new(1);
        fx.target_keypoints[[0, 3, 0]] = 4.0;
        fx.target_keypoints[[0, 3, 1]] = 5.0;
        fx.target_heatmaps[[0, 3, 5, 4]] = 1.0;
        fx.target_offsets[[0, 3, 5, 4, 0]] = 1.0;
        fx.target_offsets[[0, 3, 5, 4, 1]] = -2.0;
        fx.pred_offsets[[3, 0, 5, 4]] = 1.5; // |d| = 0.5
        fx.pred_offsets[[3, 1, 5, 4]] = 1.0; // |d| = 3.0

        let out = agg.compute(fx.inputs()).unwrap();
        let expected = (0.125 + 2.5) / (NUM_KEYPOINTS * H * W * 2) as f64;
        assert_abs_diff_eq!(out.offset, expected, epsilon = 1e-12);

        // Anything outside the mask is ignored.
        fx.pred_offsets[[3, 0, 0, 0]] = 100.0;
        fx.pred_offsets[[0, 1, 8, 8]] = -40.0;
        fx.target_offsets[[0, 5, 2, 2, 0]] = 17.0;
        let again = agg.compute(fx.inputs()).unwrap();
        assert_abs_diff_eq!(again.offset, expected, epsilon = 1e-12);
    }

    #[test]
    fn target_weight_drops_unlabelled_channels() {
        let agg = LossAggregator::new(LossConfig {
            use_target_weight: true,
            output_stride: 1,
            ..LossConfig::default()
        })
        .unwrap();
        let mut fx = Fixture::new(1);
        fx.target_keypoints[[0, 6, 0]] = 4.0;
        fx.target_keypoints[[0, 6, 1]] = 4.0;
        let out = agg.compute(fx.inputs()).unwrap();
        assert_abs_diff_eq!(out.heatmap, std::f64::consts::LN_2 / NUM_KEYPOINTS as f64, epsilon = 1e-9);
    }

    #[test]
    fn shape_mismatch_names_the_input() {
        let fx = Fixture::new(2);
        let bad_offsets = Array4::<f32>::zeros((NUM_KEYPOINTS, H, W, 2));
        let inputs = LossInputs { pred_offsets: bad_offsets.view(), ..fx.inputs() };
        match unit_stride().compute(inputs) {
            Err(TrainError::ShapeMismatch { stage, .. }) => assert_eq!(stage, "loss_pred_offsets"),
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn too_many_poses_is_rejected() {
        let fx = Fixture::new(16);
        assert!(matches!(
            unit_stride().compute(fx.inputs()),
            Err(TrainError::TooManyPoses { count: 16, max: 15 })
        ));
    }

    #[test]
    fn compute_from_keypoints_matches_prebuilt_offsets() {
        let agg = LossAggregator::new(LossConfig { output_stride: 2, ..LossConfig::default() }).unwrap();
        let mut fx = Fixture::new(2);
        fx.target_keypoints[[1, 4, 0]] = 6.0;
        fx.target_keypoints[[1, 4, 1]] = 10.0;
        fx.target_heatmaps[[1, 4, 5, 3]] = 1.0;
        fx.pred_offsets.fill(0.25);
        fx.target_offsets = OffsetMapBuilder::new(H, W, 2, 2).build(&fx.target_keypoints.view()).unwrap();

        let direct = agg.compute(fx.inputs()).unwrap();
        let built = agg
            .compute_from_keypoints(
                fx.pred_heatmaps.view(),
                fx.target_heatmaps.view(),
                fx.target_keypoints.view(),
                fx.pred_offsets.view(),
            )
            .unwrap();
        assert_abs_diff_eq!(direct.total, built.total, epsilon = 1e-12);
        assert!(built.offset > 0.0);
    }

    #[test]
    fn sentinel_keypoint_offsets_are_masked_out() {
        let mut fx = Fixture::new(1);
        fx.target_keypoints[[0, 0, 0]] = 2.0;
        fx.target_keypoints[[0, 0, 1]] = 2.0;
        // Keypoint 3 stays a sentinel but its raw heatmap channel is hot.
        fx.target_heatmaps[[0, 3, 4, 4]] = 1.0;
        fx.target_offsets.fill(-1.0);

        let out = unit_stride().compute(fx.inputs()).unwrap();
        assert_eq!(out.num_people, 1);
        assert_eq!(out.offset, 0.0);
    }

    #[test]
    fn zero_loss_weights_are_rejected() {
        let cfg = LossConfig { heatmap_weight: 0.0, offset_weight: 0.0, ..LossConfig::default() };
        assert!(matches!(LossAggregator::new(cfg), Err(TrainError::Config(_))));
    }
}
