//! Dense ground-truth offset fields.
//!
//! For every output cell `(row, col)` and every pose/keypoint slot the target
//! offset is the vector from the stride-scaled cell position to the labelled
//! keypoint:
//!
//! ```text
//! offset[p, k, row, col] = keypoint[p, k] − (col · stride, row · stride)      // [x, y]
//! ```
//!
//! Sentinel keypoints still produce a value here; the loss removes them
//! through its dilation mask.

use ndarray::{Array5, ArrayView3};

use crate::error::{TrainError, TrainResult};
use crate::pose::{ensure_pose_set_shape, ABSENT, NUM_KEYPOINTS};

#[cfg(feature = "tch-backend")]
use crate::context::ComputeContext;
#[cfg(feature = "tch-backend")]
use tch::{Kind, Tensor};

/// Builds `[max_num_poses, K, H, W, 2]` offset targets from a pose set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetMapBuilder {
    height: usize,
    width: usize,
    stride: usize,
    max_num_poses: usize,
}

impl OffsetMapBuilder {
    /// Builder for an `height × width` output grid with the given stride.
    pub fn new(height: usize, width: usize, stride: usize, max_num_poses: usize) -> Self {
        OffsetMapBuilder { height, width, stride, max_num_poses }
    }

    /// Output shape `[max_num_poses, K, H, W, 2]`.
    pub fn output_shape(&self) -> [usize; 5] {
        [self.max_num_poses, NUM_KEYPOINTS, self.height, self.width, 2]
    }

    /// Build the offset field for `ground_truth` `[P, K, 2]`, `P <= max_num_poses`.
    ///
    /// Slots beyond `P` are treated as sentinel poses.
    pub fn build(&self, ground_truth: &ArrayView3<'_, f32>) -> TrainResult<Array5<f32>> {
        ensure_pose_set_shape("offset_map", ground_truth)?;
        let num_poses = ground_truth.dim().0;
        if num_poses > self.max_num_poses {
            return Err(TrainError::TooManyPoses { count: num_poses, max: self.max_num_poses });
        }

        let stride = self.stride as f32;
        let field = Array5::from_shape_fn(self.output_shape(), |(p, k, row, col, c)| {
            let kp = if p < num_poses { ground_truth[[p, k, c]] } else { ABSENT };
            let cell = if c == 0 { col as f32 * stride } else { row as f32 * stride };
            kp - cell
        });
        Ok(field)
    }

    /// Tensor version of [`OffsetMapBuilder::build`].
    ///
    /// `ground_truth` is `[P, K, 2]` with `P <= max_num_poses`; the result is
    /// `[max_num_poses, K, H, W, 2]` on the context's device, computed by
    /// broadcasting the keypoints against a coordinate grid.
    #[cfg(feature = "tch-backend")]
    pub fn build_tensor(&self, ground_truth: &Tensor, ctx: &ComputeContext) -> TrainResult<Tensor> {
        let size = ground_truth.size();
        if size.len() != 3 || size[1] != NUM_KEYPOINTS as i64 || size[2] != 2 {
            return Err(TrainError::shape_mismatch(
                "offset_map",
                vec![self.max_num_poses, NUM_KEYPOINTS, 2],
                size.iter().map(|&d| d as usize).collect(),
            ));
        }
        let num_poses = size[0];
        let max_poses = self.max_num_poses as i64;
        if num_poses > max_poses {
            return Err(TrainError::TooManyPoses { count: num_poses as usize, max: self.max_num_poses });
        }

        let opts = ctx.float_options();
        let kps = ground_truth.to_device(ctx.device()).to_kind(Kind::Float);
        let kps = if num_poses < max_poses {
            let pad = Tensor::full([max_poses - num_poses, NUM_KEYPOINTS as i64, 2], ABSENT as f64, opts);
            Tensor::cat(&[kps, pad], 0)
        } else {
            kps
        };

        let (h, w) = (self.height as i64, self.width as i64);
        let stride = self.stride as f64;
        let xs = (Tensor::arange(w, opts) * stride).view([1, w]).expand([h, w], false);
        let ys = (Tensor::arange(h, opts) * stride).view([h, 1]).expand([h, w], false);
        let grid = Tensor::stack(&[xs, ys], -1); // [H, W, 2] as (x, y)

        Ok(kps.view([max_poses, NUM_KEYPOINTS as i64, 1, 1, 2]) - grid.view([1, 1, h, w, 2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn offset_is_zero_at_coincident_cell() {
        let mut gt = Array3::from_elem((1, NUM_KEYPOINTS, 2), ABSENT);
        // Keypoint at cell (row 3, col 5) with stride 8.
        gt[[0, 4, 0]] = 40.0;
        gt[[0, 4, 1]] = 24.0;
        let builder = OffsetMapBuilder::new(33, 33, 8, 15);
        let field = builder.build(&gt.view()).unwrap();

        assert_eq!(field.shape(), &builder.output_shape()[..]);
        assert_eq!(field.shape(), &[15, NUM_KEYPOINTS, 33, 33, 2]);
        assert_eq!(field[[0, 4, 3, 5, 0]], 0.0);
        assert_eq!(field[[0, 4, 3, 5, 1]], 0.0);
    }

    #[test]
    fn offset_points_from_cell_to_keypoint() {
        let mut gt = Array3::from_elem((2, NUM_KEYPOINTS, 2), ABSENT);
        gt[[1, 0, 0]] = 20.0;
        gt[[1, 0, 1]] = 10.0;
        let field = OffsetMapBuilder::new(4, 4, 8, 2).build(&gt.view()).unwrap();
        // Cell (row 2, col 1) sits at (x=8, y=16).
        assert_eq!(field[[1, 0, 2, 1, 0]], 12.0);
        assert_eq!(field[[1, 0, 2, 1, 1]], -6.0);
    }

    #[test]
    fn missing_slots_are_filled_as_sentinels() {
        let gt = Array3::from_elem((1, NUM_KEYPOINTS, 2), 5.0_f32);
        let field = OffsetMapBuilder::new(2, 2, 1, 3).build(&gt.view()).unwrap();
        assert_eq!(field[[2, 0, 0, 0, 0]], ABSENT);
        assert_eq!(field[[2, 0, 1, 1, 1]], ABSENT - 1.0);
    }

    #[test]
    fn too_many_poses_is_an_error() {
        let gt = Array3::from_elem((4, NUM_KEYPOINTS, 2), 5.0_f32);
        assert!(OffsetMapBuilder::new(2, 2, 1, 3).build(&gt.view()).is_err());
    }

    #[cfg(feature = "tch-backend")]
    #[test]
    fn tensor_build_matches_host_build() {
        let mut gt = Array3::from_elem((2, NUM_KEYPOINTS, 2), ABSENT);
        gt[[0, 1, 0]] = 17.0;
        gt[[0, 1, 1]] = 9.0;
        let builder = OffsetMapBuilder::new(5, 6, 4, 3);
        let host = builder.build(&gt.view()).unwrap();

        let ctx = ComputeContext::cpu();
        let t = Tensor::from_slice(gt.as_slice().unwrap()).view([2, NUM_KEYPOINTS as i64, 2]);
        let dev = builder.build_tensor(&t, &ctx).unwrap();
        assert_eq!(dev.size(), vec![3, NUM_KEYPOINTS as i64, 5, 6, 2]);
        let v = dev.double_value(&[0, 1, 2, 3, 0]);
        assert_eq!(v as f32, host[[0, 1, 2, 3, 0]]);
        let v = dev.double_value(&[0, 1, 2, 3, 1]);
        assert_eq!(v as f32, host[[0, 1, 2, 3, 1]]);
    }
}
