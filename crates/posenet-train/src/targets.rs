//! Classification targets and regions of interest for the heatmap/offset loss.
//!
//! - [`binary_disk_heatmap`]: per keypoint channel, a disk of ones around the
//!   labelled keypoint, zeros elsewhere.
//! - [`dilation_mask`]: threshold a raw ground-truth heatmap and dilate it by
//!   a square max-pool window, marking the region where offsets are supervised.

use ndarray::{Array3, ArrayView2, ArrayView3, Axis};

use crate::pose::is_sentinel;

/// Disk-shaped binary target `[K, H, W]` for one pose.
///
/// `keypoints` is `[K, 2]` in `[x, y]` image pixels. Each labelled keypoint is
/// mapped to the heatmap grid by dividing by `stride` and truncating; every
/// cell within Euclidean distance `radius` of that cell is set to `1.0`.
/// Sentinel keypoints leave their channel all-zero.
pub fn binary_disk_heatmap(
    keypoints: &ArrayView2<'_, f32>,
    height: usize,
    width: usize,
    radius: usize,
    stride: usize,
) -> Array3<f32> {
    let num_kp = keypoints.nrows();
    let mut target = Array3::zeros((num_kp, height, width));
    let stride = stride.max(1) as f32;
    let r = radius as i64;

    for k in 0..num_kp {
        let (x, y) = (keypoints[[k, 0]], keypoints[[k, 1]]);
        if is_sentinel(x, y) {
            continue;
        }
        let cx = (x / stride) as i64;
        let cy = (y / stride) as i64;

        let y_min = (cy - r).max(0);
        let y_max = (cy + r + 1).min(height as i64);
        let x_min = (cx - r).max(0);
        let x_max = (cx + r + 1).min(width as i64);

        for row in y_min..y_max {
            for col in x_min..x_max {
                let (dy, dx) = ((row - cy) as f32, (col - cx) as f32);
                if (dx * dx + dy * dy).sqrt() <= radius as f32 {
                    target[[k, row as usize, col as usize]] = 1.0;
                }
            }
        }
    }
    target
}

/// Binary region-of-interest mask `[K, H, W]` from a raw heatmap `[K, H, W]`.
///
/// Cells strictly above `threshold` are marked, then dilated with a
/// `(2·radius + 1)²` max-pool window (stride 1, output the same size).
pub fn dilation_mask(raw_heatmap: &ArrayView3<'_, f32>, threshold: f32, radius: usize) -> Array3<f32> {
    let (num_kp, height, width) = raw_heatmap.dim();
    let seeds = raw_heatmap.mapv(|v| if v > threshold { 1.0_f32 } else { 0.0 });
    let mut mask = Array3::zeros((num_kp, height, width));

    for (k, channel) in seeds.axis_iter(Axis(0)).enumerate() {
        for row in 0..height {
            for col in 0..width {
                if channel[[row, col]] == 0.0 {
                    continue;
                }
                let r0 = row.saturating_sub(radius);
                let r1 = (row + radius + 1).min(height);
                let c0 = col.saturating_sub(radius);
                let c1 = (col + radius + 1).min(width);
                mask.slice_mut(ndarray::s![k, r0..r1, c0..c1]).fill(1.0);
            }
        }
    }
    mask
}
