//! Optimal one-to-one assignment of predicted poses to ground-truth poses.
//!
//! The cost between predicted pose `i` and ground-truth pose `j` is the
//! Euclidean norm of the difference of their flattened `[K, 2]` keypoint
//! arrays (a whole-pose distance). The assignment minimising the total cost
//! is found with the Kuhn-Munkres (Hungarian) algorithm.

use ndarray::{Array2, ArrayView3, Zip};
use tracing::trace;

use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Result of matching predictions to ground truth for one image.
///
/// Each `(pred_idx, gt_idx)` pair uses every index at most once and pairs
/// are sorted by `pred_idx`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// Matched `(pred_idx, gt_idx)` pairs.
    pub pairs: Vec<(usize, usize)>,
    /// Sum of the cost-matrix entries of all matched pairs.
    pub total_cost: f64,
}

impl Assignment {
    /// Number of matched pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// `true` when nothing was matched.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate over `(pred_idx, gt_idx)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pairs.iter().copied()
    }

    /// Matched prediction indices, in pair order.
    pub fn pred_indices(&self) -> Vec<usize> {
        self.pairs.iter().map(|&(p, _)| p).collect()
    }

    /// Matched ground-truth indices, in pair order.
    pub fn gt_indices(&self) -> Vec<usize> {
        self.pairs.iter().map(|&(_, g)| g).collect()
    }
}

// ---------------------------------------------------------------------------
// Cost matrix
// ---------------------------------------------------------------------------

/// Whole-pose Euclidean cost matrix `[N_pred, N_gt]`.
///
/// # Errors
///
/// [`TrainError::ShapeMismatch`] when the two sets disagree on the per-pose
/// keypoint layout, and [`TrainError::NonFinite`] when a pose pair yields a
/// NaN or infinite distance.
pub fn pose_cost_matrix(
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
) -> TrainResult<Array2<f64>> {
    let (n_pred, kp, cp) = preds.dim();
    let (n_gt, kg, cg) = gts.dim();
    if (kp, cp) != (kg, cg) {
        return Err(TrainError::shape_mismatch("pose_cost_matrix", vec![n_pred, kg, cg], vec![n_pred, kp, cp]));
    }

    let mut cost = Array2::zeros((n_pred, n_gt));
    for (i, pred) in preds.outer_iter().enumerate() {
        for (j, gt) in gts.outer_iter().enumerate() {
            let mut sq = 0.0_f64;
            Zip::from(&pred).and(&gt).for_each(|&p, &g| {
                let d = (p - g) as f64;
                sq += d * d;
            });
            let d = sq.sqrt();
            if !d.is_finite() {
                return Err(TrainError::NonFinite { stage: "pose_cost_matrix" });
            }
            cost[[i, j]] = d;
        }
    }
    Ok(cost)
}

// ---------------------------------------------------------------------------
// Hungarian algorithm (min-cost bipartite matching)
// ---------------------------------------------------------------------------

/// Solve the optimal linear assignment problem for `cost`.
///
/// Returns the minimum-cost matching as `(row, col)` pairs sorted by row.
/// For non-square matrices exactly `min(rows, cols)` pairs are returned and
/// the shorter side is fully matched.
///
/// # Algorithm
///
/// Classical O(n²·m) potential-based Kuhn-Munkres:
///
/// 1. If there are more rows than columns the problem is solved on the
///    transpose, so that every row can be assigned.
/// 2. Each row is inserted in turn by growing a shortest augmenting path with
///    Dijkstra-style potential relaxation.
/// 3. Ties pick the lowest column index (row-major traversal).
///
/// Non-finite entries are treated as a cost above any assignment of finite
/// entries, so the solver always terminates.
pub fn hungarian_assignment(cost: &Array2<f64>) -> Vec<(usize, usize)> {
    let (n_rows, n_cols) = cost.dim();
    if n_rows == 0 || n_cols == 0 {
        return vec![];
    }
    let finite;
    let cost = if cost.iter().all(|c| c.is_finite()) {
        cost
    } else {
        finite = finite_costs(cost);
        &finite
    };
    if n_rows > n_cols {
        let transposed = cost.t().to_owned();
        let mut pairs: Vec<(usize, usize)> = solve_rows_le_cols(&transposed)
            .into_iter()
            .map(|(c, r)| (r, c))
            .collect();
        pairs.sort_unstable_by_key(|&(r, _)| r);
        return pairs;
    }
    solve_rows_le_cols(cost)
}

/// Replace NaN and infinite entries with a finite penalty larger than the
/// total of any assignment that avoids them.
fn finite_costs(cost: &Array2<f64>) -> Array2<f64> {
    let hi = cost.iter().filter(|c| c.is_finite()).fold(0.0_f64, |acc, c| acc.max(c.abs()));
    let k = cost.nrows().min(cost.ncols()) as f64;
    let penalty = ((hi + 1.0) * (2.0 * k + 1.0)).min(f64::MAX / 16.0);
    cost.mapv(|c| if c.is_finite() { c } else { penalty })
}

/// Kuhn-Munkres for `n <= m`; every row ends up assigned.
fn solve_rows_le_cols(c: &Array2<f64>) -> Vec<(usize, usize)> {
    let (n, m) = c.dim();
    let inf = f64::INFINITY;

    // u[i]: potential for row i (1-indexed; index 0 unused).
    // v[j]: potential for column j (1-indexed; index 0 = dummy source).
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; m + 1];
    // p[j]: 1-indexed row assigned to column j (0 = unassigned).
    let mut p = vec![0_usize; m + 1];
    // way[j]: predecessor column of j in the current augmenting path.
    let mut way = vec![0_usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0_usize;
        let mut min_val = vec![inf; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0_usize;

            for j in 1..=m {
                if !used[j] {
                    let val = c[[i0 - 1, j - 1]] - u[i0] - v[j];
                    if val < min_val[j] {
                        min_val[j] = val;
                        way[j] = j0;
                    }
                    if min_val[j] < delta {
                        delta = min_val[j];
                        j1 = j;
                    }
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Augment along the path back to the dummy column.
        loop {
            let prev = way[j0];
            p[j0] = p[prev];
            j0 = prev;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable_by_key(|&(r, _)| r);
    pairs
}

/// Match predicted poses `[N_pred, K, 2]` to ground-truth poses `[N_gt, K, 2]`.
///
/// Either side being empty yields an empty [`Assignment`].
pub fn match_poses(
    preds: &ArrayView3<'_, f32>,
    gts: &ArrayView3<'_, f32>,
) -> TrainResult<Assignment> {
    let cost = pose_cost_matrix(preds, gts)?;
    let pairs = hungarian_assignment(&cost);
    let total_cost = pairs.iter().map(|&(i, j)| cost[[i, j]]).sum();
    trace!(n_pred = preds.dim().0, n_gt = gts.dim().0, matched = pairs.len(), total_cost, "matched poses");
    Ok(Assignment { pairs, total_cost })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
