//! Fundamental matrix solvers: the 7-point minimal solver (null space plus
//! cubic determinant constraint), an exact 8-point minimal solver, and the
//! Hartley-normalized weighted 8-point non-minimal fit.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3};

use crate::degeneracy::recover_rank_two;
use crate::solvers::{MinimalSolver, NonMinimalSolver};
use crate::types::{mat3_to_model, Model, PointSet};
use crate::utils::solve_cubic_real;

/// Row of the epipolar constraint matrix for one correspondence, in
/// row-major order of F.
#[inline]
fn epipolar_row(row: &[f64]) -> [f64; 9] {
    let (x1, y1, x2, y2) = (row[0], row[1], row[2], row[3]);
    [
        x2 * x1,
        x2 * y1,
        x2,
        y2 * x1,
        y2 * y1,
        y2,
        x1,
        y1,
        1.0,
    ]
}

/// 7-point minimal solver. The null space of the 7x9 constraint matrix is
/// two-dimensional; `det(lambda F1 + F2) = 0` restricts lambda to the roots
/// of a cubic, giving up to three fundamental matrices.
#[derive(Clone)]
pub struct FundamentalMinimalSolver7pt {
    points: Arc<PointSet>,
}

impl FundamentalMinimalSolver7pt {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl MinimalSolver for FundamentalMinimalSolver7pt {
    fn sample_size(&self) -> usize {
        7
    }

    fn max_solutions(&self) -> usize {
        3
    }

    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        let mut coefficients = DMatrix::<f64>::zeros(7, 9);
        for (i, &idx) in sample.iter().take(7).enumerate() {
            let row = epipolar_row(self.points.row(idx));
            for (j, v) in row.iter().enumerate() {
                coefficients[(i, j)] = *v;
            }
        }

        // Null space via the 9x9 normal matrix; the thin factorization of
        // the 7x9 system would not expose the two null directions.
        let ata = coefficients.transpose() * &coefficients;
        let svd = ata.svd(false, true);
        let Some(v_t) = svd.v_t else {
            return 0;
        };

        // The two right singular vectors of the smallest singular values
        // span the null space.
        let f1: Vec<f64> = (0..9).map(|j| v_t[(7, j)]).collect();
        let f2: Vec<f64> = (0..9).map(|j| v_t[(8, j)]).collect();

        // det(lambda f1 + f2) expanded as a cubic in lambda.
        let det3 = |a: &[f64], b: &[f64], c: &[f64]| -> f64 {
            // Determinant of the matrix whose rows are taken from a, b, c.
            a[0] * (b[4] * c[8] - b[5] * c[7]) - a[1] * (b[3] * c[8] - b[5] * c[6])
                + a[2] * (b[3] * c[7] - b[4] * c[6])
        };
        // Multilinearity of the determinant in its rows: expand over all
        // row choices from f1 (weight lambda) and f2 (weight 1).
        let mut c = [0.0f64; 4];
        for mask in 0..8u32 {
            let rows: Vec<&[f64]> = (0..3)
                .map(|r| {
                    if mask & (1 << r) != 0 {
                        &f1[..]
                    } else {
                        &f2[..]
                    }
                })
                .collect();
            let degree = mask.count_ones() as usize;
            c[degree] += det3(rows[0], rows[1], rows[2]);
        }

        if c[3].abs() < 1e-10 {
            return 0;
        }
        let mut roots = [0.0f64; 3];
        let n_roots = solve_cubic_real(c[2] / c[3], c[1] / c[3], c[0] / c[3], &mut roots);

        for &lambda in roots.iter().take(n_roots) {
            let mut f = Matrix3::zeros();
            for r in 0..3 {
                for col in 0..3 {
                    f[(r, col)] = lambda * f1[r * 3 + col] + f2[r * 3 + col];
                }
            }
            let norm = f.norm();
            if norm < 1e-10 || f.iter().any(|v| !v.is_finite()) {
                continue;
            }
            models.push(mat3_to_model(&(f / norm)));
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn MinimalSolver> {
        Box::new(self.clone())
    }
}

/// Hartley normalization of a sample: similarity transforms that center the
/// points of each image and scale their mean distance to sqrt(2).
fn normalize_sample(
    points: &PointSet,
    sample: &[usize],
) -> Option<(DMatrix<f64>, Matrix3<f64>, Matrix3<f64>)> {
    let n = sample.len();
    if n == 0 {
        return None;
    }

    let (mut cx1, mut cy1, mut cx2, mut cy2) = (0.0, 0.0, 0.0, 0.0);
    for &idx in sample {
        let row = points.row(idx);
        cx1 += row[0];
        cy1 += row[1];
        cx2 += row[2];
        cy2 += row[3];
    }
    cx1 /= n as f64;
    cy1 /= n as f64;
    cx2 /= n as f64;
    cy2 /= n as f64;

    let (mut d1, mut d2) = (0.0, 0.0);
    for &idx in sample {
        let row = points.row(idx);
        d1 += ((row[0] - cx1).powi(2) + (row[1] - cy1).powi(2)).sqrt();
        d2 += ((row[2] - cx2).powi(2) + (row[3] - cy2).powi(2)).sqrt();
    }
    d1 /= n as f64;
    d2 /= n as f64;
    if d1 < 1e-10 || d2 < 1e-10 {
        return None;
    }

    let s1 = std::f64::consts::SQRT_2 / d1;
    let s2 = std::f64::consts::SQRT_2 / d2;
    let t1 = Matrix3::new(s1, 0.0, -s1 * cx1, 0.0, s1, -s1 * cy1, 0.0, 0.0, 1.0);
    let t2 = Matrix3::new(s2, 0.0, -s2 * cx2, 0.0, s2, -s2 * cy2, 0.0, 0.0, 1.0);

    let mut normalized = DMatrix::<f64>::zeros(n, 4);
    for (i, &idx) in sample.iter().enumerate() {
        let row = points.row(idx);
        normalized[(i, 0)] = (row[0] - cx1) * s1;
        normalized[(i, 1)] = (row[1] - cy1) * s1;
        normalized[(i, 2)] = (row[2] - cx2) * s2;
        normalized[(i, 3)] = (row[3] - cy2) * s2;
    }
    Some((normalized, t1, t2))
}

/// Normalized 8-point fit over any index set. Solves `A f = 0` through the
/// SVD of `A^T A`, denormalizes and enforces the rank-2 constraint.
pub(crate) fn eight_point_fit(
    points: &PointSet,
    sample: &[usize],
    weights: Option<&[f64]>,
) -> Option<Model> {
    let (normalized, t1, t2) = normalize_sample(points, sample)?;
    let n = sample.len();

    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (i, &idx) in sample.iter().enumerate() {
        let row = [
            normalized[(i, 0)],
            normalized[(i, 1)],
            normalized[(i, 2)],
            normalized[(i, 3)],
        ];
        let coeffs = epipolar_row(&row);
        let weight = weights.map_or(1.0, |w| w[idx]);
        for (j, v) in coeffs.iter().enumerate() {
            a[(i, j)] = weight * v;
        }
    }

    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t?;

    let mut f_norm = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            f_norm[(r, c)] = v_t[(8, r * 3 + c)];
        }
    }
    if f_norm.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let f = t2.transpose() * f_norm * t1;
    let mut model = mat3_to_model(&f);
    recover_rank_two(&mut model);
    Some(model)
}

/// Exact 8-point minimal solver.
#[derive(Clone)]
pub struct FundamentalMinimalSolver8pt {
    points: Arc<PointSet>,
}

impl FundamentalMinimalSolver8pt {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl MinimalSolver for FundamentalMinimalSolver8pt {
    fn sample_size(&self) -> usize {
        8
    }

    fn max_solutions(&self) -> usize {
        1
    }

    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        if let Some(model) = eight_point_fit(&self.points, sample, None) {
            models.push(model);
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn MinimalSolver> {
        Box::new(self.clone())
    }
}

/// Weighted normalized 8-point non-minimal fit.
#[derive(Clone)]
pub struct FundamentalNonMinimalSolver {
    points: Arc<PointSet>,
}

impl FundamentalNonMinimalSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl NonMinimalSolver for FundamentalNonMinimalSolver {
    fn min_sample_size(&self) -> usize {
        8
    }

    fn estimate(
        &self,
        sample: &[usize],
        weights: Option<&[f64]>,
        models: &mut Vec<Model>,
    ) -> usize {
        if let Some(model) = eight_point_fit(&self.points, sample, weights) {
            models.push(model);
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn NonMinimalSolver> {
        Box::new(self.clone())
    }
}
