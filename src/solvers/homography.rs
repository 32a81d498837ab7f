//! Homography solvers: 4-point minimal via Gaussian elimination and a
//! weighted least-squares non-minimal fit.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::solvers::{MinimalSolver, NonMinimalSolver};
use crate::types::{Model, PointSet};
use crate::utils::gauss_elimination;

/// 4-point minimal solver fixing `h33 = 1`, solved by Gaussian elimination
/// of the inhomogeneous 8x8 system.
#[derive(Clone)]
pub struct HomographyMinimalSolver {
    points: Arc<PointSet>,
}

impl HomographyMinimalSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

fn model_from_h8(h: &DVector<f64>) -> Option<Model> {
    if h.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut model = Model::zeros(3, 3);
    for r in 0..3 {
        for c in 0..3 {
            if r == 2 && c == 2 {
                model[(r, c)] = 1.0;
            } else {
                model[(r, c)] = h[r * 3 + c];
            }
        }
    }
    Some(model)
}

impl MinimalSolver for HomographyMinimalSolver {
    fn sample_size(&self) -> usize {
        4
    }

    fn max_solutions(&self) -> usize {
        1
    }

    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        let mut augmented = DMatrix::<f64>::zeros(8, 9);
        for (i, &idx) in sample.iter().take(4).enumerate() {
            let row = self.points.row(idx);
            let (x1, y1, x2, y2) = (row[0], row[1], row[2], row[3]);

            augmented[(2 * i, 0)] = -x1;
            augmented[(2 * i, 1)] = -y1;
            augmented[(2 * i, 2)] = -1.0;
            augmented[(2 * i, 6)] = x2 * x1;
            augmented[(2 * i, 7)] = x2 * y1;
            augmented[(2 * i, 8)] = -x2;

            augmented[(2 * i + 1, 3)] = -x1;
            augmented[(2 * i + 1, 4)] = -y1;
            augmented[(2 * i + 1, 5)] = -1.0;
            augmented[(2 * i + 1, 6)] = y2 * x1;
            augmented[(2 * i + 1, 7)] = y2 * y1;
            augmented[(2 * i + 1, 8)] = -y2;
        }

        let mut h = DVector::<f64>::zeros(8);
        if !gauss_elimination(&mut augmented, &mut h) {
            return 0;
        }
        if let Some(model) = model_from_h8(&h) {
            models.push(model);
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn MinimalSolver> {
        Box::new(self.clone())
    }
}

/// Weighted least-squares fit of `h33 = 1` homographies over any index set,
/// solved with a column-pivoted QR factorization.
#[derive(Clone)]
pub struct HomographyNonMinimalSolver {
    points: Arc<PointSet>,
}

impl HomographyNonMinimalSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl NonMinimalSolver for HomographyNonMinimalSolver {
    fn min_sample_size(&self) -> usize {
        4
    }

    fn estimate(
        &self,
        sample: &[usize],
        weights: Option<&[f64]>,
        models: &mut Vec<Model>,
    ) -> usize {
        let n = sample.len();
        let mut coefficients = DMatrix::<f64>::zeros(2 * n, 8);
        let mut rhs = DVector::<f64>::zeros(2 * n);

        for (i, &idx) in sample.iter().enumerate() {
            let row = self.points.row(idx);
            let (x1, y1, x2, y2) = (row[0], row[1], row[2], row[3]);
            let weight = weights.map_or(1.0, |w| w[idx]);

            let minus_wx1 = -weight * x1;
            let minus_wy1 = -weight * y1;
            let wx2 = weight * x2;
            let wy2 = weight * y2;

            coefficients[(2 * i, 0)] = minus_wx1;
            coefficients[(2 * i, 1)] = minus_wy1;
            coefficients[(2 * i, 2)] = -weight;
            coefficients[(2 * i, 6)] = wx2 * x1;
            coefficients[(2 * i, 7)] = wx2 * y1;
            rhs[2 * i] = -wx2;

            coefficients[(2 * i + 1, 3)] = minus_wx1;
            coefficients[(2 * i + 1, 4)] = minus_wy1;
            coefficients[(2 * i + 1, 5)] = -weight;
            coefficients[(2 * i + 1, 6)] = wy2 * x1;
            coefficients[(2 * i + 1, 7)] = wy2 * y1;
            rhs[2 * i + 1] = -wy2;
        }

        let qr = coefficients.col_piv_qr();
        let Some(h) = qr.solve(&rhs) else {
            return 0;
        };
        if let Some(model) = model_from_h8(&h) {
            models.push(model);
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn NonMinimalSolver> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix3, Vector3};

    fn apply(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
        let q = h * Vector3::new(x, y, 1.0);
        (q.x / q.z, q.y / q.z)
    }

    fn points_under(h: &Matrix3<f64>, coords: &[(f64, f64)]) -> Arc<PointSet> {
        let mut data = Vec::new();
        for &(x, y) in coords {
            let (xp, yp) = apply(h, x, y);
            data.extend_from_slice(&[x, y, xp, yp]);
        }
        PointSet::new(data, 4).into_shared()
    }

    #[test]
    fn four_point_solver_recovers_a_projective_map() {
        let h_true = Matrix3::new(1.1, 0.02, 4.0, -0.01, 0.95, -2.0, 1e-4, -2e-4, 1.0);
        let pts = points_under(&h_true, &[(0.0, 0.0), (100.0, 0.0), (0.0, 80.0), (100.0, 80.0)]);

        let solver = HomographyMinimalSolver::new(pts);
        let mut models = Vec::new();
        assert_eq!(solver.estimate(&[0, 1, 2, 3], &mut models), 1);

        let h = &models[0];
        for r in 0..3 {
            for c in 0..3 {
                assert_abs_diff_eq!(h[(r, c)], h_true[(r, c)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn non_minimal_fit_matches_on_exact_data() {
        let h_true = Matrix3::new(0.9, -0.05, 10.0, 0.04, 1.05, -5.0, 2e-4, 1e-4, 1.0);
        let coords: Vec<(f64, f64)> = (0..12)
            .map(|i| ((i % 4) as f64 * 30.0, (i / 4) as f64 * 25.0))
            .collect();
        let pts = points_under(&h_true, &coords);

        let solver = HomographyNonMinimalSolver::new(pts);
        let sample: Vec<usize> = (0..12).collect();
        let mut models = Vec::new();
        assert_eq!(solver.estimate(&sample, None, &mut models), 1);

        let h = &models[0];
        for r in 0..3 {
            for c in 0..3 {
                assert_abs_diff_eq!(h[(r, c)], h_true[(r, c)], epsilon = 1e-6);
            }
        }
    }
}
