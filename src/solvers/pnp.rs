//! Absolute-pose solvers producing 3x4 projection matrices.
//!
//! P3P works on calibrated rays: the law of cosines ties the three camera
//! distances together, eliminating two of them leaves a quartic in the
//! remaining distance ratio, and each admissible root yields a pose by
//! three-point alignment. P6P and the non-minimal fit are direct linear
//! transforms on the pixel coordinates.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::solvers::{MinimalSolver, NonMinimalSolver};
use crate::types::{Model, PointSet};
use crate::utils::real_roots_bracketed;

/// Compose `K [R | t]` into an opaque 3x4 model.
fn pose_to_model(k: &Matrix3<f64>, r: &Matrix3<f64>, t: &Vector3<f64>) -> Model {
    let mut model = Model::zeros(3, 4);
    let kr = k * r;
    let kt = k * t;
    for row in 0..3 {
        for col in 0..3 {
            model[(row, col)] = kr[(row, col)];
        }
        model[(row, 3)] = kt[row];
    }
    model
}

/// Rigid alignment of three world points onto three camera-frame points:
/// Kabsch on the centered point sets, with the reflection case repaired.
fn align_three_points(
    world: &[Vector3<f64>; 3],
    camera: &[Vector3<f64>; 3],
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let wc = (world[0] + world[1] + world[2]) / 3.0;
    let cc = (camera[0] + camera[1] + camera[2]) / 3.0;

    let mut covariance = Matrix3::zeros();
    for i in 0..3 {
        covariance += (camera[i] - cc) * (world[i] - wc).transpose();
    }

    let svd = covariance.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return None;
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    let t = cc - r * wc;
    Some((r, t))
}

/// P3P minimal solver on calibrated correspondences.
///
/// Rows of `calibrated` hold `[xn, yn, X, Y, Z]` with normalized image
/// coordinates; the composed models are `K [R | t]`, so residuals stay in
/// pixels.
#[derive(Clone)]
pub struct P3pSolver {
    calibrated: Arc<PointSet>,
    k: Matrix3<f64>,
}

impl P3pSolver {
    pub fn new(calibrated: Arc<PointSet>, k: Matrix3<f64>) -> Self {
        Self { calibrated, k }
    }
}

impl MinimalSolver for P3pSolver {
    fn sample_size(&self) -> usize {
        3
    }

    fn max_solutions(&self) -> usize {
        4
    }

    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        let mut rays = [Vector3::zeros(); 3];
        let mut world = [Vector3::zeros(); 3];
        for i in 0..3 {
            let row = self.calibrated.row(sample[i]);
            rays[i] = Vector3::new(row[0], row[1], 1.0).normalize();
            world[i] = Vector3::new(row[2], row[3], row[4]);
        }

        // Squared world distances and ray angle cosines.
        let a2 = (world[1] - world[2]).norm_squared();
        let b2 = (world[0] - world[2]).norm_squared();
        let c2 = (world[0] - world[1]).norm_squared();
        if a2 < 1e-14 || b2 < 1e-14 || c2 < 1e-14 {
            return 0;
        }
        let cos_a = rays[1].dot(&rays[2]);
        let cos_b = rays[0].dot(&rays[2]);
        let cos_g = rays[0].dot(&rays[1]);

        // With u = s2/s1, v = s3/s1, the law of cosines for the three point
        // pairs reads
        //   A (1 + v^2 - 2 v cos_b) = u^2 + v^2 - 2 u v cos_a
        //   B (1 + v^2 - 2 v cos_b) = 1 + u^2 - 2 u cos_g
        // with A = a^2/b^2, B = c^2/b^2. Solving the difference for u and
        // substituting back eliminates u into a quartic in v.
        let aa = a2 / b2;
        let bb = c2 / b2;

        // q(v) = 1 + v^2 - 2 v cos_b as coefficients.
        let q = [1.0, -2.0 * cos_b, 1.0];
        // n(v) = (A - B) q(v) + 1 - v^2; u(v) = n(v) / (2 (cos_g - v cos_a)).
        let n = [
            (aa - bb) * q[0] + 1.0,
            (aa - bb) * q[1],
            (aa - bb) * q[2] - 1.0,
        ];
        let d = [2.0 * cos_g, -2.0 * cos_a];

        // Substituting u into the second equation and clearing denominators:
        // n^2 - 2 cos_g n d + (1 - B q) d^2 = 0, a quartic in v.
        let n2 = [
            n[0] * n[0],
            2.0 * n[0] * n[1],
            n[1] * n[1] + 2.0 * n[0] * n[2],
            2.0 * n[1] * n[2],
            n[2] * n[2],
        ];
        let nd = [
            n[0] * d[0],
            n[1] * d[0] + n[0] * d[1],
            n[2] * d[0] + n[1] * d[1],
            n[2] * d[1],
            0.0,
        ];
        let one_minus_bq = [1.0 - bb * q[0], -bb * q[1], -bb * q[2]];
        let d2 = [d[0] * d[0], 2.0 * d[0] * d[1], d[1] * d[1]];
        let mut tail = [0.0f64; 5];
        for (i, &p) in one_minus_bq.iter().enumerate() {
            for (j, &e) in d2.iter().enumerate() {
                tail[i + j] += p * e;
            }
        }

        let mut quartic = [0.0f64; 5];
        for i in 0..5 {
            quartic[i] = n2[i] - 2.0 * cos_g * nd[i] + tail[i];
        }

        let mut roots = [0.0f64; 4];
        let n_roots = real_roots_bracketed(&quartic, &mut roots);

        for &v in roots.iter().take(n_roots) {
            if v <= 0.0 {
                continue;
            }
            let denom = d[0] + d[1] * v;
            if denom.abs() < 1e-12 {
                continue;
            }
            let u = (n[0] + n[1] * v + n[2] * v * v) / denom;
            if u <= 0.0 {
                continue;
            }

            let q_v = q[0] + q[1] * v + q[2] * v * v;
            if q_v <= 1e-14 {
                continue;
            }
            let s1 = (b2 / q_v).sqrt();
            let distances = [s1, u * s1, v * s1];

            let camera = [
                rays[0] * distances[0],
                rays[1] * distances[1],
                rays[2] * distances[2],
            ];
            let Some((r, t)) = align_three_points(&world, &camera) else {
                continue;
            };
            models.push(pose_to_model(&self.k, &r, &t));
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn MinimalSolver> {
        Box::new(self.clone())
    }
}

/// Direct linear transform over the homogeneous 12-parameter projection.
fn dlt_fit(points: &PointSet, sample: &[usize], weights: Option<&[f64]>) -> Option<Model> {
    let n = sample.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, &idx) in sample.iter().enumerate() {
        let row = points.row(idx);
        let (u, v, x, y, z) = (row[0], row[1], row[2], row[3], row[4]);
        let w = weights.map_or(1.0, |ws| ws[idx]);

        a[(2 * i, 0)] = w * x;
        a[(2 * i, 1)] = w * y;
        a[(2 * i, 2)] = w * z;
        a[(2 * i, 3)] = w;
        a[(2 * i, 8)] = -w * u * x;
        a[(2 * i, 9)] = -w * u * y;
        a[(2 * i, 10)] = -w * u * z;
        a[(2 * i, 11)] = -w * u;

        a[(2 * i + 1, 4)] = w * x;
        a[(2 * i + 1, 5)] = w * y;
        a[(2 * i + 1, 6)] = w * z;
        a[(2 * i + 1, 7)] = w;
        a[(2 * i + 1, 8)] = -w * v * x;
        a[(2 * i + 1, 9)] = -w * v * y;
        a[(2 * i + 1, 10)] = -w * v * z;
        a[(2 * i + 1, 11)] = -w * v;
    }

    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t?;

    let mut model = Model::zeros(3, 4);
    for r in 0..3 {
        for c in 0..4 {
            model[(r, c)] = v_t[(11, r * 4 + c)];
        }
    }
    if model.iter().any(|v| !v.is_finite()) {
        return None;
    }

    // Orient the projection so the first point lands in front of the camera.
    let row = points.row(sample[0]);
    let z = model[(2, 0)] * row[2] + model[(2, 1)] * row[3] + model[(2, 2)] * row[4] + model[(2, 3)];
    if z < 0.0 {
        model.neg_mut();
    }
    Some(model)
}

/// Six-point direct linear transform minimal solver.
#[derive(Clone)]
pub struct P6pSolver {
    points: Arc<PointSet>,
}

impl P6pSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl MinimalSolver for P6pSolver {
    fn sample_size(&self) -> usize {
        6
    }

    fn max_solutions(&self) -> usize {
        1
    }

    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        if let Some(model) = dlt_fit(&self.points, sample, None) {
            models.push(model);
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn MinimalSolver> {
        Box::new(self.clone())
    }
}

/// Weighted DLT refit over any index set of at least six correspondences.
#[derive(Clone)]
pub struct PnpNonMinimalSolver {
    points: Arc<PointSet>,
}

impl PnpNonMinimalSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl NonMinimalSolver for PnpNonMinimalSolver {
    fn min_sample_size(&self) -> usize {
        6
    }

    fn estimate(
        &self,
        sample: &[usize],
        weights: Option<&[f64]>,
        models: &mut Vec<Model>,
    ) -> usize {
        if let Some(model) = dlt_fit(&self.points, sample, weights) {
            models.push(model);
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn NonMinimalSolver> {
        Box::new(self.clone())
    }
}
