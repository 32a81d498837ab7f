//! Per-point residual metrics.
//!
//! Each metric caches the decomposed model on [`Residual::set_model`] and is
//! afterwards a pure function of the point index and the immutable
//! [`PointSet`]. Metrics are cloneable because the quality and the verifier
//! each hold their own model cache.

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix3x4, Vector3};

use crate::types::{as_mat3, Model, PointSet};

/// A large residual reported for points that project behind the camera or
/// onto the plane at infinity.
const INFEASIBLE_ERROR: f64 = f64::MAX / 4.0;

/// Per-point residual of the last set model.
pub trait Residual: Send {
    /// Bind the model whose residuals subsequent [`Residual::error`] calls
    /// measure.
    fn set_model(&mut self, model: &Model);

    /// Residual of one correspondence under the bound model.
    fn error(&self, point: usize) -> f64;

    fn clone_box(&self) -> Box<dyn Residual>;
}

/// Squared forward transfer error `|x' - Hx|^2` of a homography.
#[derive(Clone)]
pub struct ForwardReprojectionError {
    points: Arc<PointSet>,
    h: Matrix3<f64>,
}

impl ForwardReprojectionError {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self {
            points,
            h: Matrix3::identity(),
        }
    }

    /// Bind a fixed-size homography directly; used by the degeneracy handler
    /// which works with plane homographies rather than opaque models.
    pub fn set_homography(&mut self, h: &Matrix3<f64>) {
        self.h = *h;
    }
}

impl Residual for ForwardReprojectionError {
    fn set_model(&mut self, model: &Model) {
        self.h = as_mat3(model);
    }

    fn error(&self, point: usize) -> f64 {
        let row = self.points.row(point);
        let p = Vector3::new(row[0], row[1], 1.0);
        let q = self.h * p;
        if q.z.abs() < f64::EPSILON {
            return INFEASIBLE_ERROR;
        }
        let dx = q.x / q.z - row[2];
        let dy = q.y / q.z - row[3];
        dx * dx + dy * dy
    }

    fn clone_box(&self) -> Box<dyn Residual> {
        Box::new(self.clone())
    }
}

/// First-order (Sampson) approximation of the epipolar distance, squared.
#[derive(Clone)]
pub struct SampsonError {
    points: Arc<PointSet>,
    f: Matrix3<f64>,
}

impl SampsonError {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self {
            points,
            f: Matrix3::identity(),
        }
    }
}

impl Residual for SampsonError {
    fn set_model(&mut self, model: &Model) {
        self.f = as_mat3(model);
    }

    fn error(&self, point: usize) -> f64 {
        let row = self.points.row(point);
        let x1 = Vector3::new(row[0], row[1], 1.0);
        let x2 = Vector3::new(row[2], row[3], 1.0);

        let fx1 = self.f * x1;
        let ftx2 = self.f.transpose() * x2;
        let c = x2.dot(&fx1);

        let denom = fx1.x * fx1.x + fx1.y * fx1.y + ftx2.x * ftx2.x + ftx2.y * ftx2.y;
        if denom < f64::EPSILON {
            return 0.0;
        }
        c * c / denom
    }

    fn clone_box(&self) -> Box<dyn Residual> {
        Box::new(self.clone())
    }
}

/// Symmetric squared distance to the two epipolar lines of an essential
/// matrix in normalized image coordinates.
#[derive(Clone)]
pub struct SymmetricGeometricError {
    points: Arc<PointSet>,
    e: Matrix3<f64>,
}

impl SymmetricGeometricError {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self {
            points,
            e: Matrix3::identity(),
        }
    }
}

impl Residual for SymmetricGeometricError {
    fn set_model(&mut self, model: &Model) {
        self.e = as_mat3(model);
    }

    fn error(&self, point: usize) -> f64 {
        let row = self.points.row(point);
        let x1 = Vector3::new(row[0], row[1], 1.0);
        let x2 = Vector3::new(row[2], row[3], 1.0);

        let l2 = self.e * x1; // epipolar line in the second image
        let l1 = self.e.transpose() * x2; // epipolar line in the first image
        let c = x2.dot(&l2);

        let n2 = l2.x * l2.x + l2.y * l2.y;
        let n1 = l1.x * l1.x + l1.y * l1.y;
        if n1 < f64::EPSILON || n2 < f64::EPSILON {
            return INFEASIBLE_ERROR;
        }
        c * c * (1.0 / n1 + 1.0 / n2)
    }

    fn clone_box(&self) -> Box<dyn Residual> {
        Box::new(self.clone())
    }
}

/// Squared reprojection error of a 3x4 projection matrix applied to the 3D
/// side of a 2D-3D correspondence.
#[derive(Clone)]
pub struct ProjectionReprojectionError {
    points: Arc<PointSet>,
    p: Matrix3x4<f64>,
}

impl ProjectionReprojectionError {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self {
            points,
            p: Matrix3x4::identity(),
        }
    }
}

impl Residual for ProjectionReprojectionError {
    fn set_model(&mut self, model: &Model) {
        debug_assert!(model.nrows() == 3 && model.ncols() == 4);
        self.p = Matrix3x4::from_fn(|r, c| model[(r, c)]);
    }

    fn error(&self, point: usize) -> f64 {
        let row = self.points.row(point);
        let z = self.p[(2, 0)] * row[2] + self.p[(2, 1)] * row[3] + self.p[(2, 2)] * row[4]
            + self.p[(2, 3)];
        if z.abs() < f64::EPSILON {
            return INFEASIBLE_ERROR;
        }
        let u = (self.p[(0, 0)] * row[2] + self.p[(0, 1)] * row[3] + self.p[(0, 2)] * row[4]
            + self.p[(0, 3)])
            / z;
        let v = (self.p[(1, 0)] * row[2] + self.p[(1, 1)] * row[3] + self.p[(1, 2)] * row[4]
            + self.p[(1, 3)])
            / z;
        let du = u - row[0];
        let dv = v - row[1];
        du * du + dv * dv
    }

    fn clone_box(&self) -> Box<dyn Residual> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mat3_to_model;
    use approx::assert_abs_diff_eq;

    fn shifted_pair() -> Arc<PointSet> {
        // x' = x + 2, y' = y - 1
        PointSet::new(
            vec![
                0.0, 0.0, 2.0, -1.0, //
                3.0, 4.0, 5.0, 3.0, //
                1.0, 1.0, 10.0, 10.0, // off-model point
            ],
            4,
        )
        .into_shared()
    }

    #[test]
    fn forward_reprojection_on_exact_translation() {
        let mut err = ForwardReprojectionError::new(shifted_pair());
        let h = Matrix3::new(1.0, 0.0, 2.0, 0.0, 1.0, -1.0, 0.0, 0.0, 1.0);
        err.set_model(&mat3_to_model(&h));
        assert_abs_diff_eq!(err.error(0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(err.error(1), 0.0, epsilon = 1e-12);
        // (10 - 3)^2 + (10 - 0)^2
        assert_abs_diff_eq!(err.error(2), 149.0, epsilon = 1e-12);
    }

    #[test]
    fn sampson_zero_on_the_epipolar_constraint() {
        // Pure horizontal translation: F = [e]_x with e = (1, 0, 0) pairs
        // points of equal y.
        let points = PointSet::new(
            vec![
                0.0, 2.0, 7.0, 2.0, //
                1.0, -3.0, 4.0, -3.0, //
                1.0, 1.0, 2.0, 5.0, // violates the constraint
            ],
            4,
        )
        .into_shared();
        let f = Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0);
        let mut err = SampsonError::new(points);
        err.set_model(&mat3_to_model(&f));
        assert_abs_diff_eq!(err.error(0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(err.error(1), 0.0, epsilon = 1e-12);
        assert!(err.error(2) > 1.0);
    }

    #[test]
    fn projection_reprojection_identity_camera() {
        let points = PointSet::new(
            vec![
                0.5, 0.25, 2.0, 1.0, 4.0, // (2,1,4) projects to (0.5, 0.25)
                0.0, 0.0, 0.0, 0.0, 1.0, //
            ],
            5,
        )
        .into_shared();
        let mut p = Model::zeros(3, 4);
        p[(0, 0)] = 1.0;
        p[(1, 1)] = 1.0;
        p[(2, 2)] = 1.0;
        let mut err = ProjectionReprojectionError::new(points);
        err.set_model(&p);
        assert_abs_diff_eq!(err.error(0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(err.error(1), 0.0, epsilon = 1e-12);
    }
}
