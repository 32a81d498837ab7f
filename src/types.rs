//! Core shared types: the correspondence buffer and the opaque model matrix.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3};

/// Estimated model parameters.
///
/// A 3x3 matrix for homographies, fundamental and essential matrices, or a
/// 3x4 projection matrix for absolute pose. The engine never interprets the
/// entries; only residual metrics, solvers and degeneracy handlers do.
pub type Model = DMatrix<f64>;

/// Immutable buffer of point correspondences, one row per correspondence.
///
/// Rows are stored interleaved with a fixed stride: `[x, y, x', y']` for
/// image-to-image problems and `[x, y, X, Y, Z]` for 2D-3D problems. The
/// buffer is shared between residuals, quality, degeneracy handlers and all
/// per-thread clones through an [`Arc`], so it lives for the whole run.
#[derive(Debug, Clone)]
pub struct PointSet {
    data: Vec<f64>,
    stride: usize,
}

impl PointSet {
    /// Wrap a flat buffer; `data.len()` must be a multiple of `stride`.
    pub fn new(data: Vec<f64>, stride: usize) -> Self {
        assert!(stride > 0 && data.len() % stride == 0);
        Self { data, stride }
    }

    /// Number of correspondences.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values per correspondence (4 for image pairs, 5 for 2D-3D).
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// One coordinate of one correspondence.
    #[inline]
    pub fn at(&self, point: usize, coord: usize) -> f64 {
        self.data[point * self.stride + coord]
    }

    /// The full row of one correspondence.
    #[inline]
    pub fn row(&self, point: usize) -> &[f64] {
        let start = point * self.stride;
        &self.data[start..start + self.stride]
    }

    /// Shared handle used by the engine components.
    pub fn into_shared(self) -> Arc<PointSet> {
        Arc::new(self)
    }
}

/// View a 3x3 model as a fixed-size matrix.
pub fn as_mat3(model: &Model) -> Matrix3<f64> {
    debug_assert!(model.nrows() == 3 && model.ncols() == 3);
    Matrix3::from_fn(|r, c| model[(r, c)])
}

/// Store a fixed-size 3x3 matrix as an opaque model.
pub fn mat3_to_model(m: &Matrix3<f64>) -> Model {
    Model::from_fn(3, 3, |r, c| m[(r, c)])
}
