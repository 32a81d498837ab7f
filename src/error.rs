//! Failure modes reported by the estimation entry points.

use thiserror::Error;

/// Errors surfaced by the entry-point layer.
///
/// The consensus loop itself never aborts mid-run; it finishes and the entry
/// layer maps the outcome to one of these.
#[derive(Debug, Error)]
pub enum EstimateError {
    /// Fewer correspondences than the minimal sample size.
    #[error("need at least {required} correspondences, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// The run finished without any model reaching a non-zero inlier count.
    #[error("no model with a non-zero inlier count was found")]
    ZeroInliers,

    /// Point arrays of incompatible shape were passed to an entry point.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
