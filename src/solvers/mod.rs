//! Minimal and non-minimal model solvers plus the estimator that wires them
//! to the degeneracy screening.

pub mod essential;
pub mod fundamental;
pub mod homography;
pub mod pnp;

pub use essential::{EssentialMinimalSolver, EssentialNonMinimalSolver};
pub use fundamental::{
    FundamentalMinimalSolver7pt, FundamentalMinimalSolver8pt, FundamentalNonMinimalSolver,
};
pub use homography::{HomographyMinimalSolver, HomographyNonMinimalSolver};
pub use pnp::{P3pSolver, P6pSolver, PnpNonMinimalSolver};

use crate::degeneracy::Degeneracy;
use crate::types::Model;

/// Instantiates candidate models from a minimal sample.
pub trait MinimalSolver: Send {
    fn sample_size(&self) -> usize;

    /// Largest number of models one sample can produce.
    fn max_solutions(&self) -> usize;

    /// Solve for the sample; appends to `models` and returns how many were
    /// produced.
    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize;

    fn clone_box(&self) -> Box<dyn MinimalSolver>;
}

/// Fits one model to a larger-than-minimal index set, optionally weighted.
pub trait NonMinimalSolver: Send {
    /// Smallest index set this solver accepts.
    fn min_sample_size(&self) -> usize;

    /// Weights, when given, are indexed by point index (not sample
    /// position).
    fn estimate(&self, sample: &[usize], weights: Option<&[f64]>, models: &mut Vec<Model>)
        -> usize;

    fn clone_box(&self) -> Box<dyn NonMinimalSolver>;
}

/// Binds the two solvers of a geometry to its degeneracy screening: samples
/// are checked before solving, solved models are checked for validity.
pub struct Estimator {
    minimal: Box<dyn MinimalSolver>,
    non_minimal: Box<dyn NonMinimalSolver>,
    degeneracy: Box<dyn Degeneracy>,
}

impl Estimator {
    pub fn new(
        minimal: Box<dyn MinimalSolver>,
        non_minimal: Box<dyn NonMinimalSolver>,
        degeneracy: Box<dyn Degeneracy>,
    ) -> Self {
        Self {
            minimal,
            non_minimal,
            degeneracy,
        }
    }

    pub fn sample_size(&self) -> usize {
        self.minimal.sample_size()
    }

    pub fn max_solutions(&self) -> usize {
        self.minimal.max_solutions()
    }

    pub fn non_minimal_sample_size(&self) -> usize {
        self.non_minimal.min_sample_size()
    }

    /// Models for a minimal sample; degenerate samples and invalid models
    /// are filtered out.
    pub fn estimate_models(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        models.clear();
        if !self.degeneracy.is_sample_good(sample) {
            return 0;
        }
        self.minimal.estimate(sample, models);
        models.retain(|m| self.degeneracy.is_model_valid(m, sample));
        models.len()
    }

    /// One model fitted to a non-minimal index set.
    pub fn estimate_model_non_minimal(
        &self,
        sample: &[usize],
        weights: Option<&[f64]>,
        models: &mut Vec<Model>,
    ) -> usize {
        models.clear();
        if sample.len() < self.non_minimal.min_sample_size() {
            return 0;
        }
        self.non_minimal.estimate(sample, weights, models)
    }

    /// Copy with a reseeded degeneracy handler for a parallel worker.
    pub fn clone_with_state(&self, state: u64) -> Estimator {
        Estimator {
            minimal: self.minimal.clone_box(),
            non_minimal: self.non_minimal.clone_box(),
            degeneracy: self.degeneracy.clone_box(state),
        }
    }
}
