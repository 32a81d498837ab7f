//! Universal sample consensus (USAC) robust model estimation for
//! multi-view geometry.
//!
//! The engine draws minimal samples, instantiates candidate models through
//! closed-form solvers, rejects hopeless candidates early with a sequential
//! probability ratio test, scores the survivors, detects and repairs
//! structural degeneracies, refines promising models by local optimization
//! and terminates adaptively once a confidence bound is met.
//!
//! The [`api`] module offers one entry point per geometry (homography,
//! fundamental, essential, absolute pose); every building block is public
//! so custom pipelines can be assembled through [`ransac::Ransac`].

pub mod api;
pub mod degeneracy;
pub mod error;
pub mod local_optimization;
pub mod quality;
pub mod ransac;
pub mod residuals;
pub mod samplers;
pub mod settings;
pub mod solvers;
pub mod termination;
pub mod types;
pub mod utils;
pub mod verifier;

pub use api::{
    find_essential_mat, find_fundamental_mat, find_homography, solve_pnp_ransac, PnpPose,
};
pub use error::EstimateError;
pub use quality::Score;
pub use ransac::{Ransac, RansacOutput};
pub use settings::{
    EstimationMethod, LocalOptimMethod, Method, NeighborSearchMethod, Params, PolishingMethod,
    SamplingMethod, ScoreMethod, VerificationMethod,
};
pub use types::{Model, PointSet};
