//! Minimal-sample drawing strategies.

pub mod prosac;
pub mod uniform;

pub use prosac::ProsacSampler;
pub use uniform::UniformSampler;

/// Draws minimal samples of distinct point indices.
pub trait Sampler: Send {
    /// Fill `sample` with `sample_size` distinct indices in `[0, N)`.
    fn generate_sample(&mut self, sample: &mut [usize]);

    fn sample_size(&self) -> usize;

    /// Reseeded copy for a parallel worker; `state` mixes in the worker id.
    fn clone_box(&self, state: u64) -> Box<dyn Sampler>;
}
