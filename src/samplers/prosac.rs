//! PROSAC sampler: progressively grows the subset of high-priority points.
//!
//! Correspondences are assumed to be sorted by decreasing matching quality;
//! early samples are drawn from a small prefix that grows with the sample
//! counter, and after the configured convergence horizon the sampler
//! degenerates to plain uniform sampling.

use crate::samplers::Sampler;
use crate::utils::UniformRandom;

pub struct ProsacSampler {
    rng: UniformRandom,
    growth_function: Vec<usize>,
    sample_size: usize,
    points_size: usize,
    growth_max_samples: usize,
    kth_sample_number: usize,
    subset_size: usize,
}

impl ProsacSampler {
    pub fn new(state: u64, sample_size: usize, points_size: usize) -> Self {
        Self::with_growth_max_samples(state, sample_size, points_size, 100_000)
    }

    /// `growth_max_samples` is the sample count at which PROSAC is expected
    /// to have converged to uniform sampling.
    pub fn with_growth_max_samples(
        state: u64,
        sample_size: usize,
        points_size: usize,
        growth_max_samples: usize,
    ) -> Self {
        assert!(sample_size <= points_size);
        let mut sampler = Self {
            rng: UniformRandom::new(state),
            growth_function: Vec::new(),
            sample_size,
            points_size,
            growth_max_samples,
            kth_sample_number: 1,
            subset_size: sample_size,
        };
        sampler.build_growth_function();
        sampler
    }

    fn build_growth_function(&mut self) {
        let n = self.points_size;
        let m = self.sample_size;
        self.growth_function = vec![0; n];

        // T_n: expected number of samples containing only points from the
        // n-point prefix after growth_max_samples draws.
        let mut t_n = self.growth_max_samples as f64;
        for i in 0..m {
            t_n *= (m - i) as f64 / (n - i) as f64;
        }

        let mut t_n_prime = 1usize;
        for i in 0..n {
            if i + 1 <= m {
                self.growth_function[i] = t_n_prime;
                continue;
            }
            let t_n_plus1 = (i + 1) as f64 * t_n / (i + 1 - m) as f64;
            self.growth_function[i] = t_n_prime + (t_n_plus1 - t_n).ceil() as usize;
            t_n = t_n_plus1;
            t_n_prime = self.growth_function[i];
        }

        self.subset_size = m;
        self.kth_sample_number = 1;
    }

    /// Restart the progressive schedule without reseeding.
    pub fn reset(&mut self) {
        self.kth_sample_number = 1;
        self.subset_size = self.sample_size;
    }

    fn advance(&mut self) {
        self.kth_sample_number += 1;
        if self.kth_sample_number > self.growth_max_samples {
            return;
        }
        if self.kth_sample_number > self.growth_function[self.subset_size - 1] {
            self.subset_size = (self.subset_size + 1).min(self.points_size);
        }
    }
}

impl Sampler for ProsacSampler {
    fn generate_sample(&mut self, sample: &mut [usize]) {
        let bound = if self.kth_sample_number > self.growth_max_samples {
            // Converged to uniform sampling over all points.
            self.points_size
        } else {
            self.subset_size
        };

        sample[0] = self.rng.uniform(bound);
        let mut filled = 1;
        while filled < self.sample_size {
            let candidate = self.rng.uniform(bound);
            if sample[..filled].iter().all(|&v| v != candidate) {
                sample[filled] = candidate;
                filled += 1;
            }
        }
        self.advance();
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn clone_box(&self, state: u64) -> Box<dyn Sampler> {
        Box::new(ProsacSampler::with_growth_max_samples(
            UniformRandom::derive_seed(state),
            self.sample_size,
            self.points_size,
            self.growth_max_samples,
        ))
    }
}
