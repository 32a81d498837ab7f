//! Refinement of promising models: inner RANSAC over the inlier set, sigma
//! consensus for candidate-seeded refinement, and the final least-squares
//! polisher.

use crate::quality::{Quality, Score};
use crate::residuals::Residual;
use crate::samplers::UniformSampler;
use crate::solvers::Estimator;
use crate::types::Model;

/// Refines the so-far-the-best model.
pub trait LocalOptimization: Send {
    /// Refine `best_model`; `Some` only when a candidate was produced.
    fn refine(&mut self, best_model: &Model, best_score: &Score) -> Option<(Model, Score)>;

    /// Sigma-consensus entry: fold a freshly verified candidate into the
    /// refinement and return its score. Other strategies do not implement
    /// this and report a losing score.
    fn refine_with_candidate(
        &mut self,
        _best_model: &Model,
        _best_score: &Score,
        candidate: &Model,
    ) -> Score {
        let _ = candidate;
        Score::worst()
    }

    /// Reseeded copy for a parallel worker.
    fn clone_box(&self, state: u64) -> Box<dyn LocalOptimization>;
}

/// Inner RANSAC: repeatedly refit the model to random non-minimal subsets
/// of the current inlier set and keep the best scored refit.
pub struct InnerRansacOptimization {
    estimator: Estimator,
    quality: Box<dyn Quality>,
    sampler: UniformSampler,
    points_size: usize,
    iterations: usize,
    sample_limit: usize,
    inliers: Vec<usize>,
    subset: Vec<usize>,
    models: Vec<Model>,
}

impl InnerRansacOptimization {
    pub fn new(
        state: u64,
        estimator: Estimator,
        quality: Box<dyn Quality>,
        points_size: usize,
        iterations: usize,
        sample_limit: usize,
    ) -> Self {
        Self {
            estimator,
            quality,
            sampler: UniformSampler::new(state, 1, points_size.max(1)),
            points_size,
            iterations,
            sample_limit,
            inliers: Vec::new(),
            subset: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl LocalOptimization for InnerRansacOptimization {
    fn refine(&mut self, best_model: &Model, best_score: &Score) -> Option<(Model, Score)> {
        self.quality.inliers(best_model, &mut self.inliers);
        if self.inliers.len() <= self.estimator.non_minimal_sample_size() {
            return None;
        }

        let mut lo_model = best_model.clone();
        let mut lo_score = *best_score;
        let mut improved = false;

        for _ in 0..self.iterations {
            let subset_size = self.sample_limit.min(self.inliers.len());
            if subset_size < self.estimator.non_minimal_sample_size() {
                break;
            }

            if subset_size == self.inliers.len() {
                self.subset.clear();
                self.subset.extend_from_slice(&self.inliers);
            } else {
                self.subset.resize(subset_size, 0);
                self.sampler
                    .generate_sample_in(&mut self.subset, self.inliers.len());
                for slot in self.subset.iter_mut() {
                    *slot = self.inliers[*slot];
                }
            }

            if self
                .estimator
                .estimate_model_non_minimal(&self.subset, None, &mut self.models)
                == 0
            {
                continue;
            }

            let model = self.models.swap_remove(0);
            let score = self.quality.score(&model);
            if score.is_better(&lo_score) {
                lo_score = score;
                lo_model = model;
                improved = true;
                // Track the refined model's support for later subsets.
                self.quality.inliers(&lo_model, &mut self.inliers);
                if self.inliers.len() <= self.estimator.non_minimal_sample_size() {
                    break;
                }
            }

            // Fitting every inlier is deterministic; once tried there is
            // nothing left to vary.
            if subset_size == self.inliers.len() && !improved {
                break;
            }
        }

        improved.then_some((lo_model, lo_score))
    }

    fn clone_box(&self, state: u64) -> Box<dyn LocalOptimization> {
        Box::new(InnerRansacOptimization::new(
            crate::utils::UniformRandom::derive_seed(state),
            self.estimator.clone_with_state(state),
            self.quality.clone_box(),
            self.points_size,
            self.iterations,
            self.sample_limit,
        ))
    }
}

/// Sigma consensus: every verified candidate seeds an iteratively
/// reweighted refit over an enlarged threshold envelope; the weight of a
/// point decays linearly to zero at the envelope.
pub struct SigmaConsensus {
    estimator: Estimator,
    quality: Box<dyn Quality>,
    residual: Box<dyn Residual>,
    points_size: usize,
    maximum_threshold: f64,
    iterations: usize,
    weights: Vec<f64>,
    support: Vec<usize>,
    models: Vec<Model>,
}

impl SigmaConsensus {
    pub fn new(
        estimator: Estimator,
        quality: Box<dyn Quality>,
        residual: Box<dyn Residual>,
        points_size: usize,
        threshold: f64,
        threshold_multiplier: f64,
    ) -> Self {
        Self {
            estimator,
            quality,
            residual,
            points_size,
            maximum_threshold: threshold * threshold_multiplier,
            iterations: 5,
            weights: vec![0.0; points_size],
            support: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl LocalOptimization for SigmaConsensus {
    fn refine(&mut self, _best_model: &Model, _best_score: &Score) -> Option<(Model, Score)> {
        None
    }

    fn refine_with_candidate(
        &mut self,
        _best_model: &Model,
        _best_score: &Score,
        candidate: &Model,
    ) -> Score {
        let mut model = candidate.clone();
        let mut best = self.quality.score(&model);

        for _ in 0..self.iterations {
            self.residual.set_model(&model);
            self.support.clear();
            for point in 0..self.points_size {
                let err = self.residual.error(point);
                if err < self.maximum_threshold {
                    self.weights[point] = 1.0 - err / self.maximum_threshold;
                    self.support.push(point);
                } else {
                    self.weights[point] = 0.0;
                }
            }
            if self.support.len() < self.estimator.non_minimal_sample_size() {
                break;
            }

            if self
                .estimator
                .estimate_model_non_minimal(&self.support, Some(&self.weights), &mut self.models)
                == 0
            {
                break;
            }
            let refined = self.models.swap_remove(0);
            let score = self.quality.score(&refined);
            if score.is_better(&best) {
                best = score;
                model = refined;
            } else {
                break;
            }
        }
        best
    }

    fn clone_box(&self, state: u64) -> Box<dyn LocalOptimization> {
        Box::new(SigmaConsensus {
            estimator: self.estimator.clone_with_state(state),
            quality: self.quality.clone_box(),
            residual: self.residual.clone_box(),
            points_size: self.points_size,
            maximum_threshold: self.maximum_threshold,
            iterations: self.iterations,
            weights: vec![0.0; self.points_size],
            support: Vec::new(),
            models: Vec::new(),
        })
    }
}

/// Final polish of the winning model after the main loop.
pub trait ModelPolisher: Send {
    /// Returns the polished model and score when polishing produced one.
    fn polish(&mut self, model: &Model, best_score: &Score) -> Option<(Model, Score)>;
}

/// A few rounds of inlier collection followed by a least-squares refit; the
/// result is kept only while the score keeps improving.
pub struct LeastSquaresPolisher {
    estimator: Estimator,
    quality: Box<dyn Quality>,
    iterations: usize,
    inliers: Vec<usize>,
    models: Vec<Model>,
}

impl LeastSquaresPolisher {
    pub fn new(estimator: Estimator, quality: Box<dyn Quality>, iterations: usize) -> Self {
        Self {
            estimator,
            quality,
            iterations,
            inliers: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl ModelPolisher for LeastSquaresPolisher {
    fn polish(&mut self, model: &Model, best_score: &Score) -> Option<(Model, Score)> {
        let mut polished = model.clone();
        let mut polished_score = *best_score;
        let mut improved = false;

        for _ in 0..self.iterations {
            self.quality.inliers(&polished, &mut self.inliers);
            if self.inliers.len() < self.estimator.non_minimal_sample_size() {
                break;
            }
            if self
                .estimator
                .estimate_model_non_minimal(&self.inliers, None, &mut self.models)
                == 0
            {
                break;
            }
            let refit = self.models.swap_remove(0);
            let score = self.quality.score(&refit);
            if !score.is_better(&polished_score) {
                break;
            }
            polished = refit;
            polished_score = score;
            improved = true;
        }

        improved.then_some((polished, polished_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degeneracy::HomographyDegeneracy;
    use crate::quality::MsacQuality;
    use crate::residuals::ForwardReprojectionError;
    use crate::solvers::{HomographyMinimalSolver, HomographyNonMinimalSolver};
    use crate::types::PointSet;
    use nalgebra::{Matrix3, Vector3};
    use std::sync::Arc;

    /// 30 exact correspondences under a known homography plus 6 outliers.
    fn homography_scene() -> (Arc<PointSet>, Matrix3<f64>) {
        let h = Matrix3::new(1.05, 0.01, 3.0, -0.02, 0.97, 1.5, 1e-4, -5e-5, 1.0);
        let mut data = Vec::new();
        for i in 0..30 {
            let x = (i % 6) as f64 * 20.0;
            let y = (i / 6) as f64 * 18.0;
            let q = h * Vector3::new(x, y, 1.0);
            data.extend_from_slice(&[x, y, q.x / q.z, q.y / q.z]);
        }
        for i in 0..6 {
            let x = i as f64 * 13.0 + 5.0;
            let y = i as f64 * 9.0 + 2.0;
            data.extend_from_slice(&[x, y, x + 60.0 + i as f64, y - 45.0]);
        }
        (PointSet::new(data, 4).into_shared(), h)
    }

    fn homography_estimator(points: &Arc<PointSet>) -> Estimator {
        Estimator::new(
            Box::new(HomographyMinimalSolver::new(points.clone())),
            Box::new(HomographyNonMinimalSolver::new(points.clone())),
            Box::new(HomographyDegeneracy::new(points.clone())),
        )
    }

    fn msac(points: &Arc<PointSet>) -> Box<dyn Quality> {
        let residual = Box::new(ForwardReprojectionError::new(points.clone()));
        Box::new(MsacQuality::new(points.len(), 9.0, residual))
    }

    /// A rough model estimated from a noisy minimal sample: perturb the
    /// true homography so some inliers fall outside the threshold.
    fn rough_model(h: &Matrix3<f64>) -> Model {
        let mut rough = *h;
        rough[(0, 0)] += 0.05;
        crate::types::mat3_to_model(&rough)
    }

    #[test]
    fn inner_ransac_improves_a_rough_model() {
        let (points, h) = homography_scene();
        let mut quality = msac(&points);
        let model = rough_model(&h);
        let score = quality.score(&model);
        assert!(score.inlier_number < 30, "rough model should lose inliers");

        let mut lo = InnerRansacOptimization::new(
            17,
            homography_estimator(&points),
            quality.clone_box(),
            points.len(),
            10,
            14,
        );
        let (refined, refined_score) = lo.refine(&model, &score).expect("refinement");
        assert!(refined_score.is_better(&score));
        assert_eq!(refined_score.inlier_number, 30);

        let mut check = msac(&points);
        let rescored = check.score(&refined);
        assert_eq!(rescored.inlier_number, 30);
    }

    #[test]
    fn polisher_restores_the_exact_model() {
        let (points, h) = homography_scene();
        let mut quality = msac(&points);
        let model = rough_model(&h);
        let score = quality.score(&model);

        let mut polisher =
            LeastSquaresPolisher::new(homography_estimator(&points), quality.clone_box(), 3);
        let (polished, polished_score) = polisher.polish(&model, &score).expect("polish");
        assert!(polished_score.is_better(&score));

        for r in 0..3 {
            for c in 0..3 {
                approx::assert_abs_diff_eq!(
                    polished[(r, c)] / polished[(2, 2)],
                    h[(r, c)],
                    epsilon = 1e-6
                );
            }
        }
    }

    #[test]
    fn sigma_consensus_scores_candidates() {
        let (points, h) = homography_scene();
        let quality = msac(&points);
        let residual = Box::new(ForwardReprojectionError::new(points.clone()));
        let mut sigma = SigmaConsensus::new(
            homography_estimator(&points),
            quality,
            residual,
            points.len(),
            9.0,
            4.0,
        );

        let candidate = rough_model(&h);
        let score = sigma.refine_with_candidate(
            &candidate,
            &Score::worst(),
            &candidate,
        );
        assert!(score.inlier_number >= 24, "sigma refit lost the inliers");
    }
}
