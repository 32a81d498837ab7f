//! Preemptive model verification.
//!
//! The main verifier runs Wald's sequential probability ratio test over a
//! pre-shuffled pool of point indices: the likelihood ratio of the
//! "bad model" hypothesis is updated per point and the model is rejected as
//! soon as the ratio passes the decision threshold A. The test parameters
//! (inlier rate epsilon of a good model, consistency rate delta of a bad
//! one) are re-estimated online; every designed test is kept in a history
//! vector whose last entry is the current test.

use log::debug;

use crate::quality::{Quality, Score};
use crate::residuals::Residual;
use crate::settings::ScoreMethod;
use crate::types::Model;
use crate::utils::UniformRandom;

/// One designed SPRT test together with the number of models it judged.
#[derive(Debug, Clone, Copy)]
pub struct SprtHistory {
    pub epsilon: f64,
    pub delta: f64,
    pub threshold_a: f64,
    pub tested_samples: usize,
}

/// Decides cheaply whether a model is worth full scoring.
pub trait ModelVerifier: Send {
    /// Judge a model. `quality` carries the per-point inlier predicate for
    /// verifiers that do not measure residuals themselves.
    fn is_model_good(&mut self, quality: &mut dyn Quality, model: &Model) -> bool;

    /// Score captured during the last accepted verification, if this
    /// verifier computes one.
    fn last_score(&self) -> Option<Score> {
        None
    }

    /// Notify the verifier of a new highest inlier count found outside
    /// verification (local optimization, cross-thread sync).
    fn update(&mut self, _highest_inlier_number: usize) {}

    /// Drop all adapted state and re-install the initial test.
    fn reset(&mut self) {}

    /// Reseeded copy for a parallel worker.
    fn clone_box(&self, state: u64) -> Box<dyn ModelVerifier>;
}

/// Verifier that accepts everything.
pub struct NullVerifier;

impl ModelVerifier for NullVerifier {
    fn is_model_good(&mut self, _quality: &mut dyn Quality, _model: &Model) -> bool {
        true
    }

    fn clone_box(&self, _state: u64) -> Box<dyn ModelVerifier> {
        Box::new(NullVerifier)
    }
}

/// Shared SPRT state: current test parameters, the history vector and the
/// shuffled evaluation pool.
struct SprtState {
    epsilon: f64,
    delta: f64,
    threshold_a: f64,
    // Precomputed likelihood-ratio factors delta/epsilon and
    // (1 - delta)/(1 - epsilon).
    delta_to_epsilon: f64,
    complement_delta_to_complement_epsilon: f64,

    histories: Vec<SprtHistory>,
    highest_inlier_number: usize,

    points_random_pool: Vec<usize>,
    points_size: usize,

    // Estimator statistics fixed at construction: model instantiation time
    // and average number of models per sample.
    t_m: f64,
    m_s: f64,

    initial_epsilon: f64,
    initial_delta: f64,
    clamp_logged: bool,
}

impl SprtState {
    fn new(
        rng: &mut UniformRandom,
        points_size: usize,
        epsilon: f64,
        delta: f64,
        t_m: f64,
        m_s: f64,
    ) -> Self {
        let mut pool: Vec<usize> = (0..points_size).collect();
        rng.shuffle(&mut pool);

        let mut state = Self {
            epsilon: 0.0,
            delta: 0.0,
            threshold_a: 0.0,
            delta_to_epsilon: 0.0,
            complement_delta_to_complement_epsilon: 0.0,
            histories: Vec::with_capacity(20),
            highest_inlier_number: 0,
            points_random_pool: pool,
            points_size,
            t_m,
            m_s,
            initial_epsilon: epsilon,
            initial_delta: delta,
            clamp_logged: false,
        };
        state.create_test(epsilon, delta);
        state
    }

    /// Design a new test for the given statistics, clamp them into the
    /// numerically safe range, and append it to the history.
    fn create_test(&mut self, mut epsilon: f64, mut delta: f64) {
        if epsilon > 0.999999 || delta > 0.8 {
            if !self.clamp_logged {
                debug!(
                    "sprt statistics clamped: epsilon {:.6}, delta {:.6}",
                    epsilon, delta
                );
                self.clamp_logged = true;
            }
            if epsilon > 0.999999 {
                epsilon = 0.99;
            }
            if delta > 0.8 {
                delta = 0.8;
            }
        }

        let threshold_a = self.estimate_threshold_a(epsilon, delta);
        self.histories.push(SprtHistory {
            epsilon,
            delta,
            threshold_a,
            tested_samples: 0,
        });

        self.epsilon = epsilon;
        self.delta = delta;
        self.threshold_a = threshold_a;
        self.delta_to_epsilon = delta / epsilon;
        self.complement_delta_to_complement_epsilon = (1.0 - delta) / (1.0 - epsilon);
    }

    /// Decision threshold A as the fixed point of `A = K + ln A` where
    /// `K = t_M * C / m_S + 1` and C is the Kullback-Leibler divergence of
    /// the per-point observation distributions under the two hypotheses.
    fn estimate_threshold_a(&self, epsilon: f64, delta: f64) -> f64 {
        let c = (1.0 - delta) * ((1.0 - delta) / (1.0 - epsilon)).ln()
            + delta * (delta / epsilon).ln();
        let k = self.t_m * c / self.m_s + 1.0;
        let mut a_prev = k;
        // The series typically converges within four iterations.
        for _ in 0..10 {
            let a = k + a_prev.ln();
            if (a - a_prev).abs() < f64::EPSILON {
                return a;
            }
            a_prev = a;
        }
        a_prev
    }

    /// Walk the shuffled pool from a random offset, folding each point's
    /// likelihood factor into lambda. Returns `(accepted, tested_inliers,
    /// tested_points)` and leaves the online adaptation to the caller.
    fn run_test<F: FnMut(usize) -> bool>(
        &mut self,
        rng: &mut UniformRandom,
        mut is_inlier: F,
    ) -> (bool, usize, usize) {
        let mut lambda = 1.0;
        let mut pool_idx = rng.uniform(self.points_size);
        let mut tested_inliers = 0;
        let mut tested_points = 0;
        let mut good_model = true;

        for _ in 0..self.points_size {
            if pool_idx >= self.points_size {
                pool_idx = 0;
            }
            if is_inlier(self.points_random_pool[pool_idx]) {
                tested_inliers += 1;
                lambda *= self.delta_to_epsilon;
            } else {
                lambda *= self.complement_delta_to_complement_epsilon;
            }
            pool_idx += 1;
            tested_points += 1;

            if lambda > self.threshold_a {
                good_model = false;
                break;
            }
        }

        let current = self.histories.len() - 1;
        self.histories[current].tested_samples += 1;
        (good_model, tested_inliers, tested_points)
    }

    /// Online re-estimation after a verdict: an accepted model with record
    /// support raises epsilon; a rejected model whose consistency rate
    /// drifted more than 5% from delta re-designs the test with the new
    /// delta estimate.
    fn adapt(&mut self, good_model: bool, tested_inliers: usize, tested_points: usize) {
        if good_model {
            if tested_inliers > self.highest_inlier_number {
                self.highest_inlier_number = tested_inliers;
                let epsilon = tested_inliers as f64 / self.points_size as f64;
                let delta = self.delta;
                self.create_test(epsilon, delta);
            }
        } else {
            let delta_estimate = tested_inliers as f64 / tested_points as f64;
            if delta_estimate > 0.0 && (self.delta - delta_estimate).abs() / self.delta > 0.05 {
                let epsilon = self.epsilon;
                self.create_test(epsilon, delta_estimate);
            }
        }
    }

    fn observe_inlier_number(&mut self, inlier_number: usize) {
        if inlier_number > self.highest_inlier_number {
            self.highest_inlier_number = inlier_number;
            let epsilon = inlier_number as f64 / self.points_size as f64;
            let delta = self.delta;
            self.create_test(epsilon, delta);
        }
    }

    fn reset(&mut self) {
        self.histories.clear();
        self.highest_inlier_number = 0;
        let (epsilon, delta) = (self.initial_epsilon, self.initial_delta);
        self.create_test(epsilon, delta);
    }
}

/// SPRT verifier that delegates the per-point inlier decision to the
/// engine's [`Quality`] and reports only a good/bad verdict.
pub struct SprtVerifier {
    sprt: SprtState,
    rng: UniformRandom,
}

impl SprtVerifier {
    pub fn new(
        state: u64,
        points_size: usize,
        epsilon: f64,
        delta: f64,
        t_m: f64,
        m_s: f64,
    ) -> Self {
        let mut rng = UniformRandom::new(state);
        let sprt = SprtState::new(&mut rng, points_size, epsilon, delta, t_m, m_s);
        Self { sprt, rng }
    }

    /// All tests designed so far, in insertion order; the last is current.
    pub fn histories(&self) -> &[SprtHistory] {
        &self.sprt.histories
    }
}

impl ModelVerifier for SprtVerifier {
    fn is_model_good(&mut self, quality: &mut dyn Quality, model: &Model) -> bool {
        quality.set_model(model);
        let (good, inliers, tested) = self
            .sprt
            .run_test(&mut self.rng, |point| quality.is_inlier(point));
        self.sprt.adapt(good, inliers, tested);
        good
    }

    fn update(&mut self, highest_inlier_number: usize) {
        self.sprt.observe_inlier_number(highest_inlier_number);
    }

    fn reset(&mut self) {
        self.sprt.reset();
    }

    fn clone_box(&self, state: u64) -> Box<dyn ModelVerifier> {
        Box::new(SprtVerifier::new(
            state,
            self.sprt.points_size,
            self.sprt.initial_epsilon,
            self.sprt.initial_delta,
            self.sprt.t_m,
            self.sprt.m_s,
        ))
    }
}

/// SPRT verifier that measures residuals itself and, on acceptance, also
/// yields the model score so the controller can skip full evaluation.
pub struct SprtScore {
    sprt: SprtState,
    rng: UniformRandom,
    residual: Box<dyn Residual>,
    inlier_threshold: f64,
    score_method: ScoreMethod,
    score: Score,
    last_model_good: bool,
}

impl SprtScore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: u64,
        residual: Box<dyn Residual>,
        points_size: usize,
        inlier_threshold: f64,
        epsilon: f64,
        delta: f64,
        t_m: f64,
        m_s: f64,
        score_method: ScoreMethod,
    ) -> Self {
        let mut rng = UniformRandom::new(state);
        let sprt = SprtState::new(&mut rng, points_size, epsilon, delta, t_m, m_s);
        Self {
            sprt,
            rng,
            residual,
            inlier_threshold,
            score_method,
            score: Score::worst(),
            last_model_good: false,
        }
    }

    pub fn histories(&self) -> &[SprtHistory] {
        &self.sprt.histories
    }
}

impl ModelVerifier for SprtScore {
    fn is_model_good(&mut self, _quality: &mut dyn Quality, model: &Model) -> bool {
        self.residual.set_model(model);

        let (good, inliers, tested) = match self.score_method {
            ScoreMethod::Ransac => {
                let residual = &*self.residual;
                let threshold = self.inlier_threshold;
                self.sprt
                    .run_test(&mut self.rng, |point| residual.error(point) < threshold)
            }
            ScoreMethod::Msac => {
                let residual = &*self.residual;
                let threshold = self.inlier_threshold;
                let mut sum_errors = 0.0;
                let out = self.sprt.run_test(&mut self.rng, |point| {
                    let err = residual.error(point);
                    if err < threshold {
                        sum_errors += err;
                        true
                    } else {
                        false
                    }
                });
                if out.0 {
                    // All points were traversed, so padding the truncated sum
                    // with one threshold per outlier gives the full cost.
                    self.score = Score::new(
                        out.1,
                        sum_errors + (self.sprt.points_size - out.1) as f64 * threshold,
                    );
                }
                out
            }
        };

        if good && self.score_method == ScoreMethod::Ransac {
            self.score = Score::new(inliers, -(inliers as f64));
        }
        self.last_model_good = good;
        self.sprt.adapt(good, inliers, tested);
        good
    }

    fn last_score(&self) -> Option<Score> {
        self.last_model_good.then_some(self.score)
    }

    fn update(&mut self, highest_inlier_number: usize) {
        self.sprt.observe_inlier_number(highest_inlier_number);
    }

    fn reset(&mut self) {
        self.sprt.reset();
        self.last_model_good = false;
        self.score = Score::worst();
    }

    fn clone_box(&self, state: u64) -> Box<dyn ModelVerifier> {
        Box::new(SprtScore::new(
            state,
            self.residual.clone_box(),
            self.sprt.points_size,
            self.inlier_threshold,
            self.sprt.initial_epsilon,
            self.sprt.initial_delta,
            self.sprt.t_m,
            self.sprt.m_s,
            self.score_method,
        ))
    }
}

/// T(d,d) prefilter: test `d` random points and reject on the first
/// non-inlier. A trivially cheap alternative to the SPRT.
pub struct TddVerifier {
    rng: UniformRandom,
    points_size: usize,
    d: usize,
}

impl TddVerifier {
    pub fn new(state: u64, points_size: usize, d: usize) -> Self {
        Self {
            rng: UniformRandom::new(state),
            points_size,
            d,
        }
    }
}

impl ModelVerifier for TddVerifier {
    fn is_model_good(&mut self, quality: &mut dyn Quality, model: &Model) -> bool {
        quality.set_model(model);
        for _ in 0..self.d {
            let point = self.rng.uniform(self.points_size);
            if !quality.is_inlier(point) {
                return false;
            }
        }
        true
    }

    fn clone_box(&self, state: u64) -> Box<dyn ModelVerifier> {
        Box::new(TddVerifier::new(state, self.points_size, self.d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{MsacQuality, RansacQuality};
    use crate::residuals::ForwardReprojectionError;
    use crate::types::{mat3_to_model, PointSet};
    use nalgebra::Matrix3;
    use std::sync::Arc;

    fn half_inlier_points(n: usize) -> Arc<PointSet> {
        // Even indices follow the identity mapping, odd ones are far off.
        let mut data = Vec::with_capacity(n * 4);
        for i in 0..n {
            let x = i as f64;
            if i % 2 == 0 {
                data.extend_from_slice(&[x, x, x, x]);
            } else {
                data.extend_from_slice(&[x, x, x + 100.0, x - 100.0]);
            }
        }
        PointSet::new(data, 4).into_shared()
    }

    #[test]
    fn threshold_a_exceeds_one_when_epsilon_beats_delta() {
        let mut rng = UniformRandom::new(3);
        let sprt = SprtState::new(&mut rng, 100, 0.5, 0.1, 100.0, 1.0);
        assert!(sprt.threshold_a > 1.0);

        let sprt = SprtState::new(&mut rng, 100, 0.011, 0.01, 100.0, 1.0);
        assert!(sprt.threshold_a > 1.0);
    }

    #[test]
    fn statistics_are_clamped_into_the_safe_range() {
        let mut rng = UniformRandom::new(3);
        let mut sprt = SprtState::new(&mut rng, 100, 0.011, 0.01, 100.0, 1.0);
        sprt.create_test(1.0, 0.95);
        assert!((sprt.epsilon - 0.99).abs() < 1e-12);
        assert!((sprt.delta - 0.8).abs() < 1e-12);
    }

    #[test]
    fn tested_samples_increment_once_per_verification() {
        let n = 40;
        let points = half_inlier_points(n);
        let residual = Box::new(ForwardReprojectionError::new(points.clone()));
        let mut quality = RansacQuality::new(n, 1.0, residual.clone_box());
        let mut verifier = SprtVerifier::new(7, n, 0.3, 0.05, 100.0, 1.0);

        let identity = mat3_to_model(&Matrix3::identity());
        for _ in 0..5 {
            verifier.is_model_good(&mut quality, &identity);
        }
        let total: usize = verifier.histories().iter().map(|h| h.tested_samples).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn good_model_with_record_support_raises_epsilon() {
        let n = 40;
        let points = half_inlier_points(n);
        let residual = Box::new(ForwardReprojectionError::new(points.clone()));
        let mut quality = RansacQuality::new(n, 1.0, residual.clone_box());
        // Start from a pessimistic epsilon; the identity model is consistent
        // with half the points.
        let mut verifier = SprtVerifier::new(7, n, 0.011, 0.01, 100.0, 1.0);

        let identity = mat3_to_model(&Matrix3::identity());
        assert!(verifier.is_model_good(&mut quality, &identity));
        let current = verifier.histories().last().unwrap();
        assert!((current.epsilon - 0.5).abs() < 1e-12);
    }

    #[test]
    fn score_capturing_msac_matches_full_quality_cost() {
        let n = 40;
        let points = half_inlier_points(n);
        let residual = Box::new(ForwardReprojectionError::new(points.clone()));
        let mut quality = MsacQuality::new(n, 1.0, residual.clone_box());
        let mut verifier = SprtScore::new(
            7,
            residual.clone_box(),
            n,
            1.0,
            0.2,
            0.01,
            100.0,
            1.0,
            ScoreMethod::Msac,
        );

        let identity = mat3_to_model(&Matrix3::identity());
        assert!(verifier.is_model_good(&mut quality, &identity));
        let captured = verifier.last_score().unwrap();
        let full = quality.score(&identity);
        assert_eq!(captured.inlier_number, full.inlier_number);
        assert!((captured.cost - full.cost).abs() < 1e-9);
    }

    #[test]
    fn reset_reinstalls_the_initial_test() {
        let n = 40;
        let points = half_inlier_points(n);
        let residual = Box::new(ForwardReprojectionError::new(points));
        let mut quality = RansacQuality::new(n, 1.0, residual);
        let mut verifier = SprtVerifier::new(7, n, 0.011, 0.01, 100.0, 1.0);

        let identity = mat3_to_model(&Matrix3::identity());
        verifier.is_model_good(&mut quality, &identity);
        assert!(verifier.histories().len() > 1);

        verifier.reset();
        assert_eq!(verifier.histories().len(), 1);
        let current = verifier.histories()[0];
        assert!((current.epsilon - 0.011).abs() < 1e-12);
        assert_eq!(current.tested_samples, 0);
    }

    #[test]
    fn tdd_rejects_on_the_first_tested_outlier() {
        let n = 40;
        let points = half_inlier_points(n);
        let residual = Box::new(ForwardReprojectionError::new(points));
        let mut quality = RansacQuality::new(n, 1.0, residual);
        let mut verifier = TddVerifier::new(7, n, 4);

        let identity = mat3_to_model(&Matrix3::identity());
        // With half the points off-model, repeated verification must reject
        // at least once and accept at least once over many trials.
        let verdicts: Vec<bool> = (0..50)
            .map(|_| verifier.is_model_good(&mut quality, &identity))
            .collect();
        assert!(verdicts.iter().any(|&v| v));
        assert!(verdicts.iter().any(|&v| !v));
    }
}
