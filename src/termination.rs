//! Adaptive termination: shrink the iteration cap as the inlier ratio of
//! the best model grows.

use crate::types::Model;

/// Updates the iteration cap from the support of the current best model.
pub trait TerminationCriteria: Send {
    /// New upper bound on the number of iterations. Non-increasing across a
    /// run as long as the reported inlier counts only improve.
    fn update(&mut self, model: &Model, inlier_number: usize) -> usize;

    fn clone_box(&self) -> Box<dyn TerminationCriteria>;
}

/// Standard criterion: enough iterations to draw an all-inlier minimal
/// sample with the configured confidence.
#[derive(Clone)]
pub struct StandardTermination {
    log_one_minus_confidence: f64,
    points_size: usize,
    sample_size: usize,
    max_iterations: usize,
}

impl StandardTermination {
    pub fn new(
        confidence: f64,
        points_size: usize,
        sample_size: usize,
        max_iterations: usize,
    ) -> Self {
        Self {
            log_one_minus_confidence: (1.0 - confidence).ln(),
            points_size,
            sample_size,
            max_iterations,
        }
    }
}

impl TerminationCriteria for StandardTermination {
    fn update(&mut self, _model: &Model, inlier_number: usize) -> usize {
        let inlier_ratio = inlier_number as f64 / self.points_size as f64;
        // Probability that one random minimal sample is all inliers.
        let all_inlier_prob = inlier_ratio.powi(self.sample_size as i32);

        if all_inlier_prob >= 1.0 {
            return 0;
        }
        let denom = (1.0 - all_inlier_prob).ln();
        if denom >= 0.0 || !denom.is_finite() {
            return self.max_iterations;
        }

        let predicted = self.log_one_minus_confidence / denom;
        if !predicted.is_finite() || predicted >= self.max_iterations as f64 {
            self.max_iterations
        } else {
            predicted.ceil() as usize
        }
    }

    fn clone_box(&self) -> Box<dyn TerminationCriteria> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_model() -> Model {
        Model::zeros(3, 3)
    }

    #[test]
    fn high_inlier_ratio_collapses_the_cap() {
        let mut termination = StandardTermination::new(0.99, 100, 4, 10_000);
        let cap = termination.update(&dummy_model(), 95);
        assert!(cap < 10, "95% inliers must need only a handful of samples");
    }

    #[test]
    fn cap_never_exceeds_the_configured_maximum() {
        let mut termination = StandardTermination::new(0.99, 1000, 7, 5000);
        assert_eq!(termination.update(&dummy_model(), 1), 5000);
        assert_eq!(termination.update(&dummy_model(), 0), 5000);
    }

    #[test]
    fn cap_shrinks_monotonically_with_support() {
        let mut termination = StandardTermination::new(0.99, 200, 4, 100_000);
        let mut previous = usize::MAX;
        for inliers in [20, 60, 100, 140, 180] {
            let cap = termination.update(&dummy_model(), inliers);
            assert!(cap <= previous);
            previous = cap;
        }
    }

    #[test]
    fn all_inliers_terminate_immediately() {
        let mut termination = StandardTermination::new(0.99, 50, 4, 1000);
        assert_eq!(termination.update(&dummy_model(), 50), 0);
    }
}
