//! Model scoring: inlier counting (RANSAC) and truncated residual sums
//! (MSAC), both with an early exit against the best score seen so far.

use crate::residuals::Residual;
use crate::types::Model;

/// Quality of a model over the whole point set.
///
/// Lower `cost` is better; ties break to the higher inlier count. The
/// sentinel [`Score::worst`] loses against every evaluated model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub inlier_number: usize,
    pub cost: f64,
}

impl Score {
    pub fn new(inlier_number: usize, cost: f64) -> Self {
        Self { inlier_number, cost }
    }

    /// The score every evaluated model beats.
    pub fn worst() -> Self {
        Self {
            inlier_number: 0,
            cost: f64::INFINITY,
        }
    }

    /// Strictly better than `other`.
    #[inline]
    pub fn is_better(&self, other: &Score) -> bool {
        self.cost < other.cost
            || (self.cost == other.cost && self.inlier_number > other.inlier_number)
    }
}

impl Default for Score {
    fn default() -> Self {
        Self::worst()
    }
}

/// Scores models and answers per-point inlier queries for the last bound
/// model.
pub trait Quality: Send {
    /// Evaluate a model over all points.
    fn score(&mut self, model: &Model) -> Score;

    /// Evaluate a model and collect the inlier indices.
    fn score_with_inliers(&mut self, model: &Model, inliers: &mut Vec<usize>) -> Score;

    /// Collect inlier indices of a model without the scoring early exit.
    fn inliers(&mut self, model: &Model, out: &mut Vec<usize>) -> usize;

    /// Fill a boolean inlier mask of length N; returns the inlier count.
    fn inliers_mask(&mut self, model: &Model, mask: &mut [bool]) -> usize;

    /// Install the early-exit bound: evaluation of a model that provably
    /// cannot beat this cost stops early.
    fn set_best_score(&mut self, cost: f64);

    /// Bind a model for subsequent [`Quality::is_inlier`] queries.
    fn set_model(&mut self, model: &Model);

    /// Whether a point is an inlier of the last bound model.
    fn is_inlier(&self, point: usize) -> bool;

    fn threshold(&self) -> f64;

    fn clone_box(&self) -> Box<dyn Quality>;
}

/// RANSAC quality: cost is the negated inlier count.
pub struct RansacQuality {
    points_size: usize,
    threshold: f64,
    residual: Box<dyn Residual>,
    best_cost: f64,
}

impl RansacQuality {
    pub fn new(points_size: usize, threshold: f64, residual: Box<dyn Residual>) -> Self {
        Self {
            points_size,
            threshold,
            residual,
            best_cost: f64::MAX,
        }
    }

    fn evaluate(&mut self, model: &Model, mut inliers: Option<&mut Vec<usize>>) -> Score {
        self.residual.set_model(model);
        if let Some(out) = inliers.as_mut() {
            out.clear();
        }

        let mut inlier_number = 0usize;
        for point in 0..self.points_size {
            if self.residual.error(point) < self.threshold {
                inlier_number += 1;
                if let Some(out) = inliers.as_mut() {
                    out.push(point);
                }
            }
            // Even if every remaining point were an inlier the best count
            // cannot be reached; the model already lost.
            if ((inlier_number + (self.points_size - point - 1)) as f64) < -self.best_cost {
                break;
            }
        }
        Score::new(inlier_number, -(inlier_number as f64))
    }
}

impl Quality for RansacQuality {
    fn score(&mut self, model: &Model) -> Score {
        self.evaluate(model, None)
    }

    fn score_with_inliers(&mut self, model: &Model, inliers: &mut Vec<usize>) -> Score {
        self.evaluate(model, Some(inliers))
    }

    fn inliers(&mut self, model: &Model, out: &mut Vec<usize>) -> usize {
        self.residual.set_model(model);
        out.clear();
        for point in 0..self.points_size {
            if self.residual.error(point) < self.threshold {
                out.push(point);
            }
        }
        out.len()
    }

    fn inliers_mask(&mut self, model: &Model, mask: &mut [bool]) -> usize {
        self.residual.set_model(model);
        let mut count = 0;
        for (point, flag) in mask.iter_mut().enumerate().take(self.points_size) {
            *flag = self.residual.error(point) < self.threshold;
            count += *flag as usize;
        }
        count
    }

    fn set_best_score(&mut self, cost: f64) {
        self.best_cost = cost;
    }

    fn set_model(&mut self, model: &Model) {
        self.residual.set_model(model);
    }

    fn is_inlier(&self, point: usize) -> bool {
        self.residual.error(point) < self.threshold
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn clone_box(&self) -> Box<dyn Quality> {
        Box::new(RansacQuality {
            points_size: self.points_size,
            threshold: self.threshold,
            residual: self.residual.clone_box(),
            best_cost: self.best_cost,
        })
    }
}

/// MSAC quality: cost is the sum of residuals truncated at the threshold.
pub struct MsacQuality {
    points_size: usize,
    threshold: f64,
    residual: Box<dyn Residual>,
    best_cost: f64,
}

impl MsacQuality {
    pub fn new(points_size: usize, threshold: f64, residual: Box<dyn Residual>) -> Self {
        Self {
            points_size,
            threshold,
            residual,
            best_cost: f64::MAX,
        }
    }

    fn evaluate(&mut self, model: &Model, mut inliers: Option<&mut Vec<usize>>) -> Score {
        self.residual.set_model(model);
        if let Some(out) = inliers.as_mut() {
            out.clear();
        }

        let mut inlier_number = 0usize;
        let mut sum_errors = 0.0;
        for point in 0..self.points_size {
            let err = self.residual.error(point);
            if err < self.threshold {
                sum_errors += err;
                inlier_number += 1;
                if let Some(out) = inliers.as_mut() {
                    out.push(point);
                }
            } else {
                sum_errors += self.threshold;
            }
            // The truncated sum only grows; past the best cost the model
            // already lost.
            if sum_errors > self.best_cost {
                break;
            }
        }
        Score::new(inlier_number, sum_errors)
    }
}

impl Quality for MsacQuality {
    fn score(&mut self, model: &Model) -> Score {
        self.evaluate(model, None)
    }

    fn score_with_inliers(&mut self, model: &Model, inliers: &mut Vec<usize>) -> Score {
        self.evaluate(model, Some(inliers))
    }

    fn inliers(&mut self, model: &Model, out: &mut Vec<usize>) -> usize {
        self.residual.set_model(model);
        out.clear();
        for point in 0..self.points_size {
            if self.residual.error(point) < self.threshold {
                out.push(point);
            }
        }
        out.len()
    }

    fn inliers_mask(&mut self, model: &Model, mask: &mut [bool]) -> usize {
        self.residual.set_model(model);
        let mut count = 0;
        for (point, flag) in mask.iter_mut().enumerate().take(self.points_size) {
            *flag = self.residual.error(point) < self.threshold;
            count += *flag as usize;
        }
        count
    }

    fn set_best_score(&mut self, cost: f64) {
        self.best_cost = cost;
    }

    fn set_model(&mut self, model: &Model) {
        self.residual.set_model(model);
    }

    fn is_inlier(&self, point: usize) -> bool {
        self.residual.error(point) < self.threshold
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn clone_box(&self) -> Box<dyn Quality> {
        Box::new(MsacQuality {
            points_size: self.points_size,
            threshold: self.threshold,
            residual: self.residual.clone_box(),
            best_cost: self.best_cost,
        })
    }
}
