//! Degenerate sample and model handling.
//!
//! Three layers per geometry: cheap sample screening before the solver runs
//! (homography orientation test), model validity after solving (oriented
//! epipolar constraint), and recovery of fundamental matrices corrupted by
//! a dominant scene plane via plane-and-parallax re-estimation.

use std::sync::Arc;

use log::debug;
use nalgebra::{Matrix3, Vector3};

use crate::quality::{Quality, Score};
use crate::residuals::{ForwardReprojectionError, Residual};
use crate::types::{as_mat3, mat3_to_model, Model, PointSet};
use crate::utils::{skew_symmetric, UniformRandom};

/// Near-zero tolerance for epipole components when deciding whether the
/// cross product of two rows of F collapsed.
const EPIPOLE_ZERO_TOL: f64 = 1.9984e-15;

/// Handles degenerate samples and models of one geometry.
pub trait Degeneracy: Send {
    /// Cheap screening of a minimal sample before the solver runs.
    fn is_sample_good(&self, _sample: &[usize]) -> bool {
        true
    }

    /// Validity of a solved model with respect to its sample.
    fn is_model_valid(&self, _model: &Model, _sample: &[usize]) -> bool {
        true
    }

    /// Detect whether `best_model` is degenerate for `sample` and, when it
    /// is, try to re-estimate a non-degenerate replacement. Returns whether
    /// the model was degenerate; a replacement is only usable when
    /// `recovered_score` beats the caller's best.
    fn recover_if_degenerate(
        &mut self,
        _sample: &[usize],
        _best_model: &Model,
        _recovered_model: &mut Model,
        _recovered_score: &mut Score,
    ) -> bool {
        false
    }

    /// Reseeded copy for a parallel worker.
    fn clone_box(&self, state: u64) -> Box<dyn Degeneracy>;
}

/// Degeneracy handler that accepts everything (PnP).
pub struct NullDegeneracy;

impl Degeneracy for NullDegeneracy {
    fn clone_box(&self, _state: u64) -> Box<dyn Degeneracy> {
        Box::new(NullDegeneracy)
    }
}

/// Screens 4-point homography samples by the orientation of the two
/// quadrilaterals: for each line through a point pair, the signed distances
/// of the remaining points must agree in sign across the images, otherwise
/// the sample cannot come from a planar homeomorphism.
pub struct HomographyDegeneracy {
    points: Arc<PointSet>,
}

impl HomographyDegeneracy {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl Degeneracy for HomographyDegeneracy {
    fn is_sample_good(&self, sample: &[usize]) -> bool {
        let p = |i: usize, c: usize| self.points.at(sample[i], c);
        let (x1, y1, xp1, yp1) = (p(0, 0), p(0, 1), p(0, 2), p(0, 3));
        let (x2, y2, xp2, yp2) = (p(1, 0), p(1, 1), p(1, 2), p(1, 3));
        let (x3, y3, xp3, yp3) = (p(2, 0), p(2, 1), p(2, 2), p(2, 3));
        let (x4, y4, xp4, yp4) = (p(3, 0), p(3, 1), p(3, 2), p(3, 3));

        // Line through points 1 and 2 in both images.
        let (ab_x, ab_y, ab_z) = (y1 - y2, x2 - x1, x1 * y2 - y1 * x2);
        let (ab_px, ab_py, ab_pz) = (yp1 - yp2, xp2 - xp1, xp1 * yp2 - yp1 * xp2);

        if (ab_x * x3 + ab_y * y3 + ab_z) * (ab_px * xp3 + ab_py * yp3 + ab_pz) < 0.0 {
            return false;
        }
        if (ab_x * x4 + ab_y * y4 + ab_z) * (ab_px * xp4 + ab_py * yp4 + ab_pz) < 0.0 {
            return false;
        }

        // Line through points 3 and 4.
        let (cd_x, cd_y, cd_z) = (y3 - y4, x4 - x3, x3 * y4 - y3 * x4);
        let (cd_px, cd_py, cd_pz) = (yp3 - yp4, xp4 - xp3, xp3 * yp4 - yp3 * xp4);

        if (cd_x * x1 + cd_y * y1 + cd_z) * (cd_px * xp1 + cd_py * yp1 + cd_pz) < 0.0 {
            return false;
        }
        if (cd_x * x2 + cd_y * y2 + cd_z) * (cd_px * xp2 + cd_py * yp2 + cd_pz) < 0.0 {
            return false;
        }
        true
    }

    fn clone_box(&self, _state: u64) -> Box<dyn Degeneracy> {
        Box::new(HomographyDegeneracy {
            points: self.points.clone(),
        })
    }
}

/// Oriented epipolar constraint for fundamental and essential matrices: the
/// sample points must all lie on the same side of the tested epipolar
/// geometry.
pub struct EpipolarDegeneracy {
    points: Arc<PointSet>,
}

impl EpipolarDegeneracy {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }

    /// Right epipole as the null vector of F, from the cross product of two
    /// rows; falls back to another row pair when the first collapses.
    fn epipole(f: &Matrix3<f64>) -> Vector3<f64> {
        let e = f.row(0).transpose().cross(&f.row(2).transpose());
        if e.iter().any(|v| v.abs() > EPIPOLE_ZERO_TOL) {
            return e;
        }
        f.row(1).transpose().cross(&f.row(2).transpose())
    }

    /// Sign of the oriented constraint for one correspondence.
    #[inline]
    fn orientation_signum(&self, f: &Matrix3<f64>, e: &Vector3<f64>, point: usize) -> f64 {
        let row = self.points.row(point);
        // (F^T x')_1 expanded: F11 x' + F21 y' + F31, times e'_2 - e'_3 y.
        (f[(0, 0)] * row[2] + f[(1, 0)] * row[3] + f[(2, 0)]) * (e.y - e.z * row[1])
    }
}

impl Degeneracy for EpipolarDegeneracy {
    fn is_model_valid(&self, model: &Model, sample: &[usize]) -> bool {
        let f = as_mat3(model);
        let e = Self::epipole(&f);
        // Without loss of generality the first sample point fixes the sign.
        let sig0 = self.orientation_signum(&f, &e, sample[0]);
        sample[1..]
            .iter()
            .all(|&idx| sig0 * self.orientation_signum(&f, &e, idx) >= 0.0)
    }

    fn clone_box(&self, _state: u64) -> Box<dyn Degeneracy> {
        Box::new(EpipolarDegeneracy {
            points: self.points.clone(),
        })
    }
}

/// Project a fundamental matrix back to rank 2 by zeroing its smallest
/// singular value.
pub fn recover_rank_two(model: &mut Model) {
    let f = as_mat3(model);
    let svd = f.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return;
    };
    let mut w = svd.singular_values;
    w[2] = 0.0;
    let repaired = u * Matrix3::from_diagonal(&w) * v_t;
    *model = mat3_to_model(&repaired);
}

/// Detects fundamental matrices corrupted by a dominant scene plane and
/// repairs them with plane-and-parallax re-estimation.
///
/// Candidate plane homographies are built from triplets of the minimal
/// sample; when at least five sample points lie on such a plane the model is
/// declared degenerate and a new F is searched from pairs of off-plane
/// correspondences.
pub struct FundamentalDegeneracy {
    rng: UniformRandom,
    quality: Box<dyn Quality>,
    points: Arc<PointSet>,
    h_reproj: ForwardReprojectionError,
    epipolar: EpipolarDegeneracy,
    homography_threshold: f64,
    log_confidence: f64,
    triplets: Vec<[usize; 3]>,
    points_size: usize,
    sample_size: usize,
}

impl FundamentalDegeneracy {
    pub fn new(
        state: u64,
        quality: Box<dyn Quality>,
        points: Arc<PointSet>,
        sample_size: usize,
        homography_threshold: f64,
    ) -> Self {
        // Five triplets cover the seven-point sample; the eight-point sample
        // needs five more.
        let mut triplets = vec![[0, 1, 2], [3, 4, 5], [0, 1, 6], [3, 4, 6], [2, 5, 6]];
        if sample_size == 8 {
            triplets.push([0, 1, 7]);
            triplets.push([0, 2, 7]);
            triplets.push([3, 5, 7]);
            triplets.push([3, 6, 7]);
            triplets.push([2, 4, 7]);
        }
        let points_size = points.len();
        Self {
            rng: UniformRandom::new(state),
            quality,
            h_reproj: ForwardReprojectionError::new(points.clone()),
            epipolar: EpipolarDegeneracy::new(points.clone()),
            points,
            homography_threshold,
            log_confidence: 0.05_f64.ln(),
            triplets,
            points_size,
            sample_size,
        }
    }

    /// Left epipole e' with e'^T F = 0, from column cross products.
    fn left_epipole(f: &Matrix3<f64>) -> Vector3<f64> {
        let e = f.column(0).cross(&f.column(2));
        if e.iter().any(|v| v.abs() > 1e-10) {
            return e;
        }
        f.column(1).cross(&f.column(2))
    }

    /// RANSAC over pairs of homography outliers: each off-plane pair spans,
    /// together with the plane homography, a full epipolar geometry
    /// `F = [(x1' x H x1) x (x2' x H x2)]_x H`. The iteration budget shrinks
    /// with the inlier rate of the best candidate.
    fn plane_and_parallax(&mut self, h: &Matrix3<f64>, best_f: &mut Model) -> Score {
        let mut max_iters = 100usize;
        let mut best_score = Score::worst();
        self.h_reproj.set_homography(h);

        let mut iters = 0;
        while iters < max_iters {
            iters += 1;

            let out1 = self.rng.uniform(self.points_size);
            let mut out2 = self.rng.uniform(self.points_size);
            while out1 == out2 {
                out2 = self.rng.uniform(self.points_size);
            }

            // Both points must be outliers of the plane.
            if self.h_reproj.error(out1) <= self.homography_threshold
                || self.h_reproj.error(out2) <= self.homography_threshold
            {
                continue;
            }

            let r1 = self.points.row(out1);
            let r2 = self.points.row(out2);
            let p1 = Vector3::new(r1[0], r1[1], 1.0);
            let p2 = Vector3::new(r2[0], r2[1], 1.0);
            let p1_prime = Vector3::new(r1[2], r1[3], 1.0);
            let p2_prime = Vector3::new(r2[2], r2[3], 1.0);

            let line = (p1_prime.cross(&(h * p1))).cross(&(p2_prime.cross(&(h * p2))));
            let f = skew_symmetric(&line) * h;
            let model = mat3_to_model(&f);

            let score = self.quality.score(&model);
            if score.is_better(&best_score) {
                best_score = score;
                *best_f = model;

                let inlier_rate = score.inlier_number as f64 / self.points_size as f64;
                let predicted = self.log_confidence / (1.0 - inlier_rate * inlier_rate).ln();
                if predicted.is_finite() && (predicted as usize) < max_iters {
                    max_iters = predicted as usize;
                }
            }
        }
        best_score
    }
}

impl Degeneracy for FundamentalDegeneracy {
    fn is_model_valid(&self, model: &Model, sample: &[usize]) -> bool {
        self.epipolar.is_model_valid(model, sample)
    }

    fn recover_if_degenerate(
        &mut self,
        sample: &[usize],
        best_model: &Model,
        recovered_model: &mut Model,
        recovered_score: &mut Score,
    ) -> bool {
        *recovered_score = Score::worst();

        let f_best = as_mat3(best_model);
        let e_prime = Self::left_epipole(&f_best);
        let a = skew_symmetric(&e_prime) * f_best;

        let mut m = Matrix3::zeros();
        m[(0, 2)] = 1.0;
        m[(1, 2)] = 1.0;
        m[(2, 2)] = 1.0;
        let mut b = Vector3::zeros();

        let mut is_degenerate = false;
        for t in 0..self.triplets.len() {
            let triplet = self.triplets[t];
            for (pt, &sample_pos) in triplet.iter().enumerate() {
                let row = self.points.row(sample[sample_pos]);
                let xi = Vector3::new(row[0], row[1], 1.0);
                let xi_prime = Vector3::new(row[2], row[3], 1.0);

                let xp_cross_ep = xi_prime.cross(&e_prime);
                let xp_cross_ax = xi_prime.cross(&(a * xi));
                b[pt] = xp_cross_ax.dot(&xp_cross_ep) / xp_cross_ep.norm_squared();

                m[(pt, 0)] = xi.x;
                m[(pt, 1)] = xi.y;
            }

            let Some(m_inv) = m.try_inverse() else {
                continue;
            };
            // Plane homography compatible with F and the triplet.
            let h = a - e_prime * (m_inv * b).transpose();

            self.h_reproj.set_homography(&h);
            let inliers_on_plane = (0..self.sample_size)
                .filter(|&s| self.h_reproj.error(sample[s]) < self.homography_threshold)
                .count();

            if inliers_on_plane >= 5 {
                is_degenerate = true;
                debug!(
                    "dominant plane: {} of {} sample points on a homography",
                    inliers_on_plane, self.sample_size
                );

                let mut new_f = Model::zeros(3, 3);
                let new_score = self.plane_and_parallax(&h, &mut new_f);
                if new_score.is_better(recovered_score) {
                    *recovered_score = new_score;
                    *recovered_model = new_f;
                }
            }
        }
        is_degenerate
    }

    fn clone_box(&self, state: u64) -> Box<dyn Degeneracy> {
        Box::new(FundamentalDegeneracy::new(
            state,
            self.quality.clone_box(),
            self.points.clone(),
            self.sample_size,
            self.homography_threshold,
        ))
    }
}
