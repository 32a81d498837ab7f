//! Public estimation entry points, one per geometry.
//!
//! Each function validates and packs the input arrays, assembles the full
//! component stack for its estimator kind, runs the selected controller and
//! returns the model matrix, optionally writing the 0/1-byte inlier mask
//! into the caller's buffer.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::degeneracy::{
    Degeneracy, EpipolarDegeneracy, FundamentalDegeneracy, HomographyDegeneracy, NullDegeneracy,
};
use crate::error::EstimateError;
use crate::local_optimization::{InnerRansacOptimization, LeastSquaresPolisher};
use crate::quality::{MsacQuality, Quality};
use crate::residuals::{
    ForwardReprojectionError, ProjectionReprojectionError, Residual, SampsonError,
    SymmetricGeometricError,
};
use crate::ransac::{Ransac, RansacOutput};
use crate::samplers::UniformSampler;
use crate::settings::{
    EstimationMethod, LocalOptimMethod, Method, Params, PolishingMethod, ScoreMethod,
    VerificationMethod,
};
use crate::solvers::{
    Estimator, EssentialMinimalSolver, EssentialNonMinimalSolver, FundamentalMinimalSolver7pt,
    FundamentalNonMinimalSolver, HomographyMinimalSolver, HomographyNonMinimalSolver, P3pSolver,
    P6pSolver, PnpNonMinimalSolver,
};
use crate::termination::StandardTermination;
use crate::types::{as_mat3, Model, PointSet};
use crate::verifier::SprtScore;

/// Squared-pixel reprojection bound used to collect points on a candidate
/// scene plane during fundamental-matrix degeneracy handling.
const PLANE_HOMOGRAPHY_THRESHOLD: f64 = 8.0;

/// Camera pose recovered by [`solve_pnp_ransac`].
#[derive(Debug, Clone)]
pub struct PnpPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// Interleave two point arrays into one correspondence buffer.
///
/// `points1` are image points (N x 2); `points2` are image points (N x 2)
/// or, for 2D-3D problems, object points (N x 3).
fn merge_points(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    pnp: bool,
) -> Result<PointSet, EstimateError> {
    if points1.nrows() != points2.nrows() {
        return Err(EstimateError::InvalidInput(format!(
            "point counts differ: {} vs {}",
            points1.nrows(),
            points2.nrows()
        )));
    }
    if points1.ncols() != 2 {
        return Err(EstimateError::InvalidInput(format!(
            "image points must be N x 2, got N x {}",
            points1.ncols()
        )));
    }
    let expected = if pnp { 3 } else { 2 };
    if points2.ncols() != expected {
        return Err(EstimateError::InvalidInput(format!(
            "second point array must be N x {expected}, got N x {}",
            points2.ncols()
        )));
    }

    let n = points1.nrows();
    let stride = 2 + expected;
    let mut data = Vec::with_capacity(n * stride);
    for i in 0..n {
        data.push(points1[(i, 0)]);
        data.push(points1[(i, 1)]);
        for c in 0..expected {
            data.push(points2[(i, c)]);
        }
    }
    Ok(PointSet::new(data, stride))
}

fn check_size(points: &PointSet, params: &Params) -> Result<(), EstimateError> {
    if points.len() < params.sample_size() {
        return Err(EstimateError::InsufficientData {
            required: params.sample_size(),
            actual: points.len(),
        });
    }
    Ok(())
}

fn write_mask(mask: Option<&mut Vec<u8>>, output: &RansacOutput) {
    if let Some(out) = mask {
        *out = output.mask_bytes();
    }
}

/// Common assembly: MSAC quality, SPRT score verifier, uniform sampler,
/// inner-RANSAC local optimization and least-squares polishing.
#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    params: Params,
    points: Arc<PointSet>,
    residual: Box<dyn Residual>,
    estimator: Estimator,
    degeneracy: Box<dyn Degeneracy>,
    lo_iterations: usize,
    method: Method,
) -> Result<RansacOutput, EstimateError> {
    let n = points.len();
    let mut state = 0u64;
    let mut next_state = || {
        let s = state;
        state += 1;
        s
    };

    let quality: Box<dyn Quality> =
        Box::new(MsacQuality::new(n, params.threshold, residual.clone_box()));
    let verifier = Box::new(SprtScore::new(
        next_state(),
        residual.clone_box(),
        n,
        params.threshold,
        params.sprt_epsilon,
        params.sprt_delta,
        params.time_for_model_estimation,
        params.avg_num_models,
        params.score,
    ));
    let sampler = Box::new(UniformSampler::new(
        next_state(),
        params.sample_size(),
        n,
    ));
    let termination = Box::new(StandardTermination::new(
        params.confidence,
        n,
        params.sample_size(),
        params.max_iterations,
    ));
    let local_optimization = Box::new(InnerRansacOptimization::new(
        next_state(),
        estimator.clone_with_state(next_state()),
        quality.clone_box(),
        n,
        lo_iterations,
        params.lo_sample_size,
    ));
    let polisher = Box::new(LeastSquaresPolisher::new(
        estimator.clone_with_state(next_state()),
        quality.clone_box(),
        params.final_lsq_iterations,
    ));

    let state = next_state();
    let mut engine = Ransac::new(
        params,
        points,
        estimator,
        quality,
        sampler,
        termination,
        verifier,
        degeneracy,
        Some(local_optimization),
        Some(polisher),
        method == Method::UsacParallel,
        state,
    );
    engine.run()
}

/// Estimate a homography between two images from point correspondences.
///
/// `threshold` is the inlier bound on the forward reprojection distance in
/// pixels. Returns the 3x3 matrix normalized so its bottom-right entry is
/// one; when `mask` is given it receives one 0/1 byte per correspondence.
pub fn find_homography(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    threshold: f64,
    confidence: f64,
    max_iterations: usize,
    method: Method,
    mask: Option<&mut Vec<u8>>,
) -> Result<Matrix3<f64>, EstimateError> {
    let points = merge_points(points1, points2, false)?.into_shared();

    let mut params = Params::new(
        EstimationMethod::Homography,
        threshold,
        confidence,
        max_iterations,
        ScoreMethod::Msac,
    );
    params.set_local_optimization(LocalOptimMethod::InnerRansac);
    params.set_polisher(PolishingMethod::LeastSquares);
    params.set_verifier(VerificationMethod::Sprt);
    params.set_mask_required(mask.is_some());
    check_size(&points, &params)?;

    let residual = Box::new(ForwardReprojectionError::new(points.clone()));
    let estimator = Estimator::new(
        Box::new(HomographyMinimalSolver::new(points.clone())),
        Box::new(HomographyNonMinimalSolver::new(points.clone())),
        Box::new(HomographyDegeneracy::new(points.clone())),
    );
    let degeneracy = Box::new(HomographyDegeneracy::new(points.clone()));

    let output = run_pipeline(params, points, residual, estimator, degeneracy, 10, method)?;
    write_mask(mask, &output);

    let h = as_mat3(&output.model);
    if h[(2, 2)].abs() > f64::EPSILON {
        Ok(h / h[(2, 2)])
    } else {
        Ok(h)
    }
}

/// Estimate the fundamental matrix between two uncalibrated views.
///
/// Uses the seven-point solver with plane-and-parallax degeneracy recovery;
/// `threshold` bounds the Sampson error.
pub fn find_fundamental_mat(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    threshold: f64,
    confidence: f64,
    max_iterations: usize,
    method: Method,
    mask: Option<&mut Vec<u8>>,
) -> Result<Matrix3<f64>, EstimateError> {
    let points = merge_points(points1, points2, false)?.into_shared();

    let mut params = Params::new(
        EstimationMethod::Fundamental,
        threshold,
        confidence,
        max_iterations,
        ScoreMethod::Msac,
    );
    params.set_local_optimization(LocalOptimMethod::InnerRansac);
    params.set_polisher(PolishingMethod::LeastSquares);
    params.set_verifier(VerificationMethod::Sprt);
    params.set_mask_required(mask.is_some());
    check_size(&points, &params)?;

    let residual = Box::new(SampsonError::new(points.clone()));
    let quality_for_degeneracy: Box<dyn Quality> =
        Box::new(MsacQuality::new(points.len(), params.threshold, residual.clone_box()));
    let degeneracy = Box::new(FundamentalDegeneracy::new(
        0,
        quality_for_degeneracy,
        points.clone(),
        params.sample_size(),
        PLANE_HOMOGRAPHY_THRESHOLD,
    ));
    let estimator = Estimator::new(
        Box::new(FundamentalMinimalSolver7pt::new(points.clone())),
        Box::new(FundamentalNonMinimalSolver::new(points.clone())),
        Box::new(EpipolarDegeneracy::new(points.clone())),
    );

    let output = run_pipeline(params, points, residual, estimator, degeneracy, 10, method)?;
    write_mask(mask, &output);
    Ok(as_mat3(&output.model))
}

/// Estimate the essential matrix between two calibrated views.
///
/// Points are premultiplied by the inverse intrinsics and the pixel
/// `threshold` is rescaled by the mean focal length, so the returned matrix
/// relates normalized image coordinates.
#[allow(clippy::too_many_arguments)]
pub fn find_essential_mat(
    points1: &DMatrix<f64>,
    points2: &DMatrix<f64>,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
    threshold: f64,
    confidence: f64,
    max_iterations: usize,
    method: Method,
    mask: Option<&mut Vec<u8>>,
) -> Result<Matrix3<f64>, EstimateError> {
    let pixels = merge_points(points1, points2, false)?;

    let Some(k1_inv) = k1.try_inverse() else {
        return Err(EstimateError::InvalidInput("singular intrinsics k1".into()));
    };
    let Some(k2_inv) = k2.try_inverse() else {
        return Err(EstimateError::InvalidInput("singular intrinsics k2".into()));
    };

    // Calibrate the correspondences once up front.
    let n = pixels.len();
    let mut data = Vec::with_capacity(n * 4);
    for i in 0..n {
        let row = pixels.row(i);
        let p1 = k1_inv * Vector3::new(row[0], row[1], 1.0);
        let p2 = k2_inv * Vector3::new(row[2], row[3], 1.0);
        data.extend_from_slice(&[p1.x / p1.z, p1.y / p1.z, p2.x / p2.z, p2.y / p2.z]);
    }
    let points = PointSet::new(data, 4).into_shared();

    let mean_focal = (k1[(0, 0)] + k1[(1, 1)] + k2[(0, 0)] + k2[(1, 1)]) / 4.0;
    let calibrated_threshold = threshold / mean_focal;

    let mut params = Params::new(
        EstimationMethod::Essential,
        calibrated_threshold,
        confidence,
        max_iterations,
        ScoreMethod::Msac,
    );
    params.set_local_optimization(LocalOptimMethod::InnerRansac);
    params.set_polisher(PolishingMethod::LeastSquares);
    params.set_verifier(VerificationMethod::Sprt);
    params.set_mask_required(mask.is_some());
    check_size(&points, &params)?;

    let residual = Box::new(SymmetricGeometricError::new(points.clone()));
    let estimator = Estimator::new(
        Box::new(EssentialMinimalSolver::new(points.clone())),
        Box::new(EssentialNonMinimalSolver::new(points.clone())),
        Box::new(EpipolarDegeneracy::new(points.clone())),
    );
    let degeneracy = Box::new(EpipolarDegeneracy::new(points.clone()));

    let output = run_pipeline(params, points, residual, estimator, degeneracy, 7, method)?;
    write_mask(mask, &output);
    Ok(as_mat3(&output.model))
}

/// Estimate the absolute pose of a calibrated or uncalibrated camera from
/// 3D-2D correspondences.
///
/// With intrinsics the P3P solver runs on calibrated rays; without them the
/// six-point direct linear transform estimates a full projection matrix.
/// `threshold` bounds the reprojection distance in pixels.
#[allow(clippy::too_many_arguments)]
pub fn solve_pnp_ransac(
    object_points: &DMatrix<f64>,
    image_points: &DMatrix<f64>,
    k: Option<&Matrix3<f64>>,
    threshold: f64,
    confidence: f64,
    max_iterations: usize,
    method: Method,
    mask: Option<&mut Vec<u8>>,
) -> Result<PnpPose, EstimateError> {
    let points = merge_points(image_points, object_points, true)?.into_shared();

    let estimation = if k.is_some() {
        EstimationMethod::P3P
    } else {
        EstimationMethod::P6P
    };
    let mut params = Params::new(
        estimation,
        threshold,
        confidence,
        max_iterations,
        ScoreMethod::Msac,
    );
    params.set_local_optimization(LocalOptimMethod::InnerRansac);
    params.set_polisher(PolishingMethod::LeastSquares);
    params.set_verifier(VerificationMethod::Sprt);
    params.set_mask_required(mask.is_some());
    check_size(&points, &params)?;

    let residual = Box::new(ProjectionReprojectionError::new(points.clone()));
    let estimator = match k {
        Some(k) => {
            let Some(k_inv) = k.try_inverse() else {
                return Err(EstimateError::InvalidInput("singular intrinsics".into()));
            };
            // Normalized rays alongside the world points for the minimal
            // solver; residuals stay on the pixel buffer.
            let n = points.len();
            let mut data = Vec::with_capacity(n * 5);
            for i in 0..n {
                let row = points.row(i);
                let ray = k_inv * Vector3::new(row[0], row[1], 1.0);
                data.extend_from_slice(&[ray.x / ray.z, ray.y / ray.z, row[2], row[3], row[4]]);
            }
            let calibrated = PointSet::new(data, 5).into_shared();
            Estimator::new(
                Box::new(P3pSolver::new(calibrated, *k)),
                Box::new(PnpNonMinimalSolver::new(points.clone())),
                Box::new(NullDegeneracy),
            )
        }
        None => Estimator::new(
            Box::new(P6pSolver::new(points.clone())),
            Box::new(PnpNonMinimalSolver::new(points.clone())),
            Box::new(NullDegeneracy),
        ),
    };

    let output = run_pipeline(
        params,
        points,
        residual,
        estimator,
        Box::new(NullDegeneracy),
        3,
        method,
    )?;
    write_mask(mask, &output);

    let pose = match k {
        Some(k) => {
            let k_inv = k.try_inverse().expect("checked above");
            decompose_calibrated(&output.model, &k_inv)
        }
        None => decompose_projection(&output.model),
    };
    Ok(pose)
}

/// Split `K [R | t]` given the inverse intrinsics: scale away, project onto
/// the rotation group, fix the projective sign.
fn decompose_calibrated(model: &Model, k_inv: &Matrix3<f64>) -> PnpPose {
    let mut rt = Matrix3::zeros();
    let mut t = Vector3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            rt[(r, c)] = model[(r, c)];
        }
        t[r] = model[(r, 3)];
    }
    let mut r_raw = k_inv * rt;
    let mut t = k_inv * t;

    if r_raw.determinant() < 0.0 {
        r_raw = -r_raw;
        t = -t;
    }

    let svd = r_raw.svd(true, true);
    let (u, v_t) = (svd.u.expect("svd"), svd.v_t.expect("svd"));
    let scale = svd.singular_values.sum() / 3.0;
    PnpPose {
        rotation: u * v_t,
        translation: t / scale,
    }
}

/// RQ decomposition of a full projection matrix into intrinsics and pose;
/// only the pose is returned.
fn decompose_projection(model: &Model) -> PnpPose {
    let m = Matrix3::from_fn(|r, c| model[(r, c)]);
    let p4 = Vector3::new(model[(0, 3)], model[(1, 3)], model[(2, 3)]);

    // RQ via QR of the row-reversed transpose.
    let flip = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let qr = (flip * m).transpose().qr();
    let q = qr.q();
    let r = qr.r();
    let mut k = flip * r.transpose() * flip;
    let mut rot = flip * q.transpose();

    // Positive diagonal of the intrinsics.
    let signs = Vector3::new(
        k[(0, 0)].signum(),
        k[(1, 1)].signum(),
        k[(2, 2)].signum(),
    );
    let d = Matrix3::from_diagonal(&signs);
    k *= d;
    rot = d * rot;

    let mut t = k.try_inverse().map(|ki| ki * p4).unwrap_or_else(Vector3::zeros);
    if rot.determinant() < 0.0 {
        rot = -rot;
        t = -t;
    }
    PnpPose {
        rotation: rot,
        translation: t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn mismatched_shapes_are_rejected() {
        let a = DMatrix::<f64>::zeros(10, 2);
        let b = DMatrix::<f64>::zeros(9, 2);
        match find_homography(&a, &b, 3.0, 0.99, 100, Method::Usac, None) {
            Err(EstimateError::InvalidInput(_)) => {}
            other => panic!("expected InvalidInput, got {other:?}"),
        }

        let c = DMatrix::<f64>::zeros(10, 3);
        assert!(matches!(
            find_homography(&a, &c, 3.0, 0.99, 100, Method::Usac, None),
            Err(EstimateError::InvalidInput(_))
        ));
    }

    #[test]
    fn too_few_correspondences_are_rejected() {
        let a = DMatrix::<f64>::zeros(3, 2);
        let b = DMatrix::<f64>::zeros(3, 2);
        match find_homography(&a, &b, 3.0, 0.99, 100, Method::Usac, None) {
            Err(EstimateError::InsufficientData { required, actual }) => {
                assert_eq!(required, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }

        let a = DMatrix::<f64>::zeros(6, 2);
        let b = DMatrix::<f64>::zeros(6, 2);
        assert!(matches!(
            find_fundamental_mat(&a, &b, 1.0, 0.99, 100, Method::Usac, None),
            Err(EstimateError::InsufficientData { required: 7, .. })
        ));
    }

    #[test]
    fn projection_decomposition_round_trips() {
        let angle: f64 = 0.3;
        let (s, c) = angle.sin_cos();
        let rot = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
        let t = Vector3::new(0.5, -0.2, 4.0);
        let k = Matrix3::new(750.0, 0.0, 300.0, 0.0, 700.0, 260.0, 0.0, 0.0, 1.0);

        let mut model = Model::zeros(3, 4);
        let kr = k * rot;
        let kt = k * t;
        for r in 0..3 {
            for col in 0..3 {
                model[(r, col)] = kr[(r, col)];
            }
            model[(r, 3)] = kt[r];
        }
        // An arbitrary projective scale must not matter.
        model *= -2.5;

        let pose = decompose_projection(&model);
        assert_abs_diff_eq!((pose.rotation - rot).norm(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!((pose.translation - t).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn calibrated_decomposition_recovers_the_pose() {
        let angle: f64 = -0.2;
        let (s, c) = angle.sin_cos();
        let rot = Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c);
        let t = Vector3::new(-0.3, 0.8, 5.0);
        let k = Matrix3::new(800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0);

        let mut model = Model::zeros(3, 4);
        let kr = k * rot;
        let kt = k * t;
        for r in 0..3 {
            for col in 0..3 {
                model[(r, col)] = kr[(r, col)];
            }
            model[(r, 3)] = kt[r];
        }
        model *= 3.0;

        let pose = decompose_calibrated(&model, &k.try_inverse().unwrap());
        assert_abs_diff_eq!((pose.rotation - rot).norm(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!((pose.translation - t).norm(), 0.0, epsilon = 1e-9);
    }
}
