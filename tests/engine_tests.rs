//! End-to-end tests of the estimation entry points and the adaptive
//! behavior of the engine on synthetic scenes.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use usac::quality::{Quality, Score};
use usac::types::{mat3_to_model, Model};
use usac::verifier::{ModelVerifier, SprtVerifier};
use usac::Method;

fn apply_h(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let q = h * Vector3::new(x, y, 1.0);
    (q.x / q.z, q.y / q.z)
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[test]
fn homography_on_clean_data_is_recovered_exactly() {
    let h_true = Matrix3::new(1.05, 0.02, 12.0, -0.03, 0.96, -7.0, 2e-5, -1e-5, 1.0);

    // A 10 x 5 grid of image points.
    let n = 50;
    let mut points1 = DMatrix::<f64>::zeros(n, 2);
    let mut points2 = DMatrix::<f64>::zeros(n, 2);
    for i in 0..n {
        let x = (i % 10) as f64 * 60.0;
        let y = (i / 10) as f64 * 55.0;
        let (xp, yp) = apply_h(&h_true, x, y);
        points1[(i, 0)] = x;
        points1[(i, 1)] = y;
        points2[(i, 0)] = xp;
        points2[(i, 1)] = yp;
    }

    let mut mask = Vec::new();
    let h = usac::find_homography(
        &points1,
        &points2,
        1.0,
        0.99,
        10_000,
        Method::Usac,
        Some(&mut mask),
    )
    .expect("homography estimation");

    // The returned matrix is normalized by its bottom-right entry.
    let diff = (h - h_true / h_true[(2, 2)]).norm();
    assert!(diff < 1e-6, "homography off by {diff}");
    assert_eq!(mask.iter().filter(|&&b| b == 1).count(), 50);
}

#[test]
fn homography_with_outliers_keeps_the_inlier_set() {
    let h_true = Matrix3::new(0.98, -0.01, 25.0, 0.02, 1.03, 14.0, 1e-5, 3e-5, 1.0);
    let mut rng = StdRng::seed_from_u64(2024);

    let n = 100;
    let mut points1 = DMatrix::<f64>::zeros(n, 2);
    let mut points2 = DMatrix::<f64>::zeros(n, 2);
    for i in 0..70 {
        let x = rng.gen_range(0.0..640.0);
        let y = rng.gen_range(0.0..480.0);
        let (xp, yp) = apply_h(&h_true, x, y);
        points1[(i, 0)] = x;
        points1[(i, 1)] = y;
        points2[(i, 0)] = xp;
        points2[(i, 1)] = yp;
    }
    for i in 70..100 {
        let x = rng.gen_range(0.0..640.0);
        let y = rng.gen_range(0.0..480.0);
        let (xp, yp) = apply_h(&h_true, x, y);
        // Mismatches displaced well past the inlier threshold.
        let dx = rng.gen_range(15.0..50.0) * if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let dy = rng.gen_range(15.0..50.0) * if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        points1[(i, 0)] = x;
        points1[(i, 1)] = y;
        points2[(i, 0)] = xp + dx;
        points2[(i, 1)] = yp + dy;
    }

    let mut mask = Vec::new();
    usac::find_homography(
        &points1,
        &points2,
        3.0,
        0.99,
        10_000,
        Method::Usac,
        Some(&mut mask),
    )
    .expect("homography estimation");

    let inliers = mask.iter().filter(|&&b| b == 1).count();
    assert!(inliers >= 65, "only {inliers} inliers kept");
    let false_inliers = mask[70..].iter().filter(|&&b| b == 1).count();
    assert_eq!(false_inliers, 0, "outliers leaked into the mask");
}

/// Two-view scene dominated by a plane: 60 coplanar points and 20 points
/// off the plane, observed by two pixel cameras.
fn plane_dominant_scene() -> (DMatrix<f64>, DMatrix<f64>) {
    let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
    let angle: f64 = 0.12;
    let (s, c) = angle.sin_cos();
    let r = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
    let t = Vector3::new(1.0, 0.15, 0.0);

    let project = |p: &Vector3<f64>, second_view: bool| -> (f64, f64) {
        let q = if second_view { k * (r * p + t) } else { k * p };
        (q.x / q.z, q.y / q.z)
    };

    let n = 80;
    let mut points1 = DMatrix::<f64>::zeros(n, 2);
    let mut points2 = DMatrix::<f64>::zeros(n, 2);
    for i in 0..60 {
        // Points on the world plane z = 5.
        let p = Vector3::new(
            (i % 10) as f64 * 0.4 - 2.0,
            (i / 10) as f64 * 0.5 - 1.2,
            5.0,
        );
        let (x1, y1) = project(&p, false);
        let (x2, y2) = project(&p, true);
        points1[(i, 0)] = x1;
        points1[(i, 1)] = y1;
        points2[(i, 0)] = x2;
        points2[(i, 1)] = y2;
    }
    for i in 60..80 {
        let j = i - 60;
        let p = Vector3::new(
            (j % 5) as f64 * 0.8 - 1.5,
            (j / 5) as f64 * 0.7 - 1.0,
            3.0 + (j % 7) as f64 * 0.9,
        );
        let (x1, y1) = project(&p, false);
        let (x2, y2) = project(&p, true);
        points1[(i, 0)] = x1;
        points1[(i, 1)] = y1;
        points2[(i, 0)] = x2;
        points2[(i, 1)] = y2;
    }
    (points1, points2)
}

#[test]
fn fundamental_matrix_survives_a_dominant_plane() {
    let (points1, points2) = plane_dominant_scene();

    let mut mask = Vec::new();
    let f = usac::find_fundamental_mat(
        &points1,
        &points2,
        1.0,
        0.99,
        10_000,
        Method::Usac,
        Some(&mut mask),
    )
    .expect("fundamental estimation");

    // The recovered geometry must explain the off-plane points as well,
    // which a plane-induced fundamental matrix cannot.
    let inliers = mask.iter().filter(|&&b| b == 1).count();
    assert!(inliers >= 75, "only {inliers} of 80 exact points kept");
    let off_plane_inliers = mask[60..].iter().filter(|&&b| b == 1).count();
    assert!(
        off_plane_inliers >= 15,
        "only {off_plane_inliers} off-plane inliers kept"
    );
    assert!(f.determinant().abs() < 1e-6);
}

#[test]
fn essential_matrix_from_calibrated_views() {
    let k = Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0);
    let angle: f64 = 0.2;
    let (s, c) = angle.sin_cos();
    let r = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
    let t = Vector3::new(0.5, 0.1, 0.2);
    let e_true = skew(&t) * r;

    let n = 40;
    let mut points1 = DMatrix::<f64>::zeros(n, 2);
    let mut points2 = DMatrix::<f64>::zeros(n, 2);
    for i in 0..n {
        let p = Vector3::new(
            (i % 8) as f64 * 0.5 - 1.7,
            (i / 8) as f64 * 0.6 - 1.1,
            4.0 + ((i * 3) % 9) as f64 * 0.7,
        );
        let q1 = k * p;
        let q2 = k * (r * p + t);
        points1[(i, 0)] = q1.x / q1.z;
        points1[(i, 1)] = q1.y / q1.z;
        points2[(i, 0)] = q2.x / q2.z;
        points2[(i, 1)] = q2.y / q2.z;
    }

    let mut mask = Vec::new();
    let e = usac::find_essential_mat(
        &points1,
        &points2,
        &k,
        &k,
        2.0,
        0.99,
        10_000,
        Method::Usac,
        Some(&mut mask),
    )
    .expect("essential estimation");

    let inliers = mask.iter().filter(|&&b| b == 1).count();
    assert!(inliers >= 35, "only {inliers} of 40 exact points kept");

    let e_unit = e / e.norm();
    let t_unit = e_true / e_true.norm();
    let diff = ((e_unit - t_unit).norm()).min((e_unit + t_unit).norm());
    assert!(diff < 1e-3, "essential matrix off by {diff}");
}

fn pnp_scene(n: usize) -> (DMatrix<f64>, DMatrix<f64>, Matrix3<f64>, Matrix3<f64>, Vector3<f64>) {
    let k = Matrix3::new(700.0, 0.0, 310.0, 0.0, 700.0, 250.0, 0.0, 0.0, 1.0);
    let angle: f64 = 0.3;
    let (s, c) = angle.sin_cos();
    let r = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
    let t = Vector3::new(0.4, -0.3, 8.0);

    let mut object = DMatrix::<f64>::zeros(n, 3);
    let mut image = DMatrix::<f64>::zeros(n, 2);
    for i in 0..n {
        let p = Vector3::new(
            (i % 5) as f64 * 0.9 - 1.8,
            (i / 5 % 5) as f64 * 0.8 - 1.5,
            ((i * 2) % 7) as f64 * 0.6 - 1.0,
        );
        let q = k * (r * p + t);
        object[(i, 0)] = p.x;
        object[(i, 1)] = p.y;
        object[(i, 2)] = p.z;
        image[(i, 0)] = q.x / q.z;
        image[(i, 1)] = q.y / q.z;
    }
    (object, image, k, r, t)
}

#[test]
fn calibrated_pnp_recovers_the_pose() {
    let (object, image, k, r_true, t_true) = pnp_scene(30);
    let mut mask = Vec::new();
    let pose = usac::solve_pnp_ransac(
        &object,
        &image,
        Some(&k),
        2.0,
        0.99,
        10_000,
        Method::Usac,
        Some(&mut mask),
    )
    .expect("pnp estimation");

    assert!(mask.iter().filter(|&&b| b == 1).count() >= 28);
    assert!((pose.rotation - r_true).norm() < 1e-4);
    assert!((pose.translation - t_true).norm() < 1e-3);
}

#[test]
fn uncalibrated_pnp_recovers_the_pose() {
    let (object, image, _, r_true, t_true) = pnp_scene(30);
    let pose = usac::solve_pnp_ransac(
        &object,
        &image,
        None,
        2.0,
        0.99,
        10_000,
        Method::Usac,
        None,
    )
    .expect("pnp estimation");

    assert!((pose.rotation - r_true).norm() < 1e-4);
    assert!((pose.translation - t_true).norm() < 1e-3);
}

#[test]
fn parallel_entry_point_matches_single_threaded_support() {
    let h_true = Matrix3::new(1.01, 0.0, 8.0, 0.0, 0.99, -4.0, 0.0, 0.0, 1.0);
    let n = 80;
    let mut points1 = DMatrix::<f64>::zeros(n, 2);
    let mut points2 = DMatrix::<f64>::zeros(n, 2);
    for i in 0..60 {
        let x = (i % 10) as f64 * 50.0;
        let y = (i / 10) as f64 * 45.0;
        let (xp, yp) = apply_h(&h_true, x, y);
        points1[(i, 0)] = x;
        points1[(i, 1)] = y;
        points2[(i, 0)] = xp;
        points2[(i, 1)] = yp;
    }
    for i in 60..80 {
        points1[(i, 0)] = (i as f64) * 7.0;
        points1[(i, 1)] = (i as f64) * 3.0;
        points2[(i, 0)] = (i as f64) * 2.0 + 400.0;
        points2[(i, 1)] = (i as f64) * 5.0 + 100.0;
    }

    let mut single_mask = Vec::new();
    usac::find_homography(
        &points1,
        &points2,
        2.0,
        0.99,
        10_000,
        Method::Usac,
        Some(&mut single_mask),
    )
    .expect("single-threaded run");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .expect("thread pool");
    let mut parallel_mask = Vec::new();
    pool.install(|| {
        usac::find_homography(
            &points1,
            &points2,
            2.0,
            0.99,
            10_000,
            Method::UsacParallel,
            Some(&mut parallel_mask),
        )
        .expect("parallel run")
    });

    let single = single_mask.iter().filter(|&&b| b == 1).count();
    let parallel = parallel_mask.iter().filter(|&&b| b == 1).count();
    assert_eq!(single, parallel);
    assert_eq!(single, 60);
}

/// Quality double whose inlier pattern is switched by the bound model: a
/// positive top-left entry selects the 50%-consistent pattern of a good
/// model, anything else the 10% pattern of a bad one.
struct PatternQuality {
    points_size: usize,
    good: bool,
}

impl PatternQuality {
    fn new(points_size: usize) -> Self {
        Self {
            points_size,
            good: false,
        }
    }

    fn pattern(&self, point: usize) -> bool {
        if self.good {
            point % 2 == 0
        } else {
            point % 10 == 0
        }
    }
}

impl Quality for PatternQuality {
    fn score(&mut self, model: &Model) -> Score {
        self.set_model(model);
        let count = (0..self.points_size).filter(|&p| self.pattern(p)).count();
        Score::new(count, -(count as f64))
    }

    fn score_with_inliers(&mut self, model: &Model, inliers: &mut Vec<usize>) -> Score {
        let score = self.score(model);
        inliers.clear();
        inliers.extend((0..self.points_size).filter(|&p| self.pattern(p)));
        score
    }

    fn inliers(&mut self, model: &Model, out: &mut Vec<usize>) -> usize {
        self.score_with_inliers(model, out).inlier_number
    }

    fn inliers_mask(&mut self, model: &Model, mask: &mut [bool]) -> usize {
        self.set_model(model);
        let mut count = 0;
        for (p, flag) in mask.iter_mut().enumerate() {
            *flag = self.pattern(p);
            count += *flag as usize;
        }
        count
    }

    fn set_best_score(&mut self, _cost: f64) {}

    fn set_model(&mut self, model: &Model) {
        self.good = model[(0, 0)] > 0.5;
    }

    fn is_inlier(&self, point: usize) -> bool {
        self.pattern(point)
    }

    fn threshold(&self) -> f64 {
        1.0
    }

    fn clone_box(&self) -> Box<dyn Quality> {
        Box::new(PatternQuality::new(self.points_size))
    }
}

#[test]
fn sprt_statistics_adapt_toward_the_observed_rates() {
    let n = 80;
    let mut quality = PatternQuality::new(n);
    let mut verifier = SprtVerifier::new(11, n, 0.011, 0.01, 100.0, 1.0);

    let good_model = mat3_to_model(&Matrix3::identity());
    let bad_model = mat3_to_model(&(Matrix3::identity() * 0.1));

    // One strongly supported model raises epsilon to its inlier rate.
    assert!(verifier.is_model_good(&mut quality, &good_model));
    let current = *verifier.histories().last().unwrap();
    assert!(
        (current.epsilon - 0.5).abs() / 0.5 < 0.1,
        "epsilon {} far from 0.5",
        current.epsilon
    );

    // A stream of bad models drags delta toward their consistency rate.
    for _ in 0..20 {
        verifier.is_model_good(&mut quality, &bad_model);
    }
    let current = *verifier.histories().last().unwrap();
    assert!(
        current.delta > 0.03 && current.delta < 0.2,
        "delta {} far from 0.1",
        current.delta
    );
    assert!(current.threshold_a > 1.0);

    // Every verification was booked against exactly one test.
    let total: usize = verifier.histories().iter().map(|h| h.tested_samples).sum();
    assert_eq!(total, 21);
}

#[test]
fn nearly_clean_data_is_fully_explained() {
    let h_true = Matrix3::new(1.0, 0.0, 30.0, 0.0, 1.0, -20.0, 0.0, 0.0, 1.0);
    let n = 100;
    let mut points1 = DMatrix::<f64>::zeros(n, 2);
    let mut points2 = DMatrix::<f64>::zeros(n, 2);
    for i in 0..95 {
        let x = (i % 10) as f64 * 35.0;
        let y = (i / 10) as f64 * 30.0;
        let (xp, yp) = apply_h(&h_true, x, y);
        points1[(i, 0)] = x;
        points1[(i, 1)] = y;
        points2[(i, 0)] = xp;
        points2[(i, 1)] = yp;
    }
    for i in 95..100 {
        points1[(i, 0)] = i as f64 * 11.0;
        points1[(i, 1)] = i as f64 * 13.0;
        points2[(i, 0)] = i as f64 * 17.0 + 200.0;
        points2[(i, 1)] = i as f64 * 19.0 + 300.0;
    }

    let mut engine_mask = Vec::new();
    usac::find_homography(
        &points1,
        &points2,
        2.0,
        0.99,
        100_000,
        Method::Usac,
        Some(&mut engine_mask),
    )
    .expect("estimation");
    assert_eq!(engine_mask.iter().filter(|&&b| b == 1).count(), 95);
}
