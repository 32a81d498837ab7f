//! Essential matrix solvers for calibrated views.
//!
//! The minimal solver is the five-point method: the epipolar system leaves
//! a four-dimensional null space `E = x E1 + y E2 + z E3 + E4`; the rank
//! and trace constraints give ten cubic equations in `(x, y, z)` whose
//! Gauss-Jordan reduction collapses to a degree-10 polynomial in `z`. The
//! polynomial bookkeeping is done with a small dense trivariate type
//! instead of transcribed coefficient tables.

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::solvers::fundamental::eight_point_fit;
use crate::solvers::{MinimalSolver, NonMinimalSolver};
use crate::types::{as_mat3, mat3_to_model, Model, PointSet};
use crate::utils::real_roots_bracketed;

/// Monomials of degree <= 3 in (x, y, z) as exponent triples. The first ten
/// carry x,y-degree >= 2 and form the eliminated block; the last ten are the
/// tail `[xz^2, yz^2, xz, yz, x, y, z^3, z^2, z, 1]`.
const MONOMIALS: [(u8, u8, u8); 20] = [
    (3, 0, 0),
    (0, 3, 0),
    (2, 1, 0),
    (1, 2, 0),
    (2, 0, 1),
    (0, 2, 1),
    (1, 1, 1),
    (2, 0, 0),
    (0, 2, 0),
    (1, 1, 0),
    (1, 0, 2),
    (0, 1, 2),
    (1, 0, 1),
    (0, 1, 1),
    (1, 0, 0),
    (0, 1, 0),
    (0, 0, 3),
    (0, 0, 2),
    (0, 0, 1),
    (0, 0, 0),
];

fn mono_index(exponents: (u8, u8, u8)) -> usize {
    MONOMIALS
        .iter()
        .position(|&m| m == exponents)
        .expect("monomial exceeds degree three")
}

/// Dense polynomial over the 20 monomials of degree <= 3.
#[derive(Clone, Copy)]
struct Poly3([f64; 20]);

impl Poly3 {
    fn zero() -> Self {
        Poly3([0.0; 20])
    }

    /// `a x + b y + c z + d`.
    fn linear(a: f64, b: f64, c: f64, d: f64) -> Self {
        let mut p = Self::zero();
        p.0[mono_index((1, 0, 0))] = a;
        p.0[mono_index((0, 1, 0))] = b;
        p.0[mono_index((0, 0, 1))] = c;
        p.0[mono_index((0, 0, 0))] = d;
        p
    }

    fn add(&self, other: &Poly3) -> Poly3 {
        let mut out = *self;
        for (o, v) in out.0.iter_mut().zip(other.0.iter()) {
            *o += v;
        }
        out
    }

    fn sub(&self, other: &Poly3) -> Poly3 {
        let mut out = *self;
        for (o, v) in out.0.iter_mut().zip(other.0.iter()) {
            *o -= v;
        }
        out
    }

    fn scale(&self, s: f64) -> Poly3 {
        let mut out = *self;
        for o in out.0.iter_mut() {
            *o *= s;
        }
        out
    }

    /// Product; the caller guarantees the result stays within degree 3.
    fn mul(&self, other: &Poly3) -> Poly3 {
        let mut out = Self::zero();
        for (i, &a) in self.0.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            let (xi, yi, zi) = MONOMIALS[i];
            for (j, &b) in other.0.iter().enumerate() {
                if b == 0.0 {
                    continue;
                }
                let (xj, yj, zj) = MONOMIALS[j];
                let idx = mono_index((xi + xj, yi + yj, zi + zj));
                out.0[idx] += a * b;
            }
        }
        out
    }
}

/// Ascending-coefficient univariate polynomial product.
fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

fn poly_sub(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len().max(b.len())];
    for (i, &v) in a.iter().enumerate() {
        out[i] += v;
    }
    for (i, &v) in b.iter().enumerate() {
        out[i] -= v;
    }
    out
}

/// Multiply by z: shift the coefficients up by one degree.
fn poly_shift(a: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0];
    out.extend_from_slice(a);
    out
}

/// Five-point minimal solver; up to ten essential matrices per sample.
#[derive(Clone)]
pub struct EssentialMinimalSolver {
    points: Arc<PointSet>,
}

impl EssentialMinimalSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl MinimalSolver for EssentialMinimalSolver {
    fn sample_size(&self) -> usize {
        5
    }

    fn max_solutions(&self) -> usize {
        10
    }

    fn estimate(&self, sample: &[usize], models: &mut Vec<Model>) -> usize {
        // Null space of the 5x9 epipolar system.
        let mut a = DMatrix::<f64>::zeros(5, 9);
        for (i, &idx) in sample.iter().take(5).enumerate() {
            let row = self.points.row(idx);
            let (x1, y1, x2, y2) = (row[0], row[1], row[2], row[3]);
            let coeffs = [x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0];
            for (j, v) in coeffs.iter().enumerate() {
                a[(i, j)] = *v;
            }
        }
        let ata = a.transpose() * &a;
        let svd = ata.svd(false, true);
        let Some(v_t) = svd.v_t else {
            return 0;
        };

        // Basis matrices of the null space, row-major.
        let basis: Vec<[f64; 9]> = (5..9)
            .map(|r| {
                let mut e = [0.0; 9];
                for (c, v) in e.iter_mut().enumerate() {
                    *v = v_t[(r, c)];
                }
                e
            })
            .collect();

        // E(x, y, z) entry-wise as trivariate polynomials.
        let e_poly: Vec<Vec<Poly3>> = (0..3)
            .map(|r| {
                (0..3)
                    .map(|c| {
                        Poly3::linear(
                            basis[0][r * 3 + c],
                            basis[1][r * 3 + c],
                            basis[2][r * 3 + c],
                            basis[3][r * 3 + c],
                        )
                    })
                    .collect()
            })
            .collect();

        // det(E) = 0.
        let minor = |r1: usize, c1: usize, r2: usize, c2: usize| {
            e_poly[r1][c1]
                .mul(&e_poly[r2][c2])
                .sub(&e_poly[r1][c2].mul(&e_poly[r2][c1]))
        };
        let det = e_poly[0][0]
            .mul(&minor(1, 1, 2, 2))
            .sub(&e_poly[0][1].mul(&minor(1, 0, 2, 2)))
            .add(&e_poly[0][2].mul(&minor(1, 0, 2, 1)));

        // E E^T E - 1/2 tr(E E^T) E = 0, entry by entry.
        let mut eet = vec![vec![Poly3::zero(); 3]; 3];
        #[allow(clippy::needless_range_loop)]
        for i in 0..3 {
            for j in 0..3 {
                let mut acc = Poly3::zero();
                for k in 0..3 {
                    acc = acc.add(&e_poly[i][k].mul(&e_poly[j][k]));
                }
                eet[i][j] = acc;
            }
        }
        let trace = eet[0][0].add(&eet[1][1]).add(&eet[2][2]);

        let mut constraints = Vec::with_capacity(10);
        constraints.push(det);
        for i in 0..3 {
            for j in 0..3 {
                let mut acc = Poly3::zero();
                for k in 0..3 {
                    acc = acc.add(&eet[i][k].mul(&e_poly[k][j]));
                }
                let entry = acc.sub(&trace.scale(0.5).mul(&e_poly[i][j]));
                constraints.push(entry);
            }
        }

        // Eliminate the ten monomials of x,y-degree >= 2.
        let mut left = DMatrix::<f64>::zeros(10, 10);
        let mut right = DMatrix::<f64>::zeros(10, 10);
        for (r, poly) in constraints.iter().enumerate() {
            for c in 0..10 {
                left[(r, c)] = poly.0[c];
                right[(r, c)] = poly.0[10 + c];
            }
        }
        let Some(g) = left.lu().solve(&right) else {
            return 0;
        };

        // Reduced row i reads: monomial_i + a_i(z) x + b_i(z) y + c_i(z) = 0
        // with tail order [xz^2, yz^2, xz, yz, x, y, z^3, z^2, z, 1].
        let a_of = |i: usize| vec![g[(i, 4)], g[(i, 2)], g[(i, 0)]];
        let b_of = |i: usize| vec![g[(i, 5)], g[(i, 3)], g[(i, 1)]];
        let c_of = |i: usize| vec![g[(i, 9)], g[(i, 8)], g[(i, 7)], g[(i, 6)]];

        // Pairing each x,y-quadratic monomial m with m*z cancels the
        // quadratic part and leaves three equations linear in x and y.
        let pairs = [(4usize, 7usize), (5, 8), (6, 9)];
        let mut alpha = Vec::with_capacity(3);
        let mut beta = Vec::with_capacity(3);
        let mut gamma = Vec::with_capacity(3);
        for &(shifted, base) in &pairs {
            alpha.push(poly_sub(&a_of(shifted), &poly_shift(&a_of(base))));
            beta.push(poly_sub(&b_of(shifted), &poly_shift(&b_of(base))));
            gamma.push(poly_sub(&c_of(shifted), &poly_shift(&c_of(base))));
        }

        // det [alpha | beta | gamma] is a degree-10 polynomial in z.
        let m0 = poly_sub(&poly_mul(&beta[1], &gamma[2]), &poly_mul(&beta[2], &gamma[1]));
        let m1 = poly_sub(&poly_mul(&alpha[1], &gamma[2]), &poly_mul(&alpha[2], &gamma[1]));
        let m2 = poly_sub(&poly_mul(&alpha[1], &beta[2]), &poly_mul(&alpha[2], &beta[1]));
        let det_b = poly_sub(
            &poly_mul(&alpha[0], &m0),
            &poly_sub(&poly_mul(&beta[0], &m1), &poly_mul(&gamma[0], &m2)),
        );

        let mut roots = [0.0f64; 10];
        let n_roots = real_roots_bracketed(&det_b, &mut roots);

        for &z in roots.iter().take(n_roots) {
            // Back-substitute: solve the best-conditioned 2x2 subsystem of
            // B(z) [x, y, 1]^T = 0 for x and y.
            let eval = |p: &[f64]| crate::utils::polyval(p, z);
            let rows: Vec<(f64, f64, f64)> = (0..3)
                .map(|k| (eval(&alpha[k]), eval(&beta[k]), eval(&gamma[k])))
                .collect();

            let mut best_pair = None;
            let mut best_det = 0.0;
            for (ra, rb) in [(0, 1), (0, 2), (1, 2)] {
                let d = rows[ra].0 * rows[rb].1 - rows[rb].0 * rows[ra].1;
                if d.abs() > best_det {
                    best_det = d.abs();
                    best_pair = Some((ra, rb));
                }
            }
            let Some((ra, rb)) = best_pair else {
                continue;
            };
            let d = rows[ra].0 * rows[rb].1 - rows[rb].0 * rows[ra].1;
            let x = (-rows[ra].2 * rows[rb].1 + rows[rb].2 * rows[ra].1) / d;
            let y = (-rows[ra].0 * rows[rb].2 + rows[rb].0 * rows[ra].2) / d;

            let mut e = Matrix3::zeros();
            for r in 0..3 {
                for c in 0..3 {
                    let k = r * 3 + c;
                    e[(r, c)] =
                        x * basis[0][k] + y * basis[1][k] + z * basis[2][k] + basis[3][k];
                }
            }
            let norm = e.norm();
            if norm < 1e-10 || e.iter().any(|v| !v.is_finite()) {
                continue;
            }
            models.push(mat3_to_model(&(e / norm)));
        }
        models.len()
    }

    fn clone_box(&self) -> Box<dyn MinimalSolver> {
        Box::new(self.clone())
    }
}

/// Project a 3x3 matrix onto the essential manifold: equal leading singular
/// values, third one zero.
pub fn enforce_essential_constraints(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = e.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return None;
    };
    let s = svd.singular_values;
    let avg = (s[0] + s[1]) / 2.0;
    let w = Vector3::new(avg, avg, 0.0);
    Some(u * Matrix3::from_diagonal(&w) * v_t)
}

/// Non-minimal fit: normalized 8-point solution projected onto the
/// essential manifold.
#[derive(Clone)]
pub struct EssentialNonMinimalSolver {
    points: Arc<PointSet>,
}

impl EssentialNonMinimalSolver {
    pub fn new(points: Arc<PointSet>) -> Self {
        Self { points }
    }
}

impl NonMinimalSolver for EssentialNonMinimalSolver {
    fn min_sample_size(&self) -> usize {
        8
    }

    fn estimate(
        &self,
        sample: &[usize],
        weights: Option<&[f64]>,
        models: &mut Vec<Model>,
    ) -> usize {
        let Some(f_model) = eight_point_fit(&self.points, sample, weights) else {
            return 0;
        };
        let Some(e) = enforce_essential_constraints(&as_mat3(&f_model)) else {
            return 0;
        };
        models.push(mat3_to_model(&e));
        models.len()
    }

    fn clone_box(&self) -> Box<dyn NonMinimalSolver> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::skew_symmetric;

    #[test]
    fn trivariate_products_land_on_the_right_monomials() {
        // (x + 2)(y + 3z) = xy + 3xz + 2y + 6z
        let p = Poly3::linear(1.0, 0.0, 0.0, 2.0);
        let q = Poly3::linear(0.0, 1.0, 3.0, 0.0);
        let prod = p.mul(&q);
        assert_eq!(prod.0[mono_index((1, 1, 0))], 1.0);
        assert_eq!(prod.0[mono_index((1, 0, 1))], 3.0);
        assert_eq!(prod.0[mono_index((0, 1, 0))], 2.0);
        assert_eq!(prod.0[mono_index((0, 0, 1))], 6.0);
        assert_eq!(prod.0[mono_index((0, 0, 0))], 0.0);
    }

    /// Two calibrated views of a deterministic point cloud.
    fn calibrated_views(n: usize) -> (Arc<PointSet>, Matrix3<f64>) {
        let angle: f64 = 0.15;
        let (s, c) = angle.sin_cos();
        let r = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
        let t = Vector3::new(0.4, -0.15, 0.1);
        let e_true = skew_symmetric(&t) * r;

        let mut data = Vec::new();
        for i in 0..n {
            let p = Vector3::new(
                (i % 4) as f64 * 0.7 - 1.0,
                (i / 4 % 4) as f64 * 0.6 - 0.9,
                5.0 + ((i * 5) % 7) as f64 * 0.8,
            );
            let q = r * p + t;
            data.extend_from_slice(&[p.x / p.z, p.y / p.z, q.x / q.z, q.y / q.z]);
        }
        (PointSet::new(data, 4).into_shared(), e_true)
    }

    #[test]
    fn five_point_solver_contains_the_true_geometry() {
        let (pts, e_true) = calibrated_views(6);
        let solver = EssentialMinimalSolver::new(pts.clone());
        let mut models = Vec::new();
        let n = solver.estimate(&[0, 1, 2, 3, 4], &mut models);
        assert!(n >= 1, "five-point solver produced no model");

        // All solutions interpolate the five sample points; the held-out
        // sixth point discriminates the true essential matrix.
        let row = pts.row(5);
        let x1 = Vector3::new(row[0], row[1], 1.0);
        let x2 = Vector3::new(row[2], row[3], 1.0);
        let best_residual = models
            .iter()
            .map(|m| x2.dot(&(as_mat3(m) * x1)).abs())
            .fold(f64::INFINITY, f64::min);
        assert!(
            best_residual < 1e-6,
            "no solution matches the held-out point, best {best_residual}"
        );

        // And that solution is the true E up to sign and scale.
        let e_norm = e_true / e_true.norm();
        let matched = models.iter().any(|m| {
            let e = as_mat3(m);
            ((e - e_norm).norm()).min((e + e_norm).norm()) < 1e-4
        });
        assert!(matched);
    }

    #[test]
    fn five_point_solutions_satisfy_internal_constraints() {
        let (pts, _) = calibrated_views(5);
        let solver = EssentialMinimalSolver::new(pts);
        let mut models = Vec::new();
        solver.estimate(&[0, 1, 2, 3, 4], &mut models);
        for m in &models {
            let e = as_mat3(m);
            assert!(e.determinant().abs() < 1e-6);
            let sv = e.svd(false, false).singular_values;
            assert!((sv[0] - sv[1]).abs() < 1e-4, "singular values must pair");
            assert!(sv[2].abs() < 1e-6);
        }
    }

    #[test]
    fn non_minimal_projection_is_essential() {
        let (pts, e_true) = calibrated_views(16);
        let solver = EssentialNonMinimalSolver::new(pts);
        let sample: Vec<usize> = (0..16).collect();
        let mut models = Vec::new();
        assert_eq!(solver.estimate(&sample, None, &mut models), 1);

        let e = as_mat3(&models[0]);
        let sv = e.svd(false, false).singular_values;
        assert!((sv[0] - sv[1]).abs() < 1e-8);
        assert!(sv[2].abs() < 1e-10);

        let e_norm = e / e.norm();
        let t_norm = e_true / e_true.norm();
        assert!(((e_norm - t_norm).norm()).min((e_norm + t_norm).norm()) < 1e-6);
    }
}
