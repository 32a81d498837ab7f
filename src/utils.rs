//! Shared numeric helpers: the seeded random generator and small linear
//! algebra / polynomial routines used by the solvers.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded uniform integer generator.
///
/// Keeps the seed it was built from so clones can derive a diverged seed
/// (`seed / 10 + 10`), which lets parallel workers produce independent
/// sampling streams from a common base state.
#[derive(Debug)]
pub struct UniformRandom {
    rng: StdRng,
    seed: u64,
}

impl UniformRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Uniform draw in `[0, bound)`.
    #[inline]
    pub fn uniform(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        self.rng.gen_range(0..bound)
    }

    /// Fisher-Yates shuffle of the whole slice.
    pub fn shuffle(&mut self, values: &mut [usize]) {
        for i in (1..values.len()).rev() {
            let j = self.rng.gen_range(0..=i);
            values.swap(i, j);
        }
    }

    /// Seed this generator was built from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seed for a clone that must diverge from this generator.
    pub fn derive_seed(state: u64) -> u64 {
        state / 10 + 10
    }
}

/// Skew-symmetric cross-product matrix `[v]_x`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Gaussian elimination with partial pivoting on an augmented system
/// `[A | b]` with `A` of size n x n. Returns `false` on a singular pivot.
pub fn gauss_elimination(augmented: &mut DMatrix<f64>, result: &mut DVector<f64>) -> bool {
    let n = augmented.nrows();
    if n + 1 != augmented.ncols() || n != result.len() {
        return false;
    }

    for i in 0..n {
        let mut max_row = i;
        let mut max_val = augmented[(i, i)].abs();
        for k in (i + 1)..n {
            let val = augmented[(k, i)].abs();
            if val > max_val {
                max_val = val;
                max_row = k;
            }
        }
        if max_row != i {
            augmented.swap_rows(i, max_row);
        }
        if augmented[(i, i)].abs() < 1e-10 {
            return false;
        }
        for k in (i + 1)..n {
            let factor = augmented[(k, i)] / augmented[(i, i)];
            for j in i..augmented.ncols() {
                augmented[(k, j)] -= factor * augmented[(i, j)];
            }
        }
    }

    for i in (0..n).rev() {
        result[i] = augmented[(i, n)];
        for j in (i + 1)..n {
            result[i] -= augmented[(i, j)] * result[j];
        }
        result[i] /= augmented[(i, i)];
    }
    true
}

/// Real roots of the monic cubic `x^3 + c2 x^2 + c1 x + c0`, refined with a
/// single Newton step. Returns the number of roots written (1 or 3).
pub fn solve_cubic_real(c2: f64, c1: f64, c0: f64, roots: &mut [f64; 3]) -> usize {
    let a = c1 - c2 * c2 / 3.0;
    let b = (2.0 * c2 * c2 * c2 - 9.0 * c2 * c1) / 27.0 + c0;
    let mut c = b * b / 4.0 + a * a * a / 27.0;

    let n_roots = if c > 0.0 {
        c = c.sqrt();
        let b_neg = -0.5 * b;
        roots[0] = (b_neg + c).cbrt() + (b_neg - c).cbrt() - c2 / 3.0;
        1
    } else {
        c = 3.0 * b / (2.0 * a) * (-3.0 / a).sqrt();
        let d = 2.0 * (-a / 3.0).sqrt();
        let acos_c = c.acos();
        roots[0] = d * (acos_c / 3.0).cos() - c2 / 3.0;
        roots[1] = d * (acos_c / 3.0 - 2.0 * std::f64::consts::FRAC_PI_3).cos() - c2 / 3.0;
        roots[2] = d * (acos_c / 3.0 - 4.0 * std::f64::consts::FRAC_PI_3).cos() - c2 / 3.0;
        3
    };

    for root in roots.iter_mut().take(n_roots) {
        let x = *root;
        let x2 = x * x;
        let fx = x * x2 + c2 * x2 + c1 * x + c0;
        let dfx = 3.0 * x2 + 2.0 * c2 * x + c1;
        if dfx.abs() > 1e-12 {
            *root -= fx / dfx;
        }
    }
    n_roots
}

/// Evaluate a polynomial in ascending-coefficient form.
#[inline]
pub fn polyval(coeffs: &[f64], x: f64) -> f64 {
    let mut acc = 0.0;
    for &c in coeffs.iter().rev() {
        acc = acc * x + c;
    }
    acc
}

/// Evaluate the derivative of a polynomial in ascending-coefficient form.
#[inline]
fn polyval_deriv(coeffs: &[f64], x: f64) -> f64 {
    let mut acc = 0.0;
    for (i, &c) in coeffs.iter().enumerate().skip(1).rev() {
        acc = acc * x + c * i as f64;
    }
    acc
}

/// Real roots of an arbitrary-degree polynomial (ascending coefficients) by
/// sign-change bracketing over the Cauchy bound followed by Newton
/// refinement. Suited to the low-degree resultants of the minimal solvers;
/// roots of even multiplicity can be missed.
pub fn real_roots_bracketed(coeffs: &[f64], roots: &mut [f64]) -> usize {
    // Trim vanishing leading coefficients so the effective degree and the
    // Cauchy bound stay meaningful.
    let max_abs = coeffs.iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    if max_abs == 0.0 {
        return 0;
    }
    let mut end = coeffs.len();
    while end > 1 && coeffs[end - 1].abs() < 1e-12 * max_abs {
        end -= 1;
    }
    let coeffs = &coeffs[..end];
    if coeffs.len() < 2 {
        return 0;
    }

    let degree = coeffs.len() - 1;
    let lead = coeffs[degree];

    // Cauchy bound on the magnitude of any root.
    let bound = 1.0
        + coeffs[..degree]
            .iter()
            .fold(0.0_f64, |m, &c| m.max((c / lead).abs()));

    const STEPS: usize = 1000;
    let step = 2.0 * bound / STEPS as f64;
    let mut n_roots = 0;
    let mut prev_x = -bound;
    let mut prev_f = polyval(coeffs, prev_x);

    for i in 1..=STEPS {
        let x = -bound + i as f64 * step;
        let f = polyval(coeffs, x);
        if prev_f == 0.0 {
            if n_roots < roots.len() {
                roots[n_roots] = prev_x;
                n_roots += 1;
            }
        } else if (prev_f < 0.0) != (f < 0.0) {
            // Bracketed a root; polish with Newton from the midpoint.
            let mut r = 0.5 * (prev_x + x);
            for _ in 0..30 {
                let fr = polyval(coeffs, r);
                let dfr = polyval_deriv(coeffs, r);
                if dfr.abs() < 1e-14 {
                    break;
                }
                let dx = fr / dfr;
                r -= dx;
                if dx.abs() < 1e-14 {
                    break;
                }
            }
            if n_roots < roots.len() {
                roots[n_roots] = r.clamp(prev_x.min(x) - step, prev_x.max(x) + step);
                n_roots += 1;
            }
        }
        prev_x = x;
        prev_f = f;
        if n_roots == roots.len() {
            break;
        }
    }
    n_roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn same_seed_same_stream() {
        let mut a = UniformRandom::new(42);
        let mut b = UniformRandom::new(42);
        let xs: Vec<usize> = (0..16).map(|_| a.uniform(1000)).collect();
        let ys: Vec<usize> = (0..16).map(|_| b.uniform(1000)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn derived_seed_diverges() {
        assert_eq!(UniformRandom::derive_seed(1234), 133);
        let mut a = UniformRandom::new(1234);
        let mut b = UniformRandom::new(UniformRandom::derive_seed(1234));
        let xs: Vec<usize> = (0..16).map(|_| a.uniform(1000)).collect();
        let ys: Vec<usize> = (0..16).map(|_| b.uniform(1000)).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn gauss_elimination_solves_system() {
        // x + y = 3, x - y = 1 -> x = 2, y = 1
        let mut aug = DMatrix::from_row_slice(2, 3, &[1.0, 1.0, 3.0, 1.0, -1.0, 1.0]);
        let mut x = DVector::zeros(2);
        assert!(gauss_elimination(&mut aug, &mut x));
        assert_abs_diff_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn cubic_roots() {
        // (x - 1)(x - 2)(x - 3) = x^3 - 6x^2 + 11x - 6
        let mut roots = [0.0; 3];
        let n = solve_cubic_real(-6.0, 11.0, -6.0, &mut roots);
        assert_eq!(n, 3);
        roots.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_abs_diff_eq!(roots[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(roots[1], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(roots[2], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn bracketed_roots_of_quartic() {
        // (x^2 - 1)(x^2 - 4) = x^4 - 5x^2 + 4
        let coeffs = [4.0, 0.0, -5.0, 0.0, 1.0];
        let mut roots = [0.0; 4];
        let n = real_roots_bracketed(&coeffs, &mut roots);
        assert_eq!(n, 4);
        let mut found: Vec<f64> = roots[..n].to_vec();
        found.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (r, expected) in found.iter().zip([-2.0, -1.0, 1.0, 2.0]) {
            assert_abs_diff_eq!(*r, expected, epsilon = 1e-8);
        }
    }

    #[test]
    fn skew_matrix_encodes_cross_product() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(-2.0, 0.5, 4.0);
        let via_matrix = skew_symmetric(&a) * b;
        let direct = a.cross(&b);
        assert_abs_diff_eq!((via_matrix - direct).norm(), 0.0, epsilon = 1e-12);
    }
}
