//! One-dimensional bounded minimization (Brent's method).
//!
//! Used for the random-intercept fit, where the profiled deviance depends on a
//! single relative standard deviation.

use ps_core::{Error, Result};

const GOLDEN: f64 = 0.381_966_011_250_105_1; // (3 − √5) / 2

/// Result of a 1-D minimization.
#[derive(Debug, Clone, Copy)]
pub struct Brent1d {
    /// Arg-min.
    pub x: f64,
    /// Objective at `x`.
    pub fx: f64,
    /// Objective evaluations (bracketing scan included).
    pub n_evals: usize,
    /// `false` when the iteration budget ran out before the tolerance was met.
    pub converged: bool,
}

/// Coarse scan for a bracketing triple `a < b < c` with `f(b) <= f(a), f(c)`.
///
/// Returns the narrowed interval around the best grid point.
fn bracket<F>(f: &F, lo: f64, hi: f64, n_grid: usize, evals: &mut usize) -> Result<(f64, f64)>
where
    F: Fn(f64) -> Result<f64>,
{
    let step = (hi - lo) / n_grid as f64;
    let mut best_i = 0usize;
    let mut best_f = f64::INFINITY;
    for i in 0..=n_grid {
        let x = lo + i as f64 * step;
        let fx = f(x)?;
        *evals += 1;
        if fx < best_f {
            best_f = fx;
            best_i = i;
        }
    }
    if !best_f.is_finite() {
        return Err(Error::Computation("objective is not finite on the search interval".into()));
    }
    let a = lo + best_i.saturating_sub(1) as f64 * step;
    let c = lo + (best_i + 1).min(n_grid) as f64 * step;
    Ok((a, c))
}

/// Minimize `f` on `[lo, hi]`.
///
/// A coarse grid scan brackets the global basin, then Brent's
/// golden-section / parabolic iteration refines within the bracket to
/// absolute tolerance `tol`.
pub fn minimize<F>(f: F, lo: f64, hi: f64, tol: f64, max_iter: usize) -> Result<Brent1d>
where
    F: Fn(f64) -> Result<f64>,
{
    if !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
        return Err(Error::Validation(format!("invalid interval [{}, {}]", lo, hi)));
    }
    let mut evals = 0usize;
    let (mut a, mut b) = bracket(&f, lo, hi, 16, &mut evals)?;

    let mut x = a + GOLDEN * (b - a);
    let mut w = x;
    let mut v = x;
    let mut fx = f(x)?;
    evals += 1;
    let mut fw = fx;
    let mut fv = fx;
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..max_iter {
        let m = 0.5 * (a + b);
        let tol1 = tol * x.abs().max(1.0) * 0.5 + 1e-12;
        let tol2 = 2.0 * tol1;
        if (x - m).abs() <= tol2 - 0.5 * (b - a) {
            return Ok(Brent1d { x, fx, n_evals: evals, converged: true });
        }

        let mut golden = true;
        if e.abs() > tol1 {
            // Parabola through (v, w, x).
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (a - x) && p < q * (b - x) {
                e = d;
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = if x < m { tol1 } else { -tol1 };
                }
                golden = false;
            }
        }
        if golden {
            e = if x < m { b - x } else { a - x };
            d = GOLDEN * e;
        }

        let u = if d.abs() >= tol1 { x + d } else { x + tol1.copysign(d) };
        let fu = f(u)?;
        evals += 1;

        if fu <= fx {
            if u < x {
                b = x;
            } else {
                a = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }

    Ok(Brent1d { x, fx, n_evals: evals, converged: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quadratic_interior() {
        let r = minimize(|x| Ok((x - 1.7).powi(2) + 3.0), 0.0, 10.0, 1e-8, 100).unwrap();
        assert!(r.converged);
        assert_relative_eq!(r.x, 1.7, epsilon = 1e-6);
        assert_relative_eq!(r.fx, 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_minimum_on_boundary() {
        let r = minimize(|x| Ok((x + 1.0).powi(2)), 0.0, 5.0, 1e-8, 100).unwrap();
        assert!(r.converged);
        assert!(r.x < 1e-6, "x = {}", r.x);
    }

    #[test]
    fn test_non_quadratic() {
        // min of x − ln x at x = 1
        let r = minimize(|x: f64| Ok(x - x.ln()), 0.01, 8.0, 1e-9, 100).unwrap();
        assert_relative_eq!(r.x, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_budget_exhaustion_reported() {
        let r = minimize(|x: f64| Ok((x - 0.3).powi(2)), 0.0, 1.0, 1e-14, 1).unwrap();
        assert!(!r.converged);
    }

    #[test]
    fn test_bad_interval() {
        assert!(minimize(|x| Ok(x), 1.0, 1.0, 1e-6, 10).is_err());
    }
}
