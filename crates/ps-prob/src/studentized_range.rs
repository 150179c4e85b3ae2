//! Studentized range distribution (Tukey HSD reference distribution).
//!
//! `Q = R / S` where `R` is the range of `k` independent standard normals and
//! `S = sqrt(chi2(df)/df)`.

use ps_core::{Error, Result};

use crate::normal;
use crate::quadrature::integrate;
use crate::student_t::{scaled_chi_logpdf, scaled_chi_window};

const DF_INFINITE_LIMIT: f64 = 25_000.0;

/// CDF of the range of `k` standard normals:
/// `P(R <= w) = k ∫ φ(z) [Φ(z + w) − Φ(z)]^{k−1} dz`.
fn normal_range_cdf(w: f64, k: usize) -> f64 {
    if w <= 0.0 {
        return 0.0;
    }
    let km1 = (k - 1) as i32;
    let v = integrate(
        |z| {
            let inner = normal::cdf(z + w) - normal::cdf(z);
            if inner <= 0.0 { 0.0 } else { normal::pdf(z) * inner.powi(km1) }
        },
        -8.5,
        8.5,
        6,
    );
    (k as f64 * v).clamp(0.0, 1.0)
}

fn validate(k: usize, df: f64) -> Result<()> {
    if k < 2 {
        return Err(Error::Validation(format!("studentized range needs k >= 2, got {}", k)));
    }
    if df.is_nan() || df < 1.0 {
        return Err(Error::Validation(format!("studentized range needs df >= 1, got {}", df)));
    }
    Ok(())
}

/// CDF of the studentized range for `k` means and `df` error degrees of freedom.
pub fn cdf(q: f64, k: usize, df: f64) -> Result<f64> {
    validate(k, df)?;
    if q <= 0.0 {
        return Ok(0.0);
    }
    if df > DF_INFINITE_LIMIT {
        return Ok(normal_range_cdf(q, k));
    }
    let (lo, hi) = scaled_chi_window(df);
    let v = integrate(
        |s| {
            let lp = scaled_chi_logpdf(s, df);
            if lp.is_finite() { lp.exp() * normal_range_cdf(q * s, k) } else { 0.0 }
        },
        lo,
        hi,
        4,
    );
    Ok(v.clamp(0.0, 1.0))
}

/// Quantile of the studentized range (`qtukey`).
///
/// Bracketed bisection on [`cdf`]; absolute tolerance 1e-6 on `q`.
pub fn quantile(p: f64, k: usize, df: f64) -> Result<f64> {
    validate(k, df)?;
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::Validation(format!("probability must be in (0, 1), got {}", p)));
    }

    let mut lo = 0.0_f64;
    let mut hi = 8.0_f64;
    while cdf(hi, k, df)? < p {
        lo = hi;
        hi *= 2.0;
        if hi > 1e4 {
            return Err(Error::Computation(format!(
                "studentized range quantile did not bracket (p={}, k={}, df={})",
                p, k, df
            )));
        }
    }

    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if cdf(mid, k, df)? < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-6 {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}
