//! Student-t distribution utilities (central and non-central).

use ps_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::gamma::ln_gamma;

use crate::normal;
use crate::quadrature::integrate;

/// Degrees of freedom above which the t reference collapses to the normal.
const DF_NORMAL_LIMIT: f64 = 1e7;

fn validate_df(df: f64) -> Result<()> {
    if df.is_nan() || df <= 0.0 {
        return Err(Error::Validation(format!("df must be > 0, got {}", df)));
    }
    Ok(())
}

/// Log-density of `u = sqrt(chi2(df) / df)`.
///
/// `f(u) = 2 (df/2)^{df/2} / Γ(df/2) · u^{df-1} · exp(-df u²/2)`
pub(crate) fn scaled_chi_logpdf(u: f64, df: f64) -> f64 {
    if u <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let half_df = 0.5 * df;
    std::f64::consts::LN_2 + half_df * half_df.ln() - ln_gamma(half_df) + (df - 1.0) * u.ln()
        - 0.5 * df * u * u
}

/// Integration window `[lo, hi]` that holds essentially all mass of `sqrt(chi2(df)/df)`.
pub(crate) fn scaled_chi_window(df: f64) -> (f64, f64) {
    let s = 1.0 / (2.0 * df).sqrt();
    ((1.0 - 12.0 * s).max(0.0), 1.0 + 12.0 * s)
}

/// CDF of the central Student-t with `df` degrees of freedom.
pub fn cdf(x: f64, df: f64) -> Result<f64> {
    validate_df(df)?;
    if df > DF_NORMAL_LIMIT {
        return Ok(normal::cdf(x));
    }
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| Error::Validation(format!("invalid t distribution: {e}")))?;
    Ok(dist.cdf(x))
}

/// Quantile of the central Student-t with `df` degrees of freedom.
pub fn quantile(p: f64, df: f64) -> Result<f64> {
    validate_df(df)?;
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::Validation(format!("probability must be in [0, 1], got {}", p)));
    }
    if df > DF_NORMAL_LIMIT {
        return Ok(normal::quantile(p));
    }
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| Error::Validation(format!("invalid t distribution: {e}")))?;
    Ok(dist.inverse_cdf(p))
}

/// CDF of the non-central t with `df` degrees of freedom and non-centrality `delta`.
///
/// `T = (Z + δ) / U` with `U = sqrt(chi2(df)/df)`, so
/// `P(T <= t) = ∫ f(u) Φ(t·u − δ) du`.
pub fn noncentral_cdf(t: f64, df: f64, delta: f64) -> Result<f64> {
    validate_df(df)?;
    if delta == 0.0 {
        return cdf(t, df);
    }
    if df > DF_NORMAL_LIMIT {
        return Ok(normal::cdf(t - delta));
    }
    let (lo, hi) = scaled_chi_window(df);
    let v = integrate(
        |u| {
            let lp = scaled_chi_logpdf(u, df);
            if lp.is_finite() { lp.exp() * normal::cdf(t * u - delta) } else { 0.0 }
        },
        lo,
        hi,
        8,
    );
    Ok(v.clamp(0.0, 1.0))
}

/// Power of a two-sided t-test at level `alpha` when the true standardized
/// effect is `delta` (the non-centrality parameter).
pub fn two_sided_power(alpha: f64, df: f64, delta: f64) -> Result<f64> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::Validation(format!("alpha must be in (0, 1), got {}", alpha)));
    }
    let crit = quantile(1.0 - 0.5 * alpha, df)?;
    let inside = noncentral_cdf(crit, df, delta)? - noncentral_cdf(-crit, df, delta)?;
    Ok((1.0 - inside).clamp(0.0, 1.0))
}
