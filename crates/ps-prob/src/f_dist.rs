//! F distribution utilities (central and non-central).

use ps_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};
use statrs::function::beta::beta_reg;
use statrs::function::gamma::ln_gamma;

fn validate_dfs(df1: f64, df2: f64) -> Result<()> {
    if df1.is_nan() || df1 <= 0.0 || df2.is_nan() || df2 <= 0.0 {
        return Err(Error::Validation(format!("F dfs must be > 0, got ({}, {})", df1, df2)));
    }
    Ok(())
}

fn dist(df1: f64, df2: f64) -> Result<FisherSnedecor> {
    validate_dfs(df1, df2)?;
    FisherSnedecor::new(df1, df2)
        .map_err(|e| Error::Validation(format!("invalid F distribution: {e}")))
}

/// CDF of the central F(df1, df2).
pub fn cdf(x: f64, df1: f64, df2: f64) -> Result<f64> {
    let d = dist(df1, df2)?;
    if x <= 0.0 {
        return Ok(0.0);
    }
    Ok(d.cdf(x))
}

/// Quantile of the central F(df1, df2).
pub fn quantile(p: f64, df1: f64, df2: f64) -> Result<f64> {
    if !(0.0..1.0).contains(&p) {
        return Err(Error::Validation(format!("probability must be in [0, 1), got {}", p)));
    }
    Ok(dist(df1, df2)?.inverse_cdf(p))
}

/// CDF of the non-central F(df1, df2, λ).
///
/// Poisson mixture of regularized incomplete beta functions:
/// `P(F <= x) = Σ_j Pois(j; λ/2) · I_y(df1/2 + j, df2/2)`, `y = df1·x / (df1·x + df2)`.
pub fn noncentral_cdf(x: f64, df1: f64, df2: f64, lambda: f64) -> Result<f64> {
    validate_dfs(df1, df2)?;
    if lambda.is_nan() || lambda < 0.0 {
        return Err(Error::Validation(format!("lambda must be >= 0, got {}", lambda)));
    }
    if x <= 0.0 {
        return Ok(0.0);
    }
    if lambda == 0.0 {
        return cdf(x, df1, df2);
    }

    let y = df1 * x / (df1 * x + df2);
    let half_lambda = 0.5 * lambda;
    let sd = half_lambda.sqrt();
    let j_hi = (half_lambda + 12.0 * sd + 30.0).ceil() as usize;

    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for j in 0..=j_hi {
        let jf = j as f64;
        let log_w = -half_lambda + jf * half_lambda.ln() - ln_gamma(jf + 1.0);
        let w = log_w.exp();
        if w < 1e-300 && jf > half_lambda {
            break;
        }
        weight_sum += w;
        total += w * beta_reg(0.5 * df1 + jf, 0.5 * df2, y);
    }
    // Renormalize the truncated Poisson weights.
    if weight_sum > 0.0 {
        total /= weight_sum;
    }
    Ok(total.clamp(0.0, 1.0))
}

/// Power of an F test at level `alpha` with non-centrality `lambda`.
pub fn power(alpha: f64, df1: f64, df2: f64, lambda: f64) -> Result<f64> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::Validation(format!("alpha must be in (0, 1), got {}", alpha)));
    }
    let crit = quantile(1.0 - alpha, df1, df2)?;
    Ok((1.0 - noncentral_cdf(crit, df1, df2, lambda)?).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quantile_matches_tables() {
        // F(0.95; 2, 20) = 3.4928
        assert_relative_eq!(quantile(0.95, 2.0, 20.0).unwrap(), 3.492_828, epsilon = 1e-4);
    }

    #[test]
    fn test_noncentral_reduces_to_central() {
        let c = cdf(2.5, 3.0, 40.0).unwrap();
        let nc = noncentral_cdf(2.5, 3.0, 40.0, 1e-12).unwrap();
        assert_relative_eq!(c, nc, epsilon = 1e-9);
    }

    #[test]
    fn test_noncentral_f_matches_squared_t() {
        // F(1, df, δ²) is the square of a non-central t(df, δ).
        let df = 30.0;
        let delta = 1.7;
        let x = 2.2;
        let via_f = noncentral_cdf(x * x, 1.0, df, delta * delta).unwrap();
        let via_t = crate::student_t::noncentral_cdf(x, df, delta).unwrap()
            - crate::student_t::noncentral_cdf(-x, df, delta).unwrap();
        assert_relative_eq!(via_f, via_t, epsilon = 1e-6);
    }

    #[test]
    fn test_power_increases_with_lambda() {
        let p0 = power(0.05, 2.0, 50.0, 0.0).unwrap();
        let p1 = power(0.05, 2.0, 50.0, 5.0).unwrap();
        let p2 = power(0.05, 2.0, 50.0, 15.0).unwrap();
        assert_relative_eq!(p0, 0.05, epsilon = 1e-6);
        assert!(p0 < p1 && p1 < p2);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(cdf(1.0, 0.0, 10.0).is_err());
        assert!(noncentral_cdf(1.0, 1.0, 10.0, -1.0).is_err());
        assert_eq!(noncentral_cdf(-1.0, 1.0, 10.0, 2.0).unwrap(), 0.0);
    }
}
