//! Closed-form OLS power, used to validate the Monte Carlo estimates.

use ps_core::{Error, Result};
use ps_prob::{f_dist, student_t};

/// Power of the two-sided t test of one coefficient.
///
/// For `y = β₀ + βx + …` with `n` observations, `n_coefficients` fitted
/// columns (intercept included), predictor variance `var_x` and residual SD
/// `sigma`, the non-centrality is `δ = β √(n var_x) / σ` and the reference is
/// a non-central t with `n − n_coefficients` degrees of freedom.
pub fn analytical_power_t(
    beta: f64,
    n: usize,
    n_coefficients: usize,
    var_x: f64,
    sigma: f64,
    alpha: f64,
) -> Result<f64> {
    if n <= n_coefficients {
        return Err(Error::Validation(format!(
            "n = {} leaves no residual degrees of freedom for {} coefficients",
            n, n_coefficients
        )));
    }
    if !(var_x > 0.0 && sigma > 0.0) {
        return Err(Error::Validation("var_x and sigma must be positive".into()));
    }
    let df = (n - n_coefficients) as f64;
    let delta = beta * (n as f64 * var_x).sqrt() / sigma;
    student_t::two_sided_power(alpha, df, delta)
}

/// Power of the overall F test with Cohen's effect size `f² = R² / (1 − R²)`.
///
/// `k` predictors, non-centrality `λ = f² n`, reference `F(k, n − k − 1, λ)`.
pub fn analytical_power_f(f2: f64, n: usize, k: usize, alpha: f64) -> Result<f64> {
    if k == 0 || n <= k + 1 {
        return Err(Error::Validation(format!("need n > k + 1 and k > 0, got n={}, k={}", n, k)));
    }
    if !(f2 >= 0.0) {
        return Err(Error::Validation(format!("f² must be >= 0, got {}", f2)));
    }
    f_dist::power(alpha, k as f64, (n - k - 1) as f64, f2 * n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_null_effect_has_alpha_power() {
        assert_relative_eq!(analytical_power_t(0.0, 50, 2, 1.0, 1.0, 0.05).unwrap(), 0.05, epsilon = 1e-9);
        assert_relative_eq!(analytical_power_f(0.0, 50, 3, 0.05).unwrap(), 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_power_grows_with_n() {
        let p50 = analytical_power_t(0.3, 50, 2, 1.0, 1.0, 0.05).unwrap();
        let p200 = analytical_power_t(0.3, 200, 2, 1.0, 1.0, 0.05).unwrap();
        let p500 = analytical_power_t(0.3, 500, 2, 1.0, 1.0, 0.05).unwrap();
        assert!(p50 < p200 && p200 < p500);
        // δ = 0.3·√200 ≈ 4.24 → power ≈ 0.985
        assert_relative_eq!(p200, 0.985, epsilon = 0.01);
    }

    #[test]
    fn test_single_predictor_f_matches_t() {
        // One predictor: F(1, n−2, δ²) with f² n = β² var n / σ².
        let beta: f64 = 0.25;
        let n = 80;
        let pt = analytical_power_t(beta, n, 2, 1.0, 1.0, 0.05).unwrap();
        let pf = analytical_power_f(beta * beta, n, 1, 0.05).unwrap();
        assert_relative_eq!(pt, pf, epsilon = 1e-5);
    }

    #[test]
    fn test_invalid() {
        assert!(analytical_power_t(0.3, 2, 2, 1.0, 1.0, 0.05).is_err());
        assert!(analytical_power_f(0.1, 3, 2, 0.05).is_err());
    }
}
