//! Standard normal distribution utilities.

use statrs::function::erf::{erfc, erfc_inv};

/// `1 / sqrt(2π)`.
const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Density of `N(0, 1)` at `x`.
#[inline]
pub fn pdf(x: f64) -> f64 {
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// CDF of `N(0, 1)`.
///
/// Uses `erfc` for better numerical behavior in the tails:
/// `Φ(x) = 0.5 * erfc(-x / sqrt(2))`.
#[inline]
pub fn cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Quantile of `N(0, 1)`: `Φ⁻¹(p) = -sqrt(2) * erfc⁻¹(2p)`.
///
/// Returns `±inf` at `p = 0` / `p = 1` and `NaN` outside `[0, 1]`.
#[inline]
pub fn quantile(p: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if p == 1.0 {
        return f64::INFINITY;
    }
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pdf_at_zero() {
        assert_relative_eq!(pdf(0.0), INV_SQRT_2PI, epsilon = 1e-15);
    }

    #[test]
    fn test_cdf_symmetry() {
        for x in [0.1, 0.7, 1.96, 3.5] {
            assert_relative_eq!(cdf(x) + cdf(-x), 1.0, epsilon = 1e-14);
        }
        assert_relative_eq!(cdf(1.959_963_984_540_054), 0.975, epsilon = 1e-12);
    }

    #[test]
    fn test_quantile_inverts_cdf() {
        for p in [1e-6, 0.025, 0.3, 0.5, 0.9, 0.999] {
            assert_relative_eq!(cdf(quantile(p)), p, epsilon = 1e-10);
        }
        assert!(quantile(1.5).is_nan());
        assert_eq!(quantile(0.0), f64::NEG_INFINITY);
    }
}
