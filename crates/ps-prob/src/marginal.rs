//! Standardized marginal distributions for correlated data generation.
//!
//! Generation draws a correlated standard-normal block and pushes each column
//! through `x = F⁻¹(Φ(z))`. Composing the two steps gives a smooth, monotone
//! map `z -> x`, which is tabulated once per marginal on a fixed z-grid and
//! linearly interpolated; rank correlation is preserved exactly.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Gamma, StudentsT};
use std::sync::OnceLock;

use crate::normal;

/// Table resolution.
pub const TABLE_SIZE: usize = 4096;
/// Half-width of the tabulated z-range.
const Z_MAX: f64 = 6.0;
/// Shape of the gamma used for skewed marginals (skewness `2/sqrt(2)`).
const SKEW_SHAPE: f64 = 2.0;
/// Degrees of freedom of the heavy-tailed marginal (excess kurtosis 6).
const KURTOSIS_DF: f64 = 5.0;

/// A continuous marginal with mean 0 and variance 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marginal {
    /// Standard normal.
    Normal,
    /// Standardized Gamma(2): long right tail.
    RightSkewed,
    /// Mirror image of `RightSkewed`.
    LeftSkewed,
    /// Standardized Student-t(5).
    HighKurtosis,
    /// Standardized Uniform: `sqrt(12)·(u − ½)`.
    Uniform,
}

/// Tabulated `z -> x` map.
#[derive(Debug, Clone)]
pub struct QuantileTable {
    values: Vec<f64>,
}

impl QuantileTable {
    fn build<F: Fn(f64) -> f64>(quantile: F) -> Self {
        let step = 2.0 * Z_MAX / (TABLE_SIZE - 1) as f64;
        let values = (0..TABLE_SIZE)
            .map(|i| {
                let z = -Z_MAX + i as f64 * step;
                quantile(normal::cdf(z))
            })
            .collect();
        Self { values }
    }

    /// Interpolated transform of a standard-normal value.
    #[inline]
    pub fn transform(&self, z: f64) -> f64 {
        let step = 2.0 * Z_MAX / (TABLE_SIZE - 1) as f64;
        let pos = ((z.clamp(-Z_MAX, Z_MAX) + Z_MAX) / step).max(0.0);
        let i = (pos.floor() as usize).min(TABLE_SIZE - 2);
        let frac = pos - i as f64;
        self.values[i] + frac * (self.values[i + 1] - self.values[i])
    }
}

fn gamma_table() -> &'static QuantileTable {
    static TABLE: OnceLock<QuantileTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let g = Gamma::new(SKEW_SHAPE, 1.0).ok();
        let scale = SKEW_SHAPE.sqrt();
        QuantileTable::build(|u| match &g {
            Some(g) => (g.inverse_cdf(u) - SKEW_SHAPE) / scale,
            None => f64::NAN,
        })
    })
}

fn kurtosis_table() -> &'static QuantileTable {
    static TABLE: OnceLock<QuantileTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let t = StudentsT::new(0.0, 1.0, KURTOSIS_DF).ok();
        let scale = (KURTOSIS_DF / (KURTOSIS_DF - 2.0)).sqrt();
        QuantileTable::build(|u| match &t {
            Some(t) => t.inverse_cdf(u) / scale,
            None => f64::NAN,
        })
    })
}

impl Marginal {
    /// Map a standard-normal draw onto this marginal.
    #[inline]
    pub fn transform(self, z: f64) -> f64 {
        match self {
            Marginal::Normal => z,
            Marginal::RightSkewed => gamma_table().transform(z),
            Marginal::LeftSkewed => -gamma_table().transform(-z),
            Marginal::HighKurtosis => kurtosis_table().transform(z),
            Marginal::Uniform => 12f64.sqrt() * (normal::cdf(z) - 0.5),
        }
    }

    /// Parse the user-facing distribution name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(Marginal::Normal),
            "right_skewed" | "right-skewed" => Some(Marginal::RightSkewed),
            "left_skewed" | "left-skewed" => Some(Marginal::LeftSkewed),
            "high_kurtosis" | "high-kurtosis" => Some(Marginal::HighKurtosis),
            "uniform" => Some(Marginal::Uniform),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quadrature::integrate;
    use approx::assert_relative_eq;

    fn moments(m: Marginal) -> (f64, f64, f64) {
        let f = |k: i32| {
            integrate(|z| normal::pdf(z) * m.transform(z).powi(k), -Z_MAX, Z_MAX, 24)
        };
        (f(1), f(2), f(3))
    }

    #[test]
    fn test_marginals_are_standardized() {
        for m in [
            Marginal::Normal,
            Marginal::RightSkewed,
            Marginal::LeftSkewed,
            Marginal::HighKurtosis,
            Marginal::Uniform,
        ] {
            let (mean, m2, _) = moments(m);
            assert!(mean.abs() < 5e-3, "{m:?} mean {mean}");
            assert_relative_eq!(m2, 1.0, epsilon = 3e-2);
        }
    }

    #[test]
    fn test_skew_direction() {
        let (_, _, right) = moments(Marginal::RightSkewed);
        let (_, _, left) = moments(Marginal::LeftSkewed);
        assert!(right > 0.5);
        assert!(left < -0.5);
    }

    #[test]
    fn test_right_skewed_matches_gamma2_cdf() {
        // Gamma(2, 1) has CDF 1 - exp(-x)(1 + x).
        for z in [-3.0, -1.0, 0.0, 0.5, 2.0, 3.5] {
            let x = Marginal::RightSkewed.transform(z) * SKEW_SHAPE.sqrt() + SKEW_SHAPE;
            let cdf = 1.0 - (-x).exp() * (1.0 + x);
            assert_relative_eq!(cdf, normal::cdf(z), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_transform_is_monotone() {
        for m in [Marginal::RightSkewed, Marginal::HighKurtosis, Marginal::Uniform] {
            let mut prev = f64::NEG_INFINITY;
            for i in 0..200 {
                let z = -5.0 + i as f64 * 0.05;
                let x = m.transform(z);
                assert!(x >= prev, "{m:?} not monotone at z={z}");
                prev = x;
            }
        }
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Marginal::from_name("Right_Skewed"), Some(Marginal::RightSkewed));
        assert_eq!(Marginal::from_name("bogus"), None);
    }
}
