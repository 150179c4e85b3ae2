//! Predictor distributions.
//!
//! Continuous and binary predictors are generated from a latent correlated
//! normal block; factors are drawn independently from their level
//! proportions.

use serde::{Deserialize, Serialize};

use ps_core::{Error, Result};
use ps_formula::FactorLevels;
use ps_prob::Marginal;

/// Tolerance on `Σ proportions = 1` for factors.
const PROPORTION_TOL: f64 = 1e-6;

/// Distribution of one predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// Standard normal.
    Normal,
    /// 0/1 indicator with success probability `p`.
    Binary {
        /// `P(x = 1)`.
        p: f64,
    },
    /// Categorical predictor with level proportions (reference level first by default).
    Factor {
        /// Level probabilities; must sum to 1.
        proportions: Vec<f64>,
    },
    /// Standardized Gamma(2).
    RightSkewed,
    /// Mirror of `RightSkewed`.
    LeftSkewed,
    /// Standardized Student-t(5).
    HighKurtosis,
    /// Standardized uniform.
    Uniform,
}

impl Distribution {
    /// Parse a parameter-free name (`"normal"`, `"binary"` = Bernoulli(½), `"right_skewed"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let key = name.trim().to_ascii_lowercase();
        if key == "binary" {
            return Some(Distribution::Binary { p: 0.5 });
        }
        Marginal::from_name(&key).map(Distribution::from)
    }

    /// Factor with `k` equally likely levels.
    pub fn balanced_factor(k: usize) -> Self {
        Distribution::Factor { proportions: vec![1.0 / k.max(1) as f64; k] }
    }

    /// `true` for categorical predictors.
    pub fn is_factor(&self) -> bool {
        matches!(self, Distribution::Factor { .. })
    }

    /// Continuous marginal, if this is a continuous distribution.
    pub fn marginal(&self) -> Option<Marginal> {
        match self {
            Distribution::Normal => Some(Marginal::Normal),
            Distribution::RightSkewed => Some(Marginal::RightSkewed),
            Distribution::LeftSkewed => Some(Marginal::LeftSkewed),
            Distribution::HighKurtosis => Some(Marginal::HighKurtosis),
            Distribution::Uniform => Some(Marginal::Uniform),
            Distribution::Binary { .. } | Distribution::Factor { .. } => None,
        }
    }

    /// Population variance; `None` for factors (see [`Distribution::dummy_variance`]).
    pub fn variance(&self) -> Option<f64> {
        match self {
            Distribution::Binary { p } => Some(p * (1.0 - p)),
            Distribution::Factor { .. } => None,
            _ => Some(1.0),
        }
    }

    /// Variance `π_j (1 − π_j)` of the indicator of level `level`.
    pub fn dummy_variance(&self, level: usize) -> Option<f64> {
        match self {
            Distribution::Factor { proportions } => {
                proportions.get(level).map(|p| p * (1.0 - p))
            }
            _ => None,
        }
    }

    /// Check parameters; `name` is used in messages.
    pub fn validate(&self, name: &str) -> Result<()> {
        match self {
            Distribution::Binary { p } => {
                if !(*p > 0.0 && *p < 1.0) {
                    return Err(Error::Config(format!(
                        "binary variable '{}' needs p in (0, 1), got {}",
                        name, p
                    )));
                }
            }
            Distribution::Factor { proportions } => {
                if proportions.len() < 2 {
                    return Err(Error::Config(format!(
                        "factor '{}' needs at least 2 level proportions",
                        name
                    )));
                }
                if proportions.iter().any(|p| !(*p > 0.0 && *p < 1.0)) {
                    return Err(Error::Config(format!(
                        "factor '{}' proportions must lie in (0, 1)",
                        name
                    )));
                }
                let sum: f64 = proportions.iter().sum();
                if (sum - 1.0).abs() > PROPORTION_TOL {
                    return Err(Error::Config(format!(
                        "factor '{}' proportions sum to {}, expected 1",
                        name, sum
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl From<Marginal> for Distribution {
    fn from(m: Marginal) -> Self {
        match m {
            Marginal::Normal => Distribution::Normal,
            Marginal::RightSkewed => Distribution::RightSkewed,
            Marginal::LeftSkewed => Distribution::LeftSkewed,
            Marginal::HighKurtosis => Distribution::HighKurtosis,
            Marginal::Uniform => Distribution::Uniform,
        }
    }
}

/// Declaration of one predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Distribution.
    pub distribution: Distribution,
    /// Level names for factors (default `"1".."k"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<String>>,
    /// Reference level name for factors (default: first level).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl VariableSpec {
    /// Spec with default level naming.
    pub fn new(distribution: Distribution) -> Self {
        Self { distribution, levels: None, reference: None }
    }

    /// Factor with named levels.
    pub fn factor(proportions: Vec<f64>, levels: Vec<String>, reference: Option<String>) -> Self {
        Self { distribution: Distribution::Factor { proportions }, levels: Some(levels), reference }
    }

    /// Validate the distribution and, for factors, the level names.
    pub fn validate(&self, name: &str) -> Result<()> {
        self.distribution.validate(name)?;
        if !self.distribution.is_factor() && (self.levels.is_some() || self.reference.is_some()) {
            return Err(Error::Config(format!(
                "variable '{}' declares levels but is not a factor",
                name
            )));
        }
        self.factor_levels(name).map(|_| ())
    }

    /// Level table for factors; `None` otherwise.
    pub fn factor_levels(&self, name: &str) -> Result<Option<FactorLevels>> {
        let Distribution::Factor { proportions } = &self.distribution else {
            return Ok(None);
        };
        let levels = match &self.levels {
            Some(names) => {
                if names.len() != proportions.len() {
                    return Err(Error::Config(format!(
                        "factor '{}' has {} level names but {} proportions",
                        name,
                        names.len(),
                        proportions.len()
                    )));
                }
                FactorLevels::with_names(names.clone(), self.reference.as_deref())?
            }
            None => {
                let fl = FactorLevels::from_count(proportions.len())?;
                match &self.reference {
                    Some(r) => FactorLevels::with_names(fl.names().to_vec(), Some(r))?,
                    None => fl,
                }
            }
        };
        Ok(Some(levels))
    }
}

impl Default for VariableSpec {
    fn default() -> Self {
        Self::new(Distribution::Normal)
    }
}

impl From<Distribution> for VariableSpec {
    fn from(distribution: Distribution) -> Self {
        Self::new(distribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_variances() {
        assert_eq!(Distribution::Normal.variance(), Some(1.0));
        assert_eq!(Distribution::Uniform.variance(), Some(1.0));
        assert_relative_eq!(Distribution::Binary { p: 0.3 }.variance().unwrap(), 0.21);
        let f = Distribution::Factor { proportions: vec![0.5, 0.3, 0.2] };
        assert!(f.variance().is_none());
        assert_relative_eq!(f.dummy_variance(2).unwrap(), 0.16);
    }

    #[test]
    fn test_validation() {
        assert!(Distribution::Binary { p: 1.0 }.validate("b").is_err());
        assert!(Distribution::Factor { proportions: vec![0.5, 0.4] }.validate("f").is_err());
        assert!(Distribution::Factor { proportions: vec![1.0] }.validate("f").is_err());
        assert!(Distribution::balanced_factor(4).validate("f").is_ok());
    }

    #[test]
    fn test_factor_levels() {
        let spec = VariableSpec::factor(
            vec![0.2, 0.3, 0.5],
            vec!["a".into(), "b".into(), "c".into()],
            Some("c".into()),
        );
        let fl = spec.factor_levels("g").unwrap().unwrap();
        assert_eq!(fl.reference_name(), "c");
        let bad = VariableSpec::factor(vec![0.5, 0.5], vec!["a".into()], None);
        assert!(bad.validate("g").is_err());

        let default = VariableSpec::new(Distribution::balanced_factor(3));
        let fl = default.factor_levels("g").unwrap().unwrap();
        assert_eq!(fl.names(), &["1", "2", "3"]);
        assert!(VariableSpec::new(Distribution::Normal).factor_levels("x").unwrap().is_none());
    }

    #[test]
    fn test_serde_tagging() {
        let spec = VariableSpec::new(Distribution::Binary { p: 0.4 });
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"distribution":{"type":"binary","p":0.4}}"#);
        let back: VariableSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        let skew: Distribution = serde_json::from_str(r#"{"type":"right_skewed"}"#).unwrap();
        assert_eq!(skew, Distribution::RightSkewed);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Distribution::from_name("Binary"), Some(Distribution::Binary { p: 0.5 }));
        assert_eq!(Distribution::from_name("uniform"), Some(Distribution::Uniform));
        assert_eq!(Distribution::from_name("poisson"), None);
    }
}
