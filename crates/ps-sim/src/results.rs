//! Result types returned by the power engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ps_inference::Correction;

/// Power of one requested test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPower {
    /// Test label in selector syntax (`overall`, `x1`, `cyl[1] vs cyl[2]`).
    pub test: String,
    /// Uncorrected power, in percent.
    pub power: f64,
    /// Corrected power, in percent. `None` without a correction; `NaN`
    /// (serialized as `null`) for tests outside a Tukey family.
    pub corrected_power: Option<f64>,
}

/// Outcome of one `find_power` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerResult {
    /// Sample size.
    pub sample_size: usize,
    /// Significance level.
    pub alpha: f64,
    /// Draws requested.
    pub n_simulations: usize,
    /// Draws that produced a fit.
    pub n_valid: usize,
    /// Draws discarded as singular or non-convergent.
    pub n_failed: usize,
    /// Fitting model (`ols`, `lme-intercept`, `lme-slopes`, `lme-nested`).
    pub model_type: String,
    /// Multiple-comparison correction.
    pub correction: Correction,
    /// Scenario name, when the batch ran under one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Design effect of the clustered design.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_effect: Option<f64>,
    /// Per-test power in request order.
    pub tests: Vec<TestPower>,
}

impl PowerResult {
    /// Power entry by test label.
    pub fn test(&self, name: &str) -> Option<&TestPower> {
        self.tests.iter().find(|t| t.test == name)
    }

    /// Fraction of draws that failed.
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.n_valid + self.n_failed;
        if attempted == 0 { 0.0 } else { self.n_failed as f64 / attempted as f64 }
    }
}

/// Grid `from, from + by, ..., ≤ to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSizeGrid {
    /// First sample size.
    pub from: usize,
    /// Upper bound (inclusive).
    pub to: usize,
    /// Step.
    pub by: usize,
}

impl SampleSizeGrid {
    /// New grid.
    pub fn new(from: usize, to: usize, by: usize) -> Self {
        Self { from, to, by }
    }

    /// Sample sizes in ascending order; empty when the grid is malformed.
    pub fn sizes(&self) -> Vec<usize> {
        if self.by == 0 || self.from > self.to {
            return Vec::new();
        }
        (self.from..=self.to).step_by(self.by).collect()
    }
}

/// Outcome of a sample-size search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSizeResult {
    /// Target power, in percent.
    pub target_power: f64,
    /// Power at every grid point, ascending in sample size.
    pub grid: Vec<PowerResult>,
    /// First sample size reaching the target per test; `None` when never reached.
    pub first_reaching: BTreeMap<String, Option<usize>>,
}

impl SampleSizeResult {
    /// First sample size reaching the target for `test`.
    pub fn first_reaching(&self, test: &str) -> Option<usize> {
        self.first_reaching.get(test).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_sizes() {
        assert_eq!(SampleSizeGrid::new(20, 60, 20).sizes(), vec![20, 40, 60]);
        assert_eq!(SampleSizeGrid::new(20, 65, 20).sizes(), vec![20, 40, 60]);
        assert!(SampleSizeGrid::new(20, 10, 5).sizes().is_empty());
        assert!(SampleSizeGrid::new(20, 40, 0).sizes().is_empty());
    }

    #[test]
    fn test_nan_corrected_power_serializes_as_null() {
        let r = TestPower { test: "x1".into(), power: 80.0, corrected_power: Some(f64::NAN) };
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"test":"x1","power":80.0,"corrected_power":null}"#);
    }
}
