//! Per-draw significance decisions.
//!
//! An [`InferencePlan`] is built once per configuration: it fixes the tests,
//! the reference-distribution critical values and the correction thresholds.
//! [`InferencePlan::evaluate`] then turns each [`FitResult`] into decisions
//! without touching a quantile function.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use ps_core::{Error, FitResult, Result};
use ps_prob::f_dist;

use crate::correction::{
    Correction, apply_rank_thresholds, rank_alphas, t_critical, tukey_critical,
};

/// User-facing identity of a hypothesis test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestId {
    /// Overall F test of all non-intercept coefficients.
    Overall,
    /// Two-sided t test of one design column.
    Coefficient(String),
    /// Pairwise contrast between two levels of a factor.
    Contrast {
        /// Factor name.
        factor: String,
        /// First level.
        a: String,
        /// Second level.
        b: String,
    },
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestId::Overall => f.write_str("overall"),
            TestId::Coefficient(name) => f.write_str(name),
            TestId::Contrast { factor, a, b } => write!(f, "{factor}[{a}] vs {factor}[{b}]"),
        }
    }
}

/// How a test reads the fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestKind {
    /// Compare the overall F statistic to `F(df1, df2)`.
    Overall,
    /// `|β_j / se_j|` for design column `column`.
    Coefficient {
        /// Design column index.
        column: usize,
    },
    /// `|β_a − β_b| / se`; `None` is the reference level (coefficient 0).
    Contrast {
        /// Dummy column of the first level.
        a: Option<usize>,
        /// Dummy column of the second level.
        b: Option<usize>,
        /// Number of factor levels (Tukey family size).
        n_levels: usize,
    },
}

/// A resolved test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTest {
    /// Identity.
    pub id: TestId,
    /// Evaluation rule.
    pub kind: TestKind,
}

/// Decision for one test in one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    /// Significant at the nominal level.
    pub significant: bool,
    /// Significant after correction; `None` when no correction applies to this test.
    pub corrected: Option<bool>,
}

/// Precomputed evaluation rules for one configuration.
#[derive(Debug, Clone)]
pub struct InferencePlan {
    tests: Vec<PlannedTest>,
    alpha: f64,
    correction: Correction,
    t_crit: f64,
    f_crit: f64,
    /// Indices of tests in the correction family.
    family: Vec<usize>,
    /// Critical `|t|` per rank (family tests, largest statistic first).
    rank_crit: Vec<f64>,
    /// Tukey critical `|t|` per test (`NaN` for non-contrasts).
    tukey_crit: Vec<f64>,
}

impl InferencePlan {
    /// Precompute critical values.
    ///
    /// `df_residual` is the t / denominator-F degrees of freedom and `f_df`
    /// the numerator degrees of freedom of the overall test.
    pub fn new(
        tests: Vec<PlannedTest>,
        alpha: f64,
        correction: Correction,
        df_residual: f64,
        f_df: usize,
    ) -> Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(Error::Config(format!("alpha must be in (0, 1), got {}", alpha)));
        }
        if !(df_residual > 0.0) {
            return Err(Error::Config(format!(
                "residual degrees of freedom must be positive, got {} (sample size too small)",
                df_residual
            )));
        }
        if tests.is_empty() {
            return Err(Error::Config("no tests requested".into()));
        }

        let t_crit = t_critical(alpha, df_residual)?;
        let f_crit = if f_df > 0 {
            f_dist::quantile(1.0 - alpha, f_df as f64, df_residual)?
        } else {
            f64::NAN
        };

        let family: Vec<usize> = match correction {
            Correction::None => Vec::new(),
            Correction::Tukey => tests
                .iter()
                .enumerate()
                .filter(|(_, t)| matches!(t.kind, TestKind::Contrast { .. }))
                .map(|(i, _)| i)
                .collect(),
            _ => tests
                .iter()
                .enumerate()
                .filter(|(_, t)| t.kind != TestKind::Overall)
                .map(|(i, _)| i)
                .collect(),
        };

        let rank_crit = match correction {
            Correction::Bonferroni | Correction::Holm | Correction::Fdr => {
                rank_alphas(correction, alpha, family.len())
                    .into_iter()
                    .map(|a| t_critical(a, df_residual))
                    .collect::<Result<Vec<_>>>()?
            }
            _ => Vec::new(),
        };

        let mut tukey_crit = vec![f64::NAN; tests.len()];
        if correction == Correction::Tukey {
            let mut by_levels: BTreeMap<usize, f64> = BTreeMap::new();
            for (i, t) in tests.iter().enumerate() {
                if let TestKind::Contrast { n_levels, .. } = t.kind {
                    let q = match by_levels.get(&n_levels) {
                        Some(&q) => q,
                        None => {
                            let q = tukey_critical(alpha, n_levels, df_residual)?;
                            by_levels.insert(n_levels, q);
                            q
                        }
                    };
                    tukey_crit[i] = q;
                }
            }
        }

        Ok(Self { tests, alpha, correction, t_crit, f_crit, family, rank_crit, tukey_crit })
    }

    /// Planned tests in output order.
    pub fn tests(&self) -> &[PlannedTest] {
        &self.tests
    }

    /// Nominal significance level.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Correction method.
    pub fn correction(&self) -> Correction {
        self.correction
    }

    /// Number of tests in the correction family.
    pub fn family_size(&self) -> usize {
        self.family.len()
    }

    /// Uncorrected critical `|t|`.
    pub fn t_critical(&self) -> f64 {
        self.t_crit
    }

    /// `|t|` (or F for the overall test) of every planned test; 0 when undefined.
    fn statistics(&self, fit: &FitResult) -> Vec<f64> {
        self.tests
            .iter()
            .map(|t| {
                let s = match t.kind {
                    TestKind::Overall => fit.f_statistic,
                    TestKind::Coefficient { column } => {
                        fit.t_statistic(column).map(f64::abs).unwrap_or(0.0)
                    }
                    TestKind::Contrast { a, b, .. } => {
                        fit.contrast(a, b).map(|(est, se)| (est / se).abs()).unwrap_or(0.0)
                    }
                };
                if s.is_nan() { 0.0 } else { s }
            })
            .collect()
    }

    /// Decisions for every planned test, in plan order.
    pub fn evaluate(&self, fit: &FitResult) -> Vec<TestOutcome> {
        let stats = self.statistics(fit);
        let mut out: Vec<TestOutcome> = self
            .tests
            .iter()
            .zip(&stats)
            .map(|(t, &s)| {
                let significant = match t.kind {
                    TestKind::Overall => self.f_crit.is_finite() && s >= self.f_crit,
                    _ => s >= self.t_crit,
                };
                TestOutcome { significant, corrected: None }
            })
            .collect();

        match self.correction {
            Correction::None => {}
            Correction::Tukey => {
                for &i in &self.family {
                    out[i].corrected = Some(stats[i] >= self.tukey_crit[i]);
                }
            }
            c => {
                let fam_stats: Vec<f64> = self.family.iter().map(|&i| stats[i]).collect();
                let reject = apply_rank_thresholds(c, &fam_stats, &self.rank_crit);
                for (&i, r) in self.family.iter().zip(reject) {
                    out[i].corrected = Some(r);
                }
            }
        }
        // The overall test sits outside every family and keeps its raw decision.
        if self.correction != Correction::None {
            for (o, t) in out.iter_mut().zip(&self.tests) {
                if t.kind == TestKind::Overall {
                    o.corrected = Some(o.significant);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit(coefs: &[f64], se: &[f64], f: f64, df: f64) -> FitResult {
        let p = coefs.len();
        let mut covariance = vec![0.0; p * p];
        for i in 0..p {
            covariance[i * p + i] = se[i] * se[i];
        }
        FitResult {
            coefficients: coefs.to_vec(),
            std_errors: se.to_vec(),
            covariance,
            df_residual: df,
            f_statistic: f,
            f_df: p - 1,
            sigma2: 1.0,
            variance_components: vec![],
            converged: true,
            n_evaluations: 0,
        }
    }

    fn coef(name: &str, column: usize) -> PlannedTest {
        PlannedTest { id: TestId::Coefficient(name.into()), kind: TestKind::Coefficient { column } }
    }

    fn contrast(a: Option<usize>, b: Option<usize>, la: &str, lb: &str) -> PlannedTest {
        PlannedTest {
            id: TestId::Contrast { factor: "g".into(), a: la.into(), b: lb.into() },
            kind: TestKind::Contrast { a, b, n_levels: 3 },
        }
    }

    #[test]
    fn test_display_in_selector_syntax() {
        assert_eq!(TestId::Overall.to_string(), "overall");
        let c = TestId::Contrast { factor: "cyl".into(), a: "2".into(), b: "3".into() };
        assert_eq!(c.to_string(), "cyl[2] vs cyl[3]");
    }

    #[test]
    fn test_raw_decisions() {
        let overall = PlannedTest { id: TestId::Overall, kind: TestKind::Overall };
        let plan =
            InferencePlan::new(vec![overall, coef("x1", 1), coef("x2", 2)], 0.05, Correction::None, 100.0, 2)
                .unwrap();
        let r = plan.evaluate(&fit(&[0.0, 0.5, 0.1], &[1.0, 0.1, 0.1], 12.0, 100.0));
        assert!(r[0].significant);
        assert!(r[1].significant);
        assert!(!r[2].significant);
        assert!(r.iter().all(|o| o.corrected.is_none()));
    }

    #[test]
    fn test_bonferroni_family_excludes_overall() {
        let overall = PlannedTest { id: TestId::Overall, kind: TestKind::Overall };
        let plan = InferencePlan::new(
            vec![overall, coef("x1", 1), coef("x2", 2)],
            0.05,
            Correction::Bonferroni,
            200.0,
            2,
        )
        .unwrap();
        assert_eq!(plan.family_size(), 2);
        // t = 2.1: significant raw, not after α/2.
        let r = plan.evaluate(&fit(&[0.0, 0.21, 0.5], &[1.0, 0.1, 0.1], 1.0, 200.0));
        assert!(r[1].significant);
        assert_eq!(r[1].corrected, Some(false));
        assert_eq!(r[2].corrected, Some(true));
        assert_eq!(r[0].corrected, Some(r[0].significant));
    }

    #[test]
    fn test_tukey_marks_non_contrasts_not_applicable() {
        let tests = vec![coef("g[2]", 1), contrast(None, Some(1), "1", "2"), contrast(Some(1), Some(2), "2", "3")];
        let plan = InferencePlan::new(tests, 0.05, Correction::Tukey, 60.0, 2).unwrap();
        assert_eq!(plan.family_size(), 2);
        let r = plan.evaluate(&fit(&[0.0, 0.6, 0.0], &[1.0, 0.25, 0.25], 3.0, 60.0));
        assert!(r[0].corrected.is_none());
        // |t| = 2.4 for 1 vs 2: above t crit (≈2.0), below Tukey crit (≈2.4 for k=3).
        assert!(r[1].significant);
        assert!(r[1].corrected.is_some());
        let tukey = plan.tukey_crit[1];
        assert!(tukey > plan.t_critical());
    }

    #[test]
    fn test_corrected_never_exceeds_raw() {
        let tests = vec![coef("a", 1), coef("b", 2), coef("c", 3)];
        for c in [Correction::Bonferroni, Correction::Holm, Correction::Fdr] {
            let plan = InferencePlan::new(tests.clone(), 0.05, c, 50.0, 3).unwrap();
            for scale in [0.05, 0.1, 0.2, 0.3] {
                let f = fit(&[0.0, scale * 2.0, scale * 2.6, scale * 3.1], &[1.0, 0.1, 0.1, 0.1], 0.0, 50.0);
                for o in plan.evaluate(&f) {
                    assert!(!o.corrected.unwrap_or(false) || o.significant);
                }
            }
        }
    }

    #[test]
    fn test_invalid_plan() {
        assert!(InferencePlan::new(vec![coef("a", 1)], 1.5, Correction::None, 10.0, 1).is_err());
        assert!(InferencePlan::new(vec![coef("a", 1)], 0.05, Correction::None, 0.0, 1).is_err());
        assert!(InferencePlan::new(vec![], 0.05, Correction::None, 10.0, 1).is_err());
    }
}
