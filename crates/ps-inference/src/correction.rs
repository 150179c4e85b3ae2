//! Multiple-comparison correction policies and their precomputed thresholds.
//!
//! Thresholds depend only on `(alpha, family size, method, df)`, so they are
//! computed once per configuration and expressed as critical `|t|` values:
//! `p ≤ α_k  ⇔  |t| ≥ t_{1 − α_k/2, df}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use ps_core::{Error, Result};
use ps_prob::{student_t, studentized_range};

/// Multiple-comparison correction method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// No correction.
    #[default]
    None,
    /// `α / m` for every test.
    Bonferroni,
    /// Holm step-down.
    Holm,
    /// Benjamini–Hochberg step-up (false discovery rate).
    Fdr,
    /// Tukey HSD for pairwise factor-level contrasts.
    Tukey,
}

impl Correction {
    /// Parse a user-facing method name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Correction::None),
            "bonferroni" => Ok(Correction::Bonferroni),
            "holm" => Ok(Correction::Holm),
            "fdr" | "bh" | "benjamini-hochberg" => Ok(Correction::Fdr),
            "tukey" => Ok(Correction::Tukey),
            other => Err(Error::Config(format!(
                "unknown correction '{}' (expected none, bonferroni, holm, fdr or tukey)",
                other
            ))),
        }
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Correction::None => "none",
            Correction::Bonferroni => "bonferroni",
            Correction::Holm => "holm",
            Correction::Fdr => "fdr",
            Correction::Tukey => "tukey",
        }
    }
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-rank significance levels for a family of `m` tests (ascending p order).
pub fn rank_alphas(correction: Correction, alpha: f64, m: usize) -> Vec<f64> {
    let mf = m as f64;
    match correction {
        Correction::None | Correction::Tukey => vec![alpha; m],
        Correction::Bonferroni => vec![alpha / mf; m],
        Correction::Holm => (0..m).map(|k| alpha / (mf - k as f64)).collect(),
        Correction::Fdr => (0..m).map(|k| (k as f64 + 1.0) * alpha / mf).collect(),
    }
}

/// Critical `|t|` for a two-sided test at level `a`.
pub fn t_critical(a: f64, df: f64) -> Result<f64> {
    student_t::quantile(1.0 - 0.5 * a, df)
}

/// Tukey HSD critical `|t|` for a contrast among `k` levels: `q_{1−α}(k, df) / √2`.
pub fn tukey_critical(alpha: f64, k: usize, df: f64) -> Result<f64> {
    Ok(studentized_range::quantile(1.0 - alpha, k, df)? / std::f64::consts::SQRT_2)
}

/// Step-down/step-up decisions for one draw.
///
/// `abs_t[i]` is the statistic of family member `i`; `crit[k]` is the
/// critical value at rank `k` (largest statistic first).
pub fn apply_rank_thresholds(correction: Correction, abs_t: &[f64], crit: &[f64]) -> Vec<bool> {
    let m = abs_t.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| abs_t[b].total_cmp(&abs_t[a]));
    let mut reject = vec![false; m];
    match correction {
        Correction::Holm => {
            for (k, &i) in order.iter().enumerate() {
                if abs_t[i] >= crit[k] {
                    reject[i] = true;
                } else {
                    break;
                }
            }
        }
        Correction::Fdr => {
            if let Some(last) = (0..m).rev().find(|&k| abs_t[order[k]] >= crit[k]) {
                for &i in &order[..=last] {
                    reject[i] = true;
                }
            }
        }
        _ => {
            for (r, &t) in reject.iter_mut().zip(abs_t) {
                *r = t >= crit[0];
            }
        }
    }
    reject
}
