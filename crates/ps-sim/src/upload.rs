//! User-supplied predictor columns.
//!
//! Strict mode resamples whole rows with replacement. Otherwise each column
//! acts as an empirical marginal: a latent normal `z` maps to the sample
//! quantile at `Φ(z)`, and the columns' mutual correlations seed the latent
//! correlation matrix. A declared variable type overrides the detected one;
//! factor columns are coded by level and drawn from their observed
//! frequencies outside the latent block.

use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ps_core::{Error, Result};

use crate::variables::Distribution;

/// Named numeric columns of equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedData {
    /// Column values by predictor name.
    pub columns: BTreeMap<String, Vec<f64>>,
    /// Bootstrap whole rows instead of generating from marginals.
    #[serde(default)]
    pub strict: bool,
}

impl UploadedData {
    /// Validate and wrap columns.
    pub fn new(columns: BTreeMap<String, Vec<f64>>, strict: bool) -> Result<Self> {
        let data = Self { columns, strict };
        data.validate()?;
        Ok(data)
    }

    /// Equal, non-trivial lengths and finite values.
    pub fn validate(&self) -> Result<()> {
        let mut len = None;
        for (name, col) in &self.columns {
            if col.len() < 2 {
                return Err(Error::Config(format!("uploaded column '{}' has fewer than 2 rows", name)));
            }
            if col.iter().any(|v| !v.is_finite()) {
                return Err(Error::Config(format!("uploaded column '{}' has non-finite values", name)));
            }
            match len {
                None => len = Some(col.len()),
                Some(l) if l != col.len() => {
                    return Err(Error::Config(format!(
                        "uploaded column '{}' has {} rows, expected {}",
                        name,
                        col.len(),
                        l
                    )));
                }
                _ => {}
            }
        }
        if len.is_none() {
            return Err(Error::Config("uploaded data has no columns".into()));
        }
        Ok(())
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.columns.values().next().map(Vec::len).unwrap_or(0)
    }

    /// Column names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }
}

fn is_binary(col: &[f64]) -> bool {
    col.iter().all(|&v| v == 0.0 || v == 1.0)
}

/// Distinct values of `col` in ascending order.
fn distinct_values(col: &[f64]) -> Vec<f64> {
    let mut v = col.to_vec();
    v.sort_by(f64::total_cmp);
    v.dedup();
    v
}

/// How an uploaded column enters the design.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ColumnKind {
    /// Standardized to mean 0, variance 1.
    Continuous,
    /// Coded 0/1 (lower value 0).
    Binary,
    /// Coded by level position; `values[j]` is the raw value of level `j`.
    Factor { values: Vec<f64>, proportions: Vec<f64> },
}

/// Generation-ready view of [`UploadedData`].
#[derive(Debug, Clone)]
pub(crate) struct PreparedUpload {
    names: Vec<String>,
    kinds: Vec<ColumnKind>,
    /// Coded columns in row order.
    values: Vec<Vec<f64>>,
    /// Sorted copies for empirical quantiles.
    sorted: Vec<Vec<f64>>,
    variances: Vec<f64>,
    strict: bool,
}

impl PreparedUpload {
    /// Code every column. `declared` overrides type detection per column.
    pub(crate) fn new(data: &UploadedData, declared: impl Fn(&str) -> Option<Distribution>) -> Result<Self> {
        data.validate()?;
        let mut names = Vec::new();
        let mut kinds = Vec::new();
        let mut values = Vec::new();
        let mut variances = Vec::new();
        for (name, col) in &data.columns {
            let distinct = distinct_values(col);
            if distinct.len() < 2 {
                return Err(Error::Config(format!("uploaded column '{}' is constant", name)));
            }
            let n = col.len() as f64;
            let kind = match declared(name) {
                Some(Distribution::Factor { proportions }) => {
                    if proportions.len() != distinct.len() {
                        return Err(Error::Config(format!(
                            "factor '{}' declares {} levels but the uploaded column has {} distinct values",
                            name,
                            proportions.len(),
                            distinct.len()
                        )));
                    }
                    let mut counts = vec![0usize; distinct.len()];
                    for v in col {
                        if let Ok(j) = distinct.binary_search_by(|d| d.total_cmp(v)) {
                            counts[j] += 1;
                        }
                    }
                    let proportions = counts.iter().map(|&c| c as f64 / n).collect();
                    ColumnKind::Factor { values: distinct.clone(), proportions }
                }
                Some(Distribution::Binary { .. }) => {
                    if distinct.len() != 2 {
                        return Err(Error::Config(format!(
                            "binary column '{}' has {} distinct values, expected 2",
                            name,
                            distinct.len()
                        )));
                    }
                    ColumnKind::Binary
                }
                Some(_) => ColumnKind::Continuous,
                None if is_binary(col) => ColumnKind::Binary,
                None => ColumnKind::Continuous,
            };
            let (coded, var) = match &kind {
                ColumnKind::Factor { values: levels, .. } => {
                    let coded = col
                        .iter()
                        .map(|v| levels.binary_search_by(|d| d.total_cmp(v)).unwrap_or(0) as f64)
                        .collect();
                    (coded, f64::NAN)
                }
                ColumnKind::Binary => {
                    let high = distinct[1];
                    let coded: Vec<f64> = col.iter().map(|&v| if v == high { 1.0 } else { 0.0 }).collect();
                    let p = coded.iter().sum::<f64>() / n;
                    (coded, p * (1.0 - p))
                }
                ColumnKind::Continuous => {
                    let mean = col.iter().sum::<f64>() / n;
                    let sd = (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
                    (col.iter().map(|v| (v - mean) / sd).collect(), 1.0)
                }
            };
            names.push(name.clone());
            kinds.push(kind);
            values.push(coded);
            variances.push(var);
        }
        let sorted = values
            .iter()
            .map(|c| {
                let mut s = c.clone();
                s.sort_by(f64::total_cmp);
                s
            })
            .collect();
        Ok(Self { names, kinds, values, sorted, variances, strict: data.strict })
    }

    pub(crate) fn strict(&self) -> bool {
        self.strict
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub(crate) fn n_rows(&self) -> usize {
        self.values.first().map(Vec::len).unwrap_or(0)
    }

    pub(crate) fn kind(&self, column: usize) -> &ColumnKind {
        &self.kinds[column]
    }

    /// Observed distribution of a coded column.
    pub(crate) fn distribution(&self, column: usize) -> Distribution {
        match &self.kinds[column] {
            ColumnKind::Factor { proportions, .. } => Distribution::Factor { proportions: proportions.clone() },
            ColumnKind::Binary => {
                let p = self.values[column].iter().sum::<f64>() / self.n_rows() as f64;
                Distribution::Binary { p }
            }
            ColumnKind::Continuous => Distribution::Normal,
        }
    }

    pub(crate) fn variance(&self, column: usize) -> f64 {
        self.variances[column]
    }

    pub(crate) fn value(&self, column: usize, row: usize) -> f64 {
        self.values[column][row]
    }

    /// Sample quantile of `column` at probability `u`.
    pub(crate) fn quantile(&self, column: usize, u: f64) -> f64 {
        let s = &self.sorted[column];
        let idx = ((u * s.len() as f64) as usize).min(s.len() - 1);
        s[idx]
    }

    /// Pearson correlation between two uploaded columns.
    pub(crate) fn correlation(&self, a: usize, b: usize) -> f64 {
        let (x, y) = (&self.values[a], &self.values[b]);
        let n = x.len() as f64;
        let mx = x.iter().sum::<f64>() / n;
        let my = y.iter().sum::<f64>() / n;
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        let mut syy = 0.0;
        for (u, v) in x.iter().zip(y) {
            sxy += (u - mx) * (v - my);
            sxx += (u - mx).powi(2);
            syy += (v - my).powi(2);
        }
        if sxx > 0.0 && syy > 0.0 { sxy / (sxx * syy).sqrt() } else { 0.0 }
    }

    /// Fill the latent correlations between uploaded columns listed in `names`,
    /// leaving pairs present in `declared` untouched.
    pub(crate) fn seed_correlations(
        &self,
        names: &[String],
        matrix: &mut DMatrix<f64>,
        declared: impl Fn(&str, &str) -> bool,
    ) {
        for (i, a) in names.iter().enumerate() {
            for (j, b) in names.iter().enumerate().skip(i + 1) {
                if let (Some(ca), Some(cb)) = (self.index_of(a), self.index_of(b)) {
                    if !declared(a, b) {
                        let r = self.correlation(ca, cb);
                        matrix[(i, j)] = r;
                        matrix[(j, i)] = r;
                    }
                }
            }
        }
    }

    /// Row indices for one strict-mode draw.
    pub(crate) fn bootstrap_rows<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<usize> {
        let rows = self.n_rows();
        (0..n).map(|_| rng.random_range(0..rows)).collect()
    }
}
