//! Common data types for PowerStat

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Dense row-major design matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    n: usize,
    p: usize,
    data: Vec<f64>, // length n*p, row-major
}

impl DesignMatrix {
    /// Wrap a flat row-major buffer of shape `(n, p)`.
    pub fn from_row_major(n: usize, p: usize, data: Vec<f64>) -> Result<Self> {
        if n == 0 || p == 0 {
            return Err(Error::Validation("X must be non-empty (n>0, p>0)".to_string()));
        }
        if data.len() != n * p {
            return Err(Error::Validation(format!(
                "X has wrong length: expected n*p={}, got {}",
                n * p,
                data.len()
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation("X must contain only finite values".to_string()));
        }
        Ok(Self { n, p, data })
    }

    /// Build from row vectors; all rows must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = rows.len();
        let p = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(n * p);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != p {
                return Err(Error::Validation(format!(
                    "X must be rectangular: row {} has len {}, expected {}",
                    i,
                    row.len(),
                    p
                )));
            }
            data.extend(row);
        }
        Self::from_row_major(n, p, data)
    }

    /// Number of observations.
    #[inline]
    pub fn nrows(&self) -> usize {
        self.n
    }

    /// Number of columns.
    #[inline]
    pub fn ncols(&self) -> usize {
        self.p
    }

    /// Row `i` as a slice.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        let start = i * self.p;
        &self.data[start..start + self.p]
    }

    /// Element `(i, j)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.p + j]
    }

    /// Copy of column `j`.
    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.n).map(|i| self.get(i, j)).collect()
    }

    /// Raw row-major buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Cluster membership for one grouping factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    /// Group index of each observation, in `[0, n_groups)`.
    pub ids: Vec<usize>,
    /// Number of distinct groups.
    pub n_groups: usize,
}

impl Grouping {
    /// Validate ids against `n_groups` and the expected observation count.
    pub fn validate(&self, n: usize) -> Result<()> {
        if self.n_groups == 0 {
            return Err(Error::Validation("n_groups must be > 0".to_string()));
        }
        if self.ids.len() != n {
            return Err(Error::Validation(format!(
                "group ids length must match n: expected {}, got {}",
                n,
                self.ids.len()
            )));
        }
        if self.ids.iter().any(|&g| g >= self.n_groups) {
            return Err(Error::Validation("group ids must be in [0, n_groups)".to_string()));
        }
        Ok(())
    }
}

/// Random-effects layout of a simulated dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomStructure {
    /// Top-level grouping (e.g. school).
    pub primary: Grouping,
    /// Nested grouping inside `primary` (e.g. classroom within school).
    pub nested: Option<Grouping>,
    /// Design-matrix columns that carry a random slope in `primary`.
    pub slope_columns: Vec<usize>,
}

/// Result of fitting one simulated dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Fixed-effect estimates (one per design column, intercept first).
    pub coefficients: Vec<f64>,

    /// Standard errors (sqrt of covariance diagonal).
    pub std_errors: Vec<f64>,

    /// Covariance matrix of the estimates (row-major, p×p).
    pub covariance: Vec<f64>,

    /// Residual degrees of freedom used for t and F reference distributions.
    pub df_residual: f64,

    /// Overall F statistic against the intercept-only model (`NaN` if undefined).
    pub f_statistic: f64,

    /// Numerator degrees of freedom of `f_statistic`.
    pub f_df: usize,

    /// Residual variance estimate.
    pub sigma2: f64,

    /// Random-effect variance components (empty for OLS).
    pub variance_components: Vec<f64>,

    /// Convergence status
    pub converged: bool,

    /// Number of objective evaluations (0 for closed-form fits).
    pub n_evaluations: usize,
}

impl FitResult {
    /// Number of fixed-effect coefficients.
    pub fn n_coefficients(&self) -> usize {
        self.coefficients.len()
    }

    /// Covariance element `(i, j)`.
    #[inline]
    pub fn cov(&self, i: usize, j: usize) -> f64 {
        self.covariance[i * self.coefficients.len() + j]
    }

    /// Wald t statistic for coefficient `i`. `None` when the SE is degenerate.
    pub fn t_statistic(&self, i: usize) -> Option<f64> {
        let est = *self.coefficients.get(i)?;
        let se = *self.std_errors.get(i)?;
        if se > 0.0 && se.is_finite() { Some(est / se) } else { None }
    }

    /// Estimate and standard error of `beta_a - beta_b`.
    ///
    /// `None` stands for the implicit zero coefficient of a reference level.
    pub fn contrast(&self, a: Option<usize>, b: Option<usize>) -> Option<(f64, f64)> {
        let coef = |k: Option<usize>| k.map(|k| self.coefficients[k]).unwrap_or(0.0);
        let var = match (a, b) {
            (Some(a), Some(b)) => self.cov(a, a) + self.cov(b, b) - 2.0 * self.cov(a, b),
            (Some(a), None) => self.cov(a, a),
            (None, Some(b)) => self.cov(b, b),
            (None, None) => return None,
        };
        if !(var > 0.0 && var.is_finite()) {
            return None;
        }
        Some((coef(a) - coef(b), var.sqrt()))
    }

    /// Correlation between estimates `i` and `j`.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let n = self.coefficients.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.std_errors[i];
        let sigma_j = self.std_errors[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(self.cov(i, j) / (sigma_i * sigma_j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit_2x2() -> FitResult {
        FitResult {
            coefficients: vec![1.0, 0.5],
            std_errors: vec![0.2, 0.1],
            covariance: vec![0.04, 0.002, 0.002, 0.01],
            df_residual: 98.0,
            f_statistic: 25.0,
            f_df: 1,
            sigma2: 1.0,
            variance_components: vec![],
            converged: true,
            n_evaluations: 0,
        }
    }

    #[test]
    fn test_design_matrix_shape_checks() {
        assert!(DesignMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).is_err());
        assert!(DesignMatrix::from_row_major(2, 2, vec![1.0; 3]).is_err());
        let x = DesignMatrix::from_rows(vec![vec![1.0, 2.0], vec![1.0, 4.0]]).unwrap();
        assert_eq!(x.column(1), vec![2.0, 4.0]);
        assert_eq!(x.row(1), &[1.0, 4.0]);
    }

    #[test]
    fn test_t_statistic_and_contrast() {
        let f = fit_2x2();
        assert!((f.t_statistic(1).unwrap() - 5.0).abs() < 1e-12);
        let (est, se) = f.contrast(Some(0), Some(1)).unwrap();
        assert!((est - 0.5).abs() < 1e-12);
        assert!((se - (0.04f64 + 0.01 - 0.004).sqrt()).abs() < 1e-12);
        let (est, se) = f.contrast(None, Some(1)).unwrap();
        assert!((est + 0.5).abs() < 1e-12);
        assert!((se - 0.1).abs() < 1e-12);
        assert!(f.contrast(None, None).is_none());
    }

    #[test]
    fn test_grouping_validate() {
        let g = Grouping { ids: vec![0, 0, 1], n_groups: 2 };
        assert!(g.validate(3).is_ok());
        assert!(g.validate(4).is_err());
        let bad = Grouping { ids: vec![0, 2], n_groups: 2 };
        assert!(bad.validate(2).is_err());
    }
}
