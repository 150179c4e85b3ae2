//! Predictor correlations: assembly, PSD validation and repair.

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use ps_core::{Error, Result};

/// Smallest eigenvalue accepted as PSD.
const PSD_TOL: f64 = -1e-10;
/// Off-diagonal clamp applied to perturbed matrices.
pub const MAX_PERTURBED_CORRELATION: f64 = 0.99;
/// Eigenvalue floor used by [`repair`].
pub const EIGEN_FLOOR: f64 = 1e-6;

/// Correlation between two predictors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationPair {
    /// First predictor.
    pub a: String,
    /// Second predictor.
    pub b: String,
    /// Pearson correlation of the latent normals.
    pub r: f64,
}

impl CorrelationPair {
    fn is_pair(&self, a: &str, b: &str) -> bool {
        (self.a == a && self.b == b) || (self.a == b && self.b == a)
    }
}

/// Sparse correlation declaration over non-factor predictors; unset pairs are 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationSpec {
    pairs: Vec<CorrelationPair>,
}

impl CorrelationSpec {
    /// Empty spec (identity matrix).
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy with `(a, b) = r`; replaces an earlier value for the same unordered pair.
    pub fn with(&self, a: impl Into<String>, b: impl Into<String>, r: f64) -> Self {
        let (a, b) = (a.into(), b.into());
        let mut pairs: Vec<CorrelationPair> =
            self.pairs.iter().filter(|p| !p.is_pair(&a, &b)).cloned().collect();
        pairs.push(CorrelationPair { a, b, r });
        Self { pairs }
    }

    /// Merge `other` into a copy of `self`; `other` wins on shared pairs.
    pub fn merge(&self, other: &CorrelationSpec) -> Self {
        other.pairs.iter().fold(self.clone(), |acc, p| acc.with(p.a.clone(), p.b.clone(), p.r))
    }

    /// Declared pairs.
    pub fn pairs(&self) -> &[CorrelationPair] {
        &self.pairs
    }

    /// Declared value for `(a, b)`.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        self.pairs.iter().find(|p| p.is_pair(a, b)).map(|p| p.r)
    }

    /// Dense matrix over `names`. Every pair must name two distinct entries of `names`.
    pub fn matrix(&self, names: &[String]) -> Result<DMatrix<f64>> {
        let k = names.len();
        let mut m = DMatrix::identity(k, k);
        for p in &self.pairs {
            if p.a == p.b {
                return Err(Error::Config(format!(
                    "correlation of '{}' with itself is fixed at 1",
                    p.a
                )));
            }
            if !(p.r.abs() <= 1.0) {
                return Err(Error::Config(format!(
                    "correlation ({}, {}) = {} is outside [-1, 1]",
                    p.a, p.b, p.r
                )));
            }
            let find = |v: &str| {
                names.iter().position(|n| n == v).ok_or_else(|| {
                    Error::Config(format!(
                        "correlation references '{}', which is not a continuous or binary predictor",
                        v
                    ))
                })
            };
            let (i, j) = (find(&p.a)?, find(&p.b)?);
            m[(i, j)] = p.r;
            m[(j, i)] = p.r;
        }
        Ok(m)
    }
}

/// Reject matrices with a negative eigenvalue.
pub fn check_psd(m: &DMatrix<f64>) -> Result<()> {
    if m.nrows() == 0 {
        return Ok(());
    }
    let min = m.clone().symmetric_eigenvalues().iter().copied().fold(f64::INFINITY, f64::min);
    if min < PSD_TOL {
        return Err(Error::Config(format!(
            "correlation matrix is not positive semi-definite (smallest eigenvalue {:.4})",
            min
        )));
    }
    Ok(())
}

/// Lower Cholesky factor, or `None` if `m` is not positive definite.
pub fn cholesky_factor(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    m.clone().cholesky().map(|c| c.l())
}

/// Nearest well-conditioned correlation matrix: clamp off-diagonals, floor the
/// eigenvalues at [`EIGEN_FLOOR`], rescale to a unit diagonal.
pub fn repair(m: &DMatrix<f64>) -> DMatrix<f64> {
    let k = m.nrows();
    let mut clipped = m.clone();
    for i in 0..k {
        for j in 0..k {
            if i != j {
                clipped[(i, j)] =
                    clipped[(i, j)].clamp(-MAX_PERTURBED_CORRELATION, MAX_PERTURBED_CORRELATION);
            }
        }
        clipped[(i, i)] = 1.0;
    }
    let eig = clipped.symmetric_eigen();
    let floored = eig.eigenvalues.map(|v| v.max(EIGEN_FLOOR));
    let rebuilt =
        &eig.eigenvectors * DMatrix::from_diagonal(&floored) * eig.eigenvectors.transpose();
    let scale: Vec<f64> = (0..k).map(|i| rebuilt[(i, i)].max(EIGEN_FLOOR).sqrt()).collect();
    DMatrix::from_fn(k, k, |i, j| {
        if i == j { 1.0 } else { rebuilt[(i, j)] / (scale[i] * scale[j]) }
    })
}

/// Cholesky factor of a validated matrix, repairing PSD-but-singular input.
///
/// Returns the factor and whether a repair was needed.
pub fn factor_or_repair(m: &DMatrix<f64>) -> Result<(DMatrix<f64>, bool)> {
    if let Some(l) = cholesky_factor(m) {
        return Ok((l, false));
    }
    cholesky_factor(&repair(m))
        .map(|l| (l, true))
        .ok_or_else(|| Error::Computation("correlation repair did not yield a factorable matrix".into()))
}

/// Add `N(0, sd)` noise to every off-diagonal pair, clamp and factor.
///
/// Returns the factor of the perturbed matrix and whether repair was needed.
pub fn perturb<R: Rng + ?Sized>(
    m: &DMatrix<f64>,
    sd: f64,
    rng: &mut R,
) -> Result<(DMatrix<f64>, bool)> {
    let k = m.nrows();
    let mut noisy = m.clone();
    for i in 0..k {
        for j in (i + 1)..k {
            let e: f64 = rng.sample(StandardNormal);
            let v = (m[(i, j)] + sd * e)
                .clamp(-MAX_PERTURBED_CORRELATION, MAX_PERTURBED_CORRELATION);
            noisy[(i, j)] = v;
            noisy[(j, i)] = v;
        }
    }
    factor_or_repair(&noisy)
}
