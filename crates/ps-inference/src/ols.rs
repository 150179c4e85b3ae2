//! Ordinary least squares via Householder QR.
//!
//! `X = QR`, `β = R⁻¹ Qᵀ y`, `Cov(β) = σ² R⁻¹ R⁻ᵀ`. The normal equations are
//! never formed, so conditioning is that of `X`, not `XᵀX`.

use nalgebra::{DMatrix, DVector};
use ps_core::{DesignMatrix, Error, FitResult, ModelSolver, RandomStructure, Result};

/// Relative threshold on `|R_jj|` below which a column counts as collinear.
const RANK_TOL: f64 = 1e-10;

/// Numerical rank of `X` from the diagonal of its R factor.
pub(crate) fn qr_rank(r: &DMatrix<f64>) -> usize {
    let p = r.ncols().min(r.nrows());
    let scale = (0..p).map(|j| r[(j, j)].abs()).fold(0.0_f64, f64::max);
    if scale == 0.0 {
        return 0;
    }
    (0..p).filter(|&j| r[(j, j)].abs() > RANK_TOL * scale).count()
}

/// Overall F test of all non-intercept columns against the intercept-only model.
///
/// Returns `(F, df1)`; `F` is `NaN` when there is nothing to test.
pub(crate) fn overall_f(y: &[f64], rss: f64, p: usize, df_resid: f64) -> (f64, usize) {
    if p < 2 || df_resid <= 0.0 {
        return (f64::NAN, 0);
    }
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let tss: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    let df1 = p - 1;
    let mse = rss / df_resid;
    if mse <= 0.0 {
        return (f64::INFINITY, df1);
    }
    (((tss - rss).max(0.0) / df1 as f64) / mse, df1)
}

/// Fit `y = Xβ + ε` by least squares. Column 0 of `X` must be the intercept.
pub fn fit_ols(x: &DesignMatrix, y: &[f64]) -> Result<FitResult> {
    let n = x.nrows();
    let p = x.ncols();
    if y.len() != n {
        return Err(Error::Validation(format!("y length {} != n {}", y.len(), n)));
    }
    if n <= p {
        return Err(Error::SingularDesign(format!(
            "{} observations cannot identify {} coefficients",
            n, p
        )));
    }

    let xm = DMatrix::from_row_slice(n, p, x.as_slice());
    let yv = DVector::from_column_slice(y);

    let qr = xm.clone().qr();
    let r = qr.r();
    let rank = qr_rank(&r);
    if rank < p {
        return Err(Error::SingularDesign(format!(
            "design matrix has rank {} < {} columns (collinear predictors)",
            rank, p
        )));
    }

    let qty = qr.q().transpose() * &yv;
    let beta = r
        .solve_upper_triangular(&qty)
        .ok_or_else(|| Error::SingularDesign("R factor is not invertible".into()))?;
    let r_inv = r
        .solve_upper_triangular(&DMatrix::identity(p, p))
        .ok_or_else(|| Error::SingularDesign("R factor is not invertible".into()))?;

    let resid = &yv - &xm * &beta;
    let rss = resid.norm_squared();
    let df_resid = (n - rank) as f64;
    let sigma2 = rss / df_resid;

    let cov = (&r_inv * r_inv.transpose()) * sigma2;
    let mut covariance = Vec::with_capacity(p * p);
    for i in 0..p {
        for j in 0..p {
            covariance.push(cov[(i, j)]);
        }
    }
    let std_errors = (0..p).map(|j| cov[(j, j)].max(0.0).sqrt()).collect();
    let (f_statistic, f_df) = overall_f(y, rss, p, df_resid);

    Ok(FitResult {
        coefficients: beta.iter().copied().collect(),
        std_errors,
        covariance,
        df_residual: df_resid,
        f_statistic,
        f_df,
        sigma2,
        variance_components: Vec::new(),
        converged: true,
        n_evaluations: 0,
    })
}

/// [`ModelSolver`] adapter for [`fit_ols`]; random-effect layouts are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct OlsSolver;

impl ModelSolver for OlsSolver {
    fn fit(
        &self,
        x: &DesignMatrix,
        y: &[f64],
        _random: Option<&RandomStructure>,
    ) -> Result<FitResult> {
        fit_ols(x, y)
    }

    fn name(&self) -> &str {
        "ols"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn design(xs: &[f64]) -> DesignMatrix {
        DesignMatrix::from_rows(xs.iter().map(|&v| vec![1.0, v]).collect()).unwrap()
    }

    #[test]
    fn test_simple_regression_closed_form() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let ys = [2.1, 3.9, 6.2, 7.8, 10.1, 12.2];
        let fit = fit_ols(&design(&xs), &ys).unwrap();

        let n = xs.len() as f64;
        let mx = xs.iter().sum::<f64>() / n;
        let my = ys.iter().sum::<f64>() / n;
        let sxx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
        let sxy: f64 = xs.iter().zip(&ys).map(|(x, y)| (x - mx) * (y - my)).sum();
        let slope = sxy / sxx;
        let intercept = my - slope * mx;
        assert_relative_eq!(fit.coefficients[1], slope, epsilon = 1e-10);
        assert_relative_eq!(fit.coefficients[0], intercept, epsilon = 1e-10);

        let rss: f64 = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| (y - intercept - slope * x).powi(2))
            .sum();
        let s2 = rss / (n - 2.0);
        assert_relative_eq!(fit.std_errors[1], (s2 / sxx).sqrt(), epsilon = 1e-10);
        assert_eq!(fit.df_residual, 4.0);

        // With one predictor, F = t².
        let t = fit.t_statistic(1).unwrap();
        assert_relative_eq!(fit.f_statistic, t * t, max_relative = 1e-9);
        assert_eq!(fit.f_df, 1);
    }

    #[test]
    fn test_collinear_design_is_singular() {
        let x = DesignMatrix::from_rows(
            (0..10).map(|i| vec![1.0, i as f64, 2.0 * i as f64]).collect(),
        )
        .unwrap();
        let y: Vec<f64> = (0..10).map(|i| i as f64).collect();
        assert!(matches!(fit_ols(&x, &y), Err(Error::SingularDesign(_))));
    }

    #[test]
    fn test_too_few_observations() {
        let x = design(&[1.0, 2.0]);
        assert!(matches!(fit_ols(&x, &[1.0, 2.0]), Err(Error::SingularDesign(_))));
    }

    #[test]
    fn test_intercept_only_has_no_f() {
        let x = DesignMatrix::from_rows(vec![vec![1.0]; 5]).unwrap();
        let fit = fit_ols(&x, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert!(fit.f_statistic.is_nan());
        assert_relative_eq!(fit.coefficients[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(fit.sigma2, 2.5, epsilon = 1e-12);
    }
}
