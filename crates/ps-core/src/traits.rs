//! Core traits for PowerStat
//!
//! The simulation driver (ps-sim) only sees the `ModelSolver` seam; the
//! concrete OLS and mixed-model fitters live in ps-inference.

use crate::Result;
use crate::types::{DesignMatrix, FitResult, RandomStructure};

/// Fits one simulated dataset.
///
/// Implementations must be pure functions of their inputs so draws can run
/// on any worker thread.
pub trait ModelSolver: Send + Sync {
    /// Fit `y ~ X` with an optional random-effects layout.
    fn fit(
        &self,
        x: &DesignMatrix,
        y: &[f64],
        random: Option<&RandomStructure>,
    ) -> Result<FitResult>;

    /// Solver name (e.g. "ols", "lme-intercept").
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MeanSolver;

    impl ModelSolver for MeanSolver {
        fn fit(
            &self,
            x: &DesignMatrix,
            y: &[f64],
            _random: Option<&RandomStructure>,
        ) -> Result<FitResult> {
            let mean = y.iter().sum::<f64>() / y.len() as f64;
            Ok(FitResult {
                coefficients: vec![mean],
                std_errors: vec![0.0],
                covariance: vec![0.0],
                df_residual: (x.nrows() - 1) as f64,
                f_statistic: f64::NAN,
                f_df: 0,
                sigma2: 0.0,
                variance_components: vec![],
                converged: true,
                n_evaluations: 0,
            })
        }

        fn name(&self) -> &str {
            "mean"
        }
    }

    #[test]
    fn test_dummy_solver() {
        let solver = MeanSolver;
        let x = DesignMatrix::from_rows(vec![vec![1.0], vec![1.0]]).unwrap();
        let fit = solver.fit(&x, &[1.0, 3.0], None).unwrap();
        assert_eq!(solver.name(), "mean");
        assert_eq!(fit.coefficients, vec![2.0]);
    }
}
