//! Box-constrained quasi-Newton minimization for variance-component fits.
//!
//! argmin's L-BFGS (More–Thuente line search) runs on a clamped view of the
//! objective; gradient components that would push through an active bound are
//! zeroed so the line search never walks into a flat clamped region.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use ps_core::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tolerance used to decide whether a parameter sits on a bound.
pub const BOUND_EPS: f64 = 1e-8;

/// L-BFGS-B settings.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Iteration budget.
    pub max_iter: u64,
    /// Gradient-norm tolerance handed to the solver.
    pub tol: f64,
    /// Number of stored correction pairs.
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 200, tol: 1e-6, m: 7 }
    }
}

/// Outcome of one bounded minimization.
#[derive(Debug, Clone)]
pub struct Minimum {
    /// Arg-min, clamped into the box.
    pub parameters: Vec<f64>,
    /// Objective at `parameters`.
    pub value: f64,
    /// Iterations used.
    pub n_iter: u64,
    /// Objective evaluations, including those spent on numerical gradients.
    pub n_evals: usize,
    /// Solver-reported convergence (not budget exhaustion).
    pub converged: bool,
    /// Termination status text.
    pub status: String,
}

impl fmt::Display for Minimum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Minimum(value={:.6}, n_iter={}, n_evals={}, converged={})",
            self.value, self.n_iter, self.n_evals, self.converged
        )
    }
}

/// Scalar objective over a parameter vector.
pub trait ObjectiveFunction: Send + Sync {
    /// Objective value.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient; central differences unless overridden.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut probe = params.to_vec();
        for i in 0..params.len() {
            let h = 1e-6 * params[i].abs().max(1.0);
            probe[i] = params[i] + h;
            let up = self.eval(&probe)?;
            probe[i] = params[i] - h;
            let down = self.eval(&probe)?;
            probe[i] = params[i];
            grad[i] = (up - down) / (2.0 * h);
        }
        Ok(grad)
    }
}

/// Clamp `params` into `bounds`.
pub fn clamp_to_box(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Zero gradient components that point out of the box at an active bound.
pub fn project_gradient(params: &[f64], grad: &mut [f64], bounds: &[(f64, f64)]) {
    for ((g, &x), &(lo, hi)) in grad.iter_mut().zip(params).zip(bounds) {
        if (x <= lo + BOUND_EPS && *g > 0.0) || (x >= hi - BOUND_EPS && *g < 0.0) {
            *g = 0.0;
        }
    }
}

/// Euclidean norm of the projected gradient at `params`.
pub fn projected_gradient_norm(
    objective: &dyn ObjectiveFunction,
    params: &[f64],
    bounds: &[(f64, f64)],
) -> Result<f64> {
    let mut g = objective.gradient(params)?;
    project_gradient(params, &mut g, bounds);
    Ok(g.iter().map(|v| v * v).sum::<f64>().sqrt())
}

struct Boxed<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    evals: &'a AtomicUsize,
}

impl CostFunction for Boxed<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.evals.fetch_add(1, Ordering::Relaxed);
        let x = clamp_to_box(params, self.bounds);
        self.objective.eval(&x).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for Boxed<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.evals.fetch_add(2 * params.len(), Ordering::Relaxed);
        let x = clamp_to_box(params, self.bounds);
        let mut g =
            self.objective.gradient(&x).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        project_gradient(&x, &mut g, self.bounds);
        Ok(g)
    }
}

/// L-BFGS with box constraints by clamping and gradient projection.
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// New optimizer with the given settings.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize `objective` over the box `bounds`, starting at `init`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<Minimum> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "parameter and bounds length mismatch: {} != {}",
                init.len(),
                bounds.len()
            )));
        }

        let evals = AtomicUsize::new(0);
        let problem = Boxed { objective, bounds, evals: &evals };

        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost((0.1 * self.config.tol).max(1e-12)))
            .map_err(|e| Error::Validation(format!("invalid optimizer configuration: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(clamp_to_box(init, bounds)).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("optimization failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("optimizer returned no parameters".to_string()))?;
        let status = state.get_termination_status();
        let converged = matches!(
            status,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(Minimum {
            parameters: clamp_to_box(best, bounds),
            value: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_evals: evals.load(Ordering::Relaxed),
            converged,
            status: status.to_string(),
        })
    }
}

impl Default for LbfgsbOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `(a − 1)² + 4(b + 0.5)² + ab`, a smooth convex bowl.
    struct Bowl;

    impl ObjectiveFunction for Bowl {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] - 1.0).powi(2) + 4.0 * (p[1] + 0.5).powi(2) + p[0] * p[1])
        }
    }

    #[test]
    fn test_interior_minimum_with_numerical_gradient() {
        // Stationary point: 2(a−1) + b = 0, 8(b+0.5) + a = 0.
        let a = (16.0 + 4.0) / 15.0;
        let b = -0.5 - a / 8.0;
        let bounds = [(-10.0, 10.0), (-10.0, 10.0)];
        let m = LbfgsbOptimizer::default().minimize(&Bowl, &[0.0, 0.0], &bounds).unwrap();
        assert!(m.converged, "{m}");
        assert_relative_eq!(m.parameters[0], a, epsilon = 1e-4);
        assert_relative_eq!(m.parameters[1], b, epsilon = 1e-4);
    }

    #[test]
    fn test_active_lower_bound() {
        // Variance-like parameter pinned at zero.
        let bounds = [(0.0, 10.0), (0.0, 10.0)];
        let m = LbfgsbOptimizer::default().minimize(&Bowl, &[2.0, 2.0], &bounds).unwrap();
        assert_relative_eq!(m.parameters[1], 0.0, epsilon = 1e-8);
        assert_relative_eq!(m.parameters[0], 1.0, epsilon = 1e-4);
        let pg = projected_gradient_norm(&Bowl, &m.parameters, &bounds).unwrap();
        assert!(pg < 1e-4, "projected gradient {pg}");
    }

    #[test]
    fn test_projection_only_at_bounds() {
        let bounds = [(0.0, 1.0), (0.0, 1.0)];
        let mut g = vec![1.0, -1.0];
        project_gradient(&[0.0, 0.5], &mut g, &bounds);
        assert_eq!(g, vec![0.0, -1.0]);
        let mut g = vec![-1.0, -1.0];
        project_gradient(&[0.0, 1.0], &mut g, &bounds);
        assert_eq!(g, vec![-1.0, 0.0]);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let r = LbfgsbOptimizer::default().minimize(&Bowl, &[0.0], &[(0.0, 1.0), (0.0, 1.0)]);
        assert!(matches!(r, Err(Error::Validation(_))));
    }
}
