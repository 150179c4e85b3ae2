//! Linear mixed-effects models fit by REML profiled deviance.
//!
//! Model: `y = Xβ + Σ_j Z_j b_j + ε`, `b_j ~ N(0, σ² Λ_j Λ_jᵀ)`, `ε ~ N(0, σ² I)`.
//!
//! Observations are partitioned into independent blocks (one per top-level
//! group). With `M_j = I + Λ_jᵀ Z_jᵀ Z_j Λ_j`, Woodbury gives
//! `V_j⁻¹ = I − Z_j Λ_j M_j⁻¹ Λ_jᵀ Z_jᵀ` and `log|V_j| = log|M_j|`, so every
//! quantity the deviance needs is assembled from per-block sufficient
//! statistics (`ZᵀZ`, `ZᵀX`, `Zᵀy`) of size `q × p`. The `n × n` marginal
//! covariance is never formed.
//!
//! REML deviance with `β` and `σ²` profiled out:
//!
//! ```text
//! d(θ) = Σ_j log|M_j| + log|A| + (n − p)(1 + log(2π r² / (n − p)))
//! A  = Σ_j Xᵀ V_j⁻¹ X,   r² = yᵀV⁻¹y − (XᵀV⁻¹y)ᵀ A⁻¹ (XᵀV⁻¹y)
//! ```
//!
//! Variants:
//! - random intercept: `Λ = θ`, 1-D Brent search
//! - random slopes: `Λ` is the lower-triangular Cholesky factor of the
//!   relative random-effect covariance, L-BFGS-B with non-negative diagonal
//! - nested: block `j` is a parent group with `Z_j = [1 | child indicators]`
//!   and `Λ_j = diag(θ_parent, θ_child, …)`, L-BFGS-B over both

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ps_core::{DesignMatrix, Error, FitResult, ModelSolver, RandomStructure, Result};

use crate::brent;
use crate::ols::qr_rank;
use crate::optimizer::{
    BOUND_EPS, LbfgsbOptimizer, ObjectiveFunction, OptimizerConfig, projected_gradient_norm,
};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Which random-effects structure a dataset carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmeVariant {
    /// One random intercept per group.
    RandomIntercept,
    /// Random intercept plus correlated random slopes.
    RandomSlopes {
        /// Number of slope columns.
        n_slopes: usize,
    },
    /// Random intercepts at two nested levels.
    Nested,
}

impl LmeVariant {
    /// Select the variant for a random-effects layout.
    pub fn for_structure(random: &RandomStructure) -> Result<Self> {
        match (&random.nested, random.slope_columns.len()) {
            (Some(_), 0) => Ok(LmeVariant::Nested),
            (Some(_), _) => Err(Error::Validation(
                "random slopes are not supported together with nested groupings".into(),
            )),
            (None, 0) => Ok(LmeVariant::RandomIntercept),
            (None, k) => Ok(LmeVariant::RandomSlopes { n_slopes: k }),
        }
    }

    /// Number of free covariance parameters.
    pub fn n_theta(&self) -> usize {
        match self {
            LmeVariant::RandomIntercept => 1,
            LmeVariant::RandomSlopes { n_slopes } => {
                let q = n_slopes + 1;
                q * (q + 1) / 2
            }
            LmeVariant::Nested => 2,
        }
    }

    /// Solver label.
    pub fn name(&self) -> &'static str {
        match self {
            LmeVariant::RandomIntercept => "lme-intercept",
            LmeVariant::RandomSlopes { .. } => "lme-slopes",
            LmeVariant::Nested => "lme-nested",
        }
    }
}

/// Settings for the mixed-model fit and its convergence checks.
#[derive(Debug, Clone)]
pub struct LmeConfig {
    /// L-BFGS-B settings (slopes and nested variants).
    pub optimizer: OptimizerConfig,
    /// Absolute tolerance of the Brent search on θ.
    pub brent_tol: f64,
    /// Brent iteration budget.
    pub brent_max_iter: usize,
    /// Upper bound on every relative standard deviation in θ.
    pub theta_max: f64,
    /// Projected-gradient tolerance, relative to `1 + |deviance|`.
    pub grad_tol: f64,
    /// Most negative admissible Hessian eigenvalue, relative to the largest.
    pub hessian_tol: f64,
}

impl Default for LmeConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig { max_iter: 200, tol: 1e-5, m: 7 },
            brent_tol: 1e-7,
            brent_max_iter: 100,
            theta_max: 10.0,
            grad_tol: 1e-4,
            hessian_tol: 1e-3,
        }
    }
}

/// Per-block sufficient statistics.
#[derive(Debug, Clone)]
struct Block {
    ztz: DMatrix<f64>,
    ztx: DMatrix<f64>,
    zty: DVector<f64>,
}

impl Block {
    fn new(q: usize, p: usize) -> Self {
        Self { ztz: DMatrix::zeros(q, q), ztx: DMatrix::zeros(q, p), zty: DVector::zeros(q) }
    }

    /// Accumulate one observation with sparse `z` given as `(position, value)` pairs.
    fn add(&mut self, z: &[(usize, f64)], x_row: &[f64], y: f64) {
        for &(a, za) in z {
            for &(b, zb) in z {
                self.ztz[(a, b)] += za * zb;
            }
            for (k, &xk) in x_row.iter().enumerate() {
                self.ztx[(a, k)] += za * xk;
            }
            self.zty[a] += za * y;
        }
    }
}

/// Fixed effects and scale at a given θ.
#[derive(Debug, Clone)]
struct Profile {
    deviance: f64,
    beta: DVector<f64>,
    a_inv: DMatrix<f64>,
    sigma2: f64,
}

/// REML profiled deviance of one dataset as a function of θ.
#[derive(Debug, Clone)]
pub struct ProfiledDeviance {
    variant: LmeVariant,
    blocks: Vec<Block>,
    xtx: DMatrix<f64>,
    xty: DVector<f64>,
    yty: f64,
    n: usize,
    p: usize,
}

impl ProfiledDeviance {
    /// Precompute sufficient statistics for `y ~ X` with the given layout.
    pub fn new(x: &DesignMatrix, y: &[f64], random: &RandomStructure) -> Result<Self> {
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
        random.primary.validate(n)?;
        if let Some(&c) = random.slope_columns.iter().find(|&&c| c >= p) {
            return Err(Error::Validation(format!("slope column {} out of range (p={})", c, p)));
        }
        let variant = LmeVariant::for_structure(random)?;

        let xm = DMatrix::from_row_slice(n, p, x.as_slice());
        let yv = DVector::from_column_slice(y);
        let rank = qr_rank(&xm.clone().qr().r());
        if rank < p {
            return Err(Error::SingularDesign(format!(
                "design matrix has rank {} < {} columns (collinear predictors)",
                rank, p
            )));
        }
        let xtx = xm.transpose() * &xm;
        let xty = xm.transpose() * &yv;
        let yty = yv.norm_squared();

        let blocks = match variant {
            LmeVariant::RandomIntercept | LmeVariant::RandomSlopes { .. } => {
                let q = 1 + random.slope_columns.len();
                let mut blocks: Vec<Block> =
                    (0..random.primary.n_groups).map(|_| Block::new(q, p)).collect();
                let mut z: Vec<(usize, f64)> = Vec::with_capacity(q);
                for i in 0..n {
                    let row = x.row(i);
                    z.clear();
                    z.push((0, 1.0));
                    z.extend(random.slope_columns.iter().enumerate().map(|(s, &c)| (s + 1, row[c])));
                    blocks[random.primary.ids[i]].add(&z, row, y[i]);
                }
                blocks
            }
            LmeVariant::Nested => nested_blocks(x, y, random)?,
        };
        let blocks = blocks.into_iter().filter(|b| b.ztz[(0, 0)] > 0.0).collect();

        Ok(Self { variant, blocks, xtx, xty, yty, n, p })
    }

    /// Random-effects variant.
    pub fn variant(&self) -> LmeVariant {
        self.variant
    }

    /// Relative covariance factor for a block with `q` random effects.
    fn lambda(&self, theta: &[f64], q: usize) -> DMatrix<f64> {
        match self.variant {
            LmeVariant::RandomIntercept => DMatrix::from_element(1, 1, theta[0]),
            LmeVariant::RandomSlopes { .. } => {
                let mut l = DMatrix::zeros(q, q);
                let mut k = 0;
                for j in 0..q {
                    for i in j..q {
                        l[(i, j)] = theta[k];
                        k += 1;
                    }
                }
                l
            }
            LmeVariant::Nested => {
                let mut l = DMatrix::from_diagonal_element(q, q, theta[1]);
                l[(0, 0)] = theta[0];
                l
            }
        }
    }

    /// `(lower, upper)` box for θ: diagonal entries of Λ are non-negative.
    pub fn bounds(&self, theta_max: f64) -> Vec<(f64, f64)> {
        match self.variant {
            LmeVariant::RandomSlopes { n_slopes } => {
                let q = n_slopes + 1;
                let mut b = Vec::with_capacity(self.variant.n_theta());
                for j in 0..q {
                    for i in j..q {
                        b.push(if i == j { (0.0, theta_max) } else { (-theta_max, theta_max) });
                    }
                }
                b
            }
            _ => vec![(0.0, theta_max); self.variant.n_theta()],
        }
    }

    /// Starting point: unit-scale independent effects.
    pub fn initial_theta(&self) -> Vec<f64> {
        match self.variant {
            LmeVariant::RandomSlopes { n_slopes } => {
                let q = n_slopes + 1;
                let mut t = Vec::with_capacity(self.variant.n_theta());
                for j in 0..q {
                    for i in j..q {
                        t.push(if i == j { 0.5 } else { 0.0 });
                    }
                }
                t
            }
            _ => vec![0.5; self.variant.n_theta()],
        }
    }

    fn profile(&self, theta: &[f64]) -> Result<Profile> {
        let mut a = self.xtx.clone();
        let mut c = self.xty.clone();
        let mut r = self.yty;
        let mut logdet_m = 0.0;

        for block in &self.blocks {
            let q = block.zty.len();
            let lam = self.lambda(theta, q);
            let lt = lam.transpose();
            let m = DMatrix::identity(q, q) + &lt * &block.ztz * &lam;
            let chol = m.cholesky().ok_or_else(|| {
                Error::Computation("I + ΛᵀZᵀZΛ is not positive definite".into())
            })?;
            logdet_m += 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();

            let u = &lt * &block.ztx;
            let v = &lt * &block.zty;
            let mi_u = chol.solve(&u);
            let mi_v = chol.solve(&v);
            a -= u.transpose() * &mi_u;
            c -= u.transpose() * &mi_v;
            r -= v.dot(&mi_v);
        }

        let chol_a = a.cholesky().ok_or_else(|| {
            Error::SingularDesign("XᵀV⁻¹X is not positive definite (collinear predictors)".into())
        })?;
        let logdet_a = 2.0 * chol_a.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let beta = chol_a.solve(&c);
        let r2 = r - c.dot(&beta);
        if !(r2 > 0.0 && r2.is_finite()) {
            return Err(Error::Computation(format!("non-positive residual sum of squares {}", r2)));
        }

        let dfr = (self.n - self.p) as f64;
        let deviance = logdet_m + logdet_a + dfr * (1.0 + LN_2PI + (r2 / dfr).ln());
        Ok(Profile { deviance, beta, a_inv: chol_a.inverse(), sigma2: r2 / dfr })
    }

    /// Deviance at θ.
    pub fn deviance(&self, theta: &[f64]) -> Result<f64> {
        Ok(self.profile(theta)?.deviance)
    }

    /// Random-effect (co)variances on the data scale: `σ² ΛΛᵀ`.
    ///
    /// Intercept: `[τ²]`. Nested: `[τ²_parent, τ²_child]`. Slopes: the lower
    /// triangle of the covariance in column-major order
    /// (`[τ²₀, τ₀₁, …, τ²₁, …]`).
    fn variance_components(&self, theta: &[f64], sigma2: f64) -> Vec<f64> {
        match self.variant {
            LmeVariant::RandomIntercept => vec![sigma2 * theta[0] * theta[0]],
            LmeVariant::Nested => {
                vec![sigma2 * theta[0] * theta[0], sigma2 * theta[1] * theta[1]]
            }
            LmeVariant::RandomSlopes { n_slopes } => {
                let q = n_slopes + 1;
                let lam = self.lambda(theta, q);
                let cov = (&lam * lam.transpose()) * sigma2;
                let mut out = Vec::with_capacity(q * (q + 1) / 2);
                for j in 0..q {
                    for i in j..q {
                        out.push(cov[(i, j)]);
                    }
                }
                out
            }
        }
    }
}

impl ObjectiveFunction for ProfiledDeviance {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.deviance(params)
    }
}

/// Blocks for `(1|parent/child)`: one block per parent, intercept + one
/// indicator per child present in that parent.
fn nested_blocks(x: &DesignMatrix, y: &[f64], random: &RandomStructure) -> Result<Vec<Block>> {
    let n = x.nrows();
    let p = x.ncols();
    let child = random
        .nested
        .as_ref()
        .ok_or_else(|| Error::Validation("nested grouping missing".into()))?;
    child.validate(n)?;

    let mut parent_of: Vec<Option<usize>> = vec![None; child.n_groups];
    let mut local: Vec<usize> = vec![0; child.n_groups];
    let mut q_of: Vec<usize> = vec![1; random.primary.n_groups];
    for i in 0..n {
        let (g, c) = (random.primary.ids[i], child.ids[i]);
        match parent_of[c] {
            None => {
                parent_of[c] = Some(g);
                local[c] = q_of[g];
                q_of[g] += 1;
            }
            Some(existing) if existing != g => {
                return Err(Error::Validation(format!(
                    "nested group {} appears in parents {} and {}",
                    c, existing, g
                )));
            }
            Some(_) => {}
        }
    }

    let mut blocks: Vec<Block> = q_of.iter().map(|&q| Block::new(q, p)).collect();
    for i in 0..n {
        let (g, c) = (random.primary.ids[i], child.ids[i]);
        blocks[g].add(&[(0, 1.0), (local[c], 1.0)], x.row(i), y[i]);
    }
    Ok(blocks)
}

/// Wald F over all non-intercept coefficients: `βᵀ C⁻¹ β / (p − 1)`.
pub(crate) fn wald_f(beta: &DVector<f64>, cov: &DMatrix<f64>) -> (f64, usize) {
    let p = beta.len();
    if p < 2 {
        return (f64::NAN, 0);
    }
    let b = beta.rows(1, p - 1).into_owned();
    let c = cov.view((1, 1), (p - 1, p - 1)).into_owned();
    match c.cholesky() {
        Some(ch) => (b.dot(&ch.solve(&b)) / (p - 1) as f64, p - 1),
        None => (f64::NAN, p - 1),
    }
}

/// Finite-difference Hessian of `f` restricted to `free` coordinates.
fn free_hessian(dev: &ProfiledDeviance, theta: &[f64], free: &[usize]) -> Result<DMatrix<f64>> {
    let k = free.len();
    let mut h = DMatrix::zeros(k, k);
    let f0 = dev.deviance(theta)?;
    let step: Vec<f64> = free.iter().map(|&i| 1e-3 * theta[i].abs().max(1.0)).collect();
    let mut t = theta.to_vec();
    let at = |t: &mut Vec<f64>, moves: &[(usize, f64)]| -> Result<f64> {
        for &(i, d) in moves {
            t[i] += d;
        }
        let v = dev.deviance(t);
        for &(i, d) in moves {
            t[i] -= d;
        }
        v
    };
    for a in 0..k {
        let (ia, ha) = (free[a], step[a]);
        let up = at(&mut t, &[(ia, ha)])?;
        let down = at(&mut t, &[(ia, -ha)])?;
        h[(a, a)] = (up - 2.0 * f0 + down) / (ha * ha);
        for b in 0..a {
            let (ib, hb) = (free[b], step[b]);
            let pp = at(&mut t, &[(ia, ha), (ib, hb)])?;
            let pm = at(&mut t, &[(ia, ha), (ib, -hb)])?;
            let mp = at(&mut t, &[(ia, -ha), (ib, hb)])?;
            let mm = at(&mut t, &[(ia, -ha), (ib, -hb)])?;
            let v = (pp - pm - mp + mm) / (4.0 * ha * hb);
            h[(a, b)] = v;
            h[(b, a)] = v;
        }
    }
    Ok(h)
}

/// Reject optima whose projected gradient is not small or whose Hessian over
/// the free coordinates has a clearly negative eigenvalue.
fn check_optimum(
    dev: &ProfiledDeviance,
    theta: &[f64],
    value: f64,
    bounds: &[(f64, f64)],
    config: &LmeConfig,
) -> Result<()> {
    let pg = projected_gradient_norm(dev, theta, bounds)?;
    if pg > config.grad_tol * (1.0 + value.abs()) {
        return Err(Error::Convergence(format!(
            "{}: projected gradient norm {:.3e} above tolerance",
            dev.variant.name(),
            pg
        )));
    }

    let free: Vec<usize> = (0..theta.len())
        .filter(|&i| {
            let (lo, hi) = bounds[i];
            theta[i] > lo + 1e3 * BOUND_EPS && theta[i] < hi - 1e3 * BOUND_EPS
        })
        .collect();
    if free.is_empty() {
        return Ok(());
    }
    let h = free_hessian(dev, theta, &free)?;
    let eig = SymmetricEigen::new(h).eigenvalues;
    let max_abs = eig.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let min = eig.iter().copied().fold(f64::INFINITY, f64::min);
    if min < -config.hessian_tol * max_abs.max(1.0) {
        return Err(Error::Convergence(format!(
            "{}: Hessian at optimum is not positive definite (min eigenvalue {:.3e})",
            dev.variant.name(),
            min
        )));
    }
    Ok(())
}

/// Fit a mixed model; returns `Error::Convergence` when the optimum fails the checks.
pub fn fit_lme(
    x: &DesignMatrix,
    y: &[f64],
    random: &RandomStructure,
    config: &LmeConfig,
) -> Result<FitResult> {
    let dev = ProfiledDeviance::new(x, y, random)?;
    let bounds = dev.bounds(config.theta_max);

    let (theta, value, n_evals) = match dev.variant {
        LmeVariant::RandomIntercept => {
            let r = brent::minimize(
                |t| dev.deviance(&[t]),
                0.0,
                config.theta_max,
                config.brent_tol,
                config.brent_max_iter,
            )?;
            if !r.converged {
                return Err(Error::Convergence(format!(
                    "lme-intercept: Brent search exceeded {} iterations",
                    config.brent_max_iter
                )));
            }
            (vec![r.x], r.fx, r.n_evals)
        }
        LmeVariant::RandomSlopes { .. } | LmeVariant::Nested => {
            let opt = LbfgsbOptimizer::new(config.optimizer.clone());
            let m = opt
                .minimize(&dev, &dev.initial_theta(), &bounds)
                .map_err(|e| Error::Convergence(format!("{}: {}", dev.variant.name(), e)))?;
            if m.n_iter >= config.optimizer.max_iter {
                return Err(Error::Convergence(format!(
                    "{}: optimizer exceeded {} iterations ({})",
                    dev.variant.name(),
                    config.optimizer.max_iter,
                    m.status
                )));
            }
            (m.parameters, m.value, m.n_evals)
        }
    };
    check_optimum(&dev, &theta, value, &bounds, config)?;

    let prof = dev.profile(&theta)?;
    let p = dev.p;
    let cov = &prof.a_inv * prof.sigma2;
    let mut covariance = Vec::with_capacity(p * p);
    for i in 0..p {
        for j in 0..p {
            covariance.push(cov[(i, j)]);
        }
    }
    let std_errors = (0..p).map(|j| cov[(j, j)].max(0.0).sqrt()).collect();
    let (f_statistic, f_df) = wald_f(&prof.beta, &cov);
    log::trace!("{} fit: theta={:?} deviance={:.6}", dev.variant.name(), theta, prof.deviance);

    Ok(FitResult {
        coefficients: prof.beta.iter().copied().collect(),
        std_errors,
        covariance,
        df_residual: (dev.n - p) as f64,
        f_statistic,
        f_df,
        sigma2: prof.sigma2,
        variance_components: dev.variance_components(&theta, prof.sigma2),
        converged: true,
        n_evaluations: n_evals,
    })
}

/// [`ModelSolver`] adapter for [`fit_lme`].
#[derive(Debug, Clone, Default)]
pub struct LmeSolver {
    config: LmeConfig,
}

impl LmeSolver {
    /// Solver with custom settings.
    pub fn new(config: LmeConfig) -> Self {
        Self { config }
    }
}

impl ModelSolver for LmeSolver {
    fn fit(
        &self,
        x: &DesignMatrix,
        y: &[f64],
        random: Option<&RandomStructure>,
    ) -> Result<FitResult> {
        let random = random.ok_or_else(|| {
            Error::Validation("mixed-model fit requires a random-effects layout".into())
        })?;
        fit_lme(x, y, random, &self.config)
    }

    fn name(&self) -> &str {
        "lme"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ps_core::Grouping;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    /// Dense REML deviance for a random-intercept model, for cross-checking.
    fn dense_intercept_deviance(x: &DesignMatrix, y: &[f64], groups: &[usize], theta: f64) -> f64 {
        let n = x.nrows();
        let p = x.ncols();
        let xm = DMatrix::from_row_slice(n, p, x.as_slice());
        let yv = DVector::from_column_slice(y);
        let mut v = DMatrix::<f64>::identity(n, n);
        for i in 0..n {
            for j in 0..n {
                if groups[i] == groups[j] {
                    v[(i, j)] += theta * theta;
                }
            }
        }
        let vchol = v.clone().cholesky().unwrap();
        let logdet_v = 2.0 * vchol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let vi_x = vchol.solve(&xm);
        let vi_y = vchol.solve(&yv);
        let a = xm.transpose() * &vi_x;
        let c = xm.transpose() * &vi_y;
        let achol = a.cholesky().unwrap();
        let logdet_a = 2.0 * achol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let beta = achol.solve(&c);
        let r2 = yv.dot(&vi_y) - c.dot(&beta);
        let dfr = (n - p) as f64;
        logdet_v + logdet_a + dfr * (1.0 + LN_2PI + (r2 / dfr).ln())
    }

    struct Sim {
        x: DesignMatrix,
        y: Vec<f64>,
        primary: Vec<usize>,
        nested: Vec<usize>,
    }

    /// `n_parent` parents × `n_child` children × `m` obs, intercept + one covariate.
    fn simulate(
        n_parent: usize,
        n_child: usize,
        m: usize,
        tau_parent: f64,
        tau_child: f64,
        slope_sd: f64,
        seed: u64,
    ) -> Sim {
        let mut rng = StdRng::seed_from_u64(seed);
        let z = Normal::new(0.0, 1.0).unwrap();
        let mut rows = Vec::new();
        let mut y = Vec::new();
        let mut primary = Vec::new();
        let mut nested = Vec::new();
        for g in 0..n_parent {
            let u0 = tau_parent * z.sample(&mut rng);
            let u1 = slope_sd * z.sample(&mut rng);
            for c in 0..n_child {
                let v0 = tau_child * z.sample(&mut rng);
                for _ in 0..m {
                    let xv: f64 = z.sample(&mut rng);
                    rows.push(vec![1.0, xv]);
                    y.push(1.0 + 0.5 * xv + u0 + u1 * xv + v0 + z.sample(&mut rng));
                    primary.push(g);
                    nested.push(g * n_child + c);
                }
            }
        }
        Sim { x: DesignMatrix::from_rows(rows).unwrap(), y, primary, nested }
    }

    fn intercept_layout(s: &Sim) -> RandomStructure {
        let n_groups = s.primary.iter().max().unwrap() + 1;
        RandomStructure {
            primary: Grouping { ids: s.primary.clone(), n_groups },
            nested: None,
            slope_columns: vec![],
        }
    }

    #[test]
    fn test_woodbury_deviance_matches_dense() {
        let s = simulate(6, 1, 5, 0.8, 0.0, 0.0, 11);
        let dev = ProfiledDeviance::new(&s.x, &s.y, &intercept_layout(&s)).unwrap();
        for theta in [0.0, 0.3, 1.1, 2.5] {
            let fast = dev.deviance(&[theta]).unwrap();
            let dense = dense_intercept_deviance(&s.x, &s.y, &s.primary, theta);
            assert_relative_eq!(fast, dense, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_zero_variance_reduces_to_ols() {
        let s = simulate(8, 1, 6, 0.5, 0.0, 0.0, 3);
        let dev = ProfiledDeviance::new(&s.x, &s.y, &intercept_layout(&s)).unwrap();
        let prof = dev.profile(&[0.0]).unwrap();
        let ols = crate::ols::fit_ols(&s.x, &s.y).unwrap();
        assert_relative_eq!(prof.beta[1], ols.coefficients[1], epsilon = 1e-10);
        assert_relative_eq!(prof.sigma2, ols.sigma2, max_relative = 1e-10);
    }

    #[test]
    fn test_random_intercept_recovers_variance() {
        let s = simulate(40, 1, 10, 1.0, 0.0, 0.0, 7);
        let fit = fit_lme(&s.x, &s.y, &intercept_layout(&s), &LmeConfig::default()).unwrap();
        assert!(fit.converged);
        assert_relative_eq!(fit.coefficients[1], 0.5, epsilon = 0.1);
        assert_relative_eq!(fit.sigma2, 1.0, epsilon = 0.2);
        assert_relative_eq!(fit.variance_components[0], 1.0, epsilon = 0.6);
        assert_eq!(fit.df_residual, (400 - 2) as f64);
        // One predictor: Wald F = t².
        let t = fit.t_statistic(1).unwrap();
        assert_relative_eq!(fit.f_statistic, t * t, max_relative = 1e-8);
    }

    #[test]
    fn test_random_slopes_fit() {
        let s = simulate(30, 1, 12, 0.8, 0.0, 0.5, 21);
        let mut layout = intercept_layout(&s);
        layout.slope_columns = vec![1];
        let fit = fit_lme(&s.x, &s.y, &layout, &LmeConfig::default()).unwrap();
        assert_eq!(fit.variance_components.len(), 3);
        assert_relative_eq!(fit.coefficients[1], 0.5, epsilon = 0.25);
        assert!(fit.variance_components[0] > 0.1);
        assert!(fit.variance_components[2] > 0.02);
    }

    #[test]
    fn test_nested_fit() {
        let s = simulate(12, 4, 6, 0.9, 0.6, 0.0, 5);
        let mut layout = intercept_layout(&s);
        layout.nested = Some(Grouping { ids: s.nested.clone(), n_groups: 48 });
        let fit = fit_lme(&s.x, &s.y, &layout, &LmeConfig::default()).unwrap();
        assert_eq!(fit.variance_components.len(), 2);
        assert!(fit.variance_components[0] > 0.1);
        assert!(fit.variance_components[1] > 0.05);
        assert_relative_eq!(fit.coefficients[1], 0.5, epsilon = 0.2);
    }

    #[test]
    fn test_child_in_two_parents_rejected() {
        let s = simulate(2, 2, 3, 0.5, 0.5, 0.0, 1);
        let mut layout = intercept_layout(&s);
        // Children ids reused across parents.
        let ids: Vec<usize> = s.nested.iter().map(|c| c % 2).collect();
        layout.nested = Some(Grouping { ids, n_groups: 2 });
        assert!(matches!(
            fit_lme(&s.x, &s.y, &layout, &LmeConfig::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_variant_selection() {
        let g = Grouping { ids: vec![0], n_groups: 1 };
        let mut r = RandomStructure { primary: g.clone(), nested: None, slope_columns: vec![] };
        assert_eq!(LmeVariant::for_structure(&r).unwrap(), LmeVariant::RandomIntercept);
        r.slope_columns = vec![1, 2];
        assert_eq!(LmeVariant::for_structure(&r).unwrap().n_theta(), 6);
        r.nested = Some(g);
        assert!(LmeVariant::for_structure(&r).is_err());
    }

    #[test]
    fn test_collinear_design_is_singular() {
        let s = simulate(5, 1, 4, 0.5, 0.0, 0.0, 2);
        let rows: Vec<Vec<f64>> =
            (0..s.x.nrows()).map(|i| vec![1.0, s.x.get(i, 1), 3.0 * s.x.get(i, 1)]).collect();
        let x = DesignMatrix::from_rows(rows).unwrap();
        let r = fit_lme(&x, &s.y, &intercept_layout(&s), &LmeConfig::default());
        assert!(matches!(r, Err(Error::SingularDesign(_))));
    }
}
