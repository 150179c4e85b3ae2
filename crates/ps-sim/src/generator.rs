//! Design generator: one simulated dataset per draw.
//!
//! Per observation, a latent vector `z = L ε` (`L` the Cholesky factor of the
//! predictor correlations) feeds every continuous and binary predictor through
//! its marginal; factors draw their level from the cumulative proportions.
//! Design columns are products of predictor values and level indicators.
//! With clusters, random intercepts (and slopes) use
//! `τ² = ICC / (1 − ICC) · (σ² + Σ β_c² Var(X_c))`.

use nalgebra::DMatrix;
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, StandardNormal, StudentT};

use ps_core::{DesignMatrix, Error, RandomStructure, Result};
use ps_formula::DesignLayout;
use ps_inference::LmeVariant;
use ps_prob::{Marginal, normal};

use crate::cluster::ClusterLayout;
use crate::config::PowerConfig;
use crate::correlation::factor_or_repair;
use crate::upload::PreparedUpload;
use crate::variables::Distribution;

/// Largest ICC reachable after scenario jitter.
pub(crate) const MAX_JITTERED_ICC: f64 = 0.95;

/// One generated dataset, owned by the draw that created it.
#[derive(Debug, Clone)]
pub struct SimulationDraw {
    /// Design matrix, intercept first.
    pub x: DesignMatrix,
    /// Outcome.
    pub y: Vec<f64>,
    /// Cluster memberships for mixed models.
    pub random: Option<RandomStructure>,
    /// The draw-local correlation matrix had to be repaired.
    pub correlation_repaired: bool,
}

/// Anything that produces simulation draws from a per-draw RNG.
pub trait DrawSource: Send + Sync {
    /// Generate one dataset.
    fn draw(&self, rng: &mut StdRng) -> Result<SimulationDraw>;
}

/// Shape of a standardized noise term (mean 0, variance 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseShape {
    /// Standard normal.
    Normal,
    /// Student-t with `df > 2`, rescaled to unit variance.
    StudentT {
        /// Degrees of freedom.
        df: f64,
    },
    /// Standardized Gamma(2).
    Skewed,
}

enum Noise {
    Normal,
    T { dist: StudentT<f64>, scale: f64 },
    Skewed,
}

impl NoiseShape {
    fn sampler(self) -> Result<Noise> {
        Ok(match self {
            NoiseShape::Normal => Noise::Normal,
            NoiseShape::Skewed => Noise::Skewed,
            NoiseShape::StudentT { df } => {
                if !(df > 2.0) {
                    return Err(Error::Config(format!("noise df must exceed 2, got {}", df)));
                }
                let dist = StudentT::new(df)
                    .map_err(|e| Error::Computation(format!("Student-t({}): {}", df, e)))?;
                Noise::T { dist, scale: ((df - 2.0) / df).sqrt() }
            }
        })
    }
}

impl Noise {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Noise::Normal => rng.sample(StandardNormal),
            Noise::T { dist, scale } => dist.sample(rng) * scale,
            Noise::Skewed => Marginal::RightSkewed.transform(rng.sample(StandardNormal)),
        }
    }
}

/// How a latent normal becomes a predictor value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Latent {
    Continuous(Marginal),
    Binary { threshold: f64 },
    Empirical { column: usize },
}

#[derive(Debug, Clone)]
enum Source {
    Latent(usize),
    Factor { cumulative: Vec<f64> },
    Bootstrap(usize),
}

/// Draw-local generation parameters. Scenarios perturb a clone of these.
#[derive(Debug, Clone)]
pub struct DrawParams {
    pub(crate) effects: Vec<f64>,
    pub(crate) latent: Vec<Latent>,
    pub(crate) factor: Option<DMatrix<f64>>,
    pub(crate) residual: NoiseShape,
    pub(crate) heteroskedasticity: f64,
    pub(crate) icc: Vec<f64>,
    pub(crate) random_effect: NoiseShape,
}

impl DrawParams {
    /// True effect per design column.
    pub fn effects(&self) -> &[f64] {
        &self.effects
    }

    /// ICC per grouping level (primary first).
    pub fn icc(&self) -> &[f64] {
        &self.icc
    }
}

/// Generator for a fixed configuration and sample size.
#[derive(Debug, Clone)]
pub struct DesignGenerator {
    n: usize,
    layout: DesignLayout,
    sources: Vec<Source>,
    /// Per design column: (predictor, level) factors of the product.
    columns: Vec<Vec<(usize, Option<usize>)>>,
    column_variance: Vec<f64>,
    latent_correlation: DMatrix<f64>,
    upload: Option<PreparedUpload>,
    clusters: Option<ClusterLayout>,
    random: Option<RandomStructure>,
    slope_predictors: Vec<usize>,
    slope_sd: f64,
    slope_corr: f64,
    residual_sd: f64,
    base: DrawParams,
}

fn predictor_variance(config: &PowerConfig, name: &str) -> f64 {
    if let Some(u) = config.upload() {
        if let Some(c) = u.index_of(name) {
            return u.variance(c);
        }
    }
    config.distribution(name).variance().unwrap_or(1.0)
}

impl DesignGenerator {
    /// Resolve `config` for `n` observations.
    pub fn new(config: &PowerConfig, n: usize) -> Result<Self> {
        let layout = config.layout().clone();
        let p = layout.n_columns();
        if n <= p {
            return Err(Error::Config(format!(
                "sample size {} is too small for {} coefficients",
                n, p
            )));
        }

        let predictors = config.formula().predictor_names();
        let latent_names = config.latent_names();
        let upload = config.upload().cloned();

        let mut sources = Vec::with_capacity(predictors.len());
        for name in &predictors {
            let dist = config.distribution(name);
            let source = if let Some(col) =
                upload.as_ref().filter(|u| u.strict()).and_then(|u| u.index_of(name))
            {
                Source::Bootstrap(col)
            } else if let Distribution::Factor { proportions } = &dist {
                let mut acc = 0.0;
                let cumulative = proportions
                    .iter()
                    .map(|p| {
                        acc += p;
                        acc
                    })
                    .collect();
                Source::Factor { cumulative }
            } else {
                let slot = latent_names.iter().position(|l| l == name).ok_or_else(|| {
                    Error::Computation(format!("predictor '{}' has no latent slot", name))
                })?;
                Source::Latent(slot)
            };
            sources.push(source);
        }

        let latent = latent_names
            .iter()
            .map(|name| {
                if let Some(col) = upload.as_ref().and_then(|u| u.index_of(name)) {
                    return Latent::Empirical { column: col };
                }
                match config.distribution(name) {
                    Distribution::Binary { p } => Latent::Binary { threshold: normal::quantile(1.0 - p) },
                    d => Latent::Continuous(d.marginal().unwrap_or(Marginal::Normal)),
                }
            })
            .collect::<Vec<_>>();

        let latent_correlation = config.latent_correlation().clone();
        let factor = if latent.is_empty() {
            None
        } else {
            let (l, repaired) = factor_or_repair(&latent_correlation)?;
            if repaired {
                log::debug!("latent correlation matrix is singular; using floored eigenvalues");
            }
            Some(l)
        };

        let mut columns = Vec::with_capacity(p);
        let mut column_variance = Vec::with_capacity(p);
        for col in layout.columns() {
            let mut parts = Vec::with_capacity(col.parts.len());
            let mut var = 1.0;
            for part in &col.parts {
                let idx = predictors.iter().position(|v| *v == part.variable).ok_or_else(|| {
                    Error::Computation(format!("design column '{}' has unknown part", col.name))
                })?;
                var *= match part.level {
                    Some(level) => config.distribution(&part.variable).dummy_variance(level).unwrap_or(0.0),
                    None => predictor_variance(config, &part.variable),
                };
                parts.push((idx, part.level));
            }
            columns.push(parts);
            column_variance.push(if col.parts.is_empty() { 0.0 } else { var });
        }

        let (primary, child) = config.cluster_levels();
        let mut icc = Vec::new();
        let mut slope_predictors = Vec::new();
        let mut slope_columns = Vec::new();
        let (mut slope_sd, mut slope_corr) = (0.0, 0.0);
        let (clusters, random) = match primary {
            Some(spec) => {
                let cl = ClusterLayout::resolve(spec, child, n)?;
                icc.push(spec.icc);
                if let Some(c) = child {
                    icc.push(c.icc);
                }
                for s in config.slopes_of(&spec.grouping) {
                    let pi = predictors.iter().position(|v| v == s).ok_or_else(|| {
                        Error::Config(format!("random slope '{}' is not a predictor", s))
                    })?;
                    let ci = layout.index_of(s).ok_or_else(|| {
                        Error::Config(format!("random slope '{}' has no main-effect column", s))
                    })?;
                    slope_predictors.push(pi);
                    slope_columns.push(ci);
                }
                slope_sd = spec.slope_variance.sqrt();
                slope_corr = spec.slope_intercept_corr;
                let random = RandomStructure {
                    primary: cl.primary.clone(),
                    nested: cl.nested.clone(),
                    slope_columns,
                };
                (Some(cl), Some(random))
            }
            None => (None, None),
        };

        let base = DrawParams {
            effects: config.effects().to_vec(),
            latent,
            factor,
            residual: NoiseShape::Normal,
            heteroskedasticity: 0.0,
            icc,
            random_effect: NoiseShape::Normal,
        };

        Ok(Self {
            n,
            layout,
            sources,
            columns,
            column_variance,
            latent_correlation,
            upload,
            clusters,
            random,
            slope_predictors,
            slope_sd,
            slope_corr,
            residual_sd: config.residual_sd(),
            base,
        })
    }

    /// Observations per draw.
    pub fn sample_size(&self) -> usize {
        self.n
    }

    /// Design columns.
    pub fn layout(&self) -> &DesignLayout {
        &self.layout
    }

    /// Unperturbed parameters.
    pub fn base_params(&self) -> &DrawParams {
        &self.base
    }

    /// Correlation matrix of the latent block.
    pub fn latent_correlation(&self) -> &DMatrix<f64> {
        &self.latent_correlation
    }

    /// Cluster memberships, if clustered.
    pub fn cluster_layout(&self) -> Option<&ClusterLayout> {
        self.clusters.as_ref()
    }

    /// Population variance of each design column (0 for the intercept).
    pub fn column_variances(&self) -> &[f64] {
        &self.column_variance
    }

    /// Solver label for datasets from this generator.
    pub fn model_type(&self) -> Result<&'static str> {
        match &self.random {
            Some(r) => Ok(LmeVariant::for_structure(r)?.name()),
            None => Ok("ols"),
        }
    }

    /// Within-cluster variance `σ² + Σ β_c² Var(X_c)` for the given effects.
    pub fn within_variance(&self, effects: &[f64]) -> f64 {
        let explained: f64 = effects
            .iter()
            .zip(&self.column_variance)
            .map(|(b, v)| b * b * v)
            .sum();
        self.residual_sd * self.residual_sd + explained
    }

    /// Generate one dataset with explicit parameters.
    pub fn generate_with<R: Rng + ?Sized>(&self, params: &DrawParams, rng: &mut R) -> Result<SimulationDraw> {
        let n = self.n;
        let p = self.columns.len();
        let k = params.latent.len();

        let boot_rows = match &self.upload {
            Some(u) if self.sources.iter().any(|s| matches!(s, Source::Bootstrap(_))) => {
                u.bootstrap_rows(n, rng)
            }
            _ => Vec::new(),
        };

        let mut values: Vec<Vec<f64>> = vec![Vec::with_capacity(n); self.sources.len()];
        let mut eps = vec![0.0; k];
        let mut z = vec![0.0; k];
        for i in 0..n {
            for e in eps.iter_mut() {
                *e = rng.sample(StandardNormal);
            }
            match &params.factor {
                Some(l) => {
                    for (r, zr) in z.iter_mut().enumerate() {
                        *zr = (0..=r).map(|c| l[(r, c)] * eps[c]).sum();
                    }
                }
                None => z.copy_from_slice(&eps),
            }
            for (src, col) in self.sources.iter().zip(values.iter_mut()) {
                let v = match src {
                    Source::Latent(slot) => match params.latent[*slot] {
                        Latent::Continuous(m) => m.transform(z[*slot]),
                        Latent::Binary { threshold } => {
                            if z[*slot] > threshold { 1.0 } else { 0.0 }
                        }
                        Latent::Empirical { column } => match &self.upload {
                            Some(u) => u.quantile(column, normal::cdf(z[*slot])),
                            None => f64::NAN,
                        },
                    },
                    Source::Factor { cumulative } => {
                        let u: f64 = rng.random();
                        cumulative.iter().position(|&c| u < c).unwrap_or(cumulative.len() - 1) as f64
                    }
                    Source::Bootstrap(column) => match &self.upload {
                        Some(up) => up.value(*column, boot_rows[i]),
                        None => f64::NAN,
                    },
                };
                col.push(v);
            }
        }

        let mut data = Vec::with_capacity(n * p);
        let mut mu = vec![0.0; n];
        for (i, m) in mu.iter_mut().enumerate() {
            for (c, parts) in self.columns.iter().enumerate() {
                let v: f64 = parts
                    .iter()
                    .map(|&(pred, level)| match level {
                        Some(l) => {
                            if values[pred][i] as usize == l { 1.0 } else { 0.0 }
                        }
                        None => values[pred][i],
                    })
                    .product();
                data.push(v);
                *m += params.effects[c] * v;
            }
        }

        let mut y = mu.clone();

        if let Some(cl) = &self.clusters {
            let within = self.within_variance(&params.effects);
            let tau = |icc: f64| (icc / (1.0 - icc) * within).sqrt();
            let re = params.random_effect.sampler()?;
            let tau0 = tau(params.icc.first().copied().unwrap_or(0.0));
            let s = self.slope_predictors.len();
            let rho = self.slope_corr;
            let rho_c = (1.0 - rho * rho).max(0.0).sqrt();
            let mut intercepts = Vec::with_capacity(cl.primary.n_groups);
            let mut slopes = Vec::with_capacity(cl.primary.n_groups * s);
            for _ in 0..cl.primary.n_groups {
                let e0 = re.sample(rng);
                intercepts.push(tau0 * e0);
                for _ in 0..s {
                    let ej = re.sample(rng);
                    slopes.push(self.slope_sd * (rho * e0 + rho_c * ej));
                }
            }
            let nested_effects: Vec<f64> = match &cl.nested {
                Some(g) => {
                    let tau1 = tau(params.icc.get(1).copied().unwrap_or(0.0));
                    (0..g.n_groups).map(|_| tau1 * re.sample(rng)).collect()
                }
                None => Vec::new(),
            };
            for (i, yi) in y.iter_mut().enumerate() {
                let g = cl.primary.ids[i];
                *yi += intercepts[g];
                for (j, &pred) in self.slope_predictors.iter().enumerate() {
                    *yi += slopes[g * s + j] * values[pred][i];
                }
                if let Some(ng) = &cl.nested {
                    *yi += nested_effects[ng.ids[i]];
                }
            }
        }

        let scale = heteroskedastic_scale(&mu, params.heteroskedasticity);
        let noise = params.residual.sampler()?;
        for (i, yi) in y.iter_mut().enumerate() {
            let s = scale.as_ref().map(|v| v[i]).unwrap_or(1.0);
            *yi += self.residual_sd * s * noise.sample(rng);
        }

        Ok(SimulationDraw {
            x: DesignMatrix::from_row_major(n, p, data)?,
            y,
            random: self.random.clone(),
            correlation_repaired: false,
        })
    }
}

/// Residual SD multipliers `exp(h ẑ_i)` with `ẑ` the standardized mean,
/// normalized so the average variance stays 1. `None` when `h = 0` or the
/// mean is constant.
fn heteroskedastic_scale(mu: &[f64], h: f64) -> Option<Vec<f64>> {
    if h <= 0.0 {
        return None;
    }
    let n = mu.len() as f64;
    let mean = mu.iter().sum::<f64>() / n;
    let sd = (mu.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n).sqrt();
    if !(sd > 0.0) {
        return None;
    }
    let raw: Vec<f64> = mu.iter().map(|m| (h * (m - mean) / sd).exp()).collect();
    let norm = (raw.iter().map(|s| s * s).sum::<f64>() / n).sqrt();
    Some(raw.into_iter().map(|s| s / norm).collect())
}

impl DrawSource for DesignGenerator {
    fn draw(&self, rng: &mut StdRng) -> Result<SimulationDraw> {
        self.generate_with(&self.base, rng)
    }
}
