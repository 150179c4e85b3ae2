//! Power-analysis configuration.
//!
//! [`ConfigSpec`] is the plain serializable description. [`PowerConfigBuilder`]
//! updates it through pure merges; [`PowerConfigBuilder::build`] validates the
//! whole thing once and yields an immutable [`PowerConfig`] snapshot that runs
//! share by reference.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use ps_core::{Error, Result};
use ps_formula::{DesignLayout, FactorLevels, Formula};

use crate::cluster::ClusterSpec;
use crate::correlation::{CorrelationSpec, check_psd};
use crate::scenario::{ScenarioConfig, ScenarioOverrides};
use crate::selector::find_column;
use crate::upload::{ColumnKind, PreparedUpload, UploadedData};
use crate::variables::{Distribution, VariableSpec};

/// Default significance level.
pub const DEFAULT_ALPHA: f64 = 0.05;
/// Default simulations per configuration.
pub const DEFAULT_N_SIMULATIONS: usize = 1600;
/// Default tolerated fraction of failed draws.
pub const DEFAULT_MAX_FAILED_FRACTION: f64 = 0.03;
/// Default seed.
pub const DEFAULT_SEED: u64 = 2137;

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_n_simulations() -> usize {
    DEFAULT_N_SIMULATIONS
}

fn default_max_failed_fraction() -> f64 {
    DEFAULT_MAX_FAILED_FRACTION
}

fn default_residual_sd() -> f64 {
    1.0
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Worker threads; 0 uses the global rayon pool.
    #[serde(default)]
    pub n_threads: usize,
}

/// Serializable configuration before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSpec {
    /// Model formula.
    pub formula: String,
    /// True effect per design column name; unset columns are 0.
    #[serde(default)]
    pub effects: BTreeMap<String, f64>,
    /// Predictor declarations; undeclared predictors are standard normal.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,
    /// Latent correlations among continuous and binary predictors.
    #[serde(default)]
    pub correlation: CorrelationSpec,
    /// One entry per random-effect grouping.
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
    /// Significance level.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Base seed of all draw streams.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulations per configuration.
    #[serde(default = "default_n_simulations")]
    pub n_simulations: usize,
    /// Failure ceiling as a fraction of draws.
    #[serde(default = "default_max_failed_fraction")]
    pub max_failed_fraction: f64,
    /// Residual standard deviation.
    #[serde(default = "default_residual_sd")]
    pub residual_sd: f64,
    /// Scenario overrides by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scenarios: BTreeMap<String, ScenarioOverrides>,
    /// Worker pool.
    #[serde(default)]
    pub parallel: ParallelConfig,
    /// Uploaded predictor columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<UploadedData>,
}

impl ConfigSpec {
    /// Defaults for `formula`.
    pub fn new(formula: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            effects: BTreeMap::new(),
            variables: BTreeMap::new(),
            correlation: CorrelationSpec::new(),
            clusters: Vec::new(),
            alpha: DEFAULT_ALPHA,
            seed: DEFAULT_SEED,
            n_simulations: DEFAULT_N_SIMULATIONS,
            max_failed_fraction: DEFAULT_MAX_FAILED_FRACTION,
            residual_sd: 1.0,
            scenarios: BTreeMap::new(),
            parallel: ParallelConfig::default(),
            uploaded: None,
        }
    }
}

/// Incremental configuration. Every setter is a pure merge returning a new builder.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerConfigBuilder {
    spec: ConfigSpec,
}

impl PowerConfigBuilder {
    /// Start from defaults.
    pub fn new(formula: impl Into<String>) -> Self {
        Self { spec: ConfigSpec::new(formula) }
    }

    /// Start from an existing description.
    pub fn from_spec(spec: ConfigSpec) -> Self {
        Self { spec }
    }

    /// Current description.
    pub fn spec(&self) -> &ConfigSpec {
        &self.spec
    }

    /// Replace the formula.
    pub fn set_formula(mut self, formula: impl Into<String>) -> Self {
        self.spec.formula = formula.into();
        self
    }

    /// Merge effects; later values win per column name.
    pub fn set_effects<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        for (k, v) in effects {
            self.spec.effects.insert(k.into(), v);
        }
        self
    }

    /// Declare or replace one predictor's distribution.
    pub fn set_variable_type(mut self, name: impl Into<String>, spec: impl Into<VariableSpec>) -> Self {
        self.spec.variables.insert(name.into(), spec.into());
        self
    }

    /// Set one pairwise correlation.
    pub fn set_correlation(mut self, a: impl Into<String>, b: impl Into<String>, r: f64) -> Self {
        self.spec.correlation = self.spec.correlation.with(a, b, r);
        self
    }

    /// Merge a set of correlations.
    pub fn set_correlations(mut self, correlations: &CorrelationSpec) -> Self {
        self.spec.correlation = self.spec.correlation.merge(correlations);
        self
    }

    /// Add or replace the cluster spec for its grouping.
    pub fn set_cluster(mut self, cluster: ClusterSpec) -> Self {
        match self.spec.clusters.iter_mut().find(|c| c.grouping == cluster.grouping) {
            Some(existing) => *existing = cluster,
            None => self.spec.clusters.push(cluster),
        }
        self
    }

    /// Significance level.
    pub fn set_alpha(mut self, alpha: f64) -> Self {
        self.spec.alpha = alpha;
        self
    }

    /// Base seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.spec.seed = seed;
        self
    }

    /// Simulations per configuration.
    pub fn set_n_simulations(mut self, n: usize) -> Self {
        self.spec.n_simulations = n;
        self
    }

    /// Failure ceiling.
    pub fn set_max_failed_fraction(mut self, fraction: f64) -> Self {
        self.spec.max_failed_fraction = fraction;
        self
    }

    /// Residual standard deviation.
    pub fn set_residual_sd(mut self, sd: f64) -> Self {
        self.spec.residual_sd = sd;
        self
    }

    /// Merge overrides into the named scenario.
    pub fn set_scenario(mut self, name: impl Into<String>, overrides: ScenarioOverrides) -> Self {
        let entry = self.spec.scenarios.entry(name.into()).or_default();
        *entry = entry.merge(&overrides);
        self
    }

    /// Worker threads (0 = global pool).
    pub fn set_parallel(mut self, n_threads: usize) -> Self {
        self.spec.parallel = ParallelConfig { n_threads };
        self
    }

    /// Attach uploaded predictor columns.
    pub fn set_uploaded_data(mut self, data: UploadedData) -> Self {
        self.spec.uploaded = Some(data);
        self
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<PowerConfig> {
        PowerConfig::from_spec(self.spec)
    }
}

/// Validated, immutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ConfigSpec", into = "ConfigSpec")]
pub struct PowerConfig {
    spec: ConfigSpec,
    formula: Formula,
    factors: HashMap<String, FactorLevels>,
    layout: DesignLayout,
    effects: Vec<f64>,
    latent_names: Vec<String>,
    latent_correlation: DMatrix<f64>,
    upload: Option<PreparedUpload>,
    scenarios: BTreeMap<String, ScenarioConfig>,
}

impl TryFrom<ConfigSpec> for PowerConfig {
    type Error = Error;

    fn try_from(spec: ConfigSpec) -> Result<Self> {
        PowerConfig::from_spec(spec)
    }
}

impl From<PowerConfig> for ConfigSpec {
    fn from(config: PowerConfig) -> Self {
        config.spec
    }
}

impl PowerConfig {
    /// Load and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: ConfigSpec = serde_json::from_str(json)?;
        Self::from_spec(spec)
    }

    /// Serialize the underlying description.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.spec)?)
    }

    /// Builder seeded with this configuration, for deriving a new snapshot.
    pub fn to_builder(&self) -> PowerConfigBuilder {
        PowerConfigBuilder::from_spec(self.spec.clone())
    }

    /// Validate a description.
    pub fn from_spec(spec: ConfigSpec) -> Result<Self> {
        if !(spec.alpha > 0.0 && spec.alpha < 1.0) {
            return Err(Error::Config(format!("alpha must be in (0, 1), got {}", spec.alpha)));
        }
        if spec.n_simulations == 0 {
            return Err(Error::Config("n_simulations must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&spec.max_failed_fraction) {
            return Err(Error::Config(format!(
                "max_failed_fraction must be in [0, 1), got {}",
                spec.max_failed_fraction
            )));
        }
        if !(spec.residual_sd > 0.0 && spec.residual_sd.is_finite()) {
            return Err(Error::Config(format!("residual_sd must be positive, got {}", spec.residual_sd)));
        }

        let formula = Formula::parse(&spec.formula)?;
        let predictors = formula.predictor_names();

        for (name, v) in &spec.variables {
            if !predictors.contains(name) {
                return Err(Error::Config(format!(
                    "variable '{}' does not appear in the formula",
                    name
                )));
            }
            match &spec.uploaded {
                // Level names of an uploaded factor come from its values.
                Some(d) if d.columns.contains_key(name) && v.distribution.is_factor() && v.levels.is_none() => {
                    v.distribution.validate(name)?
                }
                _ => v.validate(name)?,
            }
        }

        let upload = match &spec.uploaded {
            Some(data) => {
                for name in data.columns.keys() {
                    if !predictors.contains(name) {
                        return Err(Error::Config(format!(
                            "uploaded column '{}' does not appear in the formula",
                            name
                        )));
                    }
                }
                let declared = |name: &str| spec.variables.get(name).map(|v| v.distribution.clone());
                Some(PreparedUpload::new(data, declared)?)
            }
            None => None,
        };

        let mut factors = HashMap::new();
        for (name, v) in &spec.variables {
            let uploaded = upload.as_ref().and_then(|u| u.index_of(name).map(|c| u.kind(c)));
            let levels = match uploaded {
                Some(ColumnKind::Factor { values, .. }) if v.levels.is_none() => {
                    let names = values.iter().map(|x| x.to_string()).collect();
                    Some(FactorLevels::with_names(names, v.reference.as_deref())?)
                }
                _ => v.factor_levels(name)?,
            };
            if let Some(levels) = levels {
                factors.insert(name.clone(), levels);
            }
        }
        let layout = formula.expand_design(&factors);

        let mut effects = vec![0.0; layout.n_columns()];
        let mut assigned: Vec<Option<&str>> = vec![None; layout.n_columns()];
        for (name, &beta) in &spec.effects {
            if !beta.is_finite() {
                return Err(Error::Config(format!("effect '{}' is not finite", name)));
            }
            let c = find_column(&layout, name).ok_or_else(|| {
                Error::Config(format!(
                    "unknown effect '{}' (design columns: {})",
                    name,
                    layout.names().join(", ")
                ))
            })?;
            if let Some(other) = assigned[c] {
                return Err(Error::Config(format!(
                    "effects '{}' and '{}' name the same column",
                    other, name
                )));
            }
            assigned[c] = Some(name.as_str());
            effects[c] = beta;
        }

        let strict_upload = |name: &str| {
            upload.as_ref().is_some_and(|u| u.strict() && u.index_of(name).is_some())
        };
        let latent_names: Vec<String> = predictors
            .iter()
            .filter(|p| !factors.contains_key(p.as_str()) && !strict_upload(p.as_str()))
            .cloned()
            .collect();
        let mut latent_correlation = spec.correlation.matrix(&latent_names)?;
        if let Some(u) = &upload {
            u.seed_correlations(&latent_names, &mut latent_correlation, |a, b| {
                spec.correlation.get(a, b).is_some()
            });
        }
        check_psd(&latent_correlation)?;

        validate_clusters(&spec, &formula, &factors)?;

        let mut scenarios = BTreeMap::new();
        for (name, overrides) in &spec.scenarios {
            scenarios.insert(name.clone(), overrides.resolve(name)?);
        }

        Ok(Self {
            spec,
            formula,
            factors,
            layout,
            effects,
            latent_names,
            latent_correlation,
            upload,
            scenarios,
        })
    }

    /// Underlying description.
    pub fn spec(&self) -> &ConfigSpec {
        &self.spec
    }

    /// Parsed formula.
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Design columns after dummy expansion.
    pub fn layout(&self) -> &DesignLayout {
        &self.layout
    }

    /// Level tables of the factor predictors.
    pub fn factor_levels(&self) -> &HashMap<String, FactorLevels> {
        &self.factors
    }

    /// True effect per design column (intercept first).
    pub fn effects(&self) -> &[f64] {
        &self.effects
    }

    /// Distribution of a predictor (standard normal when undeclared).
    /// Uploaded binary and factor columns report their observed frequencies.
    pub fn distribution(&self, name: &str) -> Distribution {
        if let Some(u) = &self.upload {
            if let Some(c) = u.index_of(name) {
                return u.distribution(c);
            }
        }
        self.spec
            .variables
            .get(name)
            .map(|v| v.distribution.clone())
            .unwrap_or(Distribution::Normal)
    }

    /// Predictors in the correlated latent block, in formula order.
    pub fn latent_names(&self) -> &[String] {
        &self.latent_names
    }

    /// Validated correlation matrix over [`PowerConfig::latent_names`].
    pub fn latent_correlation(&self) -> &DMatrix<f64> {
        &self.latent_correlation
    }

    pub(crate) fn upload(&self) -> Option<&PreparedUpload> {
        self.upload.as_ref()
    }

    /// Top-level cluster spec and its nested child, if any.
    pub fn cluster_levels(&self) -> (Option<&ClusterSpec>, Option<&ClusterSpec>) {
        let primary = self.spec.clusters.iter().find(|c| c.parent.is_none());
        let child = primary.and_then(|p| {
            self.spec.clusters.iter().find(|c| c.parent.as_deref() == Some(p.grouping.as_str()))
        });
        (primary, child)
    }

    /// Random-slope predictors of a grouping, as written in the formula.
    pub fn slopes_of(&self, grouping: &str) -> &[String] {
        self.formula
            .random_effects()
            .iter()
            .find(|r| r.grouping == grouping)
            .map(|r| r.slopes.as_slice())
            .unwrap_or(&[])
    }

    /// Significance level.
    pub fn alpha(&self) -> f64 {
        self.spec.alpha
    }

    /// Base seed.
    pub fn seed(&self) -> u64 {
        self.spec.seed
    }

    /// Simulations per configuration.
    pub fn n_simulations(&self) -> usize {
        self.spec.n_simulations
    }

    /// Failure ceiling.
    pub fn max_failed_fraction(&self) -> f64 {
        self.spec.max_failed_fraction
    }

    /// Residual standard deviation.
    pub fn residual_sd(&self) -> f64 {
        self.spec.residual_sd
    }

    /// Worker pool settings.
    pub fn parallel(&self) -> ParallelConfig {
        self.spec.parallel
    }

    /// Scenario by name: a preset, a customized preset or a custom scenario.
    pub fn scenario(&self, name: &str) -> Result<ScenarioConfig> {
        if let Some(s) = self.scenarios.get(name) {
            return Ok(s.clone());
        }
        ScenarioConfig::preset(name).ok_or_else(|| {
            let mut known = vec!["optimistic", "realistic", "doomer"];
            known.extend(self.scenarios.keys().map(String::as_str));
            Error::Config(format!("unknown scenario '{}' (known: {})", name, known.join(", ")))
        })
    }
}

/// Cluster specs must mirror the formula's random effects one to one.
fn validate_clusters(
    spec: &ConfigSpec,
    formula: &Formula,
    factors: &HashMap<String, FactorLevels>,
) -> Result<()> {
    for (i, c) in spec.clusters.iter().enumerate() {
        c.validate()?;
        if spec.clusters[..i].iter().any(|o| o.grouping == c.grouping) {
            return Err(Error::Config(format!("duplicate cluster spec for '{}'", c.grouping)));
        }
        let re = formula.random_effects().iter().find(|r| r.grouping == c.grouping).ok_or_else(|| {
            Error::Config(format!(
                "cluster '{}' has no random effect in the formula",
                c.grouping
            ))
        })?;
        if re.nested_in != c.parent {
            return Err(Error::Config(format!(
                "cluster '{}' nesting ({:?}) does not match the formula ({:?})",
                c.grouping, c.parent, re.nested_in
            )));
        }
        if !c.random_slopes.is_empty() {
            let mut a = c.random_slopes.clone();
            let mut b = re.slopes.clone();
            a.sort();
            b.sort();
            if a != b {
                return Err(Error::Config(format!(
                    "cluster '{}' random slopes {:?} do not match the formula {:?}",
                    c.grouping, c.random_slopes, re.slopes
                )));
            }
        }
        for s in &re.slopes {
            if factors.contains_key(s) {
                return Err(Error::Config(format!("random slope on factor '{}' is not supported", s)));
            }
        }
    }
    for re in formula.random_effects() {
        if !spec.clusters.iter().any(|c| c.grouping == re.grouping) {
            return Err(Error::Config(format!(
                "random effect '{}' has no cluster specification",
                re.grouping
            )));
        }
    }
    let tops = spec.clusters.iter().filter(|c| c.parent.is_none()).count();
    if tops > 1 {
        return Err(Error::Config("crossed random effects are not supported".into()));
    }
    Ok(())
}
