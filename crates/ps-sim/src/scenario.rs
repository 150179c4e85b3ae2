//! Scenario perturbations: controlled assumption violations per draw.
//!
//! A [`ScenarioGenerator`] wraps a [`DesignGenerator`] and, for each draw,
//! perturbs a clone of the base [`DrawParams`] before generating. The base
//! generator and the configuration it came from are never modified.

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use ps_core::{Error, Result};
use ps_prob::Marginal;

use crate::correlation;
use crate::generator::{
    DesignGenerator, DrawParams, DrawSource, Latent, MAX_JITTERED_ICC, NoiseShape, SimulationDraw,
};

/// Name of the neutral preset.
pub const OPTIMISTIC: &str = "optimistic";
/// Name of the moderate preset.
pub const REALISTIC: &str = "realistic";
/// Name of the pessimistic preset.
pub const DOOMER: &str = "doomer";

/// Replacement residual distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualDist {
    /// Student-t with `residual_df` degrees of freedom.
    HeavyTailed,
    /// Standardized Gamma(2).
    Skewed,
}

/// Random-effect distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomEffectDist {
    /// Normal random effects.
    Normal,
    /// Student-t with `random_effect_df` degrees of freedom.
    HeavyTailed,
    /// Standardized Gamma(2).
    Skewed,
}

/// Perturbation parameters of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Scenario name.
    pub name: String,
    /// SD of the multiplicative effect jitter `1 + N(0, h)`.
    pub heterogeneity: f64,
    /// Strength of the mean-dependent residual spread.
    pub heteroskedasticity: f64,
    /// SD of the additive noise on each correlation.
    pub correlation_noise_sd: f64,
    /// Probability of swapping one continuous marginal.
    pub distribution_change_prob: f64,
    /// Candidate marginals for the swap.
    pub new_distributions: Vec<Marginal>,
    /// Probability of non-normal residuals.
    pub residual_change_prob: f64,
    /// Candidate residual distributions.
    pub residual_dists: Vec<ResidualDist>,
    /// Degrees of freedom of heavy-tailed residuals.
    pub residual_df: f64,
    /// SD of the multiplicative ICC jitter `N(1, sd)`.
    pub icc_noise_sd: f64,
    /// Random-effect distribution.
    pub random_effect_dist: RandomEffectDist,
    /// Degrees of freedom of heavy-tailed random effects.
    pub random_effect_df: f64,
}

fn default_new_distributions() -> Vec<Marginal> {
    vec![Marginal::RightSkewed, Marginal::LeftSkewed, Marginal::Uniform]
}

fn default_residual_dists() -> Vec<ResidualDist> {
    vec![ResidualDist::HeavyTailed, ResidualDist::Skewed]
}

impl ScenarioConfig {
    /// Neutral baseline: no perturbation at all.
    pub fn optimistic() -> Self {
        Self {
            name: OPTIMISTIC.into(),
            heterogeneity: 0.0,
            heteroskedasticity: 0.0,
            correlation_noise_sd: 0.0,
            distribution_change_prob: 0.0,
            new_distributions: default_new_distributions(),
            residual_change_prob: 0.0,
            residual_dists: default_residual_dists(),
            residual_df: 10.0,
            icc_noise_sd: 0.0,
            random_effect_dist: RandomEffectDist::Normal,
            random_effect_df: 5.0,
        }
    }

    /// Moderate violations.
    pub fn realistic() -> Self {
        Self {
            name: REALISTIC.into(),
            heterogeneity: 0.2,
            heteroskedasticity: 0.1,
            correlation_noise_sd: 0.2,
            distribution_change_prob: 0.3,
            residual_change_prob: 0.3,
            residual_df: 10.0,
            icc_noise_sd: 0.15,
            random_effect_dist: RandomEffectDist::HeavyTailed,
            random_effect_df: 5.0,
            ..Self::optimistic()
        }
    }

    /// Severe violations.
    pub fn doomer() -> Self {
        Self {
            name: DOOMER.into(),
            heterogeneity: 0.4,
            heteroskedasticity: 0.2,
            correlation_noise_sd: 0.4,
            distribution_change_prob: 0.6,
            residual_change_prob: 0.8,
            residual_df: 5.0,
            icc_noise_sd: 0.30,
            random_effect_dist: RandomEffectDist::HeavyTailed,
            random_effect_df: 3.0,
            ..Self::optimistic()
        }
    }

    /// Built-in preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            OPTIMISTIC => Some(Self::optimistic()),
            REALISTIC => Some(Self::realistic()),
            DOOMER => Some(Self::doomer()),
            _ => None,
        }
    }

    /// `true` when no perturbation is active.
    pub fn is_neutral(&self) -> bool {
        self.heterogeneity == 0.0
            && self.heteroskedasticity == 0.0
            && self.correlation_noise_sd == 0.0
            && self.distribution_change_prob == 0.0
            && self.residual_change_prob == 0.0
            && self.icc_noise_sd == 0.0
            && self.random_effect_dist == RandomEffectDist::Normal
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        let bad = |what: &str| {
            Err(Error::Config(format!("scenario '{}': {}", self.name, what)))
        };
        for (label, v) in [
            ("heterogeneity", self.heterogeneity),
            ("heteroskedasticity", self.heteroskedasticity),
            ("correlation_noise_sd", self.correlation_noise_sd),
            ("icc_noise_sd", self.icc_noise_sd),
        ] {
            if !(v >= 0.0 && v.is_finite()) {
                return bad(&format!("{} must be a finite value >= 0, got {}", label, v));
            }
        }
        for (label, v) in [
            ("distribution_change_prob", self.distribution_change_prob),
            ("residual_change_prob", self.residual_change_prob),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return bad(&format!("{} must be in [0, 1], got {}", label, v));
            }
        }
        if !(self.residual_df > 2.0) || !(self.random_effect_df > 2.0) {
            return bad("degrees of freedom must exceed 2");
        }
        if self.distribution_change_prob > 0.0 && self.new_distributions.is_empty() {
            return bad("new_distributions is empty");
        }
        if self.residual_change_prob > 0.0 && self.residual_dists.is_empty() {
            return bad("residual_dists is empty");
        }
        Ok(())
    }

    /// Perturb `params` in place; returns whether the correlation matrix needed repair.
    pub fn perturb_params<R: Rng + ?Sized>(
        &self,
        base: &DesignGenerator,
        params: &mut DrawParams,
        rng: &mut R,
    ) -> Result<bool> {
        if self.heterogeneity > 0.0 {
            for b in params.effects.iter_mut().skip(1) {
                let e: f64 = rng.sample(StandardNormal);
                *b *= 1.0 + self.heterogeneity * e;
            }
        }

        if self.distribution_change_prob > 0.0 && rng.random::<f64>() < self.distribution_change_prob {
            let candidates: Vec<usize> = params
                .latent
                .iter()
                .enumerate()
                .filter(|(_, l)| matches!(l, Latent::Continuous(_)))
                .map(|(i, _)| i)
                .collect();
            if !candidates.is_empty() {
                let slot = candidates[rng.random_range(0..candidates.len())];
                let m = self.new_distributions[rng.random_range(0..self.new_distributions.len())];
                params.latent[slot] = Latent::Continuous(m);
            }
        }

        let mut repaired = false;
        if self.correlation_noise_sd > 0.0 && params.latent.len() > 1 {
            let (l, r) = correlation::perturb(base.latent_correlation(), self.correlation_noise_sd, rng)?;
            params.factor = Some(l);
            repaired = r;
        }

        if self.residual_change_prob > 0.0 && rng.random::<f64>() < self.residual_change_prob {
            params.residual = match self.residual_dists[rng.random_range(0..self.residual_dists.len())] {
                ResidualDist::HeavyTailed => NoiseShape::StudentT { df: self.residual_df },
                ResidualDist::Skewed => NoiseShape::Skewed,
            };
        }

        params.heteroskedasticity = self.heteroskedasticity;

        if self.icc_noise_sd > 0.0 {
            for icc in params.icc.iter_mut().filter(|v| **v > 0.0) {
                let e: f64 = rng.sample(StandardNormal);
                *icc = (*icc * (1.0 + self.icc_noise_sd * e)).clamp(0.0, MAX_JITTERED_ICC);
            }
        }

        params.random_effect = match self.random_effect_dist {
            RandomEffectDist::Normal => NoiseShape::Normal,
            RandomEffectDist::HeavyTailed => NoiseShape::StudentT { df: self.random_effect_df },
            RandomEffectDist::Skewed => NoiseShape::Skewed,
        };
        Ok(repaired)
    }
}

/// Partial scenario settings; unset fields keep the base preset's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioOverrides {
    /// See [`ScenarioConfig::heterogeneity`].
    pub heterogeneity: Option<f64>,
    /// See [`ScenarioConfig::heteroskedasticity`].
    pub heteroskedasticity: Option<f64>,
    /// See [`ScenarioConfig::correlation_noise_sd`].
    pub correlation_noise_sd: Option<f64>,
    /// See [`ScenarioConfig::distribution_change_prob`].
    pub distribution_change_prob: Option<f64>,
    /// See [`ScenarioConfig::new_distributions`].
    pub new_distributions: Option<Vec<Marginal>>,
    /// See [`ScenarioConfig::residual_change_prob`].
    pub residual_change_prob: Option<f64>,
    /// See [`ScenarioConfig::residual_dists`].
    pub residual_dists: Option<Vec<ResidualDist>>,
    /// See [`ScenarioConfig::residual_df`].
    pub residual_df: Option<f64>,
    /// See [`ScenarioConfig::icc_noise_sd`].
    pub icc_noise_sd: Option<f64>,
    /// See [`ScenarioConfig::random_effect_dist`].
    pub random_effect_dist: Option<RandomEffectDist>,
    /// See [`ScenarioConfig::random_effect_df`].
    pub random_effect_df: Option<f64>,
}

impl ScenarioOverrides {
    /// Field-wise merge; values set in `newer` win.
    pub fn merge(&self, newer: &ScenarioOverrides) -> Self {
        Self {
            heterogeneity: newer.heterogeneity.or(self.heterogeneity),
            heteroskedasticity: newer.heteroskedasticity.or(self.heteroskedasticity),
            correlation_noise_sd: newer.correlation_noise_sd.or(self.correlation_noise_sd),
            distribution_change_prob: newer.distribution_change_prob.or(self.distribution_change_prob),
            new_distributions: newer.new_distributions.clone().or_else(|| self.new_distributions.clone()),
            residual_change_prob: newer.residual_change_prob.or(self.residual_change_prob),
            residual_dists: newer.residual_dists.clone().or_else(|| self.residual_dists.clone()),
            residual_df: newer.residual_df.or(self.residual_df),
            icc_noise_sd: newer.icc_noise_sd.or(self.icc_noise_sd),
            random_effect_dist: newer.random_effect_dist.or(self.random_effect_dist),
            random_effect_df: newer.random_effect_df.or(self.random_effect_df),
        }
    }

    /// Resolve the named scenario: presets start from themselves, custom
    /// names from the realistic preset. The optimistic preset is fixed.
    pub fn resolve(&self, name: &str) -> Result<ScenarioConfig> {
        if name == OPTIMISTIC {
            return Err(Error::Config("the optimistic scenario cannot be overridden".into()));
        }
        let base = ScenarioConfig::preset(name).unwrap_or_else(ScenarioConfig::realistic);
        let resolved = ScenarioConfig {
            name: name.to_string(),
            heterogeneity: self.heterogeneity.unwrap_or(base.heterogeneity),
            heteroskedasticity: self.heteroskedasticity.unwrap_or(base.heteroskedasticity),
            correlation_noise_sd: self.correlation_noise_sd.unwrap_or(base.correlation_noise_sd),
            distribution_change_prob: self
                .distribution_change_prob
                .unwrap_or(base.distribution_change_prob),
            new_distributions: self.new_distributions.clone().unwrap_or(base.new_distributions),
            residual_change_prob: self.residual_change_prob.unwrap_or(base.residual_change_prob),
            residual_dists: self.residual_dists.clone().unwrap_or(base.residual_dists),
            residual_df: self.residual_df.unwrap_or(base.residual_df),
            icc_noise_sd: self.icc_noise_sd.unwrap_or(base.icc_noise_sd),
            random_effect_dist: self.random_effect_dist.unwrap_or(base.random_effect_dist),
            random_effect_df: self.random_effect_df.unwrap_or(base.random_effect_df),
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

/// A [`DesignGenerator`] with per-draw scenario perturbations.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioGenerator<'a> {
    base: &'a DesignGenerator,
    scenario: &'a ScenarioConfig,
}

/// Wrap `base` so every draw applies `scenario`.
pub fn perturb<'a>(base: &'a DesignGenerator, scenario: &'a ScenarioConfig) -> ScenarioGenerator<'a> {
    ScenarioGenerator { base, scenario }
}

impl ScenarioGenerator<'_> {
    /// Scenario applied by this generator.
    pub fn scenario(&self) -> &ScenarioConfig {
        self.scenario
    }
}

impl DrawSource for ScenarioGenerator<'_> {
    fn draw(&self, rng: &mut StdRng) -> Result<SimulationDraw> {
        let mut params = self.base.base_params().clone();
        let repaired = self.scenario.perturb_params(self.base, &mut params, rng)?;
        if repaired {
            log::debug!("scenario '{}': perturbed correlation matrix repaired", self.scenario.name);
        }
        let mut draw = self.base.generate_with(&params, rng)?;
        draw.correlation_repaired = repaired;
        Ok(draw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterSizing, ClusterSpec};
    use crate::config::PowerConfigBuilder;
    use rand::SeedableRng;

    fn generator() -> DesignGenerator {
        let config = PowerConfigBuilder::new("y ~ x1 + x2 + (1|school)")
            .set_effects([("x1", 0.5), ("x2", 0.3)])
            .set_correlation("x1", "x2", 0.5)
            .set_cluster(ClusterSpec::new("school", 0.2, ClusterSizing::Count(10)))
            .build()
            .unwrap();
        DesignGenerator::new(&config, 200).unwrap()
    }

    #[test]
    fn test_presets_validate() {
        for name in [OPTIMISTIC, REALISTIC, DOOMER] {
            ScenarioConfig::preset(name).unwrap().validate().unwrap();
        }
        assert!(ScenarioConfig::optimistic().is_neutral());
        assert!(!ScenarioConfig::realistic().is_neutral());
        assert_eq!(ScenarioConfig::doomer().residual_df, 5.0);
        assert_eq!(ScenarioConfig::doomer().random_effect_df, 3.0);
    }

    #[test]
    fn test_optimistic_override_rejected() {
        let o = ScenarioOverrides { heterogeneity: Some(0.1), ..Default::default() };
        assert!(matches!(o.resolve(OPTIMISTIC), Err(Error::Config(_))));
    }

    #[test]
    fn test_custom_starts_from_realistic() {
        let o = ScenarioOverrides { heterogeneity: Some(0.05), ..Default::default() };
        let s = o.resolve("mild").unwrap();
        assert_eq!(s.name, "mild");
        assert_eq!(s.heterogeneity, 0.05);
        assert_eq!(s.correlation_noise_sd, ScenarioConfig::realistic().correlation_noise_sd);
        let doom = ScenarioOverrides { residual_df: Some(4.0), ..Default::default() }.resolve(DOOMER).unwrap();
        assert_eq!(doom.heterogeneity, 0.4);
        assert_eq!(doom.residual_df, 4.0);
        let bad = ScenarioOverrides { residual_change_prob: Some(1.5), ..Default::default() };
        assert!(bad.resolve("x").is_err());
    }

    #[test]
    fn test_overrides_merge() {
        let a = ScenarioOverrides { heterogeneity: Some(0.1), icc_noise_sd: Some(0.2), ..Default::default() };
        let b = ScenarioOverrides { heterogeneity: Some(0.3), ..Default::default() };
        let m = a.merge(&b);
        assert_eq!(m.heterogeneity, Some(0.3));
        assert_eq!(m.icc_noise_sd, Some(0.2));
    }

    #[test]
    fn test_perturbation_leaves_base_untouched() {
        let g = generator();
        let before = g.base_params().clone();
        let doomer = ScenarioConfig::doomer();
        let wrapped = perturb(&g, &doomer);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            wrapped.draw(&mut rng).unwrap();
        }
        assert_eq!(g.base_params().effects(), before.effects());
        assert_eq!(g.base_params().icc(), before.icc());
        assert_eq!(g.base_params().residual, NoiseShape::Normal);
    }

    #[test]
    fn test_perturb_params_changes_draw_local_copy() {
        let g = generator();
        let s = ScenarioConfig::doomer();
        let mut params = g.base_params().clone();
        let mut rng = StdRng::seed_from_u64(8);
        s.perturb_params(&g, &mut params, &mut rng).unwrap();
        assert_ne!(params.effects()[1], 0.5);
        assert_eq!(params.effects()[0], 0.0);
        assert_eq!(params.heteroskedasticity, 0.2);
        assert_eq!(params.random_effect, NoiseShape::StudentT { df: 3.0 });
        assert!(params.icc()[0] >= 0.0 && params.icc()[0] <= MAX_JITTERED_ICC);
    }

    #[test]
    fn test_scenario_draws_are_reproducible() {
        let g = generator();
        let s = ScenarioConfig::realistic();
        let wrapped = perturb(&g, &s);
        let a = wrapped.draw(&mut StdRng::seed_from_u64(21)).unwrap();
        let b = wrapped.draw(&mut StdRng::seed_from_u64(21)).unwrap();
        assert_eq!(a.y, b.y);
    }
}
