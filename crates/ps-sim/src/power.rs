//! Monte Carlo power aggregator and sample-size search.
//!
//! Every draw gets its own RNG seeded from `(seed, stream index)`, and
//! per-test hit counts are summed through an associative `fold`/`reduce`, so a
//! result depends only on the configuration, never on worker count or
//! scheduling order.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ps_core::{Error, ModelSolver, Result};
use ps_inference::{Correction, InferencePlan, LmeSolver, OlsSolver, TestKind, TestOutcome};

use crate::config::PowerConfig;
use crate::generator::{DesignGenerator, DrawSource};
use crate::results::{PowerResult, SampleSizeGrid, SampleSizeResult, TestPower};
use crate::scenario::{ScenarioConfig, perturb};
use crate::selector::TestSelector;

/// Upper bound on progress callbacks per run.
const PROGRESS_CALLS: usize = 200;

/// Observational progress hook: `(completed, total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Cooperative cancellation flag shared with a running analysis.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop starting new draws.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear the flag so the analysis can run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[inline]
fn draw_rng(seed: u64, index: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_mul(2654435761).wrapping_add(index))
}

/// Offset of the draw streams for one (sample size, scenario) batch.
#[inline]
fn stream_salt(sample_size: usize, scenario: usize) -> u64 {
    (((sample_size as u64) << 32) | scenario as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Throttled progress reporting across one run.
struct Progress {
    callback: Option<ProgressCallback>,
    total: usize,
    stride: usize,
    done: AtomicUsize,
}

impl Progress {
    fn new(callback: Option<ProgressCallback>, total: usize) -> Self {
        Self { callback, total, stride: total.div_ceil(PROGRESS_CALLS).max(1), done: AtomicUsize::new(0) }
    }

    fn tick(&self) {
        let Some(cb) = &self.callback else { return };
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.stride == 0 || done == self.total {
            cb(done, self.total);
        }
    }
}

/// Per-test hit counts of a batch of draws.
#[derive(Debug, Clone)]
struct Tally {
    raw: Vec<usize>,
    corrected: Vec<usize>,
    n_valid: usize,
    n_failed: usize,
    n_repaired: usize,
}

impl Tally {
    fn new(n_tests: usize) -> Self {
        Self { raw: vec![0; n_tests], corrected: vec![0; n_tests], n_valid: 0, n_failed: 0, n_repaired: 0 }
    }

    fn record(&mut self, outcomes: &[TestOutcome]) {
        self.n_valid += 1;
        for (i, o) in outcomes.iter().enumerate() {
            if o.significant {
                self.raw[i] += 1;
            }
            if o.corrected == Some(true) {
                self.corrected[i] += 1;
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        for (a, b) in self.raw.iter_mut().zip(&other.raw) {
            *a += b;
        }
        for (a, b) in self.corrected.iter_mut().zip(&other.corrected) {
            *a += b;
        }
        self.n_valid += other.n_valid;
        self.n_failed += other.n_failed;
        self.n_repaired += other.n_repaired;
    }
}

/// Runs power analyses against one immutable configuration snapshot.
#[derive(Clone)]
pub struct PowerAnalysis {
    config: Arc<PowerConfig>,
    progress: Option<ProgressCallback>,
    cancel: CancelToken,
}

impl std::fmt::Debug for PowerAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerAnalysis")
            .field("config", &self.config)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl PowerAnalysis {
    /// Analysis over `config`.
    pub fn new(config: PowerConfig) -> Self {
        Self { config: Arc::new(config), progress: None, cancel: CancelToken::new() }
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels runs of this analysis.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Configuration snapshot.
    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Power of the selected tests at `sample_size`.
    pub fn find_power(&self, sample_size: usize, tests: &str, correction: Correction) -> Result<PowerResult> {
        let progress = Progress::new(self.progress.clone(), self.config.n_simulations());
        self.install(|| self.power_at(sample_size, tests, correction, None, &progress))
    }

    /// One independent batch per named scenario, in the given order.
    pub fn find_power_scenarios(
        &self,
        sample_size: usize,
        tests: &str,
        correction: Correction,
        scenarios: &[&str],
    ) -> Result<Vec<PowerResult>> {
        let resolved = scenarios
            .iter()
            .map(|name| self.config.scenario(name))
            .collect::<Result<Vec<_>>>()?;
        let progress = Progress::new(self.progress.clone(), self.config.n_simulations() * resolved.len());
        self.install(|| {
            resolved
                .iter()
                .enumerate()
                .map(|(i, s)| self.power_at(sample_size, tests, correction, Some((i + 1, s)), &progress))
                .collect()
        })
    }

    /// Power at every grid point, and the first sample size reaching
    /// `target_power` (percent) for each test.
    pub fn find_sample_size(
        &self,
        grid: SampleSizeGrid,
        target_power: f64,
        tests: &str,
        correction: Correction,
    ) -> Result<SampleSizeResult> {
        if !(target_power > 0.0 && target_power <= 100.0) {
            return Err(Error::Config(format!("target power must be in (0, 100], got {}", target_power)));
        }
        let sizes = grid.sizes();
        if sizes.is_empty() {
            return Err(Error::Config(format!(
                "empty sample-size grid (from {}, to {}, by {})",
                grid.from, grid.to, grid.by
            )));
        }
        let p = self.config.layout().n_columns();
        if sizes[0] <= p {
            return Err(Error::Config(format!(
                "sample size {} must exceed the {} design columns",
                sizes[0], p
            )));
        }

        let t0 = Instant::now();
        let progress = Progress::new(self.progress.clone(), self.config.n_simulations() * sizes.len());
        let points = self.install(|| {
            sizes
                .par_iter()
                .map(|&n| {
                    let r = self.power_at(n, tests, correction, None, &progress)?;
                    log::debug!("sample-size search: n = {} done ({} valid draws)", n, r.n_valid);
                    Ok(r)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut first_reaching = BTreeMap::new();
        if let Some(first) = points.first() {
            for (i, t) in first.tests.iter().enumerate() {
                let hit = points.iter().find(|r| decision_power(&r.tests[i]) >= target_power);
                first_reaching.insert(t.test.clone(), hit.map(|r| r.sample_size));
            }
        }
        log::info!(
            "sample-size search over {} grid points finished in {:.2}s",
            points.len(),
            t0.elapsed().as_secs_f64()
        );
        Ok(SampleSizeResult { target_power, grid: points, first_reaching })
    }

    /// Run on the configured pool: the global one, or a local pool of `n_threads`.
    fn install<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce() -> Result<T> + Send,
    {
        let n_threads = self.config.parallel().n_threads;
        if n_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .build()
                .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
            pool.install(f)
        } else {
            f()
        }
    }

    fn solver(&self) -> Box<dyn ModelSolver> {
        if self.config.formula().is_mixed() {
            Box::new(LmeSolver::default())
        } else {
            Box::new(OlsSolver)
        }
    }

    fn plan(&self, sample_size: usize, tests: &str, correction: Correction) -> Result<InferencePlan> {
        let layout = self.config.layout();
        let planned = TestSelector::new(layout, self.config.factor_levels()).resolve(tests)?;
        let p = layout.n_columns();
        InferencePlan::new(
            planned,
            self.config.alpha(),
            correction,
            sample_size.saturating_sub(p) as f64,
            p.saturating_sub(1),
        )
    }

    fn power_at(
        &self,
        sample_size: usize,
        tests: &str,
        correction: Correction,
        scenario: Option<(usize, &ScenarioConfig)>,
        progress: &Progress,
    ) -> Result<PowerResult> {
        let generator = DesignGenerator::new(&self.config, sample_size)?;
        let plan = self.plan(sample_size, tests, correction)?;
        let solver = self.solver();
        let model_type = generator.model_type()?;
        let t0 = Instant::now();
        log::info!(
            "find_power: n = {}, {} simulations, model {}{}",
            sample_size,
            self.config.n_simulations(),
            model_type,
            scenario.map(|(_, s)| format!(", scenario '{}'", s.name)).unwrap_or_default()
        );

        let tally = match scenario {
            Some((i, s)) => {
                let source = perturb(&generator, s);
                self.run_batch(&source, &plan, solver.as_ref(), stream_salt(sample_size, i), progress)?
            }
            None => self.run_batch(&generator, &plan, solver.as_ref(), stream_salt(sample_size, 0), progress)?,
        };

        log::info!(
            "find_power: n = {} finished in {:.2}s ({} valid, {} failed)",
            sample_size,
            t0.elapsed().as_secs_f64(),
            tally.n_valid,
            tally.n_failed
        );
        Ok(summarize(
            &plan,
            &tally,
            PowerResult {
                sample_size,
                alpha: self.config.alpha(),
                n_simulations: self.config.n_simulations(),
                n_valid: tally.n_valid,
                n_failed: tally.n_failed,
                model_type: model_type.to_string(),
                correction,
                scenario: scenario.map(|(_, s)| s.name.clone()),
                design_effect: generator.cluster_layout().map(|c| c.design_effect),
                tests: Vec::new(),
            },
        ))
    }

    /// Generate, fit and evaluate every draw of one batch.
    fn run_batch(
        &self,
        source: &dyn DrawSource,
        plan: &InferencePlan,
        solver: &dyn ModelSolver,
        salt: u64,
        progress: &Progress,
    ) -> Result<Tally> {
        let total = self.config.n_simulations();
        let ceiling = self.config.max_failed_fraction();
        let max_failed = (ceiling * total as f64).floor() as usize;
        let seed = self.config.seed();
        let n_tests = plan.tests().len();

        let failed = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let fatal: Mutex<Option<Error>> = Mutex::new(None);

        let tally = (0..total)
            .into_par_iter()
            .fold(
                || Tally::new(n_tests),
                |mut acc, i| {
                    if self.cancel.is_cancelled() || abort.load(Ordering::Relaxed) {
                        return acc;
                    }
                    let mut rng = draw_rng(seed, salt.wrapping_add(i as u64));
                    let fitted = source.draw(&mut rng).and_then(|draw| {
                        let fit = solver.fit(&draw.x, &draw.y, draw.random.as_ref())?;
                        Ok((fit, draw.correlation_repaired))
                    });
                    match fitted {
                        Ok((fit, repaired)) => {
                            acc.record(&plan.evaluate(&fit));
                            if repaired {
                                acc.n_repaired += 1;
                            }
                        }
                        Err(e) if e.is_draw_recoverable() => {
                            acc.n_failed += 1;
                            if failed.fetch_add(1, Ordering::Relaxed) + 1 > max_failed {
                                abort.store(true, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            abort.store(true, Ordering::Relaxed);
                            if let Ok(mut slot) = fatal.lock() {
                                slot.get_or_insert(e);
                            }
                        }
                    }
                    progress.tick();
                    acc
                },
            )
            .reduce(
                || Tally::new(n_tests),
                |mut a, b| {
                    a.merge(&b);
                    a
                },
            );

        if let Some(e) = fatal.into_inner().ok().flatten() {
            return Err(e);
        }
        let attempted = tally.n_valid + tally.n_failed;
        if tally.n_failed > max_failed {
            return Err(Error::TooManyFailedSimulations {
                failed: tally.n_failed,
                total: attempted,
                rate: tally.n_failed as f64 / attempted as f64,
                ceiling,
            });
        }
        if self.cancel.is_cancelled() && attempted < total {
            return Err(Error::Cancelled { completed: attempted, total });
        }
        if tally.n_repaired > 0 {
            log::warn!(
                "{} of {} draws needed a repaired correlation matrix",
                tally.n_repaired,
                attempted
            );
        }
        Ok(tally)
    }
}

/// Power used to judge the target: corrected when defined, raw otherwise.
fn decision_power(t: &TestPower) -> f64 {
    match t.corrected_power {
        Some(c) if c.is_finite() => c,
        _ => t.power,
    }
}

fn summarize(plan: &InferencePlan, tally: &Tally, mut result: PowerResult) -> PowerResult {
    let pct = |hits: usize| {
        if tally.n_valid == 0 { 0.0 } else { 100.0 * hits as f64 / tally.n_valid as f64 }
    };
    result.tests = plan
        .tests()
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let corrected_power = match (plan.correction(), &t.kind) {
                (Correction::None, _) => None,
                (Correction::Tukey, TestKind::Coefficient { .. }) => Some(f64::NAN),
                _ => Some(pct(tally.corrected[i])),
            };
            TestPower { test: t.id.to_string(), power: pct(tally.raw[i]), corrected_power }
        })
        .collect();
    result
}
