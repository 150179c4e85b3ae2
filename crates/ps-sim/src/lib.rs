//! # ps-sim
//!
//! Monte Carlo power engine for PowerStat.
//!
//! A validated [`PowerConfig`] snapshot drives a [`DesignGenerator`] that
//! draws correlated predictors, cluster memberships and outcomes; each draw is
//! fitted by an OLS or mixed-model solver from `ps-inference` and evaluated
//! against precomputed critical values. [`PowerAnalysis`] aggregates the
//! decisions in parallel into per-test power, optionally under robustness
//! scenarios, and searches a grid of sample sizes for a target power.
//!
//! ```no_run
//! use ps_inference::Correction;
//! use ps_sim::{PowerAnalysis, PowerConfigBuilder};
//!
//! let config = PowerConfigBuilder::new("y ~ x1 + x2 + x1:x2")
//!     .set_effects([("x1", 0.5), ("x2", 0.3), ("x1:x2", 0.2)])
//!     .build()?;
//! let result = PowerAnalysis::new(config).find_power(100, "all", Correction::Holm)?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok::<(), ps_core::Error>(())
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod correlation;
pub mod generator;
pub mod power;
pub mod results;
pub mod scenario;
pub mod selector;
pub mod upload;
pub mod variables;

pub use cluster::{ClusterLayout, ClusterSizing, ClusterSpec};
pub use config::{ConfigSpec, ParallelConfig, PowerConfig, PowerConfigBuilder};
pub use correlation::{CorrelationPair, CorrelationSpec};
pub use generator::{DesignGenerator, DrawSource, NoiseShape, SimulationDraw};
pub use power::{CancelToken, PowerAnalysis, ProgressCallback};
pub use results::{PowerResult, SampleSizeGrid, SampleSizeResult, TestPower};
pub use scenario::{RandomEffectDist, ResidualDist, ScenarioConfig, ScenarioGenerator, ScenarioOverrides};
pub use selector::TestSelector;
pub use upload::UploadedData;
pub use variables::{Distribution, VariableSpec};
