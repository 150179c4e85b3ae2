//! # ps-inference
//!
//! Model fitting and hypothesis testing for PowerStat simulations:
//! - OLS by Householder QR ([`ols`])
//! - linear mixed-effects models by REML profiled deviance ([`lme`]), with
//!   Brent's method for a single random intercept and box-constrained
//!   L-BFGS ([`optimizer`]) for random slopes and nested groupings
//! - per-draw test decisions and multiple-comparison corrections
//!   ([`hypothesis`], [`correction`])
//! - closed-form OLS power for validation ([`analytical`])

#![warn(missing_docs)]

pub mod analytical;
pub mod brent;
pub mod correction;
pub mod hypothesis;
pub mod lme;
pub mod ols;
pub mod optimizer;

pub use analytical::{analytical_power_f, analytical_power_t};
pub use correction::Correction;
pub use hypothesis::{InferencePlan, PlannedTest, TestId, TestKind, TestOutcome};
pub use lme::{LmeConfig, LmeSolver, LmeVariant, ProfiledDeviance, fit_lme};
pub use ols::{OlsSolver, fit_ols};
pub use optimizer::{LbfgsbOptimizer, Minimum, ObjectiveFunction, OptimizerConfig};
