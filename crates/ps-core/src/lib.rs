//! # ps-core
//!
//! Shared building blocks for PowerStat: the error taxonomy, the per-draw
//! `FitResult`, design-matrix containers and the `ModelSolver` seam between
//! the simulation driver and the fitting routines.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy.
pub mod error;
/// Solver traits.
pub mod traits;
/// Data containers shared across crates.
pub mod types;

pub use error::{Error, Result};
pub use traits::ModelSolver;
pub use types::{DesignMatrix, FitResult, Grouping, RandomStructure};
