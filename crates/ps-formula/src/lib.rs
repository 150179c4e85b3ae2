//! Model formula language for PowerStat.
//!
//! Parses R-style formulas (`y ~ x1*x2 + (1 + x1|school)`) into an explicit
//! term list, validates random-effect groupings and expands factors into
//! reference-coded design columns.

#![warn(missing_docs)]

pub mod design;
pub mod formula;
mod parser;

pub use design::{ColumnPart, DesignColumn, DesignLayout, FactorLevels, INTERCEPT};
pub use formula::{DEFAULT_OUTCOME, Formula, RandomEffect, Term};
