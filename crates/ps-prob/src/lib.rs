//! Probability building blocks for PowerStat.
//!
//! This crate hosts the reference distributions used by the inference layer
//! and the marginal transforms used by the data generator:
//! - normal / Student-t / F (central and non-central)
//! - studentized range (Tukey HSD)
//! - standardized non-normal marginals
//! - Gauss–Legendre quadrature

pub mod f_dist;
pub mod marginal;
pub mod normal;
pub mod quadrature;
pub mod student_t;
pub mod studentized_range;

pub use marginal::Marginal;
