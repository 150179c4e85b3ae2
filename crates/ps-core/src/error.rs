//! Error types for PowerStat

use thiserror::Error;

/// PowerStat error type
#[derive(Error, Debug)]
pub enum Error {
    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid user configuration (PSD violation, ICC range, cluster size, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed model formula.
    #[error("Formula error: {0}")]
    Formula(String),

    /// Rank-deficient design matrix in a single draw.
    #[error("Singular design: {0}")]
    SingularDesign(String),

    /// Mixed-model optimizer did not converge in a single draw.
    #[error("Convergence failure: {0}")]
    Convergence(String),

    /// Failure rate across draws exceeded the configured ceiling.
    #[error(
        "Too many failed simulations: {failed}/{total} ({:.1}%) exceeds ceiling {:.1}%",
        100.0 * rate,
        100.0 * ceiling
    )]
    TooManyFailedSimulations {
        /// Draws that failed (singular design or non-convergence).
        failed: usize,
        /// Draws attempted.
        total: usize,
        /// Observed failure fraction.
        rate: f64,
        /// Configured ceiling.
        ceiling: f64,
    },

    /// Run stopped by a cancellation request.
    #[error("Simulation cancelled after {completed}/{total} draws")]
    Cancelled {
        /// Draws completed before cancellation was observed.
        completed: usize,
        /// Draws requested.
        total: usize,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

impl Error {
    /// `true` for failures that only invalidate the current simulation draw.
    ///
    /// The power aggregator counts these against the failure ceiling instead of
    /// aborting the run.
    pub fn is_draw_recoverable(&self) -> bool {
        matches!(self, Error::SingularDesign(_) | Error::Convergence(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::SingularDesign("x".into()).is_draw_recoverable());
        assert!(Error::Convergence("x".into()).is_draw_recoverable());
        assert!(!Error::Config("x".into()).is_draw_recoverable());
        assert!(!Error::Cancelled { completed: 1, total: 2 }.is_draw_recoverable());
    }

    #[test]
    fn test_failure_message_reports_rate() {
        let e = Error::TooManyFailedSimulations { failed: 5, total: 100, rate: 0.05, ceiling: 0.03 };
        let msg = e.to_string();
        assert!(msg.contains("5/100"), "{msg}");
        assert!(msg.contains("5.0%"), "{msg}");
        assert!(msg.contains("3.0%"), "{msg}");
    }
}
