//! Error taxonomy shared by every analysis stage
//!
//! Configuration and lookup errors are fatal and raised where they are detected.
//! Cache problems are the one recoverable class: the attribution stage logs them
//! and recomputes, so `Cache` never escapes `ResourceAttribution::execute`.

use thiserror::Error;

/// Errors raised by the analysis engine
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The execution or resource model failed builder validation
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Settings or inputs that cannot be combined (e.g. timeslice granularity mismatch)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A phase or metric was requested from a result that never computed it
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The root phase never completed during simulation
    #[error("Simulation deadlock: root phase never completed\n{dump}")]
    Deadlock { dump: String },

    /// A derived structure violated an internal invariant
    #[error("Internal inconsistency: {message}\n{dump}")]
    Inconsistency { message: String, dump: String },

    /// Reading or writing the attribution cache failed
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, AnalysisError>;
