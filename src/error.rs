use thiserror::Error;

/// Closed set of failure kinds surfaced by the analysis pipeline.
///
/// Per-translation-unit and per-hotspot failures are downgraded to
/// diagnostics by the callers that can continue without them; everything
/// that reaches the caller through this enum aborted the operation before
/// any caller-visible output was mutated.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Malformed caller input: empty required collections, out-of-range
    /// configuration values, inconsistent sample records.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The AST backend reported a fatal diagnostic for a translation unit.
    /// Other translation units continue.
    #[error("extractor failed: {diag}")]
    ExtractorFailed { diag: String },

    /// The cache topology snapshot has no usable cache level.
    #[error("unsupported cache topology: at least one cache level is required")]
    UnsupportedTopology,

    /// The caller's cooperative stop flag was observed mid-run. Partial
    /// results produced before the stop must not be trusted.
    #[error("analysis cancelled by caller")]
    Cancelled,

    /// Invariant violation. Logged at critical level on construction.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        AnalysisError::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(critical = true, "internal invariant violation: {}", msg);
        AnalysisError::Internal(msg)
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
