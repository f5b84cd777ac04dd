/// The main error type for duesledger operations.
///
/// Variants follow the billing error taxonomy: callers match on the variant
/// to decide whether to reject input, report a missing record, retry, or
/// page an operator.
#[derive(Debug, thiserror::Error)]
pub enum DuesError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Dependency failure: {0}")]
    Dependency(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl DuesError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only dependency failures (storage, processor) are transient. A lost
    /// race (`Conflict`) is final for the caller that lost it.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Dependency(_))
    }

    /// Short machine-readable kind, used as a structured log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Dependency(_) => "dependency",
            Self::Configuration(_) => "configuration",
            Self::Internal(_) | Self::Anyhow(_) => "internal",
        }
    }
}

/// Result type alias for duesledger operations
pub type Result<T> = std::result::Result<T, DuesError>;
