use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Graph errors
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Trace session errors
    #[error("Trace session already open: {0}")]
    AlreadyOpen(String),

    #[error("No open trace session")]
    NoOpenSession,

    #[error("Trace session still open: {0}")]
    SessionNotClosed(String),

    // Snapshot errors
    #[error("Snapshot already recorded for step {0}")]
    DuplicateStep(u64),

    // Recoverable bookkeeping errors (logged, never fatal to a run)
    #[error("Breakpoint predicate failed: {0}")]
    Predicate(String),

    #[error("Tool call ordering error: {0}")]
    Ordering(String),

    // Run errors
    #[error("{0}")]
    Engine(Box<dyn std::error::Error + Send + Sync>),

    #[error("Run cancelled by operator")]
    CancelledByOperator,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Node",
            id: id.into(),
        }
    }

    pub fn edge_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Edge",
            id: id.into(),
        }
    }

    /// Wrap an error raised by the execution engine.
    pub fn engine(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Engine(err.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancelledByOperator)
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_displays_verbatim() {
        let err = StepwiseError::engine("validation rejected 3 rows");
        assert_eq!(err.to_string(), "validation rejected 3 rows");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn not_found_names_the_entity() {
        let err = StepwiseError::node_not_found("transform");
        assert_eq!(err.to_string(), "Node not found: transform");
        assert!(StepwiseError::CancelledByOperator.is_cancellation());
    }
}
