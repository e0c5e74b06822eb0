//! Error types for the verification library.

use thiserror::Error;

/// Main error type for verification operations.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store rejected a scan or lookup.
    #[error("Store '{store}' error: {message}")]
    Store { store: String, message: String },

    /// PostgreSQL connection or query error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A lookup did not complete within the configured timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A bounded queue refused a send while no cancellation was requested.
    /// This is a wiring defect, never a data condition.
    #[error("Pipeline fault: {0}")]
    PipelineFault(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Verification cancelled")]
    Cancelled,
}

impl VerifyError {
    /// Create a Store error for the named store.
    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        VerifyError::Store {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        VerifyError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            VerifyError::Config(_) | VerifyError::Yaml(_) => 2,
            VerifyError::Store { .. } | VerifyError::Postgres(_) | VerifyError::Pool { .. } => 3,
            VerifyError::PipelineFault(_) => 4,
            VerifyError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, VerifyError>;
