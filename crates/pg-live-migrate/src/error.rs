//! Error types for the migration engine.

use thiserror::Error;

/// Substrings of target errors that must not be retried during bulk load or
/// event apply. Retrying these can only reproduce the same failure; the user
/// has to fix the data or the schema.
const NON_RETRYABLE_ERRORS: &[&str] = &[
    "invalid input syntax",
    "violates unique constraint",
    "syntax error at",
    "Sending too long RPC message",
];

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (bad flags, missing fields, invalid URIs).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Target database connection or query error.
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Control connection pool error.
    #[error("Control pool error: {0}")]
    ControlPool(#[from] deadpool_postgres::PoolError),

    /// Writer pool error with context about where it occurred.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Identifier could not be resolved against the name registry.
    #[error("Name resolution failed: {0}")]
    NameResolution(String),

    /// A snapshot batch failed; carries the offending file and batch number.
    #[error("import failed for batch {number} of {file}: {message}")]
    Batch {
        file: String,
        number: i64,
        message: String,
    },

    /// Durable state (batch directory, descriptor, MSR) is corrupt or
    /// inconsistent.
    #[error("State error: {0}")]
    State(String),

    /// Snapshot export failed.
    #[error("Export error: {0}")]
    Export(String),

    /// A child process (dump tool, CDC producer) exited abnormally.
    #[error("child process {command} exited with {status}")]
    Child { command: String, status: String },

    /// Streaming event could not be decoded or applied.
    #[error("Event error: {0}")]
    Event(String),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled (SIGINT/SIGTERM).
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Batch error.
    pub fn batch(file: impl Into<String>, number: i64, message: impl Into<String>) -> Self {
        MigrateError::Batch {
            file: file.into(),
            number,
            message: message.into(),
        }
    }

    /// True for data-class failures that retrying cannot fix: invalid input
    /// syntax, unique violations, statement syntax errors, oversized RPCs.
    pub fn is_non_retryable_data_error(&self) -> bool {
        let msg = self.to_string();
        NON_RETRYABLE_ERRORS.iter().any(|s| msg.contains(s))
    }

    /// True for transient failures where dropping the connection, backing
    /// off and re-picking the same unit of work is the right response.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrateError::Target(_) | MigrateError::ControlPool(_) | MigrateError::Pool { .. } => {
                !self.is_non_retryable_data_error()
            }
            _ => false,
        }
    }

    /// Format error with full details including the error chain.
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

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_carries_file_and_number() {
        let err = MigrateError::batch("/data/users_data.sql", 3, "copy failed");
        let msg = err.to_string();
        assert!(msg.contains("/data/users_data.sql"));
        assert!(msg.contains("batch 3"));
    }

    #[test]
    fn test_non_retryable_classification() {
        let err = MigrateError::State(
            "ERROR: duplicate key value violates unique constraint \"users_email_key\"".into(),
        );
        assert!(err.is_non_retryable_data_error());

        let err = MigrateError::State("connection reset by peer".into());
        assert!(!err.is_non_retryable_data_error());
    }

    #[test]
    fn test_retryable_excludes_data_errors() {
        let err = MigrateError::pool(
            "invalid input syntax for type integer",
            "import batch 2",
        );
        assert!(!err.is_retryable());

        let err = MigrateError::pool("connection refused", "import batch 2");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = MigrateError::Io(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error"));
    }
}
