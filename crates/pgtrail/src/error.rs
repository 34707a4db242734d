//! Error types for the audit pipeline
//!
//! Every failure site consults the configured strict/lenient policy: strict
//! mode propagates these errors to the caller, lenient mode routes them to
//! the configured error sink and keeps going.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for audit operations
pub type AuditResult<T> = std::result::Result<T, AuditError>;

/// Main error type for the audit pipeline
#[derive(Error, Debug)]
pub enum AuditError {
    /// Invalid or incomplete configuration. Raised synchronously at logger
    /// construction or at the first offending call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A row could not be turned into an audit record (missing primary key
    /// columns and the like).
    #[error("Capture error: {0}")]
    Capture(String),

    /// Enqueue would exceed the configured queue bound.
    #[error("Audit queue full: {pending} queued + {incoming} incoming exceeds limit of {max}")]
    QueueOverflow {
        pending: usize,
        incoming: usize,
        max: usize,
    },

    /// Database error, either from a caller's statement executed through the
    /// audited handle or from the SQL write during a flush.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Enqueue after shutdown.
    #[error("Audit writer is closed")]
    Closed,
}

impl AuditError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a capture error
    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture(message.into())
    }
}

/// Flattened view of an error, safe to hand to user-supplied sinks.
///
/// Database errors contribute their SQLSTATE as `code`; everything else
/// surfaces name and message only.
#[derive(Debug, Clone)]
pub struct SanitizedError {
    pub name: &'static str,
    pub message: String,
    pub code: Option<String>,
}

impl SanitizedError {
    pub fn from_audit(err: &AuditError) -> Self {
        let name = match err {
            AuditError::Configuration(_) => "ConfigurationError",
            AuditError::Capture(_) => "CaptureError",
            AuditError::QueueOverflow { .. } => "QueueOverflow",
            AuditError::Database(_) => "WriteFailure",
            AuditError::Closed => "ShutdownClosed",
        };

        let code = match err {
            AuditError::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.to_string()),
            _ => None,
        };

        Self {
            name,
            message: err.to_string(),
            code,
        }
    }
}

impl std::fmt::Display for SanitizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({}): {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

/// Sink for non-fatal errors in lenient mode.
///
/// The first argument is an `[AUDIT]`-prefixed description of the failure
/// site, the second the sanitized error.
pub type ErrorSink = Arc<dyn Fn(&str, &SanitizedError) + Send + Sync>;

/// Default sink: structured `tracing` error event.
pub fn default_error_sink() -> ErrorSink {
    Arc::new(|message, err| {
        tracing::error!(
            error = %err,
            code = ?err.code,
            "{message}"
        );
    })
}
