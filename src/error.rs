//! Error types for xverify-core.

use thiserror::Error;

/// Result type alias using xverify-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during cross-verification.
///
/// Verifier failures never surface here: they are caught at the verifier
/// boundary and mapped into `VerifierResult` entries on the decision. The
/// engine's `verify` returns an error only for construction-time config
/// rejection and for caller cancellation that lands before a plan exists.
#[derive(Error, Debug)]
pub enum Error {
    /// Construction-time configuration, policy, or metadata rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// A category is already registered
    #[error("Verifier category already registered: {category}")]
    Conflict { category: String },

    /// Caller cancelled before an execution plan existed
    #[error("Verification cancelled for request {request_id}")]
    Cancelled { request_id: String },

    /// The history sink rejected or cannot accept a record
    #[error("History sink unavailable: {0}")]
    SinkUnavailable(String),

    /// The configured history sink does not implement reads
    #[error("History queries are not supported by this sink")]
    HistoryQueryUnavailable,

    /// The engine is shutting down and no longer accepts requests
    #[error("Engine is closed")]
    EngineClosed,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a duplicate-registration conflict error.
    pub fn conflict(category: impl Into<String>) -> Self {
        Self::Conflict {
            category: category.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(request_id: impl Into<String>) -> Self {
        Self::Cancelled {
            request_id: request_id.into(),
        }
    }

    /// Create a sink-unavailable error.
    pub fn sink_unavailable(message: impl Into<String>) -> Self {
        Self::SinkUnavailable(message.into())
    }
}

/// Errors a verifier invocation may raise.
///
/// These cross the verifier boundary and are converted into a synthetic
/// `VerifierResult` with `status=error` by the executor, so they carry the
/// fields the synthetic result needs.
#[derive(Error, Debug)]
pub enum VerifierError {
    /// The verifier could not evaluate one or more fields
    #[error("Verification failed: {message}")]
    Failed {
        message: String,
        failed_fields: Vec<String>,
    },

    /// A context field the verifier requires was absent from the request
    #[error("Missing required context field: {field}")]
    MissingContext { field: String },

    /// A downstream dependency of the verifier was unreachable
    #[error("Upstream unavailable: {0}")]
    Upstream(String),
}

impl VerifierError {
    /// Create a failure with the fields that could not be verified.
    pub fn failed(message: impl Into<String>, failed_fields: Vec<String>) -> Self {
        Self::Failed {
            message: message.into(),
            failed_fields,
        }
    }

    /// Create a missing-context error.
    pub fn missing_context(field: impl Into<String>) -> Self {
        Self::MissingContext {
            field: field.into(),
        }
    }

    /// Fields to attribute the failure to in the synthetic result.
    pub fn failed_fields(&self) -> Vec<String> {
        match self {
            Self::Failed { failed_fields, .. } if !failed_fields.is_empty() => {
                failed_fields.clone()
            }
            Self::Failed { .. } => vec!["unspecified".to_string()],
            Self::MissingContext { field } => vec![format!("missing_context:{}", field)],
            Self::Upstream(_) => vec!["upstream_unavailable".to_string()],
        }
    }
}
