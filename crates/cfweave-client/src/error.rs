//! Error types for cfweave-client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// One entry of the platform's error payload, surfaced verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
}

impl std::fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.title, self.code, self.detail)
    }
}

/// Errors that can occur talking to the platform
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Failed round trip. Propagated verbatim; the host engine's apply is
    /// the unit of retry.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Remote validation or server error with the platform's payload
    #[error("API error (status {status}): {}", format_errors(.errors))]
    Api {
        status: u16,
        errors: Vec<ApiErrorBody>,
    },

    /// Entity does not exist
    #[error("{kind} not found: {query}")]
    NotFound { kind: String, query: String },

    /// A single-result query matched more than one entity
    #[error("expected exactly one {kind} for {query}, found {count}")]
    NotUnique {
        kind: String,
        query: String,
        count: usize,
    },

    /// Asynchronous job reported failure
    #[error("job failed in phase '{phase}': {}", format_errors(.errors))]
    JobFailed {
        phase: String,
        errors: Vec<ApiErrorBody>,
    },

    /// Deadline reached before the job went terminal; the remote job is
    /// not cancelled
    #[error("job still '{phase}' after {waited_secs}s deadline")]
    JobTimeout { phase: String, waited_secs: u64 },

    /// MTA deploy operation ended in a non-success phase
    #[error("deploy operation {operation_id} ended in {phase}: {detail}")]
    OperationFailed {
        operation_id: String,
        phase: String,
        detail: String,
    },

    /// Token acquisition or refresh failed
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Invalid client configuration
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Archive could not be read (MTA intake)
    #[error("archive error: {message}")]
    Archive { message: String },

    #[error("unexpected response: {message}")]
    UnexpectedResponse { message: String },

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_errors(errors: &[ApiErrorBody]) -> String {
    if errors.is_empty() {
        return "no error detail supplied".to_string();
    }
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClientError {
    /// Check for platform-level not-found, either mapped or raw 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
            || matches!(self, ClientError::Api { status: 404, .. })
    }

    /// 4xx from the platform (remote validation error)
    pub fn is_remote_validation(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if (400..500).contains(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let mapped = ClientError::NotFound {
            kind: "space".to_string(),
            query: "guid=abc".to_string(),
        };
        assert!(mapped.is_not_found());

        let raw = ClientError::Api {
            status: 404,
            errors: vec![],
        };
        assert!(raw.is_not_found());

        let other = ClientError::Api {
            status: 422,
            errors: vec![],
        };
        assert!(!other.is_not_found());
        assert!(other.is_remote_validation());
    }

    #[test]
    fn test_api_error_rendering() {
        let err = ClientError::Api {
            status: 422,
            errors: vec![ApiErrorBody {
                code: 10008,
                title: "CF-UnprocessableEntity".to_string(),
                detail: "Name must be unique".to_string(),
            }],
        };
        let text = err.to_string();
        assert!(text.contains("422"));
        assert!(text.contains("Name must be unique"));
    }
}
