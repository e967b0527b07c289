//! Error types for rubric evaluation

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the evaluation error
pub type Result<T> = std::result::Result<T, EvalError>;

/// Failures of the evaluation core.
///
/// Everything here except `InvalidAction` is retryable by the retry
/// controller; none of them abort a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("no fenced JSON block found in response")]
    NoJsonFound,

    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("invalid tree shape at {path}: {reason}")]
    InvalidTreeShape { path: String, reason: String },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),
}

impl EvalError {
    pub fn shape(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTreeShape {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoJsonFound => ErrorKind::NoJsonFound,
            Self::MalformedJson(_) => ErrorKind::MalformedJson,
            Self::InvalidTreeShape { .. } => ErrorKind::InvalidTreeShape,
            Self::ServerError(_) => ErrorKind::ServerError,
            Self::InvalidAction(_) => ErrorKind::InvalidAction,
        }
    }
}

/// Serialisable error classification used in batch summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoJsonFound,
    MalformedJson,
    InvalidTreeShape,
    ServerError,
    InvalidAction,
    /// The worker task itself died (panic or cancellation).
    WorkerFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoJsonFound => "no_json_found",
            Self::MalformedJson => "malformed_json",
            Self::InvalidTreeShape => "invalid_tree_shape",
            Self::ServerError => "server_error",
            Self::InvalidAction => "invalid_action",
            Self::WorkerFailure => "worker_failure",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message_names_path() {
        let err = EvalError::shape("static.children[1]", "description must be non-empty text");
        assert_eq!(
            err.to_string(),
            "invalid tree shape at static.children[1]: description must be non-empty text"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidTreeShape);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ServerError).unwrap();
        assert_eq!(json, "\"server_error\"");
        assert_eq!(ErrorKind::NoJsonFound.to_string(), "no_json_found");
    }
}
