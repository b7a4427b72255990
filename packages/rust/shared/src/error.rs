//! Error types for Oncall Lens.
//!
//! Library crates use [`OncallError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// Top-level error type for all Oncall Lens operations.
#[derive(Debug, thiserror::Error)]
pub enum OncallError {
    /// A single artifact could not be turned into text.
    #[error("artifact extraction failed for {artifact}: {message}")]
    ArtifactExtraction { artifact: String, message: String },

    /// A retrieval strategy or its backing search provider failed.
    #[error("retrieval provider '{strategy}' failed: {message}")]
    RetrievalProvider { strategy: String, message: String },

    /// The reranker call failed or returned an unusable ordering.
    #[error("rerank failed: {0}")]
    Rerank(String),

    /// The LLM completion provider failed (after its own retries).
    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    /// No task is registered under this id.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A subscriber saw no progress for longer than its inactivity window.
    #[error("task {task_id} stalled: no progress for {}s", idle.as_secs())]
    StalledTask { task_id: TaskId, idle: Duration },

    /// A publish or completion arrived after the task reached a terminal state.
    #[error("task already completed: {0}")]
    TaskAlreadyCompleted(TaskId),

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Data validation error (bad weights, malformed response, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, OncallError>;

/// Coarse classification of an [`OncallError`], used for the failure policy
/// and for the terminal error payload of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ArtifactExtraction,
    RetrievalProvider,
    Rerank,
    LlmProvider,
    TaskNotFound,
    StalledTask,
    Config,
    Validation,
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind aborts the running task.
    ///
    /// Extraction, retrieval-provider and rerank failures degrade the result
    /// but never fail the task on their own.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            Self::ArtifactExtraction | Self::RetrievalProvider | Self::Rerank
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArtifactExtraction => "artifact_extraction",
            Self::RetrievalProvider => "retrieval_provider",
            Self::Rerank => "rerank",
            Self::LlmProvider => "llm_provider",
            Self::TaskNotFound => "task_not_found",
            Self::StalledTask => "stalled_task",
            Self::Config => "config",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OncallError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extraction error for one named artifact.
    pub fn extraction(artifact: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ArtifactExtraction {
            artifact: artifact.into(),
            message: msg.into(),
        }
    }

    /// Create a provider error for one named retrieval strategy.
    pub fn retrieval(strategy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RetrievalProvider {
            strategy: strategy.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error.
    ///
    /// Timeouts carry no collaborator identity of their own; callers that
    /// know which collaborator timed out convert them first (an LLM timeout
    /// becomes [`OncallError::LlmProvider`]).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArtifactExtraction { .. } => ErrorKind::ArtifactExtraction,
            Self::RetrievalProvider { .. } => ErrorKind::RetrievalProvider,
            Self::Rerank(_) => ErrorKind::Rerank,
            Self::LlmProvider(_) => ErrorKind::LlmProvider,
            Self::TaskNotFound(_) => ErrorKind::TaskNotFound,
            Self::StalledTask { .. } => ErrorKind::StalledTask,
            Self::Config { .. } => ErrorKind::Config,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::TaskAlreadyCompleted(_)
            | Self::Timeout { .. }
            | Self::Network(_)
            | Self::Io { .. } => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = OncallError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = OncallError::extraction("app.log", "file is empty");
        assert_eq!(
            err.to_string(),
            "artifact extraction failed for app.log: file is empty"
        );

        let err = OncallError::timeout("strategy lexical", Duration::from_millis(250));
        assert_eq!(err.to_string(), "strategy lexical timed out after 250ms");
    }

    #[test]
    fn non_fatal_kinds() {
        assert!(!OncallError::extraction("a", "b").kind().is_fatal());
        assert!(!OncallError::retrieval("semantic", "down").kind().is_fatal());
        assert!(!OncallError::Rerank("503".into()).kind().is_fatal());
        assert!(OncallError::LlmProvider("429".into()).kind().is_fatal());
        assert!(OncallError::validation("bad").kind().is_fatal());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::LlmProvider).unwrap();
        assert_eq!(json, r#""llm_provider""#);
    }
}
