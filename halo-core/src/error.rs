//! Error types for halo-core.

use thiserror::Error;

/// Result type alias using halo-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A single judge failure recorded while evaluating a request.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeFailure {
    /// Judge identifier
    pub judge: String,
    /// Human-readable failure description
    pub message: String,
}

impl std::fmt::Display for JudgeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.judge, self.message)
    }
}

/// Errors that can occur during ensemble evaluation.
#[derive(Error, Debug)]
pub enum Error {
    /// The request was rejected before any judge ran
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A judge did not answer within its budget
    #[error("Judge {judge} timed out after {duration_ms}ms")]
    JudgeTimeout { judge: String, duration_ms: u64 },

    /// Network or parse failure inside a judge
    #[error("Judge {judge} backend error: {message}")]
    JudgeBackend { judge: String, message: String },

    /// No judge produced a result, so no score can be reported
    #[error("Evaluation failed: all {attempted} judges failed ({})", format_failures(.failures))]
    AllJudgesFailed {
        attempted: usize,
        failures: Vec<JudgeFailure>,
    },

    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_failures(failures: &[JudgeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a judge timeout error.
    pub fn judge_timeout(judge: impl Into<String>, duration_ms: u64) -> Self {
        Self::JudgeTimeout {
            judge: judge.into(),
            duration_ms,
        }
    }

    /// Create a judge backend error.
    pub fn judge_backend(judge: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JudgeBackend {
            judge: judge.into(),
            message: message.into(),
        }
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an all-judges-failed error.
    pub fn all_judges_failed(attempted: usize, failures: Vec<JudgeFailure>) -> Self {
        Self::AllJudgesFailed {
            attempted,
            failures,
        }
    }

    /// Whether this error is a recoverable single-judge failure.
    ///
    /// The engine excludes such judges and renormalizes the remaining weights.
    pub fn is_judge_failure(&self) -> bool {
        matches!(
            self,
            Self::JudgeTimeout { .. } | Self::JudgeBackend { .. } | Self::LlmApi { .. }
        )
    }
}
