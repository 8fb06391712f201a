// Error types for flag evaluation and provider lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Message prefix of timeout errors.
pub const TIMEOUT_MESSAGE: &str = "evaluation timed out";

/// Message of cancellation errors.
pub const CANCELLED_MESSAGE: &str = "evaluation cancelled";

/// Machine-readable failure category attached to evaluation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProviderNotReady,
    FlagNotFound,
    ParseError,
    TypeMismatch,
    TargetingKeyMissing,
    InvalidContext,
    General,
    ProviderFatal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProviderNotReady => "PROVIDER_NOT_READY",
            ErrorCode::FlagNotFound => "FLAG_NOT_FOUND",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::TargetingKeyMissing => "TARGETING_KEY_MISSING",
            ErrorCode::InvalidContext => "INVALID_CONTEXT",
            ErrorCode::General => "GENERAL",
            ErrorCode::ProviderFatal => "PROVIDER_FATAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a provider, a hook, or the evaluation pipeline itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct EvaluationError {
    pub code: ErrorCode,
    pub message: String,
}

impl EvaluationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::General, message)
    }

    pub fn flag_not_found(flag_key: &str) -> Self {
        Self::new(
            ErrorCode::FlagNotFound,
            format!("flag '{}' not found", flag_key),
        )
    }

    pub fn type_mismatch(flag_key: &str, expected: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::TypeMismatch,
            format!("flag '{}' is not of type {}", flag_key, expected),
        )
    }

    pub fn provider_not_ready() -> Self {
        Self::new(
            ErrorCode::ProviderNotReady,
            "provider has not yet initialized",
        )
    }

    pub fn provider_fatal() -> Self {
        Self::new(ErrorCode::ProviderFatal, "provider is in an irrecoverable error state")
    }

    pub fn timeout(after: Duration) -> Self {
        Self::general(format!("{} after {}ms", TIMEOUT_MESSAGE, after.as_millis()))
    }

    pub fn cancelled() -> Self {
        Self::general(CANCELLED_MESSAGE)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::General && self.message.starts_with(TIMEOUT_MESSAGE)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::General && self.message == CANCELLED_MESSAGE
    }
}

impl From<String> for EvaluationError {
    fn from(message: String) -> Self {
        Self::general(message)
    }
}

impl From<&str> for EvaluationError {
    fn from(message: &str) -> Self {
        Self::general(message)
    }
}

/// Hooks fail with the same tagged error providers use.
pub type HookError = EvaluationError;

pub type EvaluationResult<T> = std::result::Result<T, EvaluationError>;

/// Errors surfaced by lifecycle operations the caller explicitly waits on.
#[derive(Debug, Error)]
pub enum FlagwireError {
    #[error("provider '{provider}' failed to initialize: {source}")]
    ProviderInitialization {
        provider: String,
        #[source]
        source: EvaluationError,
    },

    #[error("provider '{0}' is in a fatal state")]
    ProviderFatal(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("provider '{provider}' failed to shut down: {message}")]
    Shutdown { provider: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FlagwireError>;
