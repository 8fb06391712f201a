//! Flag values and evaluation results
//!
//! Defines the typed values a flag can resolve to and the details records
//! returned by providers and by the evaluation pipeline.

use crate::error::{ErrorCode, EvaluationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resolution reasons
pub mod reason {
    /// The resolved value is static (no dynamic evaluation).
    pub const STATIC: &str = "STATIC";
    /// The resolved value fell back to a pre-configured value.
    pub const DEFAULT: &str = "DEFAULT";
    /// The resolved value was the result of a dynamic evaluation.
    pub const TARGETING_MATCH: &str = "TARGETING_MATCH";
    /// The resolved value was the result of pseudorandom assignment.
    pub const SPLIT: &str = "SPLIT";
    /// The resolved value was retrieved from cache.
    pub const CACHED: &str = "CACHED";
    /// The resolved value was the result of the flag being disabled.
    pub const DISABLED: &str = "DISABLED";
    /// The reason for the resolved value could not be determined.
    pub const UNKNOWN: &str = "UNKNOWN";
    /// The resolved value is non-authoritative or possibly out of date.
    pub const STALE: &str = "STALE";
    /// The resolved value was the result of an error.
    pub const ERROR: &str = "ERROR";
    /// Returned by the no-op provider.
    pub const NOOP: &str = "No-op";
}

/// Flag value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    String(String),
    Number(f64),
    Object(serde_json::Value),
}

impl FlagValue {
    pub fn boolean(value: bool) -> Self {
        Self::Bool(value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn number(value: f64) -> Self {
        Self::Number(value)
    }

    pub fn object(value: serde_json::Value) -> Self {
        Self::Object(value)
    }

    /// The type this value carries at runtime.
    pub fn value_type(&self) -> FlagValueType {
        match self {
            Self::Bool(_) => FlagValueType::Boolean,
            Self::String(_) => FlagValueType::String,
            Self::Number(_) => FlagValueType::Number,
            Self::Object(_) => FlagValueType::Object,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// Accessor type requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagValueType {
    Boolean,
    String,
    Number,
    Object,
}

impl fmt::Display for FlagValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlagValueType::Boolean => "boolean",
            FlagValueType::String => "string",
            FlagValueType::Number => "number",
            FlagValueType::Object => "object",
        })
    }
}

/// Rust types a flag can be read as.
pub trait FlagType: Clone + Send + Sync + fmt::Debug + 'static {
    /// Provider accessor used for this type.
    const VALUE_TYPE: FlagValueType;

    fn into_flag_value(self) -> FlagValue;

    /// `None` when the runtime value does not fit this type.
    fn from_flag_value(value: FlagValue) -> Option<Self>;
}

impl FlagType for bool {
    const VALUE_TYPE: FlagValueType = FlagValueType::Boolean;

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Bool(self)
    }

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FlagType for String {
    const VALUE_TYPE: FlagValueType = FlagValueType::String;

    fn into_flag_value(self) -> FlagValue {
        FlagValue::String(self)
    }

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl FlagType for f64 {
    const VALUE_TYPE: FlagValueType = FlagValueType::Number;

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Number(self)
    }

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        value.as_number()
    }
}

impl FlagType for i64 {
    const VALUE_TYPE: FlagValueType = FlagValueType::Number;

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Number(self as f64)
    }

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        let n = value.as_number()?;
        (n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64).then_some(n as i64)
    }
}

impl FlagType for serde_json::Value {
    const VALUE_TYPE: FlagValueType = FlagValueType::Object;

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Object(self)
    }

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// Scalar attached to a flag as metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagMetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl From<bool> for FlagMetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FlagMetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FlagMetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FlagMetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

pub type FlagMetadata = BTreeMap<String, FlagMetadataValue>;

/// What a provider returns for one flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionDetails<T> {
    pub value: T,
    pub variant: Option<String>,
    pub reason: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub flag_metadata: FlagMetadata,
}

impl<T> ResolutionDetails<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            variant: None,
            reason: None,
            error_code: None,
            error_message: None,
            flag_metadata: FlagMetadata::new(),
        }
    }

    /// An error result carrying the caller's default.
    pub fn error(default_value: T, error: EvaluationError) -> Self {
        Self {
            value: default_value,
            variant: None,
            reason: Some(reason::ERROR.to_string()),
            error_code: Some(error.code),
            error_message: Some(error.message),
            flag_metadata: FlagMetadata::new(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<FlagMetadataValue>,
    ) -> Self {
        self.flag_metadata.insert(key.into(), value.into());
        self
    }

    /// The error this result carries, if any.
    pub fn evaluation_error(&self) -> Option<EvaluationError> {
        self.error_code.map(|code| {
            EvaluationError::new(
                code,
                self.error_message
                    .clone()
                    .unwrap_or_else(|| format!("provider returned {}", code)),
            )
        })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResolutionDetails<U> {
        ResolutionDetails {
            value: f(self.value),
            variant: self.variant,
            reason: self.reason,
            error_code: self.error_code,
            error_message: self.error_message,
            flag_metadata: self.flag_metadata,
        }
    }
}

/// Identifies the client an evaluation ran through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientMetadata {
    pub domain: Option<String>,
}

/// What the caller receives for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationDetails<T> {
    pub flag_key: String,
    pub value: T,
    pub variant: Option<String>,
    pub reason: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub flag_metadata: FlagMetadata,
    pub client_metadata: ClientMetadata,
}

impl<T> EvaluationDetails<T> {
    pub fn from_resolution(
        flag_key: impl Into<String>,
        resolution: ResolutionDetails<T>,
        client_metadata: ClientMetadata,
    ) -> Self {
        Self {
            flag_key: flag_key.into(),
            value: resolution.value,
            variant: resolution.variant,
            reason: resolution.reason,
            error_code: resolution.error_code,
            error_message: resolution.error_message,
            flag_metadata: resolution.flag_metadata,
            client_metadata,
        }
    }

    /// Degraded result: default value plus the error's code and message.
    pub fn from_error(
        flag_key: impl Into<String>,
        default_value: T,
        error: EvaluationError,
        client_metadata: ClientMetadata,
    ) -> Self {
        Self::from_resolution(
            flag_key,
            ResolutionDetails::error(default_value, error),
            client_metadata,
        )
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EvaluationDetails<U> {
        EvaluationDetails {
            flag_key: self.flag_key,
            value: f(self.value),
            variant: self.variant,
            reason: self.reason,
            error_code: self.error_code,
            error_message: self.error_message,
            flag_metadata: self.flag_metadata,
            client_metadata: self.client_metadata,
        }
    }
}
