//! Provider abstraction
//!
//! A provider performs the actual resolution of a flag to a value. The
//! evaluation pipeline never assumes a transport: in-memory, REST or
//! streaming providers are all equally valid implementations of
//! [`Provider`].
//!
//! Optional behavior is declared up front through [`ProviderCapabilities`]
//! and read once when the provider is registered.

use crate::context::EvaluationContext;
use crate::error::{ErrorCode, EvaluationError, EvaluationResult};
use crate::hooks::Hook;
use crate::value::{FlagMetadata, FlagValue, FlagValueType, ResolutionDetails, reason};
use async_trait::async_trait;
use flagwire_events::ProviderEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Provider metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderMetadata {
    pub name: String,
}

impl ProviderMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Provider readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    NotReady,
    Ready,
    Error,
    Stale,
    /// Terminal; evaluations short-circuit until the provider is replaced.
    Fatal,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderStatus::NotReady => "NOT_READY",
            ProviderStatus::Ready => "READY",
            ProviderStatus::Error => "ERROR",
            ProviderStatus::Stale => "STALE",
            ProviderStatus::Fatal => "FATAL",
        })
    }
}

/// Optional capabilities a provider implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// `initialize` must run before the provider can evaluate.
    pub initialize: bool,
    /// `on_close` releases resources.
    pub shutdown: bool,
    /// `on_context_change` reconciles a new API context.
    pub context_change: bool,
    /// `track` records tracking events.
    pub track: bool,
    /// `events` exposes a channel of provider-originated events.
    pub events: bool,
    /// Resolution never suspends; timeouts cannot be raced.
    pub synchronous_resolution: bool,
}

impl ProviderCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initialize(mut self) -> Self {
        self.initialize = true;
        self
    }

    pub fn with_shutdown(mut self) -> Self {
        self.shutdown = true;
        self
    }

    pub fn with_context_change(mut self) -> Self {
        self.context_change = true;
        self
    }

    pub fn with_track(mut self) -> Self {
        self.track = true;
        self
    }

    pub fn with_events(mut self) -> Self {
        self.events = true;
        self
    }

    pub fn with_synchronous_resolution(mut self) -> Self {
        self.synchronous_resolution = true;
        self
    }
}

/// Payload of an event a provider emits about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEventDetails {
    pub event: ProviderEvent,
    pub message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub flags_changed: Vec<String>,
    pub metadata: FlagMetadata,
}

impl ProviderEventDetails {
    pub fn new(event: ProviderEvent) -> Self {
        Self {
            event,
            message: None,
            error_code: None,
            flags_changed: Vec::new(),
            metadata: FlagMetadata::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_flags_changed(mut self, flags: Vec<String>) -> Self {
        self.flags_changed = flags;
        self
    }
}

/// Sending half of a provider's event channel.
///
/// Clones share the same channel.
#[derive(Debug, Clone)]
pub struct ProviderEventSender {
    tx: broadcast::Sender<ProviderEventDetails>,
}

impl ProviderEventSender {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn emit(&self, details: ProviderEventDetails) {
        let _ = self.tx.send(details);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEventDetails> {
        self.tx.subscribe()
    }
}

impl Default for ProviderEventSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Details attached to a tracking event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackingEventDetails {
    pub value: Option<f64>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl TrackingEventDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Resolves flags to values.
///
/// Returning `Err` and returning `Ok` details that carry an `error_code`
/// are equivalent: both degrade the evaluation to the caller's default.
#[async_trait]
pub trait Provider: Send + Sync {
    fn metadata(&self) -> ProviderMetadata;

    /// Declares which optional methods below are meaningful.
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    /// Status of a provider that declares no `initialize` capability.
    fn status(&self) -> ProviderStatus {
        ProviderStatus::Ready
    }

    /// Hooks the provider wants run around its own evaluations.
    fn hooks(&self) -> Vec<Arc<dyn Hook>> {
        Vec::new()
    }

    /// Event channel, read when the `events` capability is declared.
    fn events(&self) -> Option<ProviderEventSender> {
        None
    }

    async fn initialize(&self, _context: &EvaluationContext) -> EvaluationResult<()> {
        Ok(())
    }

    async fn on_close(&self) -> EvaluationResult<()> {
        Ok(())
    }

    async fn on_context_change(
        &self,
        _old_context: &EvaluationContext,
        _new_context: &EvaluationContext,
    ) -> EvaluationResult<()> {
        Ok(())
    }

    fn track(
        &self,
        _event_name: &str,
        _context: &EvaluationContext,
        _details: &TrackingEventDetails,
    ) {
    }

    async fn resolve_boolean_evaluation(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<bool>>;

    async fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: String,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<String>>;

    async fn resolve_number_evaluation(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<f64>>;

    async fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<serde_json::Value>>;
}

/// Call the accessor matching `value_type`, erasing the result type.
///
/// A default whose runtime type disagrees with `value_type` is a
/// `TYPE_MISMATCH`.
pub async fn resolve_flag_value(
    provider: &dyn Provider,
    flag_key: &str,
    value_type: FlagValueType,
    default_value: FlagValue,
    context: &EvaluationContext,
) -> EvaluationResult<ResolutionDetails<FlagValue>> {
    match (value_type, default_value) {
        (FlagValueType::Boolean, FlagValue::Bool(default)) => Ok(provider
            .resolve_boolean_evaluation(flag_key, default, context)
            .await?
            .map(FlagValue::Bool)),
        (FlagValueType::String, FlagValue::String(default)) => Ok(provider
            .resolve_string_evaluation(flag_key, default, context)
            .await?
            .map(FlagValue::String)),
        (FlagValueType::Number, FlagValue::Number(default)) => Ok(provider
            .resolve_number_evaluation(flag_key, default, context)
            .await?
            .map(FlagValue::Number)),
        (FlagValueType::Object, FlagValue::Object(default)) => Ok(provider
            .resolve_object_evaluation(flag_key, default, context)
            .await?
            .map(FlagValue::Object)),
        (expected, _) => Err(EvaluationError::type_mismatch(flag_key, expected)),
    }
}

/// Process-wide default provider.
///
/// Permanently `NOT_READY`, never emits `Ready`, and answers every request
/// with the caller's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

pub const NOOP_PROVIDER_NAME: &str = "No-op Provider";

impl NoopProvider {
    fn noop<T>(default_value: T) -> EvaluationResult<ResolutionDetails<T>> {
        Ok(ResolutionDetails::new(default_value).with_reason(reason::NOOP))
    }
}

#[async_trait]
impl Provider for NoopProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(NOOP_PROVIDER_NAME)
    }

    fn status(&self) -> ProviderStatus {
        ProviderStatus::NotReady
    }

    async fn resolve_boolean_evaluation(
        &self,
        _flag_key: &str,
        default_value: bool,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<bool>> {
        Self::noop(default_value)
    }

    async fn resolve_string_evaluation(
        &self,
        _flag_key: &str,
        default_value: String,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<String>> {
        Self::noop(default_value)
    }

    async fn resolve_number_evaluation(
        &self,
        _flag_key: &str,
        default_value: f64,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<f64>> {
        Self::noop(default_value)
    }

    async fn resolve_object_evaluation(
        &self,
        _flag_key: &str,
        default_value: serde_json::Value,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<serde_json::Value>> {
        Self::noop(default_value)
    }
}
