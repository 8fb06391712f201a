//! Test doubles for code that evaluates flags.
//!
//! [`ScriptedProvider`] answers from a fixed script and records how it was
//! called; [`RecordingHook`] appends `"<name>:<stage>"` entries to a shared
//! [`StageLog`] so hook ordering can be asserted.

use crate::context::EvaluationContext;
use crate::error::{EvaluationError, EvaluationResult, HookError};
use crate::hooks::{Hook, HookContext, HookHints};
use crate::provider::{
    Provider, ProviderCapabilities, ProviderEventDetails, ProviderEventSender, ProviderMetadata,
    ProviderStatus, TrackingEventDetails,
};
use crate::value::{EvaluationDetails, FlagType, FlagValue, ResolutionDetails, reason};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Ordered record of hook stage invocations, shared between hooks.
#[derive(Debug, Clone, Default)]
pub struct StageLog(Arc<Mutex<Vec<String>>>);

impl StageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries for one stage, e.g. `"before"`.
    pub fn stage(&self, stage: &str) -> Vec<String> {
        let suffix = format!(":{}", stage);
        self.0
            .lock()
            .iter()
            .filter(|e| e.ends_with(&suffix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Hook that records each stage it runs in.
pub struct RecordingHook {
    name: String,
    log: StageLog,
    contribute: Option<EvaluationContext>,
    fail_in: Option<&'static str>,
    seen_contexts: Mutex<Vec<EvaluationContext>>,
    seen_errors: Mutex<Vec<EvaluationError>>,
    seen_hints: Mutex<Vec<HookHints>>,
}

impl RecordingHook {
    pub fn new(name: impl Into<String>, log: StageLog) -> Self {
        Self {
            name: name.into(),
            log,
            contribute: None,
            fail_in: None,
            seen_contexts: Mutex::new(Vec::new()),
            seen_errors: Mutex::new(Vec::new()),
            seen_hints: Mutex::new(Vec::new()),
        }
    }

    /// Return `context` from `before`.
    pub fn contributing(mut self, context: EvaluationContext) -> Self {
        self.contribute = Some(context);
        self
    }

    /// Fail with a `GENERAL` error in `stage` (`"before"`, `"after"`, ...).
    pub fn failing_in(mut self, stage: &'static str) -> Self {
        self.fail_in = Some(stage);
        self
    }

    /// Contexts observed by `before`, in call order.
    pub fn seen_contexts(&self) -> Vec<EvaluationContext> {
        self.seen_contexts.lock().clone()
    }

    /// Errors observed by `error`, in call order.
    pub fn seen_errors(&self) -> Vec<EvaluationError> {
        self.seen_errors.lock().clone()
    }

    pub fn seen_hints(&self) -> Vec<HookHints> {
        self.seen_hints.lock().clone()
    }

    fn record(&self, stage: &'static str, hints: &HookHints) -> Result<(), HookError> {
        self.log.push(format!("{}:{}", self.name, stage));
        self.seen_hints.lock().push(hints.clone());
        if self.fail_in == Some(stage) {
            return Err(EvaluationError::general(format!(
                "{} failed in {}",
                self.name, stage
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Hook for RecordingHook {
    async fn before(
        &self,
        ctx: &HookContext,
        hints: &HookHints,
    ) -> Result<Option<EvaluationContext>, HookError> {
        self.seen_contexts.lock().push(ctx.context.clone());
        self.record("before", hints)?;
        Ok(self.contribute.clone())
    }

    async fn after(
        &self,
        _ctx: &HookContext,
        _details: &EvaluationDetails<FlagValue>,
        hints: &HookHints,
    ) -> Result<(), HookError> {
        self.record("after", hints)
    }

    async fn error(
        &self,
        _ctx: &HookContext,
        error: &EvaluationError,
        hints: &HookHints,
    ) -> Result<(), HookError> {
        self.seen_errors.lock().push(error.clone());
        self.record("error", hints)
    }

    async fn finally(
        &self,
        _ctx: &HookContext,
        _details: &EvaluationDetails<FlagValue>,
        hints: &HookHints,
    ) -> Result<(), HookError> {
        self.record("finally", hints)
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Details(ResolutionDetails<FlagValue>),
    Error(EvaluationError),
    Panic(String),
}

/// Provider answering from a fixed per-flag script.
///
/// Unscripted flags resolve to `FLAG_NOT_FOUND`.
pub struct ScriptedProvider {
    name: String,
    capabilities: ProviderCapabilities,
    status: ProviderStatus,
    script: Mutex<HashMap<String, Scripted>>,
    delay: Option<Duration>,
    init_delay: Option<Duration>,
    init_error: Option<EvaluationError>,
    context_change_error: Option<EvaluationError>,
    hooks: Vec<Arc<dyn Hook>>,
    events: ProviderEventSender,
    calls: AtomicUsize,
    init_calls: AtomicUsize,
    close_calls: AtomicUsize,
    context_changes: Mutex<Vec<(EvaluationContext, EvaluationContext)>>,
    tracked: Mutex<Vec<(String, EvaluationContext, TrackingEventDetails)>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: ProviderCapabilities::default(),
            status: ProviderStatus::Ready,
            script: Mutex::new(HashMap::new()),
            delay: None,
            init_delay: None,
            init_error: None,
            context_change_error: None,
            hooks: Vec::new(),
            events: ProviderEventSender::new(),
            calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            context_changes: Mutex::new(Vec::new()),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Every optional capability except synchronous resolution.
    pub fn full_lifecycle(name: impl Into<String>) -> Self {
        Self::new(name).with_capabilities(
            ProviderCapabilities::new()
                .with_initialize()
                .with_shutdown()
                .with_context_change()
                .with_track()
                .with_events(),
        )
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Status reported when the `initialize` capability is not declared.
    pub fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }

    /// Resolve `flag_key` to `value` with reason `STATIC`.
    pub fn with_flag<T: FlagType>(self, flag_key: impl Into<String>, value: T) -> Self {
        self.with_details(
            flag_key,
            ResolutionDetails::new(value.into_flag_value()).with_reason(reason::STATIC),
        )
    }

    pub fn with_details(
        self,
        flag_key: impl Into<String>,
        details: ResolutionDetails<FlagValue>,
    ) -> Self {
        self.script
            .lock()
            .insert(flag_key.into(), Scripted::Details(details));
        self
    }

    pub fn with_error(self, flag_key: impl Into<String>, error: EvaluationError) -> Self {
        self.script
            .lock()
            .insert(flag_key.into(), Scripted::Error(error));
        self
    }

    pub fn with_panic(self, flag_key: impl Into<String>, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .insert(flag_key.into(), Scripted::Panic(message.into()));
        self
    }

    /// Sleep this long before answering any resolution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn failing_initialize(mut self, error: EvaluationError) -> Self {
        self.init_error = Some(error);
        self
    }

    pub fn failing_context_change(mut self, error: EvaluationError) -> Self {
        self.context_change_error = Some(error);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Replace the script entry for `flag_key` after construction.
    pub fn set_flag<T: FlagType>(&self, flag_key: impl Into<String>, value: T) {
        self.script.lock().insert(
            flag_key.into(),
            Scripted::Details(
                ResolutionDetails::new(value.into_flag_value()).with_reason(reason::STATIC),
            ),
        );
    }

    /// Publish a provider-originated event.
    pub fn emit(&self, details: ProviderEventDetails) {
        self.events.emit(details);
    }

    /// Number of resolution calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn context_changes(&self) -> Vec<(EvaluationContext, EvaluationContext)> {
        self.context_changes.lock().clone()
    }

    /// Tracked event names, in call order.
    pub fn tracked(&self) -> Vec<String> {
        self.tracked
            .lock()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    pub fn tracked_events(&self) -> Vec<(String, EvaluationContext, TrackingEventDetails)> {
        self.tracked.lock().clone()
    }

    async fn resolve<T: FlagType>(
        &self,
        flag_key: &str,
        default_value: T,
    ) -> EvaluationResult<ResolutionDetails<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let entry = self.script.lock().get(flag_key).cloned();
        match entry {
            None => Err(EvaluationError::flag_not_found(flag_key)),
            Some(Scripted::Error(error)) => Err(error),
            Some(Scripted::Panic(message)) => panic!("{}", message),
            Some(Scripted::Details(details)) if details.error_code.is_some() => {
                Ok(details.map(|_| default_value))
            }
            Some(Scripted::Details(details)) => match T::from_flag_value(details.value.clone()) {
                Some(value) => Ok(details.map(|_| value)),
                None => Err(EvaluationError::type_mismatch(flag_key, T::VALUE_TYPE)),
            },
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(self.name.clone())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    fn status(&self) -> ProviderStatus {
        self.status
    }

    fn hooks(&self) -> Vec<Arc<dyn Hook>> {
        self.hooks.clone()
    }

    fn events(&self) -> Option<ProviderEventSender> {
        Some(self.events.clone())
    }

    async fn initialize(&self, _context: &EvaluationContext) -> EvaluationResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.init_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn on_close(&self) -> EvaluationResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_context_change(
        &self,
        old_context: &EvaluationContext,
        new_context: &EvaluationContext,
    ) -> EvaluationResult<()> {
        self.context_changes
            .lock()
            .push((old_context.clone(), new_context.clone()));
        match &self.context_change_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn track(&self, event_name: &str, context: &EvaluationContext, details: &TrackingEventDetails) {
        self.tracked
            .lock()
            .push((event_name.to_string(), context.clone(), details.clone()));
    }

    async fn resolve_boolean_evaluation(
        &self,
        flag_key: &str,
        default_value: bool,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<bool>> {
        self.resolve(flag_key, default_value).await
    }

    async fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: String,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<String>> {
        self.resolve(flag_key, default_value).await
    }

    async fn resolve_number_evaluation(
        &self,
        flag_key: &str,
        default_value: f64,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<f64>> {
        self.resolve(flag_key, default_value).await
    }

    async fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        _context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<serde_json::Value>> {
        self.resolve(flag_key, default_value).await
    }
}
