//! Multi-provider aggregation
//!
//! [`MultiProvider`] puts an ordered list of named providers behind one
//! [`Provider`] and lets a [`Strategy`] decide which children answer.
//!
//! ```
//! use flagwire_core::multi::{FirstMatchStrategy, MultiProvider, MultiProviderEntry};
//! use flagwire_core::InMemoryProvider;
//! use std::sync::Arc;
//!
//! let multi = MultiProvider::new(
//!     vec![
//!         MultiProviderEntry::new(Arc::new(InMemoryProvider::new())).with_name("overrides"),
//!         MultiProviderEntry::new(Arc::new(InMemoryProvider::new())).with_name("defaults"),
//!     ],
//!     Arc::new(FirstMatchStrategy),
//! )
//! .unwrap();
//! assert_eq!(multi.provider_names(), vec!["overrides", "defaults"]);
//! ```
//!
//! The aggregate's status is the worst of its children's. Hooks declared by
//! child providers are not run; register them on the registry or client
//! instead.

pub mod strategy;

pub use strategy::{
    AGGREGATE_ERROR_PREFIX, ComparisonStrategy, FinalResult, FirstMatchStrategy,
    FirstSuccessfulStrategy, MismatchCallback, ProviderError, ProviderResolutionResult, RunMode,
    Strategy, StrategyPerProviderContext, aggregate_error,
};

use crate::context::EvaluationContext;
use crate::error::{ErrorCode, EvaluationError, EvaluationResult, FlagwireError, Result};
use crate::evaluation::panic_message;
use crate::provider::{
    Provider, ProviderCapabilities, ProviderEventDetails, ProviderEventSender, ProviderMetadata,
    ProviderStatus, TrackingEventDetails, resolve_flag_value,
};
use crate::value::{FlagType, FlagValue, FlagValueType, ResolutionDetails};
use async_trait::async_trait;
use flagwire_events::ProviderEvent;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const MULTI_PROVIDER_NAME: &str = "multiprovider";

/// A child provider and an optional explicit name.
#[derive(Clone)]
pub struct MultiProviderEntry {
    pub provider: Arc<dyn Provider>,
    pub name: Option<String>,
}

impl MultiProviderEntry {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

struct Child {
    name: String,
    provider: Arc<dyn Provider>,
    capabilities: ProviderCapabilities,
}

/// Several providers behind one.
pub struct MultiProvider {
    children: Vec<Child>,
    strategy: Arc<dyn Strategy>,
    statuses: Arc<RwLock<Vec<ProviderStatus>>>,
    events: ProviderEventSender,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiProvider {
    /// Explicit names must be unique; unnamed children sharing a metadata
    /// name are suffixed `-1`, `-2`, ...
    pub fn new(entries: Vec<MultiProviderEntry>, strategy: Arc<dyn Strategy>) -> Result<Self> {
        if entries.is_empty() {
            return Err(FlagwireError::Config(
                "multi-provider needs at least one provider".to_string(),
            ));
        }

        let mut metadata_counts: HashMap<String, usize> = HashMap::new();
        for entry in entries.iter().filter(|e| e.name.is_none()) {
            *metadata_counts
                .entry(entry.provider.metadata().name)
                .or_default() += 1;
        }

        let mut seen_suffix: HashMap<String, usize> = HashMap::new();
        let mut children: Vec<Child> = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = match entry.name {
                Some(name) => name,
                None => {
                    let base = entry.provider.metadata().name;
                    if metadata_counts.get(&base).copied().unwrap_or(0) > 1 {
                        let n = seen_suffix.entry(base.clone()).or_default();
                        *n += 1;
                        format!("{}-{}", base, n)
                    } else {
                        base
                    }
                }
            };
            if children.iter().any(|c| c.name == name) {
                return Err(FlagwireError::Config(format!(
                    "provider name '{}' is not unique",
                    name
                )));
            }
            children.push(Child {
                name,
                capabilities: entry.provider.capabilities(),
                provider: entry.provider,
            });
        }

        let statuses = children
            .iter()
            .map(|c| {
                if c.capabilities.initialize {
                    ProviderStatus::NotReady
                } else {
                    c.provider.status()
                }
            })
            .collect();

        Ok(Self {
            children,
            strategy,
            statuses: Arc::new(RwLock::new(statuses)),
            events: ProviderEventSender::new(),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Child names in evaluation order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }

    /// Status of each child, in evaluation order.
    pub fn provider_statuses(&self) -> Vec<(String, ProviderStatus)> {
        let statuses = self.statuses.read();
        self.children
            .iter()
            .zip(statuses.iter())
            .map(|(c, s)| (c.name.clone(), *s))
            .collect()
    }

    fn set_child_status(&self, index: usize, status: ProviderStatus) {
        if let Some(slot) = self.statuses.write().get_mut(index) {
            *slot = status;
        }
    }

    fn start_forwarders(&self) {
        let mut forwarders = self.forwarders.lock();
        if !forwarders.is_empty() {
            return;
        }
        for (index, child) in self.children.iter().enumerate() {
            if !child.capabilities.events {
                continue;
            }
            let Some(sender) = child.provider.events() else {
                continue;
            };
            let mut rx = sender.subscribe();
            let statuses = Arc::clone(&self.statuses);
            let events = self.events.clone();
            let name = child.name.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(details) => forward_child_event(&statuses, &events, index, details),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(provider = %name, skipped, "dropped child provider events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    async fn evaluate(
        &self,
        flag_key: &str,
        flag_type: FlagValueType,
        default_value: FlagValue,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<FlagValue>> {
        let statuses = self.statuses.read().clone();
        let mut state = StrategyPerProviderContext::new(flag_key, flag_type);
        let mut results = Vec::new();

        match self.strategy.run_mode() {
            RunMode::Sequential => {
                for (child, status) in self.children.iter().zip(statuses) {
                    state.provider_name = child.name.clone();
                    state.provider_status = status;
                    if !self.strategy.should_evaluate_this_provider(&state, context) {
                        continue;
                    }
                    let result =
                        resolve_child(child, flag_key, flag_type, default_value.clone(), context)
                            .await;
                    let next = self
                        .strategy
                        .should_evaluate_next_provider(&mut state, context, &result);
                    results.push(result);
                    if !next {
                        break;
                    }
                }
            }
            RunMode::Parallel => {
                let eligible = self.children.iter().zip(statuses).filter(|(child, status)| {
                    state.provider_name = child.name.clone();
                    state.provider_status = *status;
                    self.strategy.should_evaluate_this_provider(&state, context)
                });
                let calls = eligible
                    .map(|(child, _)| {
                        resolve_child(child, flag_key, flag_type, default_value.clone(), context)
                    })
                    .collect::<Vec<_>>();
                results = join_all(calls).await;
            }
        }

        debug!(flag_key, consulted = results.len(), "multi-provider evaluation");
        self.strategy
            .determine_final_result(&state, context, &results)
            .into_resolution()
    }

    async fn resolve_typed<T: FlagType>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<T>> {
        let details = self
            .evaluate(flag_key, T::VALUE_TYPE, default_value.into_flag_value(), context)
            .await?;
        match T::from_flag_value(details.value.clone()) {
            Some(value) => Ok(details.map(|_| value)),
            None => Err(EvaluationError::type_mismatch(flag_key, T::VALUE_TYPE)),
        }
    }

    /// Run `op` concurrently on every child declaring a capability.
    async fn for_each_child<'a, F>(
        &'a self,
        wanted: fn(&ProviderCapabilities) -> bool,
        op: F,
    ) -> Vec<ProviderError>
    where
        F: Fn(&'a Child) -> futures::future::BoxFuture<'a, EvaluationResult<()>>,
    {
        let selected: Vec<&Child> = self
            .children
            .iter()
            .filter(|c| wanted(&c.capabilities))
            .collect();
        let outcomes = join_all(
            selected
                .iter()
                .map(|&c| AssertUnwindSafe(op(c)).catch_unwind().map(flatten_panic)),
        )
        .await;

        selected
            .into_iter()
            .zip(outcomes)
            .filter_map(|(child, outcome)| {
                outcome.err().map(|error| ProviderError {
                    provider_name: child.name.clone(),
                    error,
                })
            })
            .collect()
    }
}

fn flatten_panic(
    outcome: std::thread::Result<EvaluationResult<()>>,
) -> EvaluationResult<()> {
    match outcome {
        Ok(result) => result,
        Err(panic) => Err(EvaluationError::general(format!(
            "provider panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

async fn resolve_child(
    child: &Child,
    flag_key: &str,
    flag_type: FlagValueType,
    default_value: FlagValue,
    context: &EvaluationContext,
) -> ProviderResolutionResult<FlagValue> {
    let call = resolve_flag_value(
        child.provider.as_ref(),
        flag_key,
        flag_type,
        default_value,
        context,
    );
    let result = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(EvaluationError::general(format!(
            "provider panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    ProviderResolutionResult::new(child.name.clone(), result)
}

fn status_rank(status: ProviderStatus) -> u8 {
    match status {
        ProviderStatus::Ready => 0,
        ProviderStatus::Stale => 1,
        ProviderStatus::Error => 2,
        ProviderStatus::NotReady => 3,
        ProviderStatus::Fatal => 4,
    }
}

/// Worst status among `statuses`; `READY` when empty.
pub fn aggregate_status(statuses: &[ProviderStatus]) -> ProviderStatus {
    statuses
        .iter()
        .copied()
        .max_by_key(|s| status_rank(*s))
        .unwrap_or(ProviderStatus::Ready)
}

fn forward_child_event(
    statuses: &RwLock<Vec<ProviderStatus>>,
    events: &ProviderEventSender,
    index: usize,
    details: ProviderEventDetails,
) {
    let child_status = match details.event {
        ProviderEvent::Ready => ProviderStatus::Ready,
        ProviderEvent::Stale => ProviderStatus::Stale,
        ProviderEvent::Error if details.error_code == Some(ErrorCode::ProviderFatal) => {
            ProviderStatus::Fatal
        }
        ProviderEvent::Error => ProviderStatus::Error,
        ProviderEvent::ConfigurationChanged => {
            events.emit(details);
            return;
        }
        ProviderEvent::ContextChanged => return,
    };

    let (before, after) = {
        let mut guard = statuses.write();
        let before = aggregate_status(&guard);
        if let Some(slot) = guard.get_mut(index) {
            *slot = child_status;
        }
        (before, aggregate_status(&guard))
    };
    if before == after {
        return;
    }

    let event = match after {
        ProviderStatus::Ready => ProviderEventDetails::new(ProviderEvent::Ready),
        ProviderStatus::Stale => ProviderEventDetails::new(ProviderEvent::Stale),
        ProviderStatus::Error => ProviderEventDetails::new(ProviderEvent::Error),
        ProviderStatus::Fatal => ProviderEventDetails::new(ProviderEvent::Error)
            .with_error_code(ErrorCode::ProviderFatal),
        ProviderStatus::NotReady => return,
    };
    let event = match details.message {
        Some(message) => event.with_message(message),
        None => event,
    };
    events.emit(event);
}

#[async_trait]
impl Provider for MultiProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(MULTI_PROVIDER_NAME)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::new()
            .with_initialize()
            .with_shutdown()
            .with_context_change()
            .with_track()
            .with_events()
    }

    fn status(&self) -> ProviderStatus {
        aggregate_status(&self.statuses.read())
    }

    fn events(&self) -> Option<ProviderEventSender> {
        Some(self.events.clone())
    }

    async fn initialize(&self, context: &EvaluationContext) -> EvaluationResult<()> {
        let errors = self
            .for_each_child(|c| c.initialize, |c| c.provider.initialize(context))
            .await;

        for (index, child) in self.children.iter().enumerate() {
            if !child.capabilities.initialize {
                continue;
            }
            let status = match errors.iter().find(|e| e.provider_name == child.name) {
                Some(e) if e.error.code == ErrorCode::ProviderFatal => ProviderStatus::Fatal,
                Some(_) => ProviderStatus::Error,
                None => ProviderStatus::Ready,
            };
            self.set_child_status(index, status);
        }
        self.start_forwarders();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(aggregate_error(&errors))
        }
    }

    async fn on_close(&self) -> EvaluationResult<()> {
        let forwarders: Vec<_> = self.forwarders.lock().drain(..).collect();
        for handle in forwarders {
            handle.abort();
        }
        let errors = self
            .for_each_child(|c| c.shutdown, |c| c.provider.on_close())
            .await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(aggregate_error(&errors))
        }
    }

    async fn on_context_change(
        &self,
        old_context: &EvaluationContext,
        new_context: &EvaluationContext,
    ) -> EvaluationResult<()> {
        let errors = self
            .for_each_child(
                |c| c.context_change,
                |c| c.provider.on_context_change(old_context, new_context),
            )
            .await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(aggregate_error(&errors))
        }
    }

    fn track(&self, event_name: &str, context: &EvaluationContext, details: &TrackingEventDetails) {
        let statuses = self.statuses.read().clone();
        for (child, status) in self.children.iter().zip(statuses) {
            if child.capabilities.track
                && !matches!(status, ProviderStatus::NotReady | ProviderStatus::Fatal)
            {
                child.provider.track(event_name, context, details);
            }
        }
    }

    async fn resolve_boolean_evaluation(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<bool>> {
        self.resolve_typed(flag_key, default_value, context).await
    }

    async fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: String,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<String>> {
        self.resolve_typed(flag_key, default_value, context).await
    }

    async fn resolve_number_evaluation(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<f64>> {
        self.resolve_typed(flag_key, default_value, context).await
    }

    async fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<serde_json::Value>> {
        self.resolve_typed(flag_key, default_value, context).await
    }
}

impl Drop for MultiProvider {
    fn drop(&mut self) {
        for handle in self.forwarders.get_mut().drain(..) {
            handle.abort();
        }
    }
}
