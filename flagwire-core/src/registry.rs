//! Flag registry
//!
//! The registry owns the shared evaluation state: the default provider and
//! any domain-bound providers, the API evaluation context, API-level hooks,
//! the logger, the transaction context propagator and the provider event
//! emitter. Clients obtained from it evaluate against a snapshot of that
//! state taken when each evaluation starts.
//!
//! A process-wide instance is available through [`FlagRegistry::global`];
//! isolated instances are built with [`FlagRegistry::new`].
//!
//! ```
//! use flagwire_core::{FlagDefinition, FlagRegistry, InMemoryProvider, WaitOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> flagwire_core::Result<()> {
//! let registry = FlagRegistry::new();
//! registry
//!     .set_provider_and_wait(
//!         Arc::new(InMemoryProvider::new().with_flag(FlagDefinition::boolean("new-ui", true))),
//!         WaitOptions::new().with_timeout_ms(500),
//!     )
//!     .await?;
//!
//! let client = registry.get_client();
//! assert!(client.get_boolean_value("new-ui", false, None, None).await);
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::config::RegistryConfig;
use crate::context::EvaluationContext;
use crate::error::{ErrorCode, EvaluationError, EvaluationResult, FlagwireError, Result};
use crate::evaluation::{EvaluationSnapshot, panic_message};
use crate::events::{EventDetails, RegistryEventHandler};
use crate::hooks::Hook;
use crate::provider::{
    NoopProvider, Provider, ProviderCapabilities, ProviderEventDetails, ProviderMetadata,
    ProviderStatus, TrackingEventDetails,
};
use crate::transaction::{TaskLocalTransactionContextPropagator, TransactionContextPropagator};
use crate::value::ClientMetadata;
use async_trait::async_trait;
use flagwire_events::{
    AddHandlerOptions, EventEmitter, EventHandler, EventHandlerError, HandlerId, ProviderEvent,
};
use flagwire_log::{Logger, SafeLogger};
use futures::FutureExt;
use futures::future::join_all;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static GLOBAL: Lazy<FlagRegistry> = Lazy::new(FlagRegistry::new);

/// A registered provider and the status the registry tracks for it.
///
/// One entry exists per provider instance, however many domains it is
/// bound to.
pub(crate) struct ProviderEntry {
    pub(crate) id: u64,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) metadata: ProviderMetadata,
    pub(crate) capabilities: ProviderCapabilities,
    pub(crate) hooks: Vec<Arc<dyn Hook>>,
    /// Domain the entry was first registered for.
    pub(crate) domain: Option<String>,
    status: watch::Sender<ProviderStatus>,
    last_error: Mutex<Option<EvaluationError>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderEntry {
    fn new(id: u64, provider: Arc<dyn Provider>, domain: Option<String>) -> Self {
        let capabilities = provider.capabilities();
        let initial = if capabilities.initialize {
            ProviderStatus::NotReady
        } else {
            provider.status()
        };
        let (status, _) = watch::channel(initial);
        Self {
            id,
            metadata: provider.metadata(),
            hooks: provider.hooks(),
            capabilities,
            provider,
            domain,
            status,
            last_error: Mutex::new(None),
            forwarder: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> ProviderStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ProviderStatus) {
        self.status.send_replace(status);
    }

    fn fail(&self, error: EvaluationError) {
        let status = if error.code == ErrorCode::ProviderFatal {
            ProviderStatus::Fatal
        } else {
            ProviderStatus::Error
        };
        *self.last_error.lock() = Some(error);
        self.set_status(status);
    }

    fn last_error(&self) -> Option<EvaluationError> {
        self.last_error.lock().clone()
    }

    fn holds(&self, provider: &Arc<dyn Provider>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.provider), Arc::as_ptr(provider))
    }
}

/// Bounds on [`FlagRegistry::set_provider_and_wait`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(Duration::from_millis(ms));
        self
    }

    pub fn with_cancellation(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct RegistryInner {
    config: RegistryConfig,
    next_entry_id: AtomicU64,
    default_entry: RwLock<Arc<ProviderEntry>>,
    domains: RwLock<HashMap<String, Arc<ProviderEntry>>>,
    context: RwLock<EvaluationContext>,
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    emitter: EventEmitter<EventDetails>,
    logger: RwLock<SafeLogger>,
    propagator: RwLock<Arc<dyn TransactionContextPropagator>>,
}

/// Shared evaluation state and provider lifecycle.
#[derive(Clone)]
pub struct FlagRegistry {
    inner: Arc<RegistryInner>,
}

impl FlagRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        let noop = ProviderEntry::new(0, Arc::new(NoopProvider), None);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                next_entry_id: AtomicU64::new(1),
                default_entry: RwLock::new(Arc::new(noop)),
                domains: RwLock::new(HashMap::new()),
                context: RwLock::new(EvaluationContext::default()),
                hooks: RwLock::new(Vec::new()),
                emitter: EventEmitter::new(),
                logger: RwLock::new(SafeLogger::default()),
                propagator: RwLock::new(Arc::new(TaskLocalTransactionContextPropagator)),
            }),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static FlagRegistry {
        &GLOBAL
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    // ----- providers -----

    /// Install the default provider and initialize it in the background.
    pub async fn set_provider(&self, provider: Arc<dyn Provider>) {
        self.install(None, provider);
    }

    /// Bind a provider to `domain`.
    pub async fn set_provider_for(&self, domain: &str, provider: Arc<dyn Provider>) {
        self.install(Some(domain), provider);
    }

    /// Install the default provider and wait until it settles.
    ///
    /// Fails if initialization fails, or if the wait times out or is
    /// cancelled. The provider stays installed in every case. A provider
    /// without `initialize` has nothing to wait for and resolves at once,
    /// whatever status it reports.
    pub async fn set_provider_and_wait(
        &self,
        provider: Arc<dyn Provider>,
        options: WaitOptions,
    ) -> Result<()> {
        let entry = self.install(None, provider);
        self.wait_until_settled(&entry, options).await
    }

    pub async fn set_provider_and_wait_for(
        &self,
        domain: &str,
        provider: Arc<dyn Provider>,
        options: WaitOptions,
    ) -> Result<()> {
        let entry = self.install(Some(domain), provider);
        self.wait_until_settled(&entry, options).await
    }

    pub fn get_provider_metadata(&self) -> ProviderMetadata {
        self.entry_for(None).metadata.clone()
    }

    /// Metadata of the provider serving `domain` (the default if unbound).
    pub fn get_provider_metadata_for(&self, domain: &str) -> ProviderMetadata {
        self.entry_for(Some(domain)).metadata.clone()
    }

    pub fn provider_status(&self) -> ProviderStatus {
        self.entry_for(None).status()
    }

    pub fn provider_status_for(&self, domain: &str) -> ProviderStatus {
        self.entry_for(Some(domain)).status()
    }

    /// Close every provider and fall back to the no-op provider.
    pub async fn clear_providers(&self) {
        let entries = self.unique_entries();
        let noop = ProviderEntry::new(self.next_entry_id(), Arc::new(NoopProvider), None);
        *self.inner.default_entry.write() = Arc::new(noop);
        self.inner.domains.write().clear();
        join_all(entries.iter().map(|e| self.close_entry(e))).await;
    }

    /// Close every provider, reset to the no-op provider and drop all
    /// event handlers.
    pub async fn close(&self) {
        self.clear_providers().await;
        self.clear_handlers();
    }

    fn next_entry_id(&self) -> u64 {
        self.inner.next_entry_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn entry_for(&self, domain: Option<&str>) -> Arc<ProviderEntry> {
        domain
            .and_then(|d| self.inner.domains.read().get(d).cloned())
            .unwrap_or_else(|| self.inner.default_entry.read().clone())
    }

    fn unique_entries(&self) -> Vec<Arc<ProviderEntry>> {
        let mut entries = vec![self.inner.default_entry.read().clone()];
        for entry in self.inner.domains.read().values() {
            if !entries.iter().any(|e| Arc::ptr_eq(e, entry)) {
                entries.push(entry.clone());
            }
        }
        entries
    }

    fn is_bound(&self, entry: &Arc<ProviderEntry>) -> bool {
        self.unique_entries().iter().any(|e| Arc::ptr_eq(e, entry))
    }

    fn find_entry(&self, provider: &Arc<dyn Provider>) -> Option<Arc<ProviderEntry>> {
        self.unique_entries().into_iter().find(|e| e.holds(provider))
    }

    fn install(&self, domain: Option<&str>, provider: Arc<dyn Provider>) -> Arc<ProviderEntry> {
        let (entry, created) = match self.find_entry(&provider) {
            Some(existing) => (existing, false),
            None => {
                let entry = ProviderEntry::new(
                    self.next_entry_id(),
                    provider,
                    domain.map(str::to_string),
                );
                (Arc::new(entry), true)
            }
        };
        debug!(
            provider = %entry.metadata.name,
            domain = domain.unwrap_or("-"),
            reused = !created,
            "installing provider"
        );

        let previous = match domain {
            None => Some(std::mem::replace(
                &mut *self.inner.default_entry.write(),
                entry.clone(),
            )),
            Some(d) => self.inner.domains.write().insert(d.to_string(), entry.clone()),
        }
        .filter(|p| !Arc::ptr_eq(p, &entry));

        let registry = self.clone();
        let settling = entry.clone();
        if created {
            tokio::spawn(async move { registry.settle(settling, previous).await });
        } else if let Some(previous) = previous {
            tokio::spawn(async move { registry.retire(previous).await });
        }
        entry
    }

    /// Initialize a newly installed entry, announce its status, then retire
    /// the entry it replaced.
    async fn settle(&self, entry: Arc<ProviderEntry>, previous: Option<Arc<ProviderEntry>>) {
        self.start_forwarder(&entry);

        if entry.capabilities.initialize {
            let context = self.get_context();
            match self.run_initialize(&entry, &context).await {
                Ok(()) => {
                    entry.set_status(ProviderStatus::Ready);
                    self.emit(&entry, ProviderEventDetails::new(ProviderEvent::Ready))
                        .await;
                }
                Err(error) => {
                    self.logger().error(&format!(
                        "Error initializing provider '{}': {}",
                        entry.metadata.name, error
                    ));
                    entry.fail(error.clone());
                    self.emit(&entry, error_event(&error)).await;
                }
            }
        } else if entry.status() == ProviderStatus::Ready {
            self.emit(&entry, ProviderEventDetails::new(ProviderEvent::Ready))
                .await;
        }

        if let Some(previous) = previous {
            self.retire(previous).await;
        }
    }

    async fn run_initialize(
        &self,
        entry: &ProviderEntry,
        context: &EvaluationContext,
    ) -> EvaluationResult<()> {
        let init = async {
            match AssertUnwindSafe(entry.provider.initialize(context))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(EvaluationError::general(format!(
                    "provider panicked during initialize: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        };

        match self.inner.config.initialization_timeout {
            Some(limit) => tokio::time::timeout(limit, init).await.unwrap_or_else(|_| {
                Err(EvaluationError::general(format!(
                    "initialization timed out after {}ms",
                    limit.as_millis()
                )))
            }),
            None => init.await,
        }
    }

    async fn retire(&self, entry: Arc<ProviderEntry>) {
        if !self.is_bound(&entry) {
            self.close_entry(&entry).await;
        }
    }

    async fn close_entry(&self, entry: &ProviderEntry) {
        if let Some(forwarder) = entry.forwarder.lock().take() {
            forwarder.abort();
        }
        if !entry.capabilities.shutdown {
            return;
        }

        let close = AssertUnwindSafe(entry.provider.on_close()).catch_unwind();
        let failure = match tokio::time::timeout(self.inner.config.close_timeout, close).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(error))) => Some(error.message),
            Ok(Err(panic)) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => Some(format!(
                "timed out after {}ms",
                self.inner.config.close_timeout.as_millis()
            )),
        };
        if let Some(message) = failure {
            let error = FlagwireError::Shutdown {
                provider: entry.metadata.name.clone(),
                message,
            };
            self.logger().error(&error.to_string());
        }
    }

    async fn wait_until_settled(&self, entry: &ProviderEntry, options: WaitOptions) -> Result<()> {
        let mut rx = entry.status.subscribe();
        let settled = async {
            rx.wait_for(|s| *s != ProviderStatus::NotReady)
                .await
                .map(|s| *s)
        };
        let cancelled = async {
            match &options.signal {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let timer = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let status = if entry.capabilities.initialize {
            tokio::select! {
                biased;
                _ = cancelled => return Err(FlagwireError::Cancelled),
                status = settled => status,
                _ = timer => return Err(FlagwireError::Timeout(options.timeout.unwrap_or_default())),
            }
        } else {
            Ok(entry.status())
        };

        match status {
            Ok(ProviderStatus::Fatal) => Err(FlagwireError::ProviderFatal(entry.metadata.name.clone())),
            Ok(ProviderStatus::Error) => Err(FlagwireError::ProviderInitialization {
                provider: entry.metadata.name.clone(),
                source: entry
                    .last_error()
                    .unwrap_or_else(|| EvaluationError::general("provider reported an error")),
            }),
            Ok(_) => Ok(()),
            Err(_) => Err(FlagwireError::ProviderInitialization {
                provider: entry.metadata.name.clone(),
                source: EvaluationError::general("status channel closed"),
            }),
        }
    }

    fn start_forwarder(&self, entry: &Arc<ProviderEntry>) {
        if !entry.capabilities.events {
            return;
        }
        let Some(sender) = entry.provider.events() else {
            return;
        };

        let mut rx = sender.subscribe();
        let registry = Arc::downgrade(&self.inner);
        let weak_entry = Arc::downgrade(entry);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(details) => {
                        let (Some(inner), Some(entry)) = (registry.upgrade(), weak_entry.upgrade())
                        else {
                            break;
                        };
                        FlagRegistry { inner }.on_provider_event(&entry, details).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dropped provider events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *entry.forwarder.lock() = Some(handle);
    }

    /// Apply a provider-originated event to the tracked status and fan it out.
    async fn on_provider_event(&self, entry: &ProviderEntry, details: ProviderEventDetails) {
        let status_event = matches!(
            details.event,
            ProviderEvent::Ready | ProviderEvent::Stale | ProviderEvent::Error
        );
        if status_event && entry.status() == ProviderStatus::Fatal {
            debug!(provider = %entry.metadata.name, event = %details.event, "ignoring event from fatal provider");
            return;
        }

        match details.event {
            ProviderEvent::Ready => entry.set_status(ProviderStatus::Ready),
            ProviderEvent::Stale => entry.set_status(ProviderStatus::Stale),
            ProviderEvent::Error => entry.fail(EvaluationError::new(
                details.error_code.unwrap_or(ErrorCode::General),
                details.message.clone().unwrap_or_default(),
            )),
            ProviderEvent::ConfigurationChanged | ProviderEvent::ContextChanged => {}
        }
        self.emit(entry, details).await;
    }

    async fn emit(&self, entry: &ProviderEntry, details: ProviderEventDetails) {
        let event = details.event;
        let payload = EventDetails::from_provider(
            entry.id,
            entry.metadata.name.clone(),
            entry.domain.clone(),
            details,
        );
        self.inner.emitter.emit(event, payload).await;
    }

    // ----- context -----

    /// Replace the API context and let every provider reconcile it.
    pub async fn set_context(&self, context: EvaluationContext) {
        let old = std::mem::replace(&mut *self.inner.context.write(), context.clone());
        let entries = self.unique_entries();
        join_all(
            entries
                .iter()
                .map(|entry| self.reconcile_context(entry, &old, &context)),
        )
        .await;
    }

    pub fn get_context(&self) -> EvaluationContext {
        self.inner.context.read().clone()
    }

    async fn reconcile_context(
        &self,
        entry: &ProviderEntry,
        old: &EvaluationContext,
        new: &EvaluationContext,
    ) {
        if !entry.capabilities.context_change {
            self.emit(entry, ProviderEventDetails::new(ProviderEvent::ContextChanged))
                .await;
            return;
        }

        let status = entry.status();
        if status == ProviderStatus::Fatal {
            return;
        }
        let tracked = status != ProviderStatus::NotReady;
        if tracked {
            entry.set_status(ProviderStatus::Stale);
            self.emit(entry, ProviderEventDetails::new(ProviderEvent::Stale))
                .await;
        }

        let outcome = AssertUnwindSafe(entry.provider.on_context_change(old, new))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(EvaluationError::general(format!(
                    "provider panicked during context change: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match outcome {
            Ok(()) => {
                if tracked {
                    entry.set_status(ProviderStatus::Ready);
                }
                self.emit(entry, ProviderEventDetails::new(ProviderEvent::ContextChanged))
                    .await;
            }
            Err(error) => {
                self.logger().error(&format!(
                    "Error running context change handler of provider '{}': {}",
                    entry.metadata.name, error
                ));
                if tracked {
                    entry.fail(error.clone());
                }
                self.emit(entry, error_event(&error)).await;
            }
        }
    }

    // ----- hooks -----

    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.inner.hooks.write().push(hook);
    }

    pub fn add_hooks(&self, hooks: impl IntoIterator<Item = Arc<dyn Hook>>) {
        self.inner.hooks.write().extend(hooks);
    }

    pub fn get_hooks(&self) -> Vec<Arc<dyn Hook>> {
        self.inner.hooks.read().clone()
    }

    pub fn clear_hooks(&self) {
        self.inner.hooks.write().clear();
    }

    // ----- logging -----

    /// Route diagnostics through `logger`; panics inside it are contained.
    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        let safe = SafeLogger::new(logger);
        self.inner.emitter.set_logger(safe.clone());
        *self.inner.logger.write() = safe;
    }

    pub fn logger(&self) -> SafeLogger {
        self.inner.logger.read().clone()
    }

    // ----- transaction context -----

    pub fn set_transaction_context_propagator(
        &self,
        propagator: Arc<dyn TransactionContextPropagator>,
    ) {
        *self.inner.propagator.write() = propagator;
    }

    pub fn get_transaction_context(&self) -> EvaluationContext {
        self.inner.propagator.read().get_transaction_context()
    }

    /// Run `scope` with `context` as the ambient transaction context.
    pub async fn set_transaction_context<'a>(
        &self,
        context: EvaluationContext,
        scope: impl Future<Output = ()> + Send + 'a,
    ) {
        let propagator = self.inner.propagator.read().clone();
        propagator
            .set_transaction_context(context, Box::pin(scope))
            .await;
    }

    // ----- clients -----

    /// Client bound to the default provider.
    pub fn get_client(&self) -> Client {
        Client::new(self.clone(), None)
    }

    /// Client bound to `domain`'s provider, or the default one while the
    /// domain has none.
    pub fn get_client_for(&self, domain: &str) -> Client {
        Client::new(self.clone(), Some(domain.to_string()))
    }

    pub(crate) fn snapshot(
        &self,
        domain: Option<&str>,
        client_context: EvaluationContext,
        client_hooks: Vec<Arc<dyn Hook>>,
    ) -> EvaluationSnapshot {
        let entry = self.entry_for(domain);
        EvaluationSnapshot {
            provider: entry.provider.clone(),
            provider_metadata: entry.metadata.clone(),
            capabilities: entry.capabilities,
            status: entry.status(),
            api_hooks: self.get_hooks(),
            client_hooks,
            provider_hooks: entry.hooks.clone(),
            api_context: self.get_context(),
            transaction_context: self.get_transaction_context(),
            client_context,
            client_metadata: ClientMetadata {
                domain: domain.map(str::to_string),
            },
            logger: self.logger(),
            default_timeout: self.inner.config.default_timeout,
            fatal_short_circuit: self.inner.config.fatal_short_circuit,
        }
    }

    pub(crate) fn track(
        &self,
        domain: Option<&str>,
        event_name: &str,
        context: &EvaluationContext,
        details: &TrackingEventDetails,
    ) {
        let entry = self.entry_for(domain);
        if !entry.capabilities.track {
            debug!(provider = %entry.metadata.name, "provider does not track events");
            return;
        }
        if entry.status() != ProviderStatus::Ready {
            self.logger().warn(&format!(
                "Not tracking '{}': provider '{}' is {}",
                event_name,
                entry.metadata.name,
                entry.status()
            ));
            return;
        }
        let tracked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            entry.provider.track(event_name, context, details)
        }));
        if let Err(panic) = tracked {
            self.logger().error(&format!(
                "Provider '{}' panicked while tracking '{}': {}",
                entry.metadata.name,
                event_name,
                panic_message(panic.as_ref())
            ));
        }
    }

    // ----- events -----

    /// Subscribe to events from every provider.
    ///
    /// Subscribing to `Ready`, `Error` or `Stale` while a provider is already
    /// in that status runs the handler immediately for that provider.
    pub async fn add_handler(&self, event: ProviderEvent, handler: RegistryEventHandler) -> HandlerId {
        self.add_handler_with(event, handler, AddHandlerOptions::default())
            .await
    }

    pub async fn add_handler_with(
        &self,
        event: ProviderEvent,
        handler: RegistryEventHandler,
        options: AddHandlerOptions,
    ) -> HandlerId {
        let live = !options.signal.as_ref().is_some_and(CancellationToken::is_cancelled);
        let id = self
            .inner
            .emitter
            .add_handler_with(event, handler.clone(), options);
        if live {
            for entry in self.unique_entries() {
                self.run_if_current(&entry, event, &handler).await;
            }
        }
        id
    }

    pub(crate) async fn add_client_handler(
        &self,
        domain: Option<String>,
        event: ProviderEvent,
        handler: RegistryEventHandler,
        options: AddHandlerOptions,
    ) -> HandlerId {
        let live = !options.signal.as_ref().is_some_and(CancellationToken::is_cancelled);
        let entry = self.entry_for(domain.as_deref());
        let bound: RegistryEventHandler = Arc::new(BoundHandler {
            registry: Arc::downgrade(&self.inner),
            domain,
            inner: handler.clone(),
        });
        let id = self.inner.emitter.add_handler_with(event, bound, options);
        if live {
            self.run_if_current(&entry, event, &handler).await;
        }
        id
    }

    pub fn remove_handler(&self, event: ProviderEvent, id: HandlerId) -> bool {
        self.inner.emitter.remove_handler(event, id)
    }

    pub fn remove_all_handlers(&self, event: Option<ProviderEvent>) {
        self.inner.emitter.remove_all_handlers(event);
    }

    pub fn clear_handlers(&self) {
        self.remove_all_handlers(None);
    }

    async fn run_if_current(
        &self,
        entry: &ProviderEntry,
        event: ProviderEvent,
        handler: &RegistryEventHandler,
    ) {
        let status = entry.status();
        let current = match event {
            ProviderEvent::Ready => status == ProviderStatus::Ready,
            ProviderEvent::Error => {
                matches!(status, ProviderStatus::Error | ProviderStatus::Fatal)
            }
            ProviderEvent::Stale => status == ProviderStatus::Stale,
            ProviderEvent::ConfigurationChanged | ProviderEvent::ContextChanged => false,
        };
        if !current {
            return;
        }

        let details = match (event, entry.last_error()) {
            (ProviderEvent::Error, Some(error)) => error_event(&error),
            _ => ProviderEventDetails::new(event),
        };
        let payload = EventDetails::from_provider(
            entry.id,
            entry.metadata.name.clone(),
            entry.domain.clone(),
            details,
        );
        self.inner.emitter.run_handler(handler, event, &payload).await;
    }
}

impl Default for FlagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlagRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let default = self.entry_for(None);
        f.debug_struct("FlagRegistry")
            .field("provider", &default.metadata.name)
            .field("status", &default.status())
            .field("domains", &self.inner.domains.read().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn error_event(error: &EvaluationError) -> ProviderEventDetails {
    ProviderEventDetails::new(ProviderEvent::Error)
        .with_message(error.message.clone())
        .with_error_code(error.code)
}

/// Delivers only events from the provider currently serving one domain.
struct BoundHandler {
    registry: Weak<RegistryInner>,
    domain: Option<String>,
    inner: RegistryEventHandler,
}

#[async_trait]
impl EventHandler<EventDetails> for BoundHandler {
    async fn handle(
        &self,
        event: ProviderEvent,
        details: &EventDetails,
    ) -> std::result::Result<(), EventHandlerError> {
        let Some(inner) = self.registry.upgrade() else {
            return Ok(());
        };
        let bound = FlagRegistry { inner }.entry_for(self.domain.as_deref());
        if bound.id != details.source {
            return Ok(());
        }
        self.inner.handle(event, details).await
    }
}
