//! Event emitter implementation

use crate::event::{EventHandlerError, ProviderEvent, SharedEventHandler};
use dashmap::DashMap;
use flagwire_log::{Logger, SafeLogger};
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identifies one registration returned by [`EventEmitter::add_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Options accepted by [`EventEmitter::add_handler_with`].
#[derive(Debug, Clone, Default)]
pub struct AddHandlerOptions {
    /// Once cancelled, the handler behaves as if it had been removed.
    pub signal: Option<CancellationToken>,
}

impl AddHandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct HandlerEntry<D: Send + Sync + 'static> {
    id: HandlerId,
    handler: SharedEventHandler<D>,
    signal: Option<CancellationToken>,
}

impl<D: Send + Sync + 'static> HandlerEntry<D> {
    fn is_live(&self) -> bool {
        self.signal.as_ref().is_none_or(|s| !s.is_cancelled())
    }
}

impl<D: Send + Sync + 'static> Clone for HandlerEntry<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            signal: self.signal.clone(),
        }
    }
}

/// Event emitter configuration
#[derive(Debug, Clone)]
pub struct EventEmitterConfig {
    /// Enable event logging
    pub enable_logging: bool,
}

impl Default for EventEmitterConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
        }
    }
}

/// Typed publish/subscribe for provider lifecycle events.
///
/// Handlers for one event type run in registration order. A failing or
/// panicking handler is logged and never stops the remaining handlers.
/// Clones share the same handler table.
pub struct EventEmitter<D: Send + Sync + 'static> {
    handlers: Arc<DashMap<ProviderEvent, Vec<HandlerEntry<D>>>>,
    next_id: Arc<AtomicU64>,
    logger: Arc<RwLock<SafeLogger>>,
    config: Arc<EventEmitterConfig>,
}

impl<D: Send + Sync + 'static> Clone for EventEmitter<D> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            next_id: Arc::clone(&self.next_id),
            logger: Arc::clone(&self.logger),
            config: Arc::clone(&self.config),
        }
    }
}

impl<D: Send + Sync + 'static> EventEmitter<D> {
    /// Create new event emitter
    pub fn new() -> Self {
        Self::with_config(EventEmitterConfig::default())
    }

    /// Create event emitter with custom config
    pub fn with_config(config: EventEmitterConfig) -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            logger: Arc::new(RwLock::new(SafeLogger::default())),
            config: Arc::new(config),
        }
    }

    /// Replace the logger handler failures are reported through.
    pub fn set_logger(&self, logger: SafeLogger) {
        *self.logger.write() = logger;
    }

    /// Register a handler for an event type.
    pub fn add_handler(&self, event: ProviderEvent, handler: SharedEventHandler<D>) -> HandlerId {
        self.add_handler_with(event, handler, AddHandlerOptions::default())
    }

    /// Register a handler with options.
    pub fn add_handler_with(
        &self,
        event: ProviderEvent,
        handler: SharedEventHandler<D>,
        options: AddHandlerOptions,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.handlers.entry(event).or_default().push(HandlerEntry {
            id,
            handler,
            signal: options.signal,
        });

        if self.config.enable_logging {
            debug!("Subscribed handler {:?} for event {}", id, event);
        }

        id
    }

    /// Remove one registration. Returns whether it was present.
    pub fn remove_handler(&self, event: ProviderEvent, id: HandlerId) -> bool {
        let Some(mut entries) = self.handlers.get_mut(&event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;

        if removed && self.config.enable_logging {
            debug!("Removed handler {:?} for event {}", id, event);
        }
        removed
    }

    /// Remove every handler of one event type, or of all types when `None`.
    pub fn remove_all_handlers(&self, event: Option<ProviderEvent>) {
        match event {
            Some(event) => {
                self.handlers.remove(&event);
            }
            None => self.handlers.clear(),
        }

        if self.config.enable_logging {
            match event {
                Some(event) => debug!("Removed all handlers for event {}", event),
                None => debug!("Cleared all event handlers"),
            }
        }
    }

    /// Live handlers for an event type, in registration order.
    pub fn get_handlers(&self, event: ProviderEvent) -> Vec<SharedEventHandler<D>> {
        self.live_entries(event)
            .into_iter()
            .map(|entry| entry.handler)
            .collect()
    }

    /// Number of live handlers for an event type.
    pub fn handler_count(&self, event: ProviderEvent) -> usize {
        self.live_entries(event).len()
    }

    /// Invoke every live handler for `event`, in registration order.
    ///
    /// Handler failures are logged and swallowed.
    pub async fn emit(&self, event: ProviderEvent, details: D) {
        let entries = self.live_entries(event);

        if self.config.enable_logging {
            debug!("Emitting {} to {} handler(s)", event, entries.len());
        }

        for entry in entries {
            // Cancellation may land while earlier handlers run.
            if !entry.is_live() {
                continue;
            }
            if let Err(e) = Self::invoke(&entry.handler, event, &details).await {
                self.logger
                    .read()
                    .error(&format!("Error running event handler for {}: {}", event, e));
            }
        }
    }

    /// Emit on a background task without waiting for handlers.
    pub fn emit_detached(&self, event: ProviderEvent, details: D) -> tokio::task::JoinHandle<()> {
        let emitter = self.clone();
        tokio::spawn(async move { emitter.emit(event, details).await })
    }

    /// Run a single handler with the same isolation `emit` applies.
    pub async fn run_handler(&self, handler: &SharedEventHandler<D>, event: ProviderEvent, details: &D) {
        if let Err(e) = Self::invoke(handler, event, details).await {
            self.logger
                .read()
                .error(&format!("Error running event handler for {}: {}", event, e));
        }
    }

    async fn invoke(
        handler: &SharedEventHandler<D>,
        event: ProviderEvent,
        details: &D,
    ) -> Result<(), EventHandlerError> {
        match AssertUnwindSafe(handler.handle(event, details))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(EventHandlerError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn live_entries(&self, event: ProviderEvent) -> Vec<HandlerEntry<D>> {
        let Some(mut entries) = self.handlers.get_mut(&event) else {
            return Vec::new();
        };
        entries.retain(HandlerEntry::is_live);
        entries.clone()
    }
}

impl<D: Send + Sync + 'static> Default for EventEmitter<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Event emitter builder
pub struct EventEmitterBuilder {
    config: EventEmitterConfig,
    logger: Option<SafeLogger>,
}

impl EventEmitterBuilder {
    /// Create new event emitter builder
    pub fn new() -> Self {
        Self {
            config: EventEmitterConfig::default(),
            logger: None,
        }
    }

    /// Enable/disable logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    /// Report handler failures through this logger
    pub fn logger(mut self, logger: SafeLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the event emitter
    pub fn build<D: Send + Sync + 'static>(self) -> EventEmitter<D> {
        let emitter = EventEmitter::with_config(self.config);
        if let Some(logger) = self.logger {
            emitter.set_logger(logger);
        }
        emitter
    }
}

impl Default for EventEmitterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
