//! Event definitions and handler traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Provider lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderEvent {
    /// The provider finished initializing and can evaluate flags.
    #[serde(rename = "PROVIDER_READY")]
    Ready,

    /// The provider failed to initialize or hit a runtime fault.
    #[serde(rename = "PROVIDER_ERROR")]
    Error,

    /// The provider's cached state is out of date.
    #[serde(rename = "PROVIDER_STALE")]
    Stale,

    /// The provider reconciled a new evaluation context.
    #[serde(rename = "PROVIDER_CONTEXT_CHANGED")]
    ContextChanged,

    /// Flag definitions changed at the source.
    #[serde(rename = "PROVIDER_CONFIGURATION_CHANGED")]
    ConfigurationChanged,
}

impl ProviderEvent {
    /// Every event type, in declaration order.
    pub const ALL: [ProviderEvent; 5] = [
        ProviderEvent::Ready,
        ProviderEvent::Error,
        ProviderEvent::Stale,
        ProviderEvent::ContextChanged,
        ProviderEvent::ConfigurationChanged,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderEvent::Ready => "PROVIDER_READY",
            ProviderEvent::Error => "PROVIDER_ERROR",
            ProviderEvent::Stale => "PROVIDER_STALE",
            ProviderEvent::ContextChanged => "PROVIDER_CONTEXT_CHANGED",
            ProviderEvent::ConfigurationChanged => "PROVIDER_CONFIGURATION_CHANGED",
        }
    }
}

impl fmt::Display for ProviderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event handler error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventHandlerError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl EventHandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::HandlerFailed(message.into())
    }
}

/// Event handler trait
///
/// `D` is the details payload delivered with every event.
#[async_trait]
pub trait EventHandler<D>: Send + Sync
where
    D: Send + Sync + 'static,
{
    /// Handle the event
    async fn handle(&self, event: ProviderEvent, details: &D) -> Result<(), EventHandlerError>;
}

/// Shared, type-erased handler.
pub type SharedEventHandler<D> = Arc<dyn EventHandler<D>>;

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct FnEventHandler<D, F> {
    f: F,
    _phantom: PhantomData<fn(&D)>,
}

impl<D, F> FnEventHandler<D, F>
where
    D: Send + Sync + 'static,
    F: Fn(ProviderEvent, &D) -> Result<(), EventHandlerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<D, F> EventHandler<D> for FnEventHandler<D, F>
where
    D: Send + Sync + 'static,
    F: Fn(ProviderEvent, &D) -> Result<(), EventHandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, event: ProviderEvent, details: &D) -> Result<(), EventHandlerError> {
        (self.f)(event, details)
    }
}

/// Build a shared handler from a closure.
///
/// ```
/// use flagwire_events::{handler_fn, ProviderEvent};
///
/// let handler = handler_fn(|event: ProviderEvent, details: &String| {
///     println!("{event}: {details}");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<D, F>(f: F) -> SharedEventHandler<D>
where
    D: Send + Sync + 'static,
    F: Fn(ProviderEvent, &D) -> Result<(), EventHandlerError> + Send + Sync + 'static,
{
    Arc::new(FnEventHandler::new(f))
}
