//! Provider lifecycle events for flagwire
//!
//! This crate provides the typed publish/subscribe channel the evaluation
//! client uses to announce provider status transitions.
//!
//! ## Features
//!
//! - **Typed events** - `Ready`, `Error`, `Stale`, `ContextChanged`, `ConfigurationChanged`
//! - **Ordered delivery** - handlers of one event type run in registration order
//! - **Isolation** - a failing or panicking handler is logged and skipped
//! - **Cancellable subscriptions** - attach a `CancellationToken` to drop a handler
//!
//! ## Quick Start
//!
//! ```rust
//! use flagwire_events::*;
//!
//! # async fn example() {
//! let emitter: EventEmitter<String> = EventEmitter::new();
//!
//! let id = emitter.add_handler(
//!     ProviderEvent::Ready,
//!     handler_fn(|event, provider: &String| {
//!         println!("{provider} emitted {event}");
//!         Ok(())
//!     }),
//! );
//!
//! emitter.emit(ProviderEvent::Ready, "in-memory".to_string()).await;
//! emitter.remove_handler(ProviderEvent::Ready, id);
//! # }
//! ```
//!
//! ## Cancellation
//!
//! ```rust
//! use flagwire_events::*;
//! use tokio_util::sync::CancellationToken;
//!
//! let emitter: EventEmitter<()> = EventEmitter::new();
//! let token = CancellationToken::new();
//!
//! emitter.add_handler_with(
//!     ProviderEvent::Stale,
//!     handler_fn(|_, _: &()| Ok(())),
//!     AddHandlerOptions::new().with_signal(token.clone()),
//! );
//!
//! token.cancel();
//! assert_eq!(emitter.handler_count(ProviderEvent::Stale), 0);
//! ```

pub mod emitter;
pub mod event;

pub use emitter::{
    AddHandlerOptions, EventEmitter, EventEmitterBuilder, EventEmitterConfig, HandlerId,
};
pub use event::{
    EventHandler, EventHandlerError, FnEventHandler, ProviderEvent, SharedEventHandler,
    handler_fn,
};
pub use tokio_util::sync::CancellationToken;
