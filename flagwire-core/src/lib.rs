//! Feature flag evaluation for flagwire
//!
//! Applications ask what value a flag has for a given context and get back
//! the value plus how it was decided (reason, variant, error), without
//! binding to the system that stores the flags.
//!
//! # Features
//!
//! - **Providers** - pluggable flag sources with an explicit capability set
//! - **Hooks** - `before`/`after`/`error`/`finally` extension points
//! - **Contexts** - API, transaction, client and invocation layers merged per call
//! - **Timeouts and cancellation** - every evaluation can be bounded
//! - **Multi-provider** - combine sources under a resolution strategy
//! - **Lifecycle events** - subscribe to provider status changes
//!
//! # Quick Start
//!
//! ```
//! use flagwire_core::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> flagwire_core::Result<()> {
//! let registry = FlagRegistry::new();
//! let provider = InMemoryProvider::new()
//!     .with_flag(FlagDefinition::boolean("new-checkout", true))
//!     .with_flag(FlagDefinition::constant("theme", "dark".to_string()));
//! registry
//!     .set_provider_and_wait(Arc::new(provider), WaitOptions::new())
//!     .await?;
//!
//! let client = registry.get_client();
//! let ctx = EvaluationContext::new().with_targeting_key("user-42");
//!
//! if client.get_boolean_value("new-checkout", false, Some(&ctx), None).await {
//!     // new flow
//! }
//! let theme = client.get_string_details("theme", "light", Some(&ctx), None).await;
//! assert_eq!(theme.value, "dark");
//! # Ok(())
//! # }
//! ```
//!
//! # Bounded evaluation
//!
//! ```
//! use flagwire_core::*;
//!
//! # async fn example(client: Client) {
//! let signal = CancellationToken::new();
//! let options = EvaluationOptions::new()
//!     .with_timeout_ms(250)
//!     .with_cancellation(signal.clone());
//!
//! let details = client.get_boolean_details("slow-flag", false, None, Some(options)).await;
//! if details.is_error() {
//!     // default value, see details.error_message
//! }
//! # }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod hooks;
pub mod in_memory;
pub mod multi;
pub mod options;
pub mod provider;
pub mod registry;
pub mod testing;
pub mod transaction;
pub mod value;

pub use client::Client;
pub use config::RegistryConfig;
pub use context::{EvaluationContext, TARGETING_KEY, merge_contexts};
pub use error::{ErrorCode, EvaluationError, EvaluationResult, FlagwireError, HookError, Result};
pub use evaluation::{EvaluationSnapshot, Stage, evaluate};
pub use events::{EventDetails, RegistryEventHandler};
pub use hooks::{Hook, HookContext, HookHints, LoggingHook};
pub use in_memory::{
    Condition, FlagDefinition, InMemoryProvider, Operator, Rollout, TargetingRule,
};
pub use multi::{
    ComparisonStrategy, FirstMatchStrategy, FirstSuccessfulStrategy, MultiProvider,
    MultiProviderEntry, Strategy,
};
pub use options::EvaluationOptions;
pub use provider::{
    NoopProvider, Provider, ProviderCapabilities, ProviderEventDetails, ProviderEventSender,
    ProviderMetadata, ProviderStatus, TrackingEventDetails,
};
pub use registry::{FlagRegistry, WaitOptions};
pub use transaction::{
    NoopTransactionContextPropagator, TaskLocalTransactionContextPropagator,
    TransactionContextPropagator,
};
pub use value::{
    ClientMetadata, EvaluationDetails, FlagMetadata, FlagMetadataValue, FlagType, FlagValue,
    FlagValueType, ResolutionDetails, reason,
};

pub use flagwire_events::{AddHandlerOptions, HandlerId, ProviderEvent, handler_fn};
pub use flagwire_log::{Logger, SafeLogger};
pub use tokio_util::sync::CancellationToken;
