// flagwire - a provider-agnostic feature flag evaluation client
//
// Applications ask what value a flag has for a context and receive the value
// together with how it was decided, without coupling to the flag source.

// Re-export core functionality
pub use flagwire_core::*;

// Re-export the supporting crates
pub use flagwire_events;
pub use flagwire_log;

// Re-export async_trait for custom providers and hooks
pub use async_trait::async_trait;

/// Everything needed to set up a registry and evaluate flags.
///
/// ```
/// use flagwire::prelude::*;
///
/// # async fn example() -> flagwire::Result<()> {
/// let registry = FlagRegistry::new();
/// registry
///     .set_provider_and_wait(
///         Arc::new(InMemoryProvider::new().with_flag(FlagDefinition::boolean("beta", false))),
///         WaitOptions::new(),
///     )
///     .await?;
///
/// let beta = registry.get_client().get_boolean_value("beta", true, None, None).await;
/// assert!(!beta);
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use flagwire_core::{
        CancellationToken, Client, ErrorCode, EvaluationContext, EvaluationDetails,
        EvaluationError, EvaluationOptions, EventDetails, FlagDefinition, FlagRegistry, FlagType,
        FlagValue, FlagwireError, Hook, HookContext, HookError, HookHints, InMemoryProvider,
        LoggingHook, Provider, ProviderCapabilities, ProviderEvent, ProviderMetadata,
        ProviderStatus, RegistryConfig, ResolutionDetails, TrackingEventDetails, WaitOptions,
        handler_fn, reason,
    };
    pub use flagwire_log::{ConsoleLogger, LogConfig, Logger, TracingLogger};

    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
