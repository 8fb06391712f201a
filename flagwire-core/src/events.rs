// Provider events as seen by registry and client subscribers

use crate::error::ErrorCode;
use crate::provider::ProviderEventDetails;
use crate::value::FlagMetadata;
use flagwire_events::SharedEventHandler;

/// Payload delivered to registry and client event handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetails {
    /// Name of the provider the event concerns.
    pub provider_name: String,
    /// Domain the provider was registered for; `None` for the default.
    pub domain: Option<String>,
    pub message: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Keys whose definitions changed (`ConfigurationChanged` only).
    pub flags_changed: Vec<String>,
    pub metadata: FlagMetadata,
    pub(crate) source: u64,
}

impl EventDetails {
    pub(crate) fn from_provider(
        source: u64,
        provider_name: impl Into<String>,
        domain: Option<String>,
        details: ProviderEventDetails,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            domain,
            message: details.message,
            error_code: details.error_code,
            flags_changed: details.flags_changed,
            metadata: details.metadata,
            source,
        }
    }
}

/// Handler type accepted by the registry and clients.
pub type RegistryEventHandler = SharedEventHandler<EventDetails>;
