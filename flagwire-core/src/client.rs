//! Client facade
//!
//! A [`Client`] is a lightweight handle onto a [`FlagRegistry`] bound to
//! one domain (or the default provider). It carries its own evaluation
//! context and hooks, which sit between the API-level ones and those
//! supplied per invocation.

use crate::context::{EvaluationContext, merge_contexts};
use crate::evaluation::evaluate;
use crate::events::RegistryEventHandler;
use crate::hooks::Hook;
use crate::options::EvaluationOptions;
use crate::provider::{ProviderMetadata, ProviderStatus, TrackingEventDetails};
use crate::registry::FlagRegistry;
use crate::value::{ClientMetadata, EvaluationDetails, FlagType};
use flagwire_events::{AddHandlerOptions, HandlerId, ProviderEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Evaluates flags against the provider bound to its domain.
///
/// Clones share context and hooks.
#[derive(Clone)]
pub struct Client {
    registry: FlagRegistry,
    metadata: ClientMetadata,
    context: Arc<RwLock<EvaluationContext>>,
    hooks: Arc<RwLock<Vec<Arc<dyn Hook>>>>,
}

impl Client {
    pub(crate) fn new(registry: FlagRegistry, domain: Option<String>) -> Self {
        Self {
            registry,
            metadata: ClientMetadata { domain },
            context: Arc::new(RwLock::new(EvaluationContext::default())),
            hooks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn metadata(&self) -> &ClientMetadata {
        &self.metadata
    }

    pub fn domain(&self) -> Option<&str> {
        self.metadata.domain.as_deref()
    }

    /// Metadata of the provider currently serving this client.
    pub fn provider_metadata(&self) -> ProviderMetadata {
        self.registry.entry_for(self.domain()).metadata.clone()
    }

    pub fn provider_status(&self) -> ProviderStatus {
        self.registry.entry_for(self.domain()).status()
    }

    // ----- context and hooks -----

    pub fn set_context(&self, context: EvaluationContext) {
        *self.context.write() = context;
    }

    pub fn get_context(&self) -> EvaluationContext {
        self.context.read().clone()
    }

    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().push(hook);
    }

    pub fn add_hooks(&self, hooks: impl IntoIterator<Item = Arc<dyn Hook>>) {
        self.hooks.write().extend(hooks);
    }

    pub fn get_hooks(&self) -> Vec<Arc<dyn Hook>> {
        self.hooks.read().clone()
    }

    pub fn clear_hooks(&self) {
        self.hooks.write().clear();
    }

    // ----- evaluation -----

    /// Evaluate `flag_key` as `T`, returning full details.
    ///
    /// Never fails: errors degrade to `default_value` and are reported
    /// through `error_code` and `error_message`.
    pub async fn get_details<T: FlagType>(
        &self,
        flag_key: &str,
        default_value: T,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> EvaluationDetails<T> {
        let snapshot = self
            .registry
            .snapshot(self.domain(), self.get_context(), self.get_hooks());
        let empty = EvaluationContext::default();
        evaluate(
            snapshot,
            flag_key,
            default_value,
            context.unwrap_or(&empty),
            options.unwrap_or_default(),
        )
        .await
    }

    pub async fn get_value<T: FlagType>(
        &self,
        flag_key: &str,
        default_value: T,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> T {
        self.get_details(flag_key, default_value, context, options)
            .await
            .value
    }

    pub async fn get_boolean_value(
        &self,
        flag_key: &str,
        default_value: bool,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> bool {
        self.get_value(flag_key, default_value, context, options)
            .await
    }

    pub async fn get_boolean_details(
        &self,
        flag_key: &str,
        default_value: bool,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> EvaluationDetails<bool> {
        self.get_details(flag_key, default_value, context, options)
            .await
    }

    pub async fn get_string_value(
        &self,
        flag_key: &str,
        default_value: impl Into<String>,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> String {
        self.get_value(flag_key, default_value.into(), context, options)
            .await
    }

    pub async fn get_string_details(
        &self,
        flag_key: &str,
        default_value: impl Into<String>,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> EvaluationDetails<String> {
        self.get_details(flag_key, default_value.into(), context, options)
            .await
    }

    pub async fn get_number_value(
        &self,
        flag_key: &str,
        default_value: f64,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> f64 {
        self.get_value(flag_key, default_value, context, options)
            .await
    }

    pub async fn get_number_details(
        &self,
        flag_key: &str,
        default_value: f64,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> EvaluationDetails<f64> {
        self.get_details(flag_key, default_value, context, options)
            .await
    }

    /// Number flag that must hold a whole value; fractions are a
    /// `TYPE_MISMATCH`.
    pub async fn get_integer_value(
        &self,
        flag_key: &str,
        default_value: i64,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> i64 {
        self.get_value(flag_key, default_value, context, options)
            .await
    }

    pub async fn get_integer_details(
        &self,
        flag_key: &str,
        default_value: i64,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> EvaluationDetails<i64> {
        self.get_details(flag_key, default_value, context, options)
            .await
    }

    pub async fn get_object_value(
        &self,
        flag_key: &str,
        default_value: Value,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> Value {
        self.get_value(flag_key, default_value, context, options)
            .await
    }

    pub async fn get_object_details(
        &self,
        flag_key: &str,
        default_value: Value,
        context: Option<&EvaluationContext>,
        options: Option<EvaluationOptions>,
    ) -> EvaluationDetails<Value> {
        self.get_details(flag_key, default_value, context, options)
            .await
    }

    // ----- tracking -----

    /// Record a user action with the bound provider.
    ///
    /// No-op unless the provider tracks events and is `READY`.
    pub fn track(
        &self,
        event_name: &str,
        context: Option<&EvaluationContext>,
        details: TrackingEventDetails,
    ) {
        let empty = EvaluationContext::default();
        let merged = merge_contexts(
            &self.registry.get_context(),
            &self.registry.get_transaction_context(),
            &self.get_context(),
            context.unwrap_or(&empty),
        );
        self.registry
            .track(self.domain(), event_name, &merged, &details);
    }

    // ----- events -----

    /// Subscribe to events from the provider currently bound to this
    /// client's domain.
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
        self.registry
            .add_client_handler(self.metadata.domain.clone(), event, handler, options)
            .await
    }

    pub fn remove_handler(&self, event: ProviderEvent, id: HandlerId) -> bool {
        self.registry.remove_handler(event, id)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("domain", &self.metadata.domain)
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}
