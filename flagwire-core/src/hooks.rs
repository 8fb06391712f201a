//! Evaluation hooks
//!
//! Hooks are user-supplied extension points invoked around one evaluation:
//! `before` may contribute context, `after` observes a successful result,
//! `error` observes the failure that degraded the evaluation, and
//! `finally` always runs last.
//!
//! ## Ordering
//!
//! Hooks registered at API, client and invocation scope (plus any the
//! provider supplies) are concatenated in that order. `before` and `after`
//! run front to back; `error` and `finally` run back to front.
//!
//! ```
//! use flagwire_core::*;
//! use async_trait::async_trait;
//! use std::result::Result;
//!
//! struct AddRegion;
//!
//! #[async_trait]
//! impl Hook for AddRegion {
//!     async fn before(
//!         &self,
//!         _ctx: &HookContext,
//!         _hints: &HookHints,
//!     ) -> Result<Option<EvaluationContext>, HookError> {
//!         Ok(Some(EvaluationContext::new().with_attribute("region", "eu")))
//!     }
//! }
//! ```

use crate::context::EvaluationContext;
use crate::error::{EvaluationError, HookError};
use crate::provider::ProviderMetadata;
use crate::value::{ClientMetadata, EvaluationDetails, FlagValue, FlagValueType};
use async_trait::async_trait;
use flagwire_log::{Logger, SafeLogger};

/// Free-form data passed to every stage of every hook.
pub type HookHints = serde_json::Map<String, serde_json::Value>;

/// Per-evaluation record threaded through all hook stages.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub flag_key: String,
    pub default_value: FlagValue,
    pub flag_value_type: FlagValueType,
    /// Grows as `before` hooks contribute context.
    pub context: EvaluationContext,
    pub client_metadata: ClientMetadata,
    pub provider_metadata: ProviderMetadata,
    pub logger: SafeLogger,
}

#[async_trait]
pub trait Hook: Send + Sync {
    /// Returned context is merged over the running evaluation context.
    async fn before(
        &self,
        _ctx: &HookContext,
        _hints: &HookHints,
    ) -> Result<Option<EvaluationContext>, HookError> {
        Ok(None)
    }

    async fn after(
        &self,
        _ctx: &HookContext,
        _details: &EvaluationDetails<FlagValue>,
        _hints: &HookHints,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Failures here are logged, never propagated.
    async fn error(
        &self,
        _ctx: &HookContext,
        _error: &EvaluationError,
        _hints: &HookHints,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Failures here are logged, never propagated.
    async fn finally(
        &self,
        _ctx: &HookContext,
        _details: &EvaluationDetails<FlagValue>,
        _hints: &HookHints,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hook that logs every stage through the evaluation's logger.
#[derive(Debug, Clone, Default)]
pub struct LoggingHook {
    include_evaluation_context: bool,
}

impl LoggingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log the evaluation context (may contain personal data).
    pub fn with_evaluation_context(mut self, include: bool) -> Self {
        self.include_evaluation_context = include;
        self
    }

    fn describe(&self, stage: &str, ctx: &HookContext) -> String {
        let mut line = format!(
            "stage={} domain={} provider={} flag_key={} default_value={}",
            stage,
            ctx.client_metadata.domain.as_deref().unwrap_or("-"),
            ctx.provider_metadata.name,
            ctx.flag_key,
            render(&ctx.default_value),
        );
        if self.include_evaluation_context {
            let rendered = serde_json::to_string(&ctx.context).unwrap_or_default();
            line.push_str(&format!(" evaluation_context={}", rendered));
        }
        line
    }
}

fn render(value: &FlagValue) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[async_trait]
impl Hook for LoggingHook {
    async fn before(
        &self,
        ctx: &HookContext,
        _hints: &HookHints,
    ) -> Result<Option<EvaluationContext>, HookError> {
        ctx.logger.debug(&self.describe("before", ctx));
        Ok(None)
    }

    async fn after(
        &self,
        ctx: &HookContext,
        details: &EvaluationDetails<FlagValue>,
        _hints: &HookHints,
    ) -> Result<(), HookError> {
        ctx.logger.debug(&format!(
            "{} reason={} variant={} value={}",
            self.describe("after", ctx),
            details.reason.as_deref().unwrap_or("-"),
            details.variant.as_deref().unwrap_or("-"),
            render(&details.value),
        ));
        Ok(())
    }

    async fn error(
        &self,
        ctx: &HookContext,
        error: &EvaluationError,
        _hints: &HookHints,
    ) -> Result<(), HookError> {
        ctx.logger.error(&format!(
            "{} error_code={} error_message={}",
            self.describe("error", ctx),
            error.code,
            error.message,
        ));
        Ok(())
    }
}
