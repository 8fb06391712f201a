//! Evaluation pipeline
//!
//! Runs one flag evaluation through its stages:
//!
//! ```text
//! INIT -> BEFORE -> RESOLVING -> (AFTER | ERROR) -> FINALLY -> DONE
//! ```
//!
//! Every failure (hook error, provider error, error details, type mismatch,
//! timeout, cancellation, panic) is normalized onto the ERROR path and the
//! caller receives its default value with the error's code and message.
//! Evaluation never fails outright.

use crate::context::{EvaluationContext, merge_contexts};
use crate::error::{EvaluationError, EvaluationResult};
use crate::hooks::{Hook, HookContext, HookHints};
use crate::options::EvaluationOptions;
use crate::provider::{
    Provider, ProviderCapabilities, ProviderMetadata, ProviderStatus, resolve_flag_value,
};
use crate::value::{
    ClientMetadata, EvaluationDetails, FlagType, FlagValue, FlagValueType, ResolutionDetails,
};
use flagwire_log::{Logger, SafeLogger};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pipeline state, reported in debug traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Before,
    Resolving,
    After,
    Error,
    Finally,
    Done,
}

/// Provider, contexts and hooks captured when an evaluation starts.
///
/// Later registry mutations do not affect an evaluation holding a snapshot.
#[derive(Clone)]
pub struct EvaluationSnapshot {
    pub provider: Arc<dyn Provider>,
    pub provider_metadata: ProviderMetadata,
    pub capabilities: ProviderCapabilities,
    pub status: ProviderStatus,
    pub api_hooks: Vec<Arc<dyn Hook>>,
    pub client_hooks: Vec<Arc<dyn Hook>>,
    pub provider_hooks: Vec<Arc<dyn Hook>>,
    pub api_context: EvaluationContext,
    pub transaction_context: EvaluationContext,
    pub client_context: EvaluationContext,
    pub client_metadata: ClientMetadata,
    pub logger: SafeLogger,
    pub default_timeout: Option<Duration>,
    /// Short-circuit `FATAL` providers to `PROVIDER_FATAL`.
    pub fatal_short_circuit: bool,
}

impl EvaluationSnapshot {
    /// Snapshot with no hooks and empty contexts.
    pub fn new(provider: Arc<dyn Provider>, status: ProviderStatus) -> Self {
        Self {
            provider_metadata: provider.metadata(),
            capabilities: provider.capabilities(),
            provider_hooks: provider.hooks(),
            provider,
            status,
            api_hooks: Vec::new(),
            client_hooks: Vec::new(),
            api_context: EvaluationContext::default(),
            transaction_context: EvaluationContext::default(),
            client_context: EvaluationContext::default(),
            client_metadata: ClientMetadata::default(),
            logger: SafeLogger::default(),
            default_timeout: None,
            fatal_short_circuit: true,
        }
    }
}

/// Evaluate `flag_key` against the snapshot.
pub async fn evaluate<T: FlagType>(
    snapshot: EvaluationSnapshot,
    flag_key: &str,
    default_value: T,
    invocation_context: &EvaluationContext,
    options: EvaluationOptions,
) -> EvaluationDetails<T> {
    let EvaluationOptions {
        hooks: invocation_hooks,
        hook_hints,
        timeout,
        signal,
    } = options;

    debug!(flag_key, stage = ?Stage::Init, "evaluating flag");

    let merged = merge_contexts(
        &snapshot.api_context,
        &snapshot.transaction_context,
        &snapshot.client_context,
        invocation_context,
    );

    let mut hook_ctx = HookContext {
        flag_key: flag_key.to_string(),
        default_value: default_value.clone().into_flag_value(),
        flag_value_type: T::VALUE_TYPE,
        context: merged,
        client_metadata: snapshot.client_metadata.clone(),
        provider_metadata: snapshot.provider_metadata.clone(),
        logger: snapshot.logger.clone(),
    };

    let hooks: Vec<Arc<dyn Hook>> = snapshot
        .api_hooks
        .iter()
        .chain(&snapshot.client_hooks)
        .chain(&invocation_hooks)
        .chain(&snapshot.provider_hooks)
        .cloned()
        .collect();

    let outcome = run_stages::<T>(
        &snapshot,
        &hooks,
        &mut hook_ctx,
        &hook_hints,
        timeout.or(snapshot.default_timeout),
        signal.as_ref(),
    )
    .await;

    let (details, failed) = match outcome {
        Ok(details) => (details, false),
        Err(error) => {
            debug!(flag_key, stage = ?Stage::Error, code = %error.code, "evaluation failed");
            snapshot.logger.warn(&format!(
                "Error during evaluation of flag '{}': {}",
                flag_key, error
            ));
            run_error_hooks(&hooks, &hook_ctx, &error, &hook_hints).await;
            let details = EvaluationDetails::from_error(
                flag_key,
                hook_ctx.default_value.clone(),
                error,
                snapshot.client_metadata.clone(),
            );
            (details, true)
        }
    };

    debug!(flag_key, stage = ?Stage::Finally);
    run_finally_hooks(&hooks, &hook_ctx, &details, &hook_hints).await;

    debug!(flag_key, stage = ?Stage::Done);
    // Failed evaluations hand back the caller's default untouched; i64 does
    // not survive the trip through f64 above 2^53.
    if failed {
        details.map(|_| default_value)
    } else {
        details.map(|value| T::from_flag_value(value).unwrap_or(default_value))
    }
}

async fn run_stages<T: FlagType>(
    snapshot: &EvaluationSnapshot,
    hooks: &[Arc<dyn Hook>],
    hook_ctx: &mut HookContext,
    hints: &HookHints,
    timeout: Option<Duration>,
    signal: Option<&CancellationToken>,
) -> EvaluationResult<EvaluationDetails<FlagValue>> {
    debug!(flag_key = %hook_ctx.flag_key, stage = ?Stage::Before);
    for hook in hooks {
        if let Some(contributed) = guarded(hook.before(hook_ctx, hints)).await? {
            hook_ctx.context = hook_ctx.context.merge(&contributed);
        }
    }

    match snapshot.status {
        ProviderStatus::Fatal if snapshot.fatal_short_circuit => {
            return Err(EvaluationError::provider_fatal());
        }
        ProviderStatus::NotReady if snapshot.capabilities.initialize => {
            return Err(EvaluationError::provider_not_ready());
        }
        _ => {}
    }

    debug!(flag_key = %hook_ctx.flag_key, stage = ?Stage::Resolving);
    let resolution = race_resolution(
        Arc::clone(&snapshot.provider),
        &hook_ctx.flag_key,
        hook_ctx.flag_value_type,
        hook_ctx.default_value.clone(),
        hook_ctx.context.clone(),
        ResolutionLimits {
            timeout,
            signal,
            synchronous: snapshot.capabilities.synchronous_resolution,
        },
        &snapshot.logger,
    )
    .await?;

    if let Some(error) = resolution.evaluation_error() {
        return Err(error);
    }
    if T::from_flag_value(resolution.value.clone()).is_none() {
        return Err(EvaluationError::type_mismatch(
            &hook_ctx.flag_key,
            hook_ctx.flag_value_type,
        ));
    }

    let details = EvaluationDetails::from_resolution(
        hook_ctx.flag_key.clone(),
        resolution,
        hook_ctx.client_metadata.clone(),
    );

    debug!(flag_key = %hook_ctx.flag_key, stage = ?Stage::After);
    for hook in hooks {
        guarded(hook.after(hook_ctx, &details, hints)).await?;
    }

    Ok(details)
}

async fn run_error_hooks(
    hooks: &[Arc<dyn Hook>],
    hook_ctx: &HookContext,
    error: &EvaluationError,
    hints: &HookHints,
) {
    for hook in hooks.iter().rev() {
        if let Err(e) = guarded(hook.error(hook_ctx, error, hints)).await {
            hook_ctx
                .logger
                .error(&format!("Unhandled error during 'error' hook: {}", e));
        }
    }
}

async fn run_finally_hooks(
    hooks: &[Arc<dyn Hook>],
    hook_ctx: &HookContext,
    details: &EvaluationDetails<FlagValue>,
    hints: &HookHints,
) {
    for hook in hooks.iter().rev() {
        if let Err(e) = guarded(hook.finally(hook_ctx, details, hints)).await {
            hook_ctx
                .logger
                .error(&format!("Unhandled error during 'finally' hook: {}", e));
        }
    }
}

/// Await a hook stage, turning a panic into a `GENERAL` error.
async fn guarded<R>(
    stage: impl Future<Output = Result<R, EvaluationError>>,
) -> Result<R, EvaluationError> {
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(EvaluationError::general(format!(
            "hook panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounds placed on one provider call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionLimits<'a> {
    pub timeout: Option<Duration>,
    pub signal: Option<&'a CancellationToken>,
    /// The provider cannot suspend, so there is nothing to race.
    pub synchronous: bool,
}

/// Race the provider call against the timeout and the cancellation token.
///
/// The first to settle wins. A losing provider call keeps running on its own
/// task and its result is discarded. Cancellation wins over timeout.
pub async fn race_resolution(
    provider: Arc<dyn Provider>,
    flag_key: &str,
    value_type: FlagValueType,
    default_value: FlagValue,
    context: EvaluationContext,
    limits: ResolutionLimits<'_>,
    logger: &SafeLogger,
) -> EvaluationResult<ResolutionDetails<FlagValue>> {
    if limits.signal.is_some_and(CancellationToken::is_cancelled) {
        return Err(EvaluationError::cancelled());
    }

    if limits.synchronous {
        if let Some(timeout) = limits.timeout {
            logger.warn(&format!(
                "Timeout of {}ms is not supported by synchronous provider '{}'; ignoring it",
                timeout.as_millis(),
                provider.metadata().name
            ));
        }
        return resolve_inline(provider.as_ref(), flag_key, value_type, default_value, &context)
            .await;
    }

    let ((Some(_), _) | (_, Some(_))) = (limits.timeout, limits.signal) else {
        return resolve_inline(provider.as_ref(), flag_key, value_type, default_value, &context)
            .await;
    };

    let key = flag_key.to_string();
    let task = tokio::spawn(async move {
        resolve_flag_value(provider.as_ref(), &key, value_type, default_value, &context).await
    });

    let cancelled = async {
        match limits.signal {
            Some(signal) => signal.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let timer = async {
        match limits.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(EvaluationError::cancelled()),
        joined = task => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(EvaluationError::general(format!(
                "provider panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))),
            Err(e) => Err(EvaluationError::general(format!("provider task failed: {}", e))),
        },
        _ = timer => Err(EvaluationError::timeout(limits.timeout.unwrap_or_default())),
    }
}

async fn resolve_inline(
    provider: &dyn Provider,
    flag_key: &str,
    value_type: FlagValueType,
    default_value: FlagValue,
    context: &EvaluationContext,
) -> EvaluationResult<ResolutionDetails<FlagValue>> {
    let call = resolve_flag_value(provider, flag_key, value_type, default_value, context);
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(EvaluationError::general(format!(
            "provider panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::testing::{RecordingHook, ScriptedProvider, StageLog};
    use crate::value::reason;
    use flagwire_log::{BufferLogger, Level};
    use tokio::time::Instant;

    fn snapshot(provider: ScriptedProvider) -> (EvaluationSnapshot, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        (
            EvaluationSnapshot::new(provider.clone(), ProviderStatus::Ready),
            provider,
        )
    }

    #[tokio::test]
    async fn test_success_runs_hooks_in_order() {
        let log = StageLog::new();
        let (mut snap, _) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        snap.api_hooks = vec![Arc::new(RecordingHook::new("api", log.clone()))];
        snap.client_hooks = vec![Arc::new(RecordingHook::new("client", log.clone()))];
        let options =
            EvaluationOptions::new().with_hook(Arc::new(RecordingHook::new("call", log.clone())));

        let details = evaluate(snap, "on", false, &EvaluationContext::new(), options).await;

        assert!(details.value);
        assert_eq!(details.reason.as_deref(), Some(reason::STATIC));
        assert_eq!(
            log.entries(),
            vec![
                "api:before",
                "client:before",
                "call:before",
                "api:after",
                "client:after",
                "call:after",
                "call:finally",
                "client:finally",
                "api:finally",
            ]
        );
    }

    #[tokio::test]
    async fn test_provider_error_runs_error_hooks_in_reverse() {
        let log = StageLog::new();
        let a = Arc::new(RecordingHook::new("a", log.clone()));
        let (mut snap, _) = snapshot(
            ScriptedProvider::new("p").with_error("flag", EvaluationError::general("backend down")),
        );
        snap.api_hooks = vec![a.clone(), Arc::new(RecordingHook::new("b", log.clone()))];

        let details = evaluate(
            snap,
            "flag",
            "fallback".to_string(),
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert_eq!(details.value, "fallback");
        assert_eq!(details.error_code, Some(ErrorCode::General));
        assert_eq!(details.error_message.as_deref(), Some("backend down"));
        assert_eq!(details.reason.as_deref(), Some(reason::ERROR));
        assert_eq!(log.stage("error"), vec!["b:error", "a:error"]);
        assert_eq!(log.stage("finally"), vec!["b:finally", "a:finally"]);
        assert!(log.stage("after").is_empty());
        assert_eq!(a.seen_errors()[0].message, "backend down");
    }

    #[tokio::test]
    async fn test_failing_before_hook_skips_resolution() {
        let log = StageLog::new();
        let (mut snap, provider) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        snap.api_hooks = vec![
            Arc::new(RecordingHook::new("a", log.clone()).failing_in("before")),
            Arc::new(RecordingHook::new("b", log.clone())),
        ];

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert!(!details.value);
        assert_eq!(details.error_code, Some(ErrorCode::General));
        assert_eq!(provider.calls(), 0);
        assert_eq!(log.stage("before"), vec!["a:before"]);
        assert_eq!(log.stage("error"), vec!["b:error", "a:error"]);
    }

    #[tokio::test]
    async fn test_failing_after_hook_degrades_to_default() {
        let log = StageLog::new();
        let (mut snap, _) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        snap.api_hooks = vec![
            Arc::new(RecordingHook::new("a", log.clone()).failing_in("after")),
            Arc::new(RecordingHook::new("b", log.clone())),
        ];

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert!(!details.value);
        assert_eq!(log.stage("after"), vec!["a:after"]);
        assert_eq!(log.stage("error"), vec!["b:error", "a:error"]);
    }

    #[tokio::test]
    async fn test_error_and_finally_failures_are_logged_only() {
        let buffer = BufferLogger::new();
        let log = StageLog::new();
        let (mut snap, _) = snapshot(ScriptedProvider::new("p"));
        snap.logger = SafeLogger::new(Arc::new(buffer.clone()));
        snap.api_hooks = vec![
            Arc::new(RecordingHook::new("a", log.clone())),
            Arc::new(RecordingHook::new("b", log.clone()).failing_in("error")),
            Arc::new(RecordingHook::new("c", log.clone()).failing_in("finally")),
        ];

        let details = evaluate(
            snap,
            "missing",
            1.5,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert_eq!(details.value, 1.5);
        assert_eq!(details.error_code, Some(ErrorCode::FlagNotFound));
        assert_eq!(log.stage("error"), vec!["c:error", "b:error", "a:error"]);
        assert_eq!(log.stage("finally"), vec!["c:finally", "b:finally", "a:finally"]);
        assert!(buffer.contains(Level::Error, "'error' hook"));
        assert!(buffer.contains(Level::Error, "'finally' hook"));
    }

    #[tokio::test]
    async fn test_before_hooks_contribute_context() {
        let log = StageLog::new();
        let second = Arc::new(RecordingHook::new("second", log.clone()));
        let (mut snap, _) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        snap.api_context = EvaluationContext::new()
            .with_attribute("region", "us")
            .with_attribute("tier", "free");
        snap.api_hooks = vec![
            Arc::new(
                RecordingHook::new("first", log.clone())
                    .contributing(EvaluationContext::new().with_attribute("region", "eu")),
            ),
            second.clone(),
        ];

        evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        let seen = &second.seen_contexts()[0];
        assert_eq!(seen.get_str("region").as_deref(), Some("eu"));
        assert_eq!(seen.get_str("tier").as_deref(), Some("free"));
    }

    #[tokio::test]
    async fn test_error_code_details_return_default() {
        let (snap, _) = snapshot(
            ScriptedProvider::new("p").with_details(
                "flag",
                ResolutionDetails::new(FlagValue::Bool(true))
                    .with_variant("on")
                    .with_reason(reason::TARGETING_MATCH),
            ),
        );
        let mut details = ResolutionDetails::new(FlagValue::Bool(true));
        details.error_code = Some(ErrorCode::ParseError);
        details.error_message = Some("bad rule".to_string());
        let (errored, _) = snapshot(ScriptedProvider::new("p").with_details("flag", details));

        let ok = evaluate(snap, "flag", false, &EvaluationContext::new(), EvaluationOptions::new())
            .await;
        assert!(ok.value);
        assert_eq!(ok.variant.as_deref(), Some("on"));

        let degraded = evaluate(
            errored,
            "flag",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;
        assert!(!degraded.value);
        assert_eq!(degraded.error_code, Some(ErrorCode::ParseError));
        assert_eq!(degraded.error_message.as_deref(), Some("bad rule"));
        assert_eq!(degraded.variant, None);
    }

    #[tokio::test]
    async fn test_integer_accessor_rejects_fraction() {
        let (snap, _) = snapshot(ScriptedProvider::new("p").with_flag("ratio", 0.5));

        let details = evaluate(
            snap,
            "ratio",
            7_i64,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert_eq!(details.value, 7);
        assert_eq!(details.error_code, Some(ErrorCode::TypeMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_race() {
        let (snap, _) = snapshot(
            ScriptedProvider::new("slow")
                .with_flag("on", true)
                .with_delay(Duration::from_millis(200)),
        );
        let started = Instant::now();

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new().with_timeout_ms(50),
        )
        .await;

        assert!(!details.value);
        assert_eq!(details.error_code, Some(ErrorCode::General));
        assert!(details
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with(crate::error::TIMEOUT_MESSAGE)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let (mut snap, _) = snapshot(
            ScriptedProvider::new("slow")
                .with_flag("on", true)
                .with_delay(Duration::from_millis(200)),
        );
        snap.default_timeout = Some(Duration::from_millis(20));

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert!(details.error_message.unwrap().contains("20ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_provider_beats_timeout() {
        let (snap, _) = snapshot(
            ScriptedProvider::new("fast")
                .with_flag("on", true)
                .with_delay(Duration::from_millis(10)),
        );

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new().with_timeout_ms(50),
        )
        .await;

        assert!(details.value);
        assert_eq!(details.error_code, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_token_beats_timeout() {
        let (snap, provider) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        let token = CancellationToken::new();
        token.cancel();

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new()
                .with_timeout(Duration::ZERO)
                .with_cancellation(token),
        )
        .await;

        assert_eq!(
            details.error_message.as_deref(),
            Some(crate::error::CANCELLED_MESSAGE)
        );
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_resolution() {
        let (snap, _) = snapshot(
            ScriptedProvider::new("slow")
                .with_flag("on", true)
                .with_delay(Duration::from_secs(10)),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new().with_cancellation(token),
        )
        .await;

        assert!(details.error_message.unwrap().contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fatal_short_circuits_without_calling_provider() {
        let (mut snap, provider) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        snap.status = ProviderStatus::Fatal;

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert_eq!(details.error_code, Some(ErrorCode::ProviderFatal));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_not_ready_initializing_provider_short_circuits() {
        let (mut snap, provider) = snapshot(ScriptedProvider::new("p").with_flag("on", true));
        snap.status = ProviderStatus::NotReady;
        snap.capabilities = ProviderCapabilities::new().with_initialize();

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert_eq!(details.error_code, Some(ErrorCode::ProviderNotReady));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_panic_becomes_general_error() {
        let (snap, _) = snapshot(ScriptedProvider::new("p").with_panic("on", "kaboom"));

        let details = evaluate(
            snap,
            "on",
            true,
            &EvaluationContext::new(),
            EvaluationOptions::new(),
        )
        .await;

        assert!(details.value);
        assert_eq!(details.error_code, Some(ErrorCode::General));
        assert!(details.error_message.unwrap().contains("kaboom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_provider_ignores_timeout() {
        let buffer = BufferLogger::new();
        let (mut snap, _) = snapshot(
            ScriptedProvider::new("sync")
                .with_flag("on", true)
                .with_delay(Duration::from_millis(100)),
        );
        snap.capabilities = ProviderCapabilities::new().with_synchronous_resolution();
        snap.logger = SafeLogger::new(Arc::new(buffer.clone()));

        let details = evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new().with_timeout_ms(10),
        )
        .await;

        assert!(details.value);
        assert!(buffer.contains(Level::Warn, "not supported"));
    }

    #[tokio::test]
    async fn test_hook_hints_reach_every_stage() {
        let log = StageLog::new();
        let hook = Arc::new(RecordingHook::new("h", log));
        let (snap, _) = snapshot(ScriptedProvider::new("p").with_flag("on", true));

        evaluate(
            snap,
            "on",
            false,
            &EvaluationContext::new(),
            EvaluationOptions::new()
                .with_hook(hook.clone())
                .with_hook_hint("trace", "abc"),
        )
        .await;

        let hints = hook.seen_hints();
        assert_eq!(hints.len(), 3);
        assert!(hints.iter().all(|h| h.get("trace") == Some(&serde_json::json!("abc"))));
    }
}
