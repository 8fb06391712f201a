//! Integration tests for the evaluation pipeline as seen through the
//! registry and its clients.

use flagwire_core::testing::{RecordingHook, ScriptedProvider, StageLog};
use flagwire_core::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn registry_with(provider: Arc<ScriptedProvider>) -> FlagRegistry {
    let registry = FlagRegistry::new();
    assert_ok!(
        registry
            .set_provider_and_wait(provider, WaitOptions::new())
            .await
    );
    registry
}

fn event_log() -> (RegistryEventHandler, Arc<Mutex<Vec<EventDetails>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |_event: ProviderEvent, details: &EventDetails| {
        sink.lock().push(details.clone());
        Ok(())
    });
    (handler, seen)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Hook pipeline
// =============================================================================

#[tokio::test]
async fn test_hook_stages_run_in_order() {
    let provider = Arc::new(ScriptedProvider::new("p").with_flag("flag", true));
    let registry = registry_with(provider).await;
    let log = StageLog::new();
    registry.add_hook(Arc::new(RecordingHook::new("A", log.clone())));
    let client = registry.get_client();
    client.add_hook(Arc::new(RecordingHook::new("B", log.clone())));

    let value = client
        .get_boolean_value(
            "flag",
            false,
            None,
            Some(EvaluationOptions::new().with_hook(Arc::new(RecordingHook::new("C", log.clone())))),
        )
        .await;

    assert!(value);
    assert_eq!(
        log.entries(),
        vec![
            "A:before", "B:before", "C:before", "A:after", "B:after", "C:after", "C:finally",
            "B:finally", "A:finally",
        ]
    );
}

#[tokio::test]
async fn test_error_hooks_unwind_in_reverse() {
    let provider = Arc::new(
        ScriptedProvider::new("p").with_error("flag", EvaluationError::general("backend down")),
    );
    let registry = registry_with(provider).await;
    let log = StageLog::new();
    registry.add_hook(Arc::new(RecordingHook::new("A", log.clone())));
    let client = registry.get_client();
    client.add_hook(Arc::new(RecordingHook::new("B", log.clone())));

    let details = client.get_string_details("flag", "fallback", None, None).await;

    assert_eq!(details.value, "fallback");
    assert_eq!(details.error_code, Some(ErrorCode::General));
    assert_eq!(details.error_message.as_deref(), Some("backend down"));
    assert_eq!(log.stage("error"), vec!["B:error", "A:error"]);
    assert!(log.stage("after").is_empty());
    assert_eq!(log.stage("finally"), vec!["B:finally", "A:finally"]);
}

#[tokio::test]
async fn test_before_hook_context_reaches_provider_hooks() {
    let log = StageLog::new();
    let observer = Arc::new(RecordingHook::new("provider", log.clone()));
    let provider = Arc::new(
        ScriptedProvider::new("p")
            .with_flag("flag", 1.0)
            .with_hook(observer.clone()),
    );
    let registry = registry_with(provider).await;
    registry.add_hook(Arc::new(
        RecordingHook::new("api", log.clone())
            .contributing(EvaluationContext::new().with_attribute("plan", "pro")),
    ));

    registry
        .get_client()
        .get_number_value("flag", 0.0, None, None)
        .await;

    let seen = observer.seen_contexts();
    assert!(!seen.is_empty());
    assert_eq!(seen[0].get_str("plan").as_deref(), Some("pro"));
}

#[tokio::test]
async fn test_provider_error_code_degrades_to_default() {
    let provider = Arc::new(ScriptedProvider::new("p").with_details(
        "flag",
        ResolutionDetails::error(
            FlagValue::Bool(true),
            EvaluationError::new(ErrorCode::ParseError, "bad json"),
        ),
    ));
    let registry = registry_with(provider).await;

    let details = registry
        .get_client()
        .get_boolean_details("flag", false, None, None)
        .await;

    assert!(!details.value);
    assert_eq!(details.error_code, Some(ErrorCode::ParseError));
}

#[tokio::test]
async fn test_unknown_flag_is_not_found() {
    let registry = registry_with(Arc::new(ScriptedProvider::new("p"))).await;

    let details = registry
        .get_client()
        .get_integer_details("missing", 3, None, None)
        .await;

    assert_eq!(details.value, 3);
    assert_eq!(details.error_code, Some(ErrorCode::FlagNotFound));
    assert_eq!(details.flag_key, "missing");
}

#[tokio::test]
async fn test_failed_integer_evaluation_keeps_exact_default() {
    let registry = registry_with(Arc::new(ScriptedProvider::new("p"))).await;
    let default = 9_007_199_254_740_993_i64;

    let details = registry
        .get_client()
        .get_integer_details("missing", default, None, None)
        .await;

    assert_eq!(details.error_code, Some(ErrorCode::FlagNotFound));
    assert_eq!(details.value, default);
}

// =============================================================================
// Timeouts and cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_default() {
    let provider = Arc::new(
        ScriptedProvider::new("slow")
            .with_flag("flag", true)
            .with_delay(Duration::from_millis(500)),
    );
    let registry = registry_with(provider).await;
    let log = StageLog::new();

    let details = registry
        .get_client()
        .get_boolean_details(
            "flag",
            false,
            None,
            Some(
                EvaluationOptions::new()
                    .with_timeout_ms(100)
                    .with_hook(Arc::new(RecordingHook::new("h", log.clone()))),
            ),
        )
        .await;

    assert!(!details.value);
    assert_eq!(details.error_code, Some(ErrorCode::General));
    assert!(details.error_message.unwrap().starts_with("evaluation timed out"));
    assert_eq!(log.stage("error"), vec!["h:error"]);
    assert_eq!(log.stage("finally"), vec!["h:finally"]);
}

#[tokio::test(start_paused = true)]
async fn test_registry_default_timeout_applies() {
    let registry = FlagRegistry::with_config(RegistryConfig::new().default_timeout_ms(50));
    registry
        .set_provider_and_wait(
            Arc::new(
                ScriptedProvider::new("slow")
                    .with_flag("flag", true)
                    .with_delay(Duration::from_secs(1)),
            ),
            WaitOptions::new(),
        )
        .await
        .unwrap();

    let details = registry
        .get_client()
        .get_boolean_details("flag", false, None, None)
        .await;

    assert!(details.error_message.unwrap().starts_with("evaluation timed out"));
}

#[tokio::test]
async fn test_cancellation_before_call() {
    let provider = Arc::new(ScriptedProvider::new("p").with_flag("flag", true));
    let registry = registry_with(provider.clone()).await;
    let signal = CancellationToken::new();
    signal.cancel();

    let details = registry
        .get_client()
        .get_boolean_details(
            "flag",
            false,
            None,
            Some(EvaluationOptions::new().with_cancellation(signal).with_timeout_ms(10)),
        )
        .await;

    assert!(!details.value);
    assert!(details.error_message.unwrap().starts_with("evaluation cancelled"));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_flight() {
    let provider = Arc::new(
        ScriptedProvider::new("slow")
            .with_flag("flag", "late".to_string())
            .with_delay(Duration::from_secs(10)),
    );
    let registry = registry_with(provider).await;
    let signal = CancellationToken::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let details = registry
        .get_client()
        .get_string_details(
            "flag",
            "early",
            None,
            Some(EvaluationOptions::new().with_cancellation(signal)),
        )
        .await;

    assert_eq!(details.value, "early");
    assert!(details.error_message.unwrap().starts_with("evaluation cancelled"));
}

// =============================================================================
// Provider lifecycle
// =============================================================================

#[tokio::test]
async fn test_noop_provider_defaults_and_no_ready_event() {
    let registry = FlagRegistry::new();
    let (handler, seen) = event_log();
    registry.add_handler(ProviderEvent::Ready, handler).await;

    let details = registry
        .get_client()
        .get_boolean_details("anything", true, None, None)
        .await;
    settle().await;

    assert!(details.value);
    assert_eq!(details.reason.as_deref(), Some(reason::NOOP));
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_fatal_provider_short_circuits() {
    let provider = Arc::new(
        ScriptedProvider::new("p")
            .with_capabilities(ProviderCapabilities::new().with_events())
            .with_flag("flag", true),
    );
    let registry = registry_with(provider.clone()).await;
    settle().await;
    provider.emit(
        ProviderEventDetails::new(ProviderEvent::Error)
            .with_error_code(ErrorCode::ProviderFatal)
            .with_message("revoked"),
    );
    settle().await;

    let details = registry
        .get_client()
        .get_boolean_details("flag", false, None, None)
        .await;

    assert_eq!(details.error_code, Some(ErrorCode::ProviderFatal));
    assert!(!details.value);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_not_ready_provider_short_circuits() {
    let provider = Arc::new(
        ScriptedProvider::full_lifecycle("slow")
            .with_flag("flag", true)
            .with_init_delay(Duration::from_secs(60)),
    );
    let registry = FlagRegistry::new();
    registry.set_provider(provider.clone()).await;

    let details = registry
        .get_client()
        .get_boolean_details("flag", false, None, None)
        .await;

    assert_eq!(details.error_code, Some(ErrorCode::ProviderNotReady));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_set_provider_and_wait_surfaces_failure() {
    let registry = FlagRegistry::new();
    let (handler, seen) = event_log();
    registry.add_handler(ProviderEvent::Error, handler).await;

    let result = registry
        .set_provider_and_wait(
            Arc::new(
                ScriptedProvider::full_lifecycle("broken")
                    .failing_initialize(EvaluationError::general("no credentials")),
            ),
            WaitOptions::new(),
        )
        .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("no credentials"));
    settle().await;
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].provider_name, "broken");
    assert_eq!(seen[0].message.as_deref(), Some("no credentials"));
}

#[tokio::test]
async fn test_ready_event_after_initialization() {
    let registry = FlagRegistry::new();
    let (handler, seen) = event_log();
    registry.add_handler(ProviderEvent::Ready, handler).await;

    registry
        .set_provider_and_wait(
            Arc::new(ScriptedProvider::full_lifecycle("remote")),
            WaitOptions::new(),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].provider_name, "remote");
    assert_eq!(seen.lock()[0].domain, None);
}

#[tokio::test]
async fn test_configuration_changed_is_forwarded() {
    let provider = Arc::new(InMemoryProvider::new().with_flag(FlagDefinition::boolean("a", true)));
    let registry = FlagRegistry::new();
    registry
        .set_provider_and_wait(provider.clone(), WaitOptions::new())
        .await
        .unwrap();
    let (handler, seen) = event_log();
    registry
        .add_handler(ProviderEvent::ConfigurationChanged, handler)
        .await;
    settle().await;

    provider.put_configuration([
        FlagDefinition::boolean("a", false),
        FlagDefinition::boolean("b", true),
    ]);
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].flags_changed, vec!["a".to_string(), "b".to_string()]);
}

// =============================================================================
// Domains and client handlers
// =============================================================================

#[tokio::test]
async fn test_domain_clients_use_their_provider() {
    let registry = FlagRegistry::new();
    registry
        .set_provider_and_wait(
            Arc::new(ScriptedProvider::new("default").with_flag("color", "red".to_string())),
            WaitOptions::new(),
        )
        .await
        .unwrap();
    registry
        .set_provider_and_wait_for(
            "billing",
            Arc::new(ScriptedProvider::new("billing").with_flag("color", "blue".to_string())),
            WaitOptions::new(),
        )
        .await
        .unwrap();

    let billing = registry.get_client_for("billing");
    let other = registry.get_client_for("search");

    assert_eq!(billing.get_string_value("color", "none", None, None).await, "blue");
    assert_eq!(other.get_string_value("color", "none", None, None).await, "red");
    assert_eq!(billing.provider_metadata().name, "billing");
}

#[tokio::test]
async fn test_client_handlers_only_see_bound_provider() {
    let registry = FlagRegistry::new();
    let events = ProviderCapabilities::new().with_events();
    let billing_provider = Arc::new(ScriptedProvider::new("billing").with_capabilities(events));
    let default_provider = Arc::new(ScriptedProvider::new("default").with_capabilities(events));
    registry
        .set_provider_and_wait(default_provider.clone(), WaitOptions::new())
        .await
        .unwrap();
    registry
        .set_provider_and_wait_for("billing", billing_provider.clone(), WaitOptions::new())
        .await
        .unwrap();
    settle().await;

    let client = registry.get_client_for("billing");
    let (handler, seen) = event_log();
    client.add_handler(ProviderEvent::Stale, handler).await;

    default_provider.emit(ProviderEventDetails::new(ProviderEvent::Stale));
    billing_provider.emit(ProviderEventDetails::new(ProviderEvent::Stale));
    settle().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].provider_name, "billing");
    assert_eq!(seen[0].domain.as_deref(), Some("billing"));
}

#[tokio::test]
async fn test_late_client_subscription_runs_immediately() {
    let registry = registry_with(Arc::new(ScriptedProvider::full_lifecycle("p"))).await;
    let client = registry.get_client();
    let (handler, seen) = event_log();

    client.add_handler(ProviderEvent::Ready, handler).await;

    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_removed_handler_not_called() {
    let registry = FlagRegistry::new();
    let (handler, seen) = event_log();
    let id = registry.add_handler(ProviderEvent::Ready, handler).await;
    assert!(registry.remove_handler(ProviderEvent::Ready, id));

    registry
        .set_provider_and_wait(
            Arc::new(ScriptedProvider::full_lifecycle("p")),
            WaitOptions::new(),
        )
        .await
        .unwrap();
    settle().await;

    assert!(seen.lock().is_empty());
}

// =============================================================================
// Contexts
// =============================================================================

#[tokio::test]
async fn test_context_layers_merge_by_specificity() {
    let observer = Arc::new(RecordingHook::new("observer", StageLog::new()));
    let registry = registry_with(Arc::new(ScriptedProvider::new("p").with_flag("f", true))).await;
    registry.add_hook(observer.clone());
    registry
        .set_context(
            EvaluationContext::new()
                .with_attribute("k", "api")
                .with_attribute("api_only", true),
        )
        .await;
    let client = registry.get_client();
    client.set_context(EvaluationContext::new().with_attribute("k", "client"));

    let invocation = EvaluationContext::new().with_attribute("k", "invocation");
    let tx = EvaluationContext::new()
        .with_attribute("k", "transaction")
        .with_attribute("tx_only", 1);
    let client_ref = client.clone();
    registry
        .set_transaction_context(tx, async move {
            client_ref
                .get_boolean_value("f", false, Some(&invocation), None)
                .await;
        })
        .await;

    let seen = observer.seen_contexts();
    let ctx = &seen[0];
    assert_eq!(ctx.get_str("k").as_deref(), Some("invocation"));
    assert_eq!(ctx.get("api_only"), Some(&json!(true)));
    assert_eq!(ctx.get("tx_only"), Some(&json!(1)));
}

#[tokio::test]
async fn test_context_change_event_sequence() {
    let provider = Arc::new(ScriptedProvider::full_lifecycle("p"));
    let registry = registry_with(provider.clone()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    for event in [ProviderEvent::Stale, ProviderEvent::ContextChanged] {
        let sink = order.clone();
        registry
            .add_handler(
                event,
                handler_fn(move |event: ProviderEvent, _: &EventDetails| {
                    sink.lock().push(event);
                    Ok(())
                }),
            )
            .await;
    }

    registry
        .set_context(EvaluationContext::new().with_targeting_key("u-1"))
        .await;

    assert_eq!(
        *order.lock(),
        vec![ProviderEvent::Stale, ProviderEvent::ContextChanged]
    );
    assert_eq!(registry.provider_status(), ProviderStatus::Ready);
    assert_eq!(provider.context_changes().len(), 1);
}

// =============================================================================
// Multi-provider
// =============================================================================

#[tokio::test]
async fn test_multi_provider_first_match_falls_through() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_flag("a", "p".to_string()));
    let secondary = Arc::new(
        ScriptedProvider::new("secondary")
            .with_flag("a", "s".to_string())
            .with_flag("b", "s".to_string()),
    );
    let multi = MultiProvider::new(
        vec![
            MultiProviderEntry::new(primary),
            MultiProviderEntry::new(secondary),
        ],
        Arc::new(FirstMatchStrategy),
    )
    .unwrap();
    let registry = FlagRegistry::new();
    registry
        .set_provider_and_wait(Arc::new(multi), WaitOptions::new())
        .await
        .unwrap();
    let client = registry.get_client();

    assert_eq!(client.get_string_value("a", "-", None, None).await, "p");
    assert_eq!(client.get_string_value("b", "-", None, None).await, "s");
    let missing = client.get_string_details("c", "-", None, None).await;
    assert_eq!(missing.error_code, Some(ErrorCode::FlagNotFound));
}

#[tokio::test]
async fn test_multi_provider_aggregates_errors() {
    let multi = MultiProvider::new(
        vec![
            MultiProviderEntry::new(Arc::new(
                ScriptedProvider::new("one").with_error("f", EvaluationError::general("boom")),
            )),
            MultiProviderEntry::new(Arc::new(
                ScriptedProvider::new("two").with_error("f", EvaluationError::general("bang")),
            )),
        ],
        Arc::new(FirstSuccessfulStrategy),
    )
    .unwrap();
    let registry = FlagRegistry::new();
    registry
        .set_provider_and_wait(Arc::new(multi), WaitOptions::new())
        .await
        .unwrap();

    let details = registry
        .get_client()
        .get_boolean_details("f", true, None, None)
        .await;

    assert!(details.value);
    assert_eq!(details.error_code, Some(ErrorCode::General));
    assert_eq!(
        details.error_message.as_deref(),
        Some("Provider errors occurred: one: boom; two: bang")
    );
}

#[tokio::test]
async fn test_multi_provider_initializes_and_closes_children() {
    let first = Arc::new(ScriptedProvider::full_lifecycle("first").with_flag("f", true));
    let second = Arc::new(ScriptedProvider::full_lifecycle("second"));
    let multi = Arc::new(
        MultiProvider::new(
            vec![
                MultiProviderEntry::new(first.clone()),
                MultiProviderEntry::new(second.clone()),
            ],
            Arc::new(FirstMatchStrategy),
        )
        .unwrap(),
    );
    let registry = FlagRegistry::new();
    assert_ok!(
        registry
            .set_provider_and_wait(multi.clone(), WaitOptions::new())
            .await
    );

    assert_eq!(first.init_calls(), 1);
    assert_eq!(second.init_calls(), 1);
    assert_eq!(multi.status(), ProviderStatus::Ready);
    assert_eq!(registry.provider_status(), ProviderStatus::Ready);
    assert!(
        registry
            .get_client()
            .get_boolean_value("f", false, None, None)
            .await
    );

    registry.close().await;

    assert_eq!(first.close_calls(), 1);
    assert_eq!(second.close_calls(), 1);
}

#[tokio::test]
async fn test_multi_provider_initialize_failure_is_aggregated() {
    let broken = Arc::new(
        ScriptedProvider::full_lifecycle("broken")
            .failing_initialize(EvaluationError::general("no credentials")),
    );
    let healthy = Arc::new(ScriptedProvider::full_lifecycle("healthy"));
    let multi = MultiProvider::new(
        vec![
            MultiProviderEntry::new(broken),
            MultiProviderEntry::new(healthy.clone()),
        ],
        Arc::new(FirstSuccessfulStrategy),
    )
    .unwrap();
    let registry = FlagRegistry::new();

    let error = assert_err!(
        registry
            .set_provider_and_wait(Arc::new(multi), WaitOptions::new())
            .await
    );

    match error {
        FlagwireError::ProviderInitialization { provider, source } => {
            assert_eq!(provider, "multiprovider");
            assert_eq!(source.code, ErrorCode::General);
            assert_eq!(
                source.message,
                format!(
                    "{}: broken: no credentials",
                    flagwire_core::multi::AGGREGATE_ERROR_PREFIX
                )
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(healthy.init_calls(), 1);
    assert_eq!(registry.provider_status(), ProviderStatus::Error);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_close_shuts_down_all_providers() {
    let default_provider = Arc::new(ScriptedProvider::full_lifecycle("default"));
    let domain_provider = Arc::new(ScriptedProvider::full_lifecycle("domain"));
    let registry = registry_with(default_provider.clone()).await;
    registry
        .set_provider_and_wait_for("d", domain_provider.clone(), WaitOptions::new())
        .await
        .unwrap();

    registry.close().await;

    assert_eq!(default_provider.close_calls(), 1);
    assert_eq!(domain_provider.close_calls(), 1);
    let details = registry
        .get_client_for("d")
        .get_boolean_details("f", true, None, None)
        .await;
    assert_eq!(details.reason.as_deref(), Some(reason::NOOP));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let provider = Arc::new(ScriptedProvider::full_lifecycle("p"));
    let registry = registry_with(provider.clone()).await;

    registry.close().await;
    registry.close().await;

    assert_eq!(provider.close_calls(), 1);
    assert_eq!(registry.provider_status(), ProviderStatus::NotReady);
}

#[tokio::test]
async fn test_setting_same_provider_again_is_a_no_op() {
    let provider = Arc::new(ScriptedProvider::full_lifecycle("p"));
    let registry = registry_with(provider.clone()).await;

    registry.set_provider(provider.clone()).await;
    assert_ok!(
        registry
            .set_provider_and_wait(provider.clone(), WaitOptions::new())
            .await
    );
    registry.set_provider_for("d", provider.clone()).await;
    settle().await;

    assert_eq!(provider.init_calls(), 1);
    assert_eq!(provider.close_calls(), 0);
    assert_eq!(registry.provider_status_for("d"), ProviderStatus::Ready);

    registry.close().await;
    assert_eq!(provider.close_calls(), 1);
}

#[tokio::test]
async fn test_waiting_on_provider_without_initialize_resolves_immediately() {
    let registry = FlagRegistry::new();
    let provider = Arc::new(ScriptedProvider::new("lazy").with_status(ProviderStatus::NotReady));

    assert_ok!(
        registry
            .set_provider_and_wait(provider.clone(), WaitOptions::new())
            .await
    );
    assert_ok!(
        registry
            .set_provider_and_wait(Arc::new(NoopProvider), WaitOptions::new())
            .await
    );
    assert_eq!(provider.init_calls(), 0);
}
