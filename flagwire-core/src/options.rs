// Per-invocation evaluation options

use crate::hooks::{Hook, HookHints};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for one evaluation call.
///
/// ```
/// use flagwire_core::{EvaluationOptions, LoggingHook};
/// use std::sync::Arc;
///
/// let options = EvaluationOptions::new()
///     .with_hook(Arc::new(LoggingHook::new()))
///     .with_timeout_ms(250);
/// ```
#[derive(Clone, Default)]
pub struct EvaluationOptions {
    /// Invocation-scoped hooks, run after API and client hooks.
    pub hooks: Vec<Arc<dyn Hook>>,
    pub hook_hints: HookHints,
    /// Falls back to the registry's default timeout when unset.
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
}

impl EvaluationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = Arc<dyn Hook>>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    pub fn with_hook_hint(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.hook_hints.insert(key.into(), value.into());
        self
    }

    pub fn with_hook_hints(mut self, hints: HookHints) -> Self {
        self.hook_hints = hints;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(Duration::from_millis(ms));
        self
    }

    pub fn with_cancellation(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

impl std::fmt::Debug for EvaluationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationOptions")
            .field("hooks", &self.hooks.len())
            .field("hook_hints", &self.hook_hints)
            .field("timeout", &self.timeout)
            .field("signal", &self.signal)
            .finish()
    }
}
