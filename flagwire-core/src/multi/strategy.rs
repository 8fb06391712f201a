//! Resolution strategies for the multi-provider.
//!
//! A strategy decides which child providers are consulted for one
//! evaluation and how their results collapse into one [`FinalResult`].

use crate::context::EvaluationContext;
use crate::error::{ErrorCode, EvaluationError, EvaluationResult};
use crate::provider::ProviderStatus;
use crate::value::{FlagValue, FlagValueType, ResolutionDetails};
use std::fmt;
use std::sync::Arc;

/// How children are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// One at a time, consulting the strategy after each.
    #[default]
    Sequential,
    /// All eligible children at once.
    Parallel,
}

/// Mutable bookkeeping shared across one evaluation's provider calls.
///
/// `provider_name` and `provider_status` describe the child about to be
/// (or just) consulted; `scratch` is free for strategy use.
#[derive(Debug, Clone)]
pub struct StrategyPerProviderContext {
    pub flag_key: String,
    pub flag_type: FlagValueType,
    pub provider_name: String,
    pub provider_status: ProviderStatus,
    pub scratch: serde_json::Map<String, serde_json::Value>,
}

impl StrategyPerProviderContext {
    pub fn new(flag_key: impl Into<String>, flag_type: FlagValueType) -> Self {
        Self {
            flag_key: flag_key.into(),
            flag_type,
            provider_name: String::new(),
            provider_status: ProviderStatus::Ready,
            scratch: serde_json::Map::new(),
        }
    }
}

/// Outcome of consulting one child.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResolutionResult<T> {
    pub provider_name: String,
    pub result: EvaluationResult<ResolutionDetails<T>>,
}

impl<T> ProviderResolutionResult<T> {
    pub fn new(
        provider_name: impl Into<String>,
        result: EvaluationResult<ResolutionDetails<T>>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            result,
        }
    }

    /// The failure, whether raised or carried in the details.
    pub fn error(&self) -> Option<EvaluationError> {
        match &self.result {
            Err(e) => Some(e.clone()),
            Ok(details) => details.evaluation_error(),
        }
    }

    pub fn is_error(&self) -> bool {
        match &self.result {
            Err(_) => true,
            Ok(details) => details.error_code.is_some(),
        }
    }

    pub fn is_flag_not_found(&self) -> bool {
        self.error()
            .is_some_and(|e| e.code == ErrorCode::FlagNotFound)
    }
}

/// One child's failure inside an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub provider_name: String,
    pub error: EvaluationError,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider_name, self.error.message)
    }
}

/// Message prefix of aggregated errors.
pub const AGGREGATE_ERROR_PREFIX: &str = "Provider errors occurred";

/// Join child failures into one `GENERAL` error.
pub fn aggregate_error(errors: &[ProviderError]) -> EvaluationError {
    let joined = errors
        .iter()
        .map(ProviderError::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    EvaluationError::general(format!("{}: {}", AGGREGATE_ERROR_PREFIX, joined))
}

/// What a strategy decided.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult<T> {
    pub details: Option<ResolutionDetails<T>>,
    pub provider_name: Option<String>,
    /// Every failure the strategy chose to report.
    pub errors: Vec<ProviderError>,
    /// Report failures as one aggregate even when a single provider failed.
    pub aggregate: bool,
}

impl<T> FinalResult<T> {
    pub fn success(provider_name: impl Into<String>, details: ResolutionDetails<T>) -> Self {
        Self {
            details: Some(details),
            provider_name: Some(provider_name.into()),
            errors: Vec::new(),
            aggregate: false,
        }
    }

    pub fn failure(errors: Vec<ProviderError>) -> Self {
        Self {
            details: None,
            provider_name: None,
            errors,
            aggregate: false,
        }
    }

    pub fn aggregated_failure(errors: Vec<ProviderError>) -> Self {
        Self {
            aggregate: true,
            ..Self::failure(errors)
        }
    }

    /// Details on success; a single failure unchanged unless aggregation
    /// was requested; several always aggregated.
    pub fn into_resolution(self) -> EvaluationResult<ResolutionDetails<T>> {
        if let Some(details) = self.details {
            return Ok(details);
        }
        match self.errors.as_slice() {
            [] => Err(EvaluationError::general("no provider produced a result")),
            [only] if !self.aggregate => Err(only.error.clone()),
            many => Err(aggregate_error(many)),
        }
    }
}

fn to_final(result: &ProviderResolutionResult<FlagValue>) -> FinalResult<FlagValue> {
    match (&result.result, result.error()) {
        (Ok(details), None) => FinalResult::success(&result.provider_name, details.clone()),
        (_, error) => FinalResult::failure(vec![ProviderError {
            provider_name: result.provider_name.clone(),
            error: error.unwrap_or_else(|| EvaluationError::general("unknown provider error")),
        }]),
    }
}

fn collect_errors(results: &[ProviderResolutionResult<FlagValue>]) -> Vec<ProviderError> {
    results
        .iter()
        .filter_map(|r| {
            r.error().map(|error| ProviderError {
                provider_name: r.provider_name.clone(),
                error,
            })
        })
        .collect()
}

/// Policy for consulting children and combining their answers.
pub trait Strategy: Send + Sync {
    fn run_mode(&self) -> RunMode {
        RunMode::Sequential
    }

    /// Children that are not ready or fatal are skipped by default.
    fn should_evaluate_this_provider(
        &self,
        state: &StrategyPerProviderContext,
        _context: &EvaluationContext,
    ) -> bool {
        !matches!(
            state.provider_status,
            ProviderStatus::NotReady | ProviderStatus::Fatal
        )
    }

    /// Consulted after each sequential call.
    fn should_evaluate_next_provider(
        &self,
        state: &mut StrategyPerProviderContext,
        context: &EvaluationContext,
        result: &ProviderResolutionResult<FlagValue>,
    ) -> bool;

    fn determine_final_result(
        &self,
        state: &StrategyPerProviderContext,
        context: &EvaluationContext,
        results: &[ProviderResolutionResult<FlagValue>],
    ) -> FinalResult<FlagValue>;
}

/// Falls through only on `FLAG_NOT_FOUND`.
///
/// Any other error stops the sequence and is the final result.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMatchStrategy;

impl Strategy for FirstMatchStrategy {
    fn should_evaluate_next_provider(
        &self,
        _state: &mut StrategyPerProviderContext,
        _context: &EvaluationContext,
        result: &ProviderResolutionResult<FlagValue>,
    ) -> bool {
        result.is_flag_not_found()
    }

    fn determine_final_result(
        &self,
        _state: &StrategyPerProviderContext,
        _context: &EvaluationContext,
        results: &[ProviderResolutionResult<FlagValue>],
    ) -> FinalResult<FlagValue> {
        match results.last() {
            Some(last) => to_final(last),
            None => FinalResult::failure(Vec::new()),
        }
    }
}

/// Falls through on any error; reports every error if none succeed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstSuccessfulStrategy;

impl Strategy for FirstSuccessfulStrategy {
    fn should_evaluate_next_provider(
        &self,
        _state: &mut StrategyPerProviderContext,
        _context: &EvaluationContext,
        result: &ProviderResolutionResult<FlagValue>,
    ) -> bool {
        result.is_error()
    }

    fn determine_final_result(
        &self,
        _state: &StrategyPerProviderContext,
        _context: &EvaluationContext,
        results: &[ProviderResolutionResult<FlagValue>],
    ) -> FinalResult<FlagValue> {
        match results.iter().find(|r| !r.is_error()) {
            Some(success) => to_final(success),
            None => FinalResult::failure(collect_errors(results)),
        }
    }
}

/// Called with every result when successful children disagree.
pub type MismatchCallback = Arc<dyn Fn(&[ProviderResolutionResult<FlagValue>]) + Send + Sync>;

/// Consults every child in parallel and compares their values.
///
/// The fallback child's answer wins (the first child when no fallback is
/// named). Any child error makes the whole evaluation fail with every error.
#[derive(Clone, Default)]
pub struct ComparisonStrategy {
    fallback_provider: Option<String>,
    on_mismatch: Option<MismatchCallback>,
}

impl ComparisonStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback_provider(mut self, name: impl Into<String>) -> Self {
        self.fallback_provider = Some(name.into());
        self
    }

    pub fn on_mismatch<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[ProviderResolutionResult<FlagValue>]) + Send + Sync + 'static,
    {
        self.on_mismatch = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ComparisonStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComparisonStrategy")
            .field("fallback_provider", &self.fallback_provider)
            .field("on_mismatch", &self.on_mismatch.is_some())
            .finish()
    }
}

impl Strategy for ComparisonStrategy {
    fn run_mode(&self) -> RunMode {
        RunMode::Parallel
    }

    fn should_evaluate_next_provider(
        &self,
        _state: &mut StrategyPerProviderContext,
        _context: &EvaluationContext,
        _result: &ProviderResolutionResult<FlagValue>,
    ) -> bool {
        true
    }

    fn determine_final_result(
        &self,
        _state: &StrategyPerProviderContext,
        _context: &EvaluationContext,
        results: &[ProviderResolutionResult<FlagValue>],
    ) -> FinalResult<FlagValue> {
        let errors = collect_errors(results);
        if !errors.is_empty() {
            return FinalResult::aggregated_failure(errors);
        }

        let values: Vec<&FlagValue> = results
            .iter()
            .filter_map(|r| r.result.as_ref().ok().map(|d| &d.value))
            .collect();
        let agree = values.windows(2).all(|pair| pair[0] == pair[1]);
        if !agree && let Some(callback) = &self.on_mismatch {
            callback(results);
        }

        let chosen = self
            .fallback_provider
            .as_deref()
            .and_then(|name| results.iter().find(|r| r.provider_name == name))
            .or_else(|| results.first());
        match chosen {
            Some(result) => to_final(result),
            None => FinalResult::failure(Vec::new()),
        }
    }
}
