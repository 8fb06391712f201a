//! In-memory provider
//!
//! Serves flags from definitions held in process: named variants, ordered
//! targeting rules and percentage rollouts.

use crate::context::{EvaluationContext, TARGETING_KEY};
use crate::error::{ErrorCode, EvaluationError, EvaluationResult};
use crate::provider::{
    Provider, ProviderCapabilities, ProviderEventDetails, ProviderEventSender, ProviderMetadata,
};
use crate::value::{FlagMetadata, FlagMetadataValue, FlagType, FlagValue, ResolutionDetails, reason};
use async_trait::async_trait;
use flagwire_events::ProviderEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const IN_MEMORY_PROVIDER_NAME: &str = "in-memory";

/// Flag definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    /// Flag key/name
    pub key: String,

    pub description: Option<String>,

    /// Disabled flags resolve to the caller's default
    #[serde(default)]
    pub disabled: bool,

    /// Named values this flag can take
    pub variants: BTreeMap<String, FlagValue>,

    /// Variant served when no rule or rollout applies
    pub default_variant: String,

    /// Targeting rules, first match wins
    #[serde(default)]
    pub targeting: Vec<TargetingRule>,

    pub rollout: Option<Rollout>,

    #[serde(default)]
    pub metadata: FlagMetadata,
}

/// How a definition picked its variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<'a> {
    pub variant: Option<&'a str>,
    pub reason: &'static str,
}

impl FlagDefinition {
    /// Create a new boolean flag with `on`/`off` variants
    ///
    /// # Examples
    ///
    /// ```
    /// use flagwire_core::FlagDefinition;
    ///
    /// let flag = FlagDefinition::boolean("new-ui", true);
    /// assert_eq!(flag.default_variant, "on");
    /// ```
    pub fn boolean(key: impl Into<String>, default_value: bool) -> Self {
        let mut variants = BTreeMap::new();
        variants.insert("on".to_string(), FlagValue::Bool(true));
        variants.insert("off".to_string(), FlagValue::Bool(false));
        Self::new(key, variants, if default_value { "on" } else { "off" })
    }

    pub fn new(
        key: impl Into<String>,
        variants: BTreeMap<String, FlagValue>,
        default_variant: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            description: None,
            disabled: false,
            variants,
            default_variant: default_variant.into(),
            targeting: Vec::new(),
            rollout: None,
            metadata: FlagMetadata::new(),
        }
    }

    /// Single-variant flag whose only variant is `default`.
    pub fn constant<T: FlagType>(key: impl Into<String>, value: T) -> Self {
        let mut variants = BTreeMap::new();
        variants.insert("default".to_string(), value.into_flag_value());
        Self::new(key, variants, "default")
    }

    pub fn with_variant(
        mut self,
        name: impl Into<String>,
        value: impl Into<FlagValueInput>,
    ) -> Self {
        self.variants.insert(name.into(), value.into().0);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_rule(mut self, rule: TargetingRule) -> Self {
        self.targeting.push(rule);
        self
    }

    pub fn with_rollout(mut self, rollout: Rollout) -> Self {
        self.rollout = Some(rollout);
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<FlagMetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Pick the variant for `context`.
    pub fn select(&self, context: &EvaluationContext) -> EvaluationResult<Selection<'_>> {
        if self.disabled {
            return Ok(Selection {
                variant: None,
                reason: reason::DISABLED,
            });
        }

        for rule in &self.targeting {
            if rule.matches(context)? {
                return Ok(Selection {
                    variant: Some(rule.variant.as_str()),
                    reason: reason::TARGETING_MATCH,
                });
            }
        }

        if let Some(rollout) = &self.rollout
            && rollout.includes(context, &self.key)?
        {
            return Ok(Selection {
                variant: Some(rollout.variant.as_str()),
                reason: reason::SPLIT,
            });
        }

        let dynamic = !self.targeting.is_empty() || self.rollout.is_some();
        Ok(Selection {
            variant: Some(self.default_variant.as_str()),
            reason: if dynamic { reason::DEFAULT } else { reason::STATIC },
        })
    }

    /// Resolve to a typed value, or the caller's default when disabled.
    pub fn resolve<T: FlagType>(
        &self,
        default_value: T,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<T>> {
        let selection = self.select(context)?;
        let Some(variant) = selection.variant else {
            return Ok(ResolutionDetails::new(default_value).with_reason(selection.reason));
        };

        let value = self.variants.get(variant).cloned().ok_or_else(|| {
            EvaluationError::new(
                ErrorCode::ParseError,
                format!("flag '{}' has no variant '{}'", self.key, variant),
            )
        })?;
        let value = T::from_flag_value(value)
            .ok_or_else(|| EvaluationError::type_mismatch(&self.key, T::VALUE_TYPE))?;

        let mut details = ResolutionDetails::new(value)
            .with_variant(variant)
            .with_reason(selection.reason);
        details.flag_metadata = self.metadata.clone();
        Ok(details)
    }
}

/// Anything convertible to a [`FlagValue`], for variant builders.
pub struct FlagValueInput(FlagValue);

impl<T: FlagType> From<T> for FlagValueInput {
    fn from(value: T) -> Self {
        Self(value.into_flag_value())
    }
}

impl From<&str> for FlagValueInput {
    fn from(value: &str) -> Self {
        Self(FlagValue::String(value.to_string()))
    }
}

/// Targeting rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingRule {
    /// Rule conditions (all must match)
    pub conditions: Vec<Condition>,

    /// Variant served when the rule matches
    pub variant: String,
}

impl TargetingRule {
    pub fn new(variant: impl Into<String>) -> Self {
        Self {
            conditions: Vec::new(),
            variant: variant.into(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, context: &EvaluationContext) -> EvaluationResult<bool> {
        for condition in &self.conditions {
            if !condition.matches(context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Targeting condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Context attribute to check; `targetingKey` reads the targeting key
    pub attribute: String,

    pub operator: Operator,

    /// Values to compare against
    pub values: Vec<String>,
}

impl Condition {
    pub fn new(attribute: impl Into<String>, operator: Operator, values: Vec<String>) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            values,
        }
    }

    pub fn matches(&self, context: &EvaluationContext) -> EvaluationResult<bool> {
        let attr_value = context.get_str(&self.attribute);
        if attr_value.is_none() && self.attribute == TARGETING_KEY {
            return Err(EvaluationError::new(
                ErrorCode::TargetingKeyMissing,
                "rule reads the targeting key but the context has none",
            ));
        }
        let v = attr_value.as_deref();

        Ok(match self.operator {
            Operator::In => v.is_some_and(|v| self.values.iter().any(|val| val == v)),
            Operator::NotIn => v.is_none_or(|v| !self.values.iter().any(|val| val == v)),
            Operator::Contains => v.is_some_and(|v| self.values.iter().any(|val| v.contains(val))),
            Operator::StartsWith => {
                v.is_some_and(|v| self.values.iter().any(|val| v.starts_with(val)))
            }
            Operator::EndsWith => v.is_some_and(|v| self.values.iter().any(|val| v.ends_with(val))),
            Operator::Matches => match v {
                Some(v) => {
                    for pattern in &self.values {
                        let re = regex::Regex::new(pattern).map_err(|e| {
                            EvaluationError::new(
                                ErrorCode::ParseError,
                                format!("invalid pattern '{}': {}", pattern, e),
                            )
                        })?;
                        if re.is_match(v) {
                            return Ok(true);
                        }
                    }
                    false
                }
                None => false,
            },
        })
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    /// Any value is a regular expression matching the attribute
    Matches,
}

/// Gradual rollout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    /// Percentage (0-100)
    pub percentage: u8,

    /// Variant served to included subjects
    pub variant: String,

    /// Attribute to bucket by (default: the targeting key)
    pub bucket_by: Option<String>,
}

impl Rollout {
    pub fn new(percentage: u8, variant: impl Into<String>) -> Self {
        Self {
            percentage: percentage.min(100),
            variant: variant.into(),
            bucket_by: None,
        }
    }

    pub fn with_bucket_by(mut self, attribute: impl Into<String>) -> Self {
        self.bucket_by = Some(attribute.into());
        self
    }

    pub fn includes(&self, context: &EvaluationContext, flag_key: &str) -> EvaluationResult<bool> {
        let bucket_value = match &self.bucket_by {
            Some(attribute) => match context.get_str(attribute) {
                Some(value) => value,
                None => return Ok(false),
            },
            None => context.targeting_key().map(str::to_string).ok_or_else(|| {
                EvaluationError::new(
                    ErrorCode::TargetingKeyMissing,
                    format!("rollout of '{}' needs a targeting key", flag_key),
                )
            })?,
        };

        Ok(Self::calculate_bucket(flag_key, &bucket_value) < self.percentage)
    }

    fn calculate_bucket(flag_key: &str, value: &str) -> u8 {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(flag_key.as_bytes());
        hasher.update(value.as_bytes());
        let result = hasher.finalize();

        // first byte (0-255) scaled to 0-99
        ((result[0] as u16 * 100) / 256) as u8
    }
}

/// Provider serving [`FlagDefinition`]s held in memory.
///
/// ```
/// use flagwire_core::{FlagDefinition, InMemoryProvider};
///
/// let provider = InMemoryProvider::new()
///     .with_flag(FlagDefinition::boolean("new-ui", true));
/// assert_eq!(provider.flag_keys(), vec!["new-ui".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    flags: RwLock<HashMap<String, FlagDefinition>>,
    events: ProviderEventSender,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(self, flags: impl IntoIterator<Item = FlagDefinition>) -> Self {
        {
            let mut table = self.flags.write();
            for flag in flags {
                table.insert(flag.key.clone(), flag);
            }
        }
        self
    }

    pub fn with_flag(self, flag: FlagDefinition) -> Self {
        self.with_flags([flag])
    }

    pub fn flag(&self, key: &str) -> Option<FlagDefinition> {
        self.flags.read().get(key).cloned()
    }

    /// Sorted flag keys.
    pub fn flag_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.flags.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Replace every definition and announce the keys that changed.
    pub fn put_configuration(&self, flags: impl IntoIterator<Item = FlagDefinition>) -> Vec<String> {
        let next: HashMap<String, FlagDefinition> =
            flags.into_iter().map(|f| (f.key.clone(), f)).collect();

        let changed: Vec<String> = {
            let mut table = self.flags.write();
            let changed = table
                .keys()
                .chain(next.keys())
                .filter(|key| table.get(*key) != next.get(*key))
                .cloned()
                .collect::<std::collections::BTreeSet<String>>()
                .into_iter()
                .collect();
            *table = next;
            changed
        };

        debug!(changed = changed.len(), "in-memory configuration replaced");
        self.events.emit(
            ProviderEventDetails::new(ProviderEvent::ConfigurationChanged)
                .with_flags_changed(changed.clone()),
        );
        changed
    }

    fn resolve<T: FlagType>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<T>> {
        let flags = self.flags.read();
        let flag = flags
            .get(flag_key)
            .ok_or_else(|| EvaluationError::flag_not_found(flag_key))?;
        flag.resolve(default_value, context)
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(IN_MEMORY_PROVIDER_NAME)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::new().with_events()
    }

    fn events(&self) -> Option<ProviderEventSender> {
        Some(self.events.clone())
    }

    async fn resolve_boolean_evaluation(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<bool>> {
        self.resolve(flag_key, default_value, context)
    }

    async fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: String,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<String>> {
        self.resolve(flag_key, default_value, context)
    }

    async fn resolve_number_evaluation(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<f64>> {
        self.resolve(flag_key, default_value, context)
    }

    async fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<serde_json::Value>> {
        self.resolve(flag_key, default_value, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> EvaluationContext {
        EvaluationContext::new().with_targeting_key(id)
    }

    #[test]
    fn test_boolean_flag() {
        let flag = FlagDefinition::boolean("test-flag", true);

        let details = flag.resolve(false, &user("user-1")).unwrap();
        assert!(details.value);
        assert_eq!(details.variant.as_deref(), Some("on"));
        assert_eq!(details.reason.as_deref(), Some(reason::STATIC));
    }

    #[test]
    fn test_disabled_flag_returns_caller_default() {
        let flag = FlagDefinition::boolean("test-flag", true).disabled();

        let details = flag.resolve(false, &user("user-1")).unwrap();
        assert!(!details.value);
        assert_eq!(details.variant, None);
        assert_eq!(details.reason.as_deref(), Some(reason::DISABLED));
    }

    #[test]
    fn test_targeting_rule() {
        let rule = TargetingRule::new("on").with_condition(Condition::new(
            "email",
            Operator::EndsWith,
            vec!["@example.com".to_string()],
        ));
        let flag = FlagDefinition::boolean("test-flag", false).with_rule(rule);

        let matched = flag
            .resolve(false, &user("user-1").with_attribute("email", "user@example.com"))
            .unwrap();
        assert!(matched.value);
        assert_eq!(matched.reason.as_deref(), Some(reason::TARGETING_MATCH));

        let unmatched = flag
            .resolve(true, &user("user-2").with_attribute("email", "user@other.org"))
            .unwrap();
        assert!(!unmatched.value);
        assert_eq!(unmatched.reason.as_deref(), Some(reason::DEFAULT));
    }

    #[test]
    fn test_regex_condition() {
        let condition = Condition::new("plan", Operator::Matches, vec!["^pro(-.*)?$".to_string()]);
        assert!(condition.matches(&user("u").with_attribute("plan", "pro-annual")).unwrap());
        assert!(!condition.matches(&user("u").with_attribute("plan", "free")).unwrap());

        let broken = Condition::new("plan", Operator::Matches, vec!["(".to_string()]);
        let err = broken
            .matches(&user("u").with_attribute("plan", "pro"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);
    }

    #[test]
    fn test_not_in_matches_missing_attribute() {
        let condition = Condition::new("country", Operator::NotIn, vec!["US".to_string()]);
        assert!(condition.matches(&user("u")).unwrap());
        assert!(!condition.matches(&user("u").with_attribute("country", "US")).unwrap());
    }

    #[test]
    fn test_targeting_key_condition_requires_key() {
        let rule = TargetingRule::new("on").with_condition(Condition::new(
            TARGETING_KEY,
            Operator::In,
            vec!["admin".to_string()],
        ));
        let flag = FlagDefinition::boolean("admin-tools", false).with_rule(rule);

        assert!(flag.resolve(false, &user("admin")).unwrap().value);
        let err = flag.resolve(false, &EvaluationContext::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TargetingKeyMissing);
    }

    #[test]
    fn test_rollout() {
        let flag =
            FlagDefinition::boolean("test-flag", false).with_rollout(Rollout::new(50, "on"));

        let mut enabled_count = 0;
        for i in 0..100 {
            let details = flag.resolve(false, &user(&format!("user-{}", i))).unwrap();
            if details.value {
                assert_eq!(details.reason.as_deref(), Some(reason::SPLIT));
                enabled_count += 1;
            }
        }

        // Should be close to 50%
        assert!((35..=65).contains(&enabled_count));

        let err = flag.resolve(false, &EvaluationContext::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::TargetingKeyMissing);
    }

    #[test]
    fn test_multivariate_flag() {
        let flag = FlagDefinition::constant("color-scheme", "red".to_string())
            .with_variant("blue", "blue")
            .with_rule(
                TargetingRule::new("blue").with_condition(Condition::new(
                    "beta",
                    Operator::In,
                    vec!["true".to_string()],
                )),
            );

        let beta = flag
            .resolve("x".to_string(), &user("u").with_attribute("beta", true))
            .unwrap();
        assert_eq!(beta.value, "blue");

        let mismatch = flag.resolve(false, &user("u")).unwrap_err();
        assert_eq!(mismatch.code, ErrorCode::TypeMismatch);
    }

    #[tokio::test]
    async fn test_provider_lookup_and_metadata() {
        let provider = InMemoryProvider::new().with_flag(
            FlagDefinition::boolean("new-ui", true).with_metadata("owner", "web"),
        );

        let details = provider
            .resolve_boolean_evaluation("new-ui", false, &user("u"))
            .await
            .unwrap();
        assert_eq!(
            details.flag_metadata.get("owner"),
            Some(&FlagMetadataValue::from("web"))
        );

        let err = provider
            .resolve_boolean_evaluation("missing", false, &user("u"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FlagNotFound);
    }

    #[tokio::test]
    async fn test_put_configuration_reports_changes() {
        let provider = InMemoryProvider::new().with_flags([
            FlagDefinition::boolean("a", true),
            FlagDefinition::boolean("b", true),
        ]);
        let mut rx = provider.events().unwrap().subscribe();

        let changed = provider.put_configuration([
            FlagDefinition::boolean("a", true),
            FlagDefinition::boolean("b", false),
            FlagDefinition::boolean("c", true),
        ]);

        assert_eq!(changed, vec!["b".to_string(), "c".to_string()]);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, ProviderEvent::ConfigurationChanged);
        assert_eq!(event.flags_changed, changed);
    }
}
