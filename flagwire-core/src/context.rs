//! Evaluation context
//!
//! Key/value data describing the subject of an evaluation, and the merge
//! that layers API, transaction, client and invocation contexts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute name of the targeting key.
pub const TARGETING_KEY: &str = "targetingKey";

/// Evaluation context (subject attributes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(
        rename = "targetingKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    targeting_key: Option<String>,

    #[serde(flatten)]
    attributes: BTreeMap<String, Value>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targeting_key(mut self, targeting_key: impl Into<String>) -> Self {
        self.targeting_key = Some(targeting_key.into());
        self
    }

    /// Add an attribute. `targetingKey` with a string value sets the targeting key.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if key == TARGETING_KEY
            && let Value::String(s) = value
        {
            self.targeting_key = Some(s);
            return;
        }
        self.attributes.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if key == TARGETING_KEY {
            return self.targeting_key.take().map(Value::String);
        }
        self.attributes.remove(key)
    }

    pub fn targeting_key(&self) -> Option<&str> {
        self.targeting_key.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Attribute rendered as a string; the targeting key is readable as `targetingKey`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        if key == TARGETING_KEY {
            return self.targeting_key.clone();
        }
        self.attributes.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.targeting_key.is_none() && self.attributes.is_empty()
    }

    /// Shallow merge; keys of `other` win and nested values are replaced wholesale.
    pub fn merge(&self, other: &EvaluationContext) -> EvaluationContext {
        let mut merged = self.clone();
        if other.targeting_key.is_some() {
            merged.targeting_key = other.targeting_key.clone();
        }
        for (key, value) in &other.attributes {
            merged.attributes.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// Merge the four context layers in increasing specificity.
pub fn merge_contexts(
    api: &EvaluationContext,
    transaction: &EvaluationContext,
    client: &EvaluationContext,
    invocation: &EvaluationContext,
) -> EvaluationContext {
    api.merge(transaction).merge(client).merge(invocation)
}
