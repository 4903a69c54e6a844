use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::broker::BrokerConfig;
use crate::error::MetadataError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Mqtt,
    Memory,
}

/// How inbound topics are matched against registered topics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Registered topics are literal topic names
    #[default]
    Exact,
    /// Registered topics are MQTT filters and may use `+` and `#`
    Wildcard,
}

/// Default coalescing window for variable definition refreshes
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
/// Default delay before reconnecting after a connection error
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5000;
/// Default time a publish waits for a reconnect to complete
pub const DEFAULT_PUBLISH_CONNECT_TIMEOUT_MS: u64 = 2000;

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_publish_connect_timeout_ms() -> u64 {
    DEFAULT_PUBLISH_CONNECT_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_publish_connect_timeout_ms")]
    pub publish_connect_timeout_ms: u64,
    #[serde(default)]
    pub matcher: MatchStrategy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            publish_connect_timeout_ms: default_publish_connect_timeout_ms(),
            matcher: MatchStrategy::default(),
        }
    }
}

/// A topic value mirrored into a named variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    /// JSON path into the payload; blank when the payload is not JSON
    #[serde(default)]
    pub path: Option<String>,
    pub variable: String,
}

/// A boolean state derived by comparing a topic value to a target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub value: String,
    /// One of eq, ne, lt, lte, gt, gte
    #[serde(default = "default_comparison")]
    pub comparison: String,
}

fn default_comparison() -> String {
    "eq".to_string()
}

impl VariableSpec {
    pub fn resolved_id(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("variable-{}", index))
    }
}

impl FeedbackSpec {
    pub fn resolved_id(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("feedback-{}", index))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub transport: TransportType,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub feedbacks: Vec<FeedbackSpec>,
}

impl Environment {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let env: Environment = serde_yaml::from_str(&content)?;
        env.validate()?;
        Ok(env)
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        self.broker.validate()?;

        let mut ids = HashSet::new();
        for (index, variable) in self.variables.iter().enumerate() {
            if variable.topic.is_empty() {
                return Err(MetadataError::Validation(format!(
                    "variable {} has an empty topic",
                    index
                )));
            }
            if variable.variable.trim().is_empty() {
                return Err(MetadataError::Validation(format!(
                    "variable {} has an empty variable name",
                    index
                )));
            }
            if !ids.insert(variable.resolved_id(index)) {
                return Err(MetadataError::Validation(format!(
                    "duplicate consumer id: {}",
                    variable.resolved_id(index)
                )));
            }
        }
        for (index, feedback) in self.feedbacks.iter().enumerate() {
            if feedback.topic.is_empty() {
                return Err(MetadataError::Validation(format!(
                    "feedback {} has an empty topic",
                    index
                )));
            }
            if !ids.insert(feedback.resolved_id(index)) {
                return Err(MetadataError::Validation(format!(
                    "duplicate consumer id: {}",
                    feedback.resolved_id(index)
                )));
            }
        }
        Ok(())
    }
}
