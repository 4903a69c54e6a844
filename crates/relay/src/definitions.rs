//! Debounced publication of variable definitions
//!
//! Every registration change re-arms a trailing-edge timer. When the window
//! passes without further changes the full list is rebuilt from the
//! registry and published once.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::registry::TopicRegistry;

/// A variable the host should expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDefinition {
    pub name: String,
    pub label: String,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>, topic: &str) -> Self {
        Self {
            name: name.into(),
            label: format!("MQTT value from topic: {}", topic),
        }
    }
}

#[derive(Debug)]
pub struct DefinitionPublisher {
    window: Duration,
    deadline: Option<Instant>,
}

impl DefinitionPublisher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Push the deadline out to one window from now
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Disarm and rebuild the definitions from the registry
    pub fn fire(&mut self, registry: &TopicRegistry) -> Vec<VariableDefinition> {
        self.deadline = None;
        let definitions = registry.variable_definitions();
        debug!(count = definitions.len(), "refreshing variable definitions");
        definitions
    }
}
