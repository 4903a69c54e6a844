use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MetadataError;

/// Default MQTT broker port
pub const DEFAULT_PORT: u16 = 1883;
/// Default keep-alive interval in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// URL scheme used to reach the broker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    #[serde(rename = "mqtt://", alias = "mqtt")]
    Mqtt,
    #[serde(rename = "mqtts://", alias = "mqtts")]
    Mqtts,
    #[serde(rename = "ws://", alias = "ws")]
    Ws,
    #[serde(rename = "wss://", alias = "wss")]
    Wss,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt://",
            Protocol::Mqtts => "mqtts://",
            Protocol::Ws => "ws://",
            Protocol::Wss => "wss://",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Generated per connection when not set
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl BrokerConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }

    /// Broker URL, e.g. `mqtt://10.0.0.5:1883`
    pub fn url(&self) -> String {
        format!("{}{}:{}", self.protocol, self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.host.trim().is_empty() {
            return Err(MetadataError::Validation("broker host is empty".into()));
        }
        if self.port == 0 {
            return Err(MetadataError::Validation("broker port must be 1-65535".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(MetadataError::Validation(
                "broker password set without username".into(),
            ));
        }
        Ok(())
    }
}
