//! mqtt-relay-metadata: Deployment configuration for the relay
//!
//! Broker settings, relay tuning and declared consumers, loaded from YAML.

pub mod broker;
pub mod environment;
pub mod error;

pub use broker::{BrokerConfig, Protocol};
pub use environment::{
    Environment, FeedbackSpec, MatchStrategy, RelaySettings, TransportType, VariableSpec,
};
pub use error::MetadataError;
