//! mqtt-relay: topic subscriptions and value propagation over MQTT
//!
//! Consumers register interest in a topic as either a named variable or a
//! feedback. The relay keeps one broker subscription per topic however many
//! consumers share it, caches the last payload per topic, and fans inbound
//! messages out as variable values and feedback re-check requests.
//!
//! All state lives in a single task; see [`Relay::spawn`].

pub mod cache;
pub mod compare;
pub mod definitions;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod interest;
pub mod lifecycle;
pub mod registry;
pub mod relay;

pub use cache::ValueCache;
pub use compare::{compare, compare_with, Comparison};
pub use definitions::{DefinitionPublisher, VariableDefinition};
pub use dispatch::{dispatch, evaluate, Dispatch, FeedbackCheck};
pub use error::{ExtractError, RelayError};
pub use extract::{extract, render};
pub use interest::{Interest, InterestId, InterestKind};
pub use lifecycle::{ConnectionManager, ConnectionStatus};
pub use registry::{Registered, TopicRegistry, Unregistered};
pub use relay::{HostEvent, Relay, RelayHandle};
