//! mqtt-relay-middleware: Broker transport abstractions
//!
//! Provides the `Transport`/`Connection` traits the relay talks to, an MQTT
//! implementation over rumqttc, and an in-memory broker for testing.

pub mod error;
pub mod factory;
pub mod memory;
pub mod mqtt;
pub mod topic;
pub mod transport;

pub use error::TransportError;
pub use factory::MiddlewareFactory;
pub use memory::{BrokerCall, InMemoryTransport};
pub use mqtt::MqttTransport;
pub use transport::{
    ConnectOptions, Connection, ConnectionEvent, QoS, Session, Transport, TransportMessage,
};
