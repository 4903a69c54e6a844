//! MQTT transport implementation
pub mod transport;

pub use transport::{mqtt_options, MqttTransport};
