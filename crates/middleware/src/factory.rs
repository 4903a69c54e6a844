use std::sync::Arc;
use std::time::Duration;

use mqtt_relay_metadata::{BrokerConfig, Environment, TransportType};

use crate::memory::InMemoryTransport;
use crate::mqtt::MqttTransport;
use crate::transport::{ConnectOptions, Transport};

/// Factory for creating middleware instances based on environment config
pub struct MiddlewareFactory;

impl MiddlewareFactory {
    /// Create a transport based on environment configuration
    pub fn create_transport(env: &Environment) -> Arc<dyn Transport> {
        match env.transport {
            TransportType::Mqtt => Arc::new(MqttTransport::new()),
            TransportType::Memory => Arc::new(InMemoryTransport::new()),
        }
    }

    /// Connect options for the configured broker
    pub fn connect_options(broker: &BrokerConfig) -> ConnectOptions {
        ConnectOptions {
            url: broker.url(),
            username: broker.username.clone(),
            password: broker.password.clone(),
            client_id: broker.client_id.clone(),
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
        }
    }
}
