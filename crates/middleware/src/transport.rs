use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Inbound message from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text; invalid UTF-8 sequences are replaced
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Delivery guarantee requested for a publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = TransportError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(TransportError::PublishFailed(format!(
                "qos must be 0, 1 or 2, got {}",
                other
            ))),
        }
    }
}

/// Events raised by a live connection, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Broker accepted the connection
    Connected,
    /// Connection attempt failed; the connection will not recover on its own
    Error(String),
    /// An established connection was lost
    Offline,
    Message(TransportMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive: Duration,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            client_id: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Broker operations available on an open connection.
///
/// Subscribe and unsubscribe hand the request to the client and return; the
/// broker's acknowledgement arrives later and is only logged.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Fails with `NotConnected` instead of queueing while offline
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// A connection together with the stream of events it produces
pub struct Session {
    pub connection: Box<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Opens broker connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting. Returns once the connection is set up locally;
    /// `ConnectionEvent::Connected` or `ConnectionEvent::Error` follows on
    /// the session's event stream.
    async fn connect(&self, options: &ConnectOptions) -> Result<Session, TransportError>;
}
