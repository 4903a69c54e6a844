//! Broker connection ownership and status tracking
//!
//! Status moves `Connecting -> Ok`, `Connecting -> Error` (retried after a
//! fixed backoff), `Ok -> Disconnected` (retried the same way) and back to
//! `Connecting` on retry or reconfiguration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use mqtt_relay_middleware::{
    ConnectOptions, Connection, ConnectionEvent, QoS, Transport, TransportError,
};

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Ok,
    Error(String),
    Disconnected,
    Warning(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Ok => f.write_str("ok"),
            ConnectionStatus::Error(msg) => write!(f, "error: {}", msg),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Warning(msg) => write!(f, "warning: {}", msg),
        }
    }
}

/// Owns the broker connection. The connection is replaced wholesale on
/// every reconnect; nothing else keeps a reference to it.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    connection: Option<Box<dyn Connection>>,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
    status: watch::Sender<ConnectionStatus>,
    retry_backoff: Duration,
    retry_at: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
        retry_backoff: Duration,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            transport,
            options,
            connection: None,
            events: None,
            status,
            retry_backoff,
            retry_at: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!(from = %current, to = %status, "connection status changed");
            *current = status;
            true
        });
    }

    pub fn connection(&self) -> Option<&dyn Connection> {
        self.connection.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_connected())
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Drop any current connection and open a new one
    pub async fn connect(&mut self) {
        self.close().await;
        self.retry_at = None;
        self.set_status(ConnectionStatus::Connecting);

        match self.transport.connect(&self.options).await {
            Ok(session) => {
                self.connection = Some(session.connection);
                self.events = Some(session.events);
            }
            Err(e) => {
                let message = e.to_string();
                let err = RelayError::Connection(e);
                error!(url = %self.options.url, error = %err, "failed to start broker connection");
                self.fail(message);
            }
        }
    }

    /// Replace the connect options and reconnect with them
    pub async fn reconfigure(&mut self, options: ConnectOptions) {
        info!(url = %options.url, "broker configuration changed");
        self.options = options;
        self.connect().await;
    }

    async fn close(&mut self) {
        self.events = None;
        if let Some(connection) = self.connection.take() {
            if connection.is_connected() {
                if let Err(e) = connection.disconnect().await {
                    warn!(error = %e, "failed to disconnect cleanly");
                }
            }
        }
    }

    /// Disconnect and stop retrying
    pub async fn shutdown(&mut self) {
        self.retry_at = None;
        self.close().await;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Next event from the current connection; pending while there is none
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    pub fn on_connected(&mut self) {
        info!(url = %self.options.url, "connected to broker");
        self.retry_at = None;
        self.set_status(ConnectionStatus::Ok);
    }

    pub fn on_error(&mut self, message: String) {
        error!(url = %self.options.url, error = %message, "broker connection failed");
        self.fail(message);
    }

    /// In-memory registrations are kept; they are replayed once reconnected
    pub fn on_offline(&mut self) {
        warn!(url = %self.options.url, "broker connection offline");
        self.set_status(ConnectionStatus::Disconnected);
        self.schedule_retry();
    }

    /// The event stream ended without an error or offline event
    pub fn on_closed(&mut self) {
        self.events = None;
        if self.status() == ConnectionStatus::Ok {
            self.on_offline();
        }
    }

    /// Record a publish dropped for lack of a connection. A pending
    /// connection error stays the visible status.
    pub fn on_publish_dropped(&self, topic: &str) {
        warn!(topic, "publish dropped, broker not connected");
        if matches!(self.status(), ConnectionStatus::Error(_)) {
            return;
        }
        self.set_status(ConnectionStatus::Warning(format!(
            "publish to {} dropped: not connected",
            topic
        )));
    }

    fn fail(&mut self, message: String) {
        self.set_status(ConnectionStatus::Error(message));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.retry_at = Some(Instant::now() + self.retry_backoff);
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        match self.connection() {
            Some(connection) => connection.publish(topic, payload, qos, retain).await,
            None => Err(TransportError::NotConnected),
        }
    }
}
