use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::topic::{matches_filter, validate_filter, validate_topic};
use crate::transport::{
    ConnectOptions, Connection, ConnectionEvent, QoS, Session, Transport, TransportMessage,
};

const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Broker request observed by the in-memory transport
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

struct MemorySession {
    tx: mpsc::Sender<ConnectionEvent>,
    filters: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

impl MemorySession {
    fn filters(&self) -> MutexGuard<'_, HashSet<String>> {
        self.filters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wants(&self, topic: &str) -> bool {
        self.filters().iter().any(|f| matches_filter(f, topic))
    }
}

#[derive(Default)]
struct Broker {
    sessions: DashMap<u64, Arc<MemorySession>>,
    next_session: AtomicU64,
    connects: AtomicU64,
    calls: Mutex<Vec<BrokerCall>>,
    connect_failures: Mutex<VecDeque<String>>,
    subscribe_failures: Mutex<VecDeque<String>>,
    unsubscribe_failures: Mutex<VecDeque<String>>,
}

fn script(queue: &Mutex<VecDeque<String>>, reason: String) {
    queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(reason);
}

fn take_scripted(queue: &Mutex<VecDeque<String>>) -> Option<String> {
    queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
}

impl Broker {
    fn record(&self, call: BrokerCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn route(&self, topic: &str, payload: &Bytes) -> usize {
        let mut delivered = 0;
        for session in self.sessions.iter() {
            if !session.connected.load(Ordering::SeqCst) || !session.wants(topic) {
                continue;
            }
            let msg = TransportMessage::new(topic, payload.clone());
            if session.tx.try_send(ConnectionEvent::Message(msg)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Broker living in process memory.
///
/// Records every subscribe, unsubscribe and publish it sees, routes
/// published messages to subscribed connections, and lets tests script
/// connection failures.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next connection attempt fail with `reason`
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        script(&self.broker.connect_failures, reason.into());
    }

    /// Make the next subscribe request fail with `reason`
    pub fn fail_next_subscribe(&self, reason: impl Into<String>) {
        script(&self.broker.subscribe_failures, reason.into());
    }

    /// Make the next unsubscribe request fail with `reason`
    pub fn fail_next_unsubscribe(&self, reason: impl Into<String>) {
        script(&self.broker.unsubscribe_failures, reason.into());
    }

    /// Sessions the broker still tracks
    pub fn session_count(&self) -> usize {
        self.broker.sessions.len()
    }

    /// Deliver a message as if another client published it.
    /// Returns the number of connections it reached.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.broker.route(topic, &payload.into())
    }

    /// Drop every live connection, as a broker restart would
    pub fn drop_connections(&self) {
        for session in self.broker.sessions.iter() {
            if session.connected.swap(false, Ordering::SeqCst) {
                let _ = session.tx.try_send(ConnectionEvent::Offline);
            }
        }
    }

    pub fn connect_count(&self) -> u64 {
        self.broker.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.broker
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_calls(&self) {
        self.broker
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BrokerCall::Subscribe(t) if t == topic))
            .count()
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BrokerCall::Unsubscribe(t) if t == topic))
            .count()
    }

    pub fn published(&self) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::Publish { .. }))
            .collect()
    }
}

struct InMemoryConnection {
    id: u64,
    session: Arc<MemorySession>,
    broker: Arc<Broker>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        validate_filter(topic).map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        if let Some(reason) = take_scripted(&self.broker.subscribe_failures) {
            return Err(TransportError::SubscribeFailed(reason));
        }
        self.broker.record(BrokerCall::Subscribe(topic.to_string()));
        self.session.filters().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if let Some(reason) = take_scripted(&self.broker.unsubscribe_failures) {
            return Err(TransportError::UnsubscribeFailed(reason));
        }
        self.broker.record(BrokerCall::Unsubscribe(topic.to_string()));
        self.session.filters().remove(topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        validate_topic(topic)?;
        self.broker.record(BrokerCall::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retain,
        });
        self.broker.route(topic, &payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.session.connected.store(false, Ordering::SeqCst);
        self.broker.sessions.remove(&self.id);
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.broker.sessions.remove(&self.id);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<Session, TransportError> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let failure = take_scripted(&self.broker.connect_failures);

        let session = Arc::new(MemorySession {
            tx,
            filters: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(failure.is_none()),
        });
        let event = match failure {
            Some(reason) => ConnectionEvent::Error(reason),
            None => ConnectionEvent::Connected,
        };
        let _ = session.tx.try_send(event);

        let id = self.broker.next_session.fetch_add(1, Ordering::SeqCst);
        self.broker.sessions.insert(id, Arc::clone(&session));

        Ok(Session {
            connection: Box::new(InMemoryConnection {
                id,
                session,
                broker: Arc::clone(&self.broker),
            }),
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectOptions {
        ConnectOptions::new("mqtt://memory:1883")
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let transport = InMemoryTransport::new();
        let mut session = transport.connect(&options()).await.unwrap();
        assert_eq!(session.events.recv().await, Some(ConnectionEvent::Connected));
        assert!(session.connection.is_connected());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connect("connection refused");
        let mut session = transport.connect(&options()).await.unwrap();
        assert_eq!(
            session.events.recv().await,
            Some(ConnectionEvent::Error("connection refused".into()))
        );
        assert!(!session.connection.is_connected());
    }

    #[tokio::test]
    async fn test_deliver_routes_to_matching_subscriptions() {
        let transport = InMemoryTransport::new();
        let mut session = transport.connect(&options()).await.unwrap();
        session.events.recv().await;
        session.connection.subscribe("status/+").await.unwrap();

        assert_eq!(transport.deliver("status/device1", "42"), 1);
        assert_eq!(transport.deliver("config/device1", "x"), 0);

        let event = session.events.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectionEvent::Message(TransportMessage::new("status/device1", "42"))
        );
    }

    #[tokio::test]
    async fn test_publish_loops_back_and_is_recorded() {
        let transport = InMemoryTransport::new();
        let mut session = transport.connect(&options()).await.unwrap();
        session.events.recv().await;
        session.connection.subscribe("studio/onair").await.unwrap();
        session
            .connection
            .publish("studio/onair", Bytes::from("1"), QoS::AtLeastOnce, true)
            .await
            .unwrap();

        assert_eq!(transport.published().len(), 1);
        assert!(matches!(
            session.events.recv().await,
            Some(ConnectionEvent::Message(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_while_offline_is_not_queued() {
        let transport = InMemoryTransport::new();
        let session = transport.connect(&options()).await.unwrap();
        transport.drop_connections();

        let result = session
            .connection
            .publish("a", Bytes::from("x"), QoS::AtMostOnce, false)
            .await;
        assert_eq!(result, Err(TransportError::NotConnected));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_drop_connections_emits_offline() {
        let transport = InMemoryTransport::new();
        let mut session = transport.connect(&options()).await.unwrap();
        session.events.recv().await;
        transport.drop_connections();
        assert_eq!(session.events.recv().await, Some(ConnectionEvent::Offline));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_malformed_filter() {
        let transport = InMemoryTransport::new();
        let session = transport.connect(&options()).await.unwrap();
        let result = session.connection.subscribe("a/#/b").await;
        assert!(matches!(result, Err(TransportError::SubscribeFailed(_))));
        assert_eq!(transport.subscribe_count("a/#/b"), 0);
    }

    #[tokio::test]
    async fn test_scripted_subscribe_and_unsubscribe_failures() {
        let transport = InMemoryTransport::new();
        let session = transport.connect(&options()).await.unwrap();

        transport.fail_next_subscribe("not authorized");
        let result = session.connection.subscribe("studio/temp").await;
        assert_eq!(
            result,
            Err(TransportError::SubscribeFailed("not authorized".into()))
        );
        assert_eq!(transport.subscribe_count("studio/temp"), 0);
        session.connection.subscribe("studio/temp").await.unwrap();

        transport.fail_next_unsubscribe("gone");
        let result = session.connection.unsubscribe("studio/temp").await;
        assert_eq!(result, Err(TransportError::UnsubscribeFailed("gone".into())));
        session.connection.unsubscribe("studio/temp").await.unwrap();
        assert_eq!(transport.unsubscribe_count("studio/temp"), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_leaves_broker() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connect("refused");
        let failed = transport.connect(&options()).await.unwrap();
        let live = transport.connect(&options()).await.unwrap();
        assert_eq!(transport.session_count(), 2);

        drop(failed);
        assert_eq!(transport.session_count(), 1);

        transport.drop_connections();
        drop(live);
        assert_eq!(transport.session_count(), 0);
    }
}
