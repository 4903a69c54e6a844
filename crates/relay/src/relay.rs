//! The relay event loop
//!
//! One task owns the registry, the cache, the definition publisher and the
//! broker connection. Host calls arrive as commands over a channel, broker
//! traffic as connection events, and both debounce and retry are deadlines
//! polled by the same `select!`. Nothing here needs a lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use mqtt_relay_metadata::RelaySettings;
use mqtt_relay_middleware::{
    ConnectOptions, ConnectionEvent, QoS, Transport, TransportError, TransportMessage,
};

use crate::definitions::{DefinitionPublisher, VariableDefinition};
use crate::dispatch::{dispatch, evaluate, Dispatch, FeedbackCheck};
use crate::error::RelayError;
use crate::interest::{Interest, InterestId};
use crate::lifecycle::{ConnectionManager, ConnectionStatus};
use crate::registry::{Registered, TopicRegistry, Unregistered};

const COMMAND_BUFFER: usize = 256;

/// Output for the host; delivered in the order it was produced
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Variable name -> value, one batch per inbound message or backfill
    VariableValues(BTreeMap<String, String>),
    /// Feedbacks whose topic changed
    CheckFeedbacks(Vec<InterestId>),
    /// Full list of variables after a quiet period in registration churn
    VariableDefinitions(Vec<VariableDefinition>),
    /// The connection was (re)established and the registry cleared; every
    /// consumer should register again
    ResubscribeRequested,
}

enum Command {
    Register {
        topic: String,
        interest: Interest,
        reply: oneshot::Sender<Registered>,
    },
    Unregister {
        topic: String,
        id: InterestId,
        reply: oneshot::Sender<Option<Unregistered>>,
    },
    ResubscribeAll {
        reply: oneshot::Sender<usize>,
    },
    CachedValue {
        topic: String,
        reply: oneshot::Sender<Option<String>>,
    },
    EvaluateFeedback {
        check: FeedbackCheck,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Reconfigure {
        options: ConnectOptions,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running relay
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl RelayHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    pub async fn register(
        &self,
        topic: impl Into<String>,
        interest: Interest,
    ) -> Result<Registered, RelayError> {
        let topic = topic.into();
        self.request(|reply| Command::Register {
            topic,
            interest,
            reply,
        })
        .await
    }

    /// `Ok(None)` when the topic or id was not registered
    pub async fn unregister(
        &self,
        topic: impl Into<String>,
        id: impl Into<InterestId>,
    ) -> Result<Option<Unregistered>, RelayError> {
        let topic = topic.into();
        let id = id.into();
        self.request(|reply| Command::Unregister { topic, id, reply })
            .await
    }

    /// Drop every registration and cached value. Callers re-register what
    /// they still need.
    pub async fn resubscribe_all(&self) -> Result<usize, RelayError> {
        self.request(|reply| Command::ResubscribeAll { reply }).await
    }

    pub async fn cached_value(
        &self,
        topic: impl Into<String>,
    ) -> Result<Option<String>, RelayError> {
        let topic = topic.into();
        self.request(|reply| Command::CachedValue { topic, reply })
            .await
    }

    pub async fn evaluate_feedback(&self, check: FeedbackCheck) -> Result<bool, RelayError> {
        self.request(|reply| Command::EvaluateFeedback { check, reply })
            .await
    }

    /// Publish to the broker, reconnecting once first if disconnected.
    /// Never queued: a publish that cannot be sent is dropped.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RelayError> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            topic,
            payload,
            qos,
            retain,
            reply,
        })
        .await?
    }

    pub async fn reconfigure(&self, options: ConnectOptions) -> Result<(), RelayError> {
        self.request(|reply| Command::Reconfigure { options, reply })
            .await
    }

    /// Cancel timers, disconnect and stop the loop
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

pub struct Relay {
    registry: TopicRegistry,
    manager: ConnectionManager,
    definitions: DefinitionPublisher,
    events: mpsc::UnboundedSender<HostEvent>,
    publish_timeout: Duration,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Relay {
    /// Start the relay on the current runtime and begin connecting
    pub fn spawn(
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
        settings: &RelaySettings,
    ) -> (RelayHandle, mpsc::UnboundedReceiver<HostEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(
            transport,
            options,
            Duration::from_millis(settings.retry_backoff_ms),
        );
        let handle = RelayHandle {
            commands: command_tx,
            status: manager.watch_status(),
        };

        let relay = Relay {
            registry: TopicRegistry::new(settings.matcher),
            manager,
            definitions: DefinitionPublisher::new(Duration::from_millis(settings.debounce_ms)),
            events: event_tx,
            publish_timeout: Duration::from_millis(settings.publish_connect_timeout_ms),
        };
        tokio::spawn(relay.run(command_rx));

        (handle, event_rx)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(matcher = ?self.registry.strategy(), "relay started");
        self.manager.connect().await;

        loop {
            let debounce = self.definitions.deadline();
            let retry = self.manager.retry_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all relay handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                event = self.manager.next_event() => match event {
                    Some(event) => self.handle_connection_event(event).await,
                    None => self.manager.on_closed(),
                },
                _ = sleep_until_opt(debounce) => self.publish_definitions(),
                _ = sleep_until_opt(retry) => {
                    info!("retrying broker connection");
                    self.manager.connect().await;
                }
            }
        }

        info!("relay stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                topic,
                interest,
                reply,
            } => {
                let outcome = self.register(&topic, interest).await;
                let _ = reply.send(outcome);
            }
            Command::Unregister { topic, id, reply } => {
                let outcome = self
                    .registry
                    .unregister(self.manager.connection(), &topic, &id)
                    .await;
                if outcome.as_ref().is_some_and(|o| o.variables_changed) {
                    self.definitions.arm();
                }
                let _ = reply.send(outcome);
            }
            Command::ResubscribeAll { reply } => {
                let dropped = self.resubscribe_all().await;
                let _ = reply.send(dropped);
            }
            Command::CachedValue { topic, reply } => {
                let _ = reply.send(self.registry.cached_value(&topic).map(String::from));
            }
            Command::EvaluateFeedback { check, reply } => {
                let _ = reply.send(evaluate(self.registry.cache(), &check));
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                let result = self.publish(&topic, payload, qos, retain).await;
                let _ = reply.send(result);
            }
            Command::Reconfigure { options, reply } => {
                self.manager.reconfigure(options).await;
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn register(&mut self, topic: &str, interest: Interest) -> Registered {
        let outcome = self
            .registry
            .register(self.manager.connection(), topic, interest)
            .await;
        if outcome.variables_changed {
            self.definitions.arm();
        }
        if let Some(backfill) = &outcome.backfill {
            self.emit_dispatch(backfill.clone());
        }
        outcome
    }

    async fn resubscribe_all(&mut self) -> usize {
        let dropped = self
            .registry
            .resubscribe_all(self.manager.connection())
            .await;
        if dropped > 0 {
            self.definitions.arm();
        }
        dropped
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.manager.on_connected();
                let dropped = self.resubscribe_all().await;
                debug!(dropped, "registry cleared for resubscription");
                self.emit(HostEvent::ResubscribeRequested);
            }
            ConnectionEvent::Error(message) => self.manager.on_error(message),
            ConnectionEvent::Offline => self.manager.on_offline(),
            ConnectionEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_message(&mut self, message: TransportMessage) {
        if message.topic.is_empty() {
            return;
        }
        let payload = message.payload_str();
        if let Some(out) = dispatch(&mut self.registry, &message.topic, &payload) {
            self.emit_dispatch(out);
        }
    }

    fn publish_definitions(&mut self) {
        let definitions = self.definitions.fire(&self.registry);
        self.emit(HostEvent::VariableDefinitions(definitions));
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RelayError> {
        if !self.manager.is_connected() {
            if self.manager.status() != ConnectionStatus::Connecting {
                info!(topic, "not connected, reconnecting before publish");
                self.manager.connect().await;
            }
            if !self.await_connected().await {
                self.manager.on_publish_dropped(topic);
                return Err(RelayError::PublishWhileDisconnected);
            }
        }

        match self.manager.publish(topic, payload, qos, retain).await {
            Ok(()) => {
                debug!(topic, ?qos, retain, "published");
                Ok(())
            }
            Err(TransportError::NotConnected) => {
                self.manager.on_publish_dropped(topic);
                Err(RelayError::PublishWhileDisconnected)
            }
            Err(e) => {
                warn!(topic, error = %e, "publish failed");
                Err(RelayError::Publish(e))
            }
        }
    }

    /// Process connection events until connected, failed, or out of time
    async fn await_connected(&mut self) -> bool {
        let deadline = Instant::now() + self.publish_timeout;
        loop {
            match self.manager.status() {
                ConnectionStatus::Ok => return self.manager.is_connected(),
                ConnectionStatus::Error(_) | ConnectionStatus::Disconnected => return false,
                ConnectionStatus::Connecting | ConnectionStatus::Warning(_) => {}
            }
            match timeout_at(deadline, self.manager.next_event()).await {
                Ok(Some(event)) => self.handle_connection_event(event).await,
                Ok(None) => {
                    self.manager.on_closed();
                    return false;
                }
                Err(_) => {
                    warn!("timed out waiting for broker connection");
                    return false;
                }
            }
        }
    }

    async fn teardown(&mut self) {
        self.definitions.cancel();
        self.manager.shutdown().await;
    }

    fn emit_dispatch(&self, out: Dispatch) {
        if !out.variables.is_empty() {
            self.emit(HostEvent::VariableValues(out.variables));
        }
        if !out.feedbacks.is_empty() {
            self.emit(HostEvent::CheckFeedbacks(out.feedbacks));
        }
    }

    fn emit(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            debug!("host event receiver dropped");
        }
    }
}
