use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode,
    Transport as Wire,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;
use crate::topic::{validate_filter, validate_topic};
use crate::transport::{
    ConnectOptions, Connection, ConnectionEvent, QoS, Session, Transport, TransportMessage,
};

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;
const EVENT_BUFFER_SIZE: usize = 1024;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Translate relay connect options into rumqttc options.
///
/// Accepts `mqtt://`, `mqtts://`, `ws://` and `wss://` URLs.
pub fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&options.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("missing host: {}", options.url)))?
        .to_string();

    let client_id = options
        .client_id
        .clone()
        .unwrap_or_else(|| format!("mqtt-relay-{}", uuid::Uuid::new_v4().simple()));

    let mut mqtt = match url.scheme() {
        "mqtt" | "tcp" => MqttOptions::new(client_id, host, url.port().unwrap_or(1883)),
        "mqtts" | "ssl" => {
            let mut mqtt = MqttOptions::new(client_id, host, url.port().unwrap_or(8883));
            mqtt.set_transport(Wire::tls_with_default_config());
            mqtt
        }
        // Websocket transports take the full URL as the broker address
        "ws" => {
            let mut mqtt =
                MqttOptions::new(client_id, options.url.clone(), url.port().unwrap_or(80));
            mqtt.set_transport(Wire::Ws);
            mqtt
        }
        "wss" => {
            let mut mqtt =
                MqttOptions::new(client_id, options.url.clone(), url.port().unwrap_or(443));
            mqtt.set_transport(Wire::wss_with_default_config());
            mqtt
        }
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };

    mqtt.set_keep_alive(options.keep_alive);
    if let Some(ref username) = options.username {
        mqtt.set_credentials(username.clone(), options.password.clone().unwrap_or_default());
    }
    Ok(mqtt)
}

/// MQTT transport backed by rumqttc
#[derive(Debug, Default, Clone)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

struct MqttConnection {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        validate_filter(topic).map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        self.client
            .subscribe(topic, rumqttc::QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed(e.to_string()))
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
        self.client
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

/// Poll the rumqttc event loop and forward what the relay cares about.
///
/// Stops after the first connection error: reconnecting is the owner's
/// decision, not the event loop's.
async fn drive(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<ConnectionEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                ConnectionEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic.is_empty() {
                    continue;
                }
                ConnectionEvent::Message(TransportMessage::new(publish.topic, publish.payload))
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(pkid = ack.pkid, "broker rejected subscription");
                } else {
                    debug!(pkid = ack.pkid, "subscription acknowledged");
                }
                continue;
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                debug!(pkid = ack.pkid, "unsubscribe acknowledged");
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                info!("MQTT client disconnected");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "MQTT connection lost");
                    ConnectionEvent::Offline
                } else {
                    ConnectionEvent::Error(e.to_string())
                }
            }
        };

        let stop = matches!(event, ConnectionEvent::Offline | ConnectionEvent::Error(_));
        if tx.send(event).await.is_err() || stop {
            break;
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Session, TransportError> {
        let mqtt = mqtt_options(options)?;
        info!(url = %options.url, client_id = %mqtt.client_id(), "Connecting to MQTT broker");

        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        tokio::spawn(drive(eventloop, tx, Arc::clone(&connected)));

        Ok(Session {
            connection: Box::new(MqttConnection { client, connected }),
            events: rx,
        })
    }
}
