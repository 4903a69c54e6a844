//! End-to-end tests of the relay loop against the in-memory broker

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use mqtt_relay::{
    ConnectionStatus, FeedbackCheck, HostEvent, Interest, InterestId, Relay, RelayError,
    RelayHandle, VariableDefinition,
};
use mqtt_relay_metadata::{MatchStrategy, RelaySettings};
use mqtt_relay_middleware::{BrokerCall, ConnectOptions, InMemoryTransport, QoS};

const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    transport: InMemoryTransport,
    handle: RelayHandle,
    events: UnboundedReceiver<HostEvent>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(RelaySettings::default()).await
    }

    async fn start_with(settings: RelaySettings) -> Self {
        Self::spawn(InMemoryTransport::new(), settings).await
    }

    /// Spawn and wait for the initial connection to settle
    async fn spawn(transport: InMemoryTransport, settings: RelaySettings) -> Self {
        let (handle, events) = Relay::spawn(
            Arc::new(transport.clone()),
            ConnectOptions::new("mqtt://memory:1883"),
            &settings,
        );
        let mut harness = Self {
            transport,
            handle,
            events,
        };
        harness.wait_for_status(ConnectionStatus::Ok).await;
        assert_eq!(harness.next_event().await, HostEvent::ResubscribeRequested);
        harness
    }

    async fn wait_for_status(&self, want: ConnectionStatus) {
        let mut status = self.handle.status();
        timeout(WAIT, status.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for status")
            .expect("relay stopped");
    }

    /// Next event that is not a definitions refresh
    async fn next_event(&mut self) -> HostEvent {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for host event")
                .expect("relay stopped");
            if !matches!(event, HostEvent::VariableDefinitions(_)) {
                return event;
            }
        }
    }

    async fn next_definitions(&mut self) -> Vec<VariableDefinition> {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for definitions")
                .expect("relay stopped");
            if let HostEvent::VariableDefinitions(definitions) = event {
                return definitions;
            }
        }
    }
}

fn values(pairs: &[(&str, &str)]) -> HostEvent {
    HostEvent::VariableValues(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn feedbacks(ids: &[&str]) -> HostEvent {
    HostEvent::CheckFeedbacks(ids.iter().map(|id| InterestId::from(*id)).collect())
}

#[tokio::test(start_paused = true)]
async fn test_shared_topic_subscribes_once() {
    let h = Harness::start().await;

    let first = h
        .handle
        .register("status/device1", Interest::variable("v", "temp", None))
        .await
        .unwrap();
    let second = h
        .handle
        .register("status/device1", Interest::feedback("f", None))
        .await
        .unwrap();
    assert!(first.subscribed);
    assert!(!second.subscribed);
    assert_eq!(h.transport.subscribe_count("status/device1"), 1);

    h.handle.unregister("status/device1", "v").await.unwrap();
    assert_eq!(h.transport.unsubscribe_count("status/device1"), 0);

    let last = h
        .handle
        .unregister("status/device1", "f")
        .await
        .unwrap()
        .unwrap();
    assert!(last.unsubscribed);
    assert_eq!(h.transport.unsubscribe_count("status/device1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_message_fans_out_to_variables_and_feedbacks() {
    let mut h = Harness::start().await;
    h.handle
        .register("dev/1", Interest::variable("v", "temp", Some("t".into())))
        .await
        .unwrap();
    h.handle
        .register("dev/1", Interest::feedback("f", None))
        .await
        .unwrap();

    assert_eq!(h.transport.deliver("dev/1", r#"{"t":20}"#), 1);

    assert_eq!(h.next_event().await, values(&[("temp", "20")]));
    assert_eq!(h.next_event().await, feedbacks(&["f"]));
    assert_eq!(
        h.handle.cached_value("dev/1").await.unwrap().as_deref(),
        Some(r#"{"t":20}"#)
    );
}

#[tokio::test(start_paused = true)]
async fn test_integral_float_renders_as_integer() {
    let mut h = Harness::start().await;
    h.handle
        .register("dev/1", Interest::variable("v", "temp", Some("t".into())))
        .await
        .unwrap();

    h.transport.deliver("dev/1", r#"{"t":21.0}"#);
    assert_eq!(h.next_event().await, values(&[("temp", "21")]));
}

#[tokio::test(start_paused = true)]
async fn test_failed_subscribe_keeps_registration() {
    let h = Harness::start().await;
    h.transport.fail_next_subscribe("not authorized");

    let registered = h
        .handle
        .register("dev/1", Interest::variable("v", "temp", None))
        .await
        .unwrap();
    assert!(registered.subscribed);
    assert_eq!(h.transport.subscribe_count("dev/1"), 0);
    assert_eq!(h.transport.deliver("dev/1", "x"), 0);
    assert_eq!(*h.handle.status().borrow(), ConnectionStatus::Ok);

    let removed = h.handle.unregister("dev/1", "v").await.unwrap().unwrap();
    assert!(removed.unsubscribed);
}

#[tokio::test(start_paused = true)]
async fn test_late_variable_is_backfilled() {
    let mut h = Harness::start().await;
    h.handle
        .register("studio/temp", Interest::feedback("f", None))
        .await
        .unwrap();
    h.transport.deliver("studio/temp", "21.5");
    assert_eq!(h.next_event().await, feedbacks(&["f"]));

    let late = h
        .handle
        .register("studio/temp", Interest::variable("v", "temp", None))
        .await
        .unwrap();
    assert!(late.backfill.is_some());
    assert_eq!(h.next_event().await, values(&[("temp", "21.5")]));
}

#[tokio::test(start_paused = true)]
async fn test_feedback_evaluates_against_cached_value() {
    let mut h = Harness::start().await;
    h.handle
        .register("status/device1", Interest::feedback("f", Some(String::new())))
        .await
        .unwrap();
    h.transport.deliver("status/device1", "42");
    assert_eq!(h.next_event().await, feedbacks(&["f"]));

    let check = |comparison: &str| FeedbackCheck {
        topic: "status/device1".into(),
        path: None,
        target: "40".into(),
        comparison: comparison.into(),
    };
    assert!(h.handle.evaluate_feedback(check("gte")).await.unwrap());
    assert!(!h.handle.evaluate_feedback(check("lt")).await.unwrap());
    assert!(!h.handle.evaluate_feedback(check("between")).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_last_unregister_evicts_and_drops_later_messages() {
    let mut h = Harness::start().await;
    h.handle
        .register("t", Interest::feedback("f", None))
        .await
        .unwrap();
    h.transport.deliver("t", "1");
    assert_eq!(h.next_event().await, feedbacks(&["f"]));

    h.handle.unregister("t", "f").await.unwrap();
    assert_eq!(h.handle.cached_value("t").await.unwrap(), None);
    assert_eq!(h.transport.deliver("t", "2"), 0);
    assert_eq!(h.handle.cached_value("t").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_empty_payload_only_triggers_feedbacks() {
    let mut h = Harness::start().await;
    h.handle
        .register("t", Interest::variable("v", "v", None))
        .await
        .unwrap();
    h.handle
        .register("t", Interest::feedback("f", None))
        .await
        .unwrap();

    h.transport.deliver("t", Bytes::new());
    assert_eq!(h.next_event().await, feedbacks(&["f"]));
}

#[tokio::test(start_paused = true)]
async fn test_definitions_are_debounced() {
    let mut h = Harness::start().await;
    for (id, topic) in [("a", "t/a"), ("b", "t/b"), ("c", "t/c"), ("d", "t/d")] {
        h.handle
            .register(topic, Interest::variable(id, id, None))
            .await
            .unwrap();
    }
    h.handle.unregister("t/b", "b").await.unwrap();

    let definitions = h.next_definitions().await;
    assert_eq!(
        definitions,
        vec![
            VariableDefinition::new("a", "t/a"),
            VariableDefinition::new("c", "t/c"),
            VariableDefinition::new("d", "t/d"),
        ]
    );

    let extra = timeout(Duration::from_secs(5), h.events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);
}

#[tokio::test(start_paused = true)]
async fn test_feedback_churn_does_not_republish_definitions() {
    let mut h = Harness::start().await;
    h.handle
        .register("t", Interest::feedback("f", None))
        .await
        .unwrap();
    h.handle.unregister("t", "f").await.unwrap();

    let event = timeout(Duration::from_secs(5), h.events.recv()).await;
    assert!(event.is_err(), "unexpected event: {:?}", event);
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_matcher_routes_by_filter() {
    let settings = RelaySettings {
        matcher: MatchStrategy::Wildcard,
        ..RelaySettings::default()
    };
    let mut h = Harness::start_with(settings).await;
    h.handle
        .register("status/+", Interest::variable("v", "any", None))
        .await
        .unwrap();

    h.transport.deliver("status/device7", "on");
    assert_eq!(h.next_event().await, values(&[("any", "on")]));
    assert_eq!(
        h.handle.cached_value("status/+").await.unwrap().as_deref(),
        Some("on")
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_retries_after_backoff() {
    let transport = InMemoryTransport::new();
    transport.fail_next_connect("connection refused");

    let (handle, mut events) = Relay::spawn(
        Arc::new(transport.clone()),
        ConnectOptions::new("mqtt://memory:1883"),
        &RelaySettings::default(),
    );

    let mut status = handle.status();
    timeout(
        WAIT,
        status.wait_for(|s| *s == ConnectionStatus::Error("connection refused".into())),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(transport.connect_count(), 1);

    timeout(WAIT, status.wait_for(|s| *s == ConnectionStatus::Ok))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(events.recv().await, Some(HostEvent::ResubscribeRequested));
}

#[tokio::test(start_paused = true)]
async fn test_offline_reconnects_and_requests_resubscribe() {
    let mut h = Harness::start().await;
    h.handle
        .register("t", Interest::variable("v", "v", None))
        .await
        .unwrap();

    h.transport.drop_connections();
    h.wait_for_status(ConnectionStatus::Disconnected).await;
    h.wait_for_status(ConnectionStatus::Ok).await;

    assert_eq!(h.next_event().await, HostEvent::ResubscribeRequested);
    assert_eq!(h.transport.connect_count(), 2);

    // Registry was cleared; the host registers again on the new connection
    h.transport.clear_calls();
    let again = h
        .handle
        .register("t", Interest::variable("v", "v", None))
        .await
        .unwrap();
    assert!(again.subscribed);
    assert_eq!(h.transport.subscribe_count("t"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_passes_through() {
    let h = Harness::start().await;
    h.handle
        .publish("studio/onair", "1", QoS::AtLeastOnce, true)
        .await
        .unwrap();

    assert_eq!(
        h.transport.published(),
        vec![BrokerCall::Publish {
            topic: "studio/onair".into(),
            payload: Bytes::from("1"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish_reconnects_first_when_disconnected() {
    let h = Harness::start().await;
    h.transport.drop_connections();
    h.wait_for_status(ConnectionStatus::Disconnected).await;

    h.handle
        .publish("a/b", "x", QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(h.transport.connect_count(), 2);
    assert_eq!(h.transport.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_dropped_when_reconnect_fails() {
    let h = Harness::start().await;
    h.transport.drop_connections();
    h.wait_for_status(ConnectionStatus::Disconnected).await;
    h.transport.fail_next_connect("broker down");

    let result = h.handle.publish("a/b", "x", QoS::AtMostOnce, false).await;
    assert_eq!(result, Err(RelayError::PublishWhileDisconnected));
    assert!(h.transport.published().is_empty());
    assert_eq!(
        *h.handle.status().borrow(),
        ConnectionStatus::Error("broker down".into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_reconnects() {
    let mut h = Harness::start().await;
    h.handle
        .reconfigure(ConnectOptions::new("mqtt://other:1883"))
        .await
        .unwrap();

    h.wait_for_status(ConnectionStatus::Ok).await;
    assert_eq!(h.next_event().await, HostEvent::ResubscribeRequested);
    assert_eq!(h.transport.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_all_clears_registrations() {
    let h = Harness::start().await;
    h.handle
        .register("a", Interest::variable("1", "one", None))
        .await
        .unwrap();
    h.handle
        .register("b", Interest::feedback("2", None))
        .await
        .unwrap();

    assert_eq!(h.handle.resubscribe_all().await.unwrap(), 1);
    assert_eq!(h.transport.unsubscribe_count("a"), 1);
    assert_eq!(h.transport.unsubscribe_count("b"), 1);
    assert_eq!(h.handle.cached_value("a").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_definitions() {
    let mut h = Harness::start().await;
    h.handle
        .register("t", Interest::variable("v", "v", None))
        .await
        .unwrap();
    h.handle.shutdown().await.unwrap();

    assert_eq!(*h.handle.status().borrow(), ConnectionStatus::Disconnected);
    while let Some(event) = h.events.recv().await {
        assert!(
            !matches!(event, HostEvent::VariableDefinitions(_)),
            "definitions published after shutdown"
        );
    }

    let after = h
        .handle
        .register("t", Interest::feedback("f", None))
        .await;
    assert_eq!(after.unwrap_err(), RelayError::Closed);
}
