//! Integration tests for MQTT client
//!
//! Tests the engine against the scripted in-memory broker:
//! - Connection lifecycle (handshake, rejection, clean-init, disconnect)
//! - QoS 0 and QoS 1 publishing with bounded retransmission
//! - Subscription management and inbound delivery
//! - Keepalive, liveness and protocol violations

use mqtt_edge::protocol::codec::ProtocolError;
use mqtt_edge::protocol::{PacketType, QoS};
use mqtt_edge::testing::{mock_config, MockBroker, MockConnector, RecordingListener};
use mqtt_edge::transport::mqtt::{ConnectionState, MqttClient, RejectReason};
use mqtt_edge::{ConfigError, MqttError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

type TestClient = MqttClient<MockConnector>;

fn client_for(broker: &MockBroker) -> (TestClient, Arc<RecordingListener>) {
    let listener = Arc::new(RecordingListener::new());
    let client = MqttClient::new(mock_config("dev-1"), broker.connector(), listener.clone())
        .unwrap();
    (client, listener)
}

async fn connected_client(broker: &MockBroker) -> (TestClient, Arc<RecordingListener>) {
    let (client, listener) = client_for(broker);
    client.connect().await.expect("handshake should succeed");
    (client, listener)
}

async fn wait_for_state(client: &TestClient, wanted: ConnectionState) {
    let mut state = client.watch_state();
    timeout(Duration::from_secs(120), state.wait_for(|s| *s == wanted))
        .await
        .expect("state change should happen")
        .expect("client should still exist");
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_connected_state() {
    // Arrange
    let broker = MockBroker::new();
    let (client, _) = client_for(&broker);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // Act
    client.connect().await.unwrap();

    // Assert
    assert!(client.is_connected());
    let connects = broker.frames_of(PacketType::Connect);
    assert_eq!(connects.len(), 1);
    assert_eq!(&connects[0].body[..7], &[0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04]);
    // clean session, keepalive 60
    assert_eq!(connects[0].body[7], 0x02);
    assert_eq!(&connects[0].body[8..10], &[0x00, 0x3C]);
    assert_eq!(&connects[0].body[10..], &[0x00, 0x05, b'd', b'e', b'v', b'-', b'1']);
}

#[tokio::test(start_paused = true)]
async fn test_connack_return_code_rejects_connection() {
    // Arrange: broker answers "not authorized"
    let broker = MockBroker::new();
    broker.set_connack_code(0x05);
    let (client, _) = client_for(&broker);

    // Act
    let result = client.connect().await;

    // Assert
    match result {
        Err(MqttError::ConnectionRejected(RejectReason::ReturnCode(0x05))) => {}
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connack_with_session_present_is_rejected() {
    let broker = MockBroker::new();
    broker.set_connack_flags(0x01);
    let (client, _) = client_for(&broker);

    let result = client.connect().await;

    assert!(matches!(
        result,
        Err(MqttError::ConnectionRejected(RejectReason::SessionPresent(0x01)))
    ));
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_refused_transport_fails_handshake() {
    let broker = MockBroker::new();
    broker.set_refuse_connections(true);
    let (client, _) = client_for(&broker);

    let result = client.connect().await;

    assert!(matches!(result, Err(MqttError::Transport(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_clean_init_clears_session_before_unclean_connect() {
    // Arrange
    let broker = MockBroker::new();
    let mut config = mock_config("dev-1");
    config.clean_session = false;
    config.clean_init = true;
    let client = MqttClient::new(
        config,
        broker.connector(),
        Arc::new(RecordingListener::new()),
    )
    .unwrap();

    // Act
    let started = Instant::now();
    client.connect().await.unwrap();

    // Assert: clean CONNECT, DISCONNECT, pause, unclean CONNECT
    let kinds: Vec<_> = broker
        .frames()
        .iter()
        .filter_map(|frame| frame.packet_type())
        .collect();
    assert_eq!(
        kinds,
        vec![
            PacketType::Connect,
            PacketType::Disconnect,
            PacketType::Connect
        ]
    );
    let connects = broker.frames_of(PacketType::Connect);
    assert_eq!(connects[0].body[7] & 0x02, 0x02);
    assert_eq!(connects[1].body[7] & 0x02, 0x00);
    assert!(started.elapsed() >= Duration::from_secs(2));

    // Later connects skip the pre-step
    client.disconnect().await;
    client.connect().await.unwrap();
    assert_eq!(broker.connect_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_retransmits_with_dup_until_acknowledged() {
    // Arrange: first two PUBACKs are lost
    let broker = MockBroker::new();
    broker.drop_pubacks(2);
    let (client, _) = connected_client(&broker).await;

    // Act
    let result = client
        .publish("telemetry/dev-1", b"21.5", false, QoS::AtLeastOnce)
        .await;

    // Assert
    assert!(result.is_ok(), "publish should succeed: {result:?}");
    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 3);
    let dups: Vec<bool> = publishes.iter().map(|p| p.dup).collect();
    assert_eq!(dups, vec![false, true, true]);
    assert!(publishes.iter().all(|p| p.pid == publishes[0].pid));
    assert!(publishes.iter().all(|p| p.payload == b"21.5"));
    assert_eq!(client.republish_count(), 2);
    assert_eq!(client.in_flight_count(), 0);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_fails_after_exact_attempt_budget() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_ack_publishes(false);
    let mut config = mock_config("dev-1");
    config.max_publish_attempts = 2;
    let client = MqttClient::new(
        config,
        broker.connector(),
        Arc::new(RecordingListener::new()),
    )
    .unwrap();
    client.connect().await.unwrap();

    // Act
    let result = client
        .publish("telemetry/dev-1", b"x", false, QoS::AtLeastOnce)
        .await;

    // Assert
    match result {
        Err(MqttError::DeliveryFailed { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected delivery failure, got {other:?}"),
    }
    assert_eq!(broker.publishes().len(), 2);
    assert_eq!(client.republish_count(), 1);
    assert_eq!(client.in_flight_count(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_qos0_publish_sends_single_frame_without_pid() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;

    client
        .publish("status/dev-1", b"up", true, QoS::AtMostOnce)
        .await
        .unwrap();

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].pid, None);
    assert!(publishes[0].retain);
    assert_eq!(client.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_qos2_is_rejected_before_anything_is_sent() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;
    broker.clear_frames();

    let publish = client
        .publish("status/dev-1", b"up", false, QoS::ExactlyOnce)
        .await;
    let subscribe = client.subscribe("cmd/dev-1", QoS::ExactlyOnce).await;

    assert!(matches!(publish, Err(MqttError::UnsupportedQoS(2))));
    assert!(matches!(subscribe, Err(MqttError::UnsupportedQoS(2))));
    assert!(broker.frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_topics_are_rejected() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;

    assert!(matches!(
        client.publish("cmd/+", b"x", false, QoS::AtMostOnce).await,
        Err(MqttError::InvalidTopic(_))
    ));
    assert!(matches!(
        client.subscribe("cmd/#/x", QoS::AtMostOnce).await,
        Err(MqttError::InvalidTopic(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_operations_require_connection() {
    let broker = MockBroker::new();
    let (client, _) = client_for(&broker);

    let result = client
        .publish("status/dev-1", b"up", false, QoS::AtLeastOnce)
        .await;

    assert!(matches!(
        result,
        Err(MqttError::NotConnected {
            state: ConnectionState::Disconnected
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_and_receive_message_end_to_end() {
    // Arrange
    let broker = MockBroker::new();
    let (client, listener) = connected_client(&broker).await;
    client.subscribe("cmd/dev-1", QoS::AtMostOnce).await.unwrap();

    // Act
    broker.inject_publish("cmd/dev-1", b"on", QoS::AtMostOnce, false, None);
    wait_until(|| listener.count() > 0).await;
    sleep(Duration::from_millis(100)).await;

    // Assert: callback fired exactly once
    assert_eq!(
        listener.messages(),
        vec![("cmd/dev-1".to_string(), b"on".to_vec(), false)]
    );
    assert_eq!(broker.frames_of(PacketType::Subscribe).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_qos1_message_is_acknowledged() {
    let broker = MockBroker::new();
    let (client, listener) = connected_client(&broker).await;

    broker.inject_publish("cmd/dev-1", b"reboot", QoS::AtLeastOnce, true, Some(77));
    wait_until(|| !broker.frames_of(PacketType::PubAck).is_empty()).await;

    let pubacks = broker.frames_of(PacketType::PubAck);
    assert_eq!(pubacks[0].body, vec![0x00, 77]);
    assert!(listener.messages()[0].2);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_suback_failure_rejects_subscription_without_disconnect() {
    let broker = MockBroker::new();
    broker.set_suback_code(0x80);
    let (client, _) = connected_client(&broker).await;

    let result = client.subscribe("cmd/dev-1", QoS::AtLeastOnce).await;

    match result {
        Err(MqttError::SubscriptionRejected { topic, code }) => {
            assert_eq!(topic, "cmd/dev-1");
            assert_eq!(code, 0x80);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_subscribe_times_out_and_disconnects() {
    let broker = MockBroker::new();
    broker.set_ack_subscriptions(false);
    let (client, _) = connected_client(&broker).await;

    let result = client.subscribe("cmd/dev-1", QoS::AtMostOnce).await;

    assert!(matches!(result, Err(MqttError::Timeout(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_suback_with_extra_return_codes_forces_disconnect() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_ack_subscriptions(false);
    let (client, _) = connected_client(&broker).await;
    let client = Arc::new(client);
    let subscriber = client.clone();
    let pending = tokio::spawn(async move {
        subscriber
            .subscribe("cmd/dev-1", QoS::AtMostOnce)
            .await
    });
    wait_until(|| !broker.frames_of(PacketType::Subscribe).is_empty()).await;
    let pid = broker.frames_of(PacketType::Subscribe)[0]
        .request_pid()
        .unwrap()
        .to_be_bytes();

    // Act: two granted QoS bytes for a single filter
    broker.inject(&[0x90, 0x04, pid[0], pid[1], 0x00, 0x00]);
    wait_for_state(&client, ConnectionState::Disconnected).await;

    // Assert
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(MqttError::ConnectionClosed)), "{result:?}");
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_round_trip() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;
    client.subscribe("cmd/#", QoS::AtMostOnce).await.unwrap();

    client.unsubscribe("cmd/#").await.unwrap();

    assert_eq!(broker.frames_of(PacketType::Unsubscribe).len(), 1);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_puback_forces_disconnect() {
    // Arrange
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;

    // Act: acknowledgment for a pid that was never issued
    broker.inject(&[0x40, 0x02, 0x12, 0x34]);
    wait_for_state(&client, ConnectionState::Disconnected).await;

    // Assert
    let result = client
        .publish("status/dev-1", b"up", false, QoS::AtMostOnce)
        .await;
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_qos2_forces_disconnect() {
    let broker = MockBroker::new();
    let (client, listener) = connected_client(&broker).await;

    // PUBLISH QoS 2 to "t" with pid 1
    broker.inject(&[0x34, 0x05, 0x00, 0x01, b't', 0x00, 0x01]);
    wait_for_state(&client, ConnectionState::Disconnected).await;

    assert_eq!(listener.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_broker_closing_stream_forces_disconnect() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;

    broker.close_stream();
    wait_for_state(&client, ConnectionState::Disconnected).await;

    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_pending_publish_fails_when_connection_drops() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_ack_publishes(false);
    let (client, _) = connected_client(&broker).await;
    let client = Arc::new(client);
    let publisher = client.clone();

    // Act
    let handle = tokio::spawn(async move {
        publisher
            .publish("telemetry/dev-1", b"x", false, QoS::AtLeastOnce)
            .await
    });
    wait_until(|| client.in_flight_count() == 1).await;
    client.force_disconnect("test").await;

    // Assert
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(MqttError::ConnectionClosed)));
    assert_eq!(client.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_keep_connection_alive() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;
    assert_eq!(client.ping_interval(), Duration::from_secs(15));

    sleep(Duration::from_secs(120)).await;

    assert!(client.is_connected());
    assert!(broker.frames_of(PacketType::PingReq).len() >= 7);
}

#[tokio::test(start_paused = true)]
async fn test_silent_broker_is_detected_as_stale() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_respond_to_pings(false);
    let (client, _) = connected_client(&broker).await;
    let started = Instant::now();

    // Act
    wait_for_state(&client, ConnectionState::Disconnected).await;

    // Assert: four ping intervals of silence
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(broker.frames_of(PacketType::PingReq).len() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_broker_up_falls_back_to_ping() {
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;
    assert!(client.broker_up().await);

    sleep(Duration::from_secs(2)).await;
    let pings = broker.frames_of(PacketType::PingReq).len();
    assert!(client.broker_up().await);
    assert_eq!(broker.frames_of(PacketType::PingReq).len(), pings + 1);

    broker.set_respond_to_pings(false);
    sleep(Duration::from_secs(2)).await;
    assert!(!client.broker_up().await);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_sends_disconnect_and_fails_pending() {
    // Arrange: a QoS 1 publish waiting for a PUBACK that never comes
    let broker = MockBroker::new();
    broker.set_ack_publishes(false);
    let (client, _) = connected_client(&broker).await;
    let client = Arc::new(client);
    let publisher = client.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("telemetry/dev-1", b"x", false, QoS::AtLeastOnce)
            .await
    });
    wait_until(|| client.in_flight_count() == 1).await;

    // Act
    client.disconnect().await;

    // Assert
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(MqttError::ConnectionClosed)), "{result:?}");
    assert_eq!(client.in_flight_count(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(broker.frames_of(PacketType::Disconnect).len(), 1);
    assert!(matches!(
        client.subscribe("cmd/dev-1", QoS::AtMostOnce).await,
        Err(MqttError::NotConnected { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_keepalive_is_rejected_at_construction() {
    let broker = MockBroker::new();
    let mut config = mock_config("dev-1");
    config.keepalive_secs = 70_000;

    let result = MqttClient::new(
        config,
        broker.connector(),
        Arc::new(RecordingListener::new()),
    );

    assert!(matches!(
        result,
        Err(MqttError::Config(ConfigError::InvalidKeepalive(70_000)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_zero_publish_attempts_is_rejected_at_construction() {
    let broker = MockBroker::new();
    let mut config = mock_config("dev-1");
    config.max_publish_attempts = 0;

    let result = MqttClient::new(
        config,
        broker.connector(),
        Arc::new(RecordingListener::new()),
    );

    assert!(matches!(
        result,
        Err(MqttError::Config(ConfigError::InvalidConfig(_)))
    ));
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_traffic_reuses_receive_buffer() {
    // Arrange: the first 100-byte payload sizes the buffer
    let broker = MockBroker::new();
    let (client, listener) = connected_client(&broker).await;
    let payload = [0x5A; 100];
    broker.inject_publish("cmd/dev-1", &payload, QoS::AtMostOnce, false, None);
    wait_until(|| listener.count() == 1).await;
    let warmed = client.buffer_stats().await.unwrap();

    // Act
    for _ in 0..200 {
        broker.inject_publish("cmd/dev-1", &payload, QoS::AtMostOnce, false, None);
    }
    wait_until(|| listener.count() == 201).await;

    // Assert
    let after = client.buffer_stats().await.unwrap();
    assert_eq!(after.rx_grows, warmed.rx_grows);
    assert_eq!(after.rx_capacity, warmed.rx_capacity);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_outbound_publishes_reuse_transmit_buffer() {
    // Arrange
    let broker = MockBroker::new();
    let (client, _) = connected_client(&broker).await;
    let payload = [0xA5; 100];
    client
        .publish("telemetry/dev-1", &payload, false, QoS::AtLeastOnce)
        .await
        .unwrap();
    let warmed = client.buffer_stats().await.unwrap();

    // Act
    for i in 0..200 {
        let qos = if i % 2 == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        };
        client
            .publish("telemetry/dev-1", &payload, false, qos)
            .await
            .unwrap();
    }

    // Assert
    let after = client.buffer_stats().await.unwrap();
    assert_eq!(after.tx_grows, warmed.tx_grows);
    assert_eq!(after.tx_capacity, warmed.tx_capacity);
    assert_eq!(broker.publishes().len(), 201);
}

#[test]
fn test_protocol_error_is_fatal() {
    let error = MqttError::from(ProtocolError::UnknownPacketId {
        pid: 0x1234,
        packet: "PUBACK",
    });
    assert!(error.is_fatal_to_connection());
}
