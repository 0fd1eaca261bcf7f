//! Connection lifecycle tests
//!
//! Open, close and reconfigure against the in-memory broker, including
//! unreachable brokers, refused connections and connect timeouts.


use mqtt_session::testing::{wait_until, MockBroker};
use mqtt_session::{ConnectionConfig, ConnectionState, MqttConnection, MqttError, MqttMessage, QoS};
use rumqttc::mqttbytes::v4::ConnectReturnCode;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connection, open_connection, test_config, WAIT};

#[tokio::test]
async fn test_open_and_close() {
    // Arrange
    let broker = MockBroker::new();
    let conn = connection(&broker, test_config("lifecycle"));
    assert_eq!(conn.state(), ConnectionState::Closed);

    // Act
    let opened = conn.open().await;

    // Assert
    assert_eq!(opened, Ok(()));
    assert_eq!(conn.state(), ConnectionState::Open);
    assert!(conn.is_open());
    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].client_id, "lifecycle");
    assert_eq!(connects[0].endpoint, "mock-broker:1883");

    // Act: close
    let closed = conn.close().await;

    // Assert: DISCONNECT reached the broker and the link is gone
    assert_eq!(closed, Ok(()));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(broker.disconnects(), 1);
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_open_while_open_resolves_immediately() {
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "twice").await;

    let mut handle = conn.open();

    assert_eq!(handle.try_result(), Some(Ok(())));
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_concurrent_open_requests_share_one_session() {
    // Arrange
    let broker = MockBroker::new();
    let conn = connection(&broker, test_config("shared-open"));

    // Act
    let first = conn.open();
    let second = conn.open();

    // Assert
    assert_eq!(first.await, Ok(()));
    assert_eq!(second.await, Ok(()));
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_close_when_closed_resolves() {
    let broker = MockBroker::new();
    let conn = connection(&broker, test_config("idle"));

    assert_eq!(conn.close().await, Ok(()));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(broker.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_without_reconnect_fails_open() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let mut config = test_config("no-retry");
    config.reconnect = false;
    let conn = connection(&broker, config);

    // Act
    let result = conn.open().await;

    // Assert
    assert!(
        matches!(result, Err(MqttError::ConnectFailed { .. })),
        "expected ConnectFailed, got {result:?}"
    );
    assert_eq!(conn.state(), ConnectionState::Closed);

    // No further attempts are made
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connection_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_with_reconnect_keeps_retrying_until_available() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let conn = connection(&broker, test_config("patient"));

    // Act
    let handle = conn.open();
    assert!(wait_until(WAIT, || broker.connection_attempts() >= 3).await);
    assert!(matches!(
        conn.state(),
        ConnectionState::Connecting | ConnectionState::ReconnectWaiting
    ));
    broker.set_reachable(true);

    // Assert
    assert_eq!(handle.await, Ok(()));
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_reconnect_delay_between_attempts() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let mut config = test_config("delayed");
    config.reconnect_delay_secs = 5;
    let conn = connection(&broker, config);

    // Act
    let _handle = conn.open();
    assert!(wait_until(WAIT, || broker.connection_attempts() == 1).await);
    tokio::time::sleep(Duration::from_secs(4)).await;
    let before_delay = broker.connection_attempts();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Assert
    assert_eq!(before_delay, 1);
    assert_eq!(broker.connection_attempts(), 2);
}

#[tokio::test]
async fn test_refused_connection_reports_return_code() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_connack_code(ConnectReturnCode::NotAuthorized);
    let mut config = test_config("refused");
    config.reconnect = false;
    let conn = connection(&broker, config);

    // Act
    let result = conn.open().await;

    // Assert
    match result {
        Err(MqttError::ConnectFailed { reason }) => {
            assert!(reason.contains("refused"), "reason was: {reason}")
        }
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_missing_connack_times_out() {
    // Arrange
    let broker = MockBroker::new();
    broker.withhold_connack(true);
    let mut config = test_config("silent-broker");
    config.reconnect = false;
    config.connect_timeout_secs = 2;
    let conn = connection(&broker, config);

    // Act
    let result = conn.open().await;

    // Assert
    match result {
        Err(MqttError::ConnectFailed { reason }) => {
            assert!(reason.contains("CONNACK"), "reason was: {reason}")
        }
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert_eq!(broker.connects().len(), 1);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_reconnect_and_fails_open() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let conn = connection(&broker, test_config("cancelled"));
    let open = conn.open();
    assert!(wait_until(WAIT, || broker.connection_attempts() >= 2).await);

    // Act
    let closed = conn.close().await;

    // Assert
    assert_eq!(closed, Ok(()));
    assert_eq!(open.await, Err(MqttError::Closed));
    assert_eq!(conn.state(), ConnectionState::Closed);

    let attempts = broker.connection_attempts();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connection_attempts(), attempts);
}

#[tokio::test]
async fn test_close_fails_pending_operations() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "pending-close").await;
    broker.set_ack_publishes(false);
    let publish = conn.publish(MqttMessage::new("jobs/1", QoS::AtLeastOnce, "payload"));
    assert_eq!(conn.pending_operations(), 1);

    // Act
    conn.close().await.unwrap();

    // Assert
    assert_eq!(publish.await, Err(MqttError::Closed));
    assert_eq!(conn.pending_operations(), 0);
}

#[tokio::test]
async fn test_operations_fail_when_not_connected() {
    let broker = MockBroker::new();
    let conn = connection(&broker, test_config("offline"));
    let not_connected = Err(MqttError::NotConnected {
        state: ConnectionState::Closed,
    });

    assert_eq!(
        conn.publish(MqttMessage::new("a/b", QoS::AtMostOnce, "x")).await,
        not_connected
    );
    assert_eq!(
        conn.subscribe("a/#", QoS::AtLeastOnce, None).await,
        not_connected
    );
    assert_eq!(conn.unsubscribe("a/#", None).await, not_connected);
    assert!(broker.client_frames().is_empty());
}

#[tokio::test]
async fn test_close_clears_subscriptions_but_keeps_global_handler() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "clear-on-close").await;
    let global = mqtt_session::testing::MessageCollector::new();
    conn.set_message_handler(Some(global.handler()));
    conn.subscribe("sensors/#", QoS::AtLeastOnce, None)
        .await
        .unwrap();
    assert_eq!(conn.subscriptions().len(), 1);

    // Act
    conn.close().await.unwrap();

    // Assert
    assert!(conn.subscriptions().is_empty());

    conn.open().await.unwrap();
    conn.subscribe("alerts", QoS::AtMostOnce, None).await.unwrap();
    broker.inject(MqttMessage::new("alerts", QoS::AtMostOnce, "fire"));
    assert!(global.wait_for(1, WAIT).await);
    assert_eq!(global.payloads(), vec!["fire"]);
}

#[tokio::test]
async fn test_session_parameters_reach_the_broker() {
    // Arrange
    let broker = MockBroker::new();
    let mut config = test_config("persistent");
    config.clean_session = false;
    config.keep_alive_secs = 15;
    config.username = Some("meter".to_string());
    config.password = Some("secret".to_string());
    let conn = connection(&broker, config);

    // Act
    conn.open().await.unwrap();

    // Assert
    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    assert!(!connects[0].clean_session);
    assert_eq!(connects[0].keep_alive, 15);
    assert_eq!(connects[0].username.as_deref(), Some("meter"));
}

#[tokio::test(start_paused = true)]
async fn test_generated_client_id_survives_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "").await;

    // Act
    broker.drop_connections();
    assert!(wait_until(WAIT, || broker.connects().len() == 2).await);

    // Assert
    let connects = broker.connects();
    assert!(connects[0].client_id.starts_with("mqtt-"));
    assert_eq!(connects[0].client_id, connects[1].client_id);
    assert_eq!(conn.config().client_id, connects[0].client_id);
}

#[tokio::test]
async fn test_reconfigure_disconnects_old_session_before_connecting_new() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "first").await;
    let mut config = ConnectionConfig::new("mqtt://second-broker:2883", "second");
    config.reconnect_delay_secs = 1;

    // Act
    let result = conn.reconfigure(config).await;

    // Assert
    assert_eq!(result, Ok(()));
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(conn.config().client_id, "second");
    assert_eq!(broker.disconnects(), 1);

    let connects = broker.connects();
    assert_eq!(connects.len(), 2);
    assert_eq!(connects[0].endpoint, "mock-broker:1883");
    assert_eq!(connects[0].client_id, "first");
    assert_eq!(connects[1].endpoint, "second-broker:2883");
    assert_eq!(connects[1].client_id, "second");
    assert_eq!(connects[1].concurrent_sessions, 0);
}

#[tokio::test]
async fn test_reconfigure_removes_subscriptions() {
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "resub").await;
    conn.subscribe("a/b", QoS::AtLeastOnce, None).await.unwrap();

    conn.reconfigure(test_config("resub-2")).await.unwrap();

    assert!(conn.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_fails_earlier_open_request() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let conn = connection(&broker, test_config("before"));
    let first_open = conn.open();
    assert!(wait_until(WAIT, || broker.connection_attempts() >= 1).await);

    // Act
    broker.set_reachable(true);
    let reconfigured = conn.reconfigure(test_config("after"));

    // Assert
    assert_eq!(first_open.await, Err(MqttError::Closed));
    assert_eq!(reconfigured.await, Ok(()));
    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].client_id, "after");
}

#[tokio::test]
async fn test_reconfigure_with_invalid_config_is_rejected() {
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "keep-me").await;

    let result = conn
        .reconfigure(ConnectionConfig::new("ws://elsewhere:80", "nope"))
        .await;

    assert!(matches!(result, Err(MqttError::Config(_))));
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(conn.config().client_id, "keep-me");
}

#[tokio::test(start_paused = true)]
async fn test_dropping_connection_stops_reconnecting() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let conn = connection(&broker, test_config("dropped"));
    drop(conn.open());
    assert!(wait_until(WAIT, || broker.connection_attempts() >= 2).await);

    // Act
    drop(conn);
    let attempts = broker.connection_attempts();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Assert
    assert!(broker.connection_attempts() <= attempts + 1);
}

async fn reaches(
    states: &mut tokio::sync::watch::Receiver<ConnectionState>,
    target: ConnectionState,
) -> bool {
    match tokio::time::timeout(WAIT, states.wait_for(|s| *s == target)).await {
        Ok(seen) => seen.is_ok(),
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_watch_state_observes_transitions() {
    // Arrange
    let broker = MockBroker::new();
    let conn = connection(&broker, test_config("watched"));
    let mut states = conn.watch_state();
    assert_eq!(*states.borrow(), ConnectionState::Closed);

    // Act
    conn.open().await.unwrap();

    // Assert
    assert!(reaches(&mut states, ConnectionState::Open).await);
    conn.close().await.unwrap();
    assert!(reaches(&mut states, ConnectionState::Closed).await);
}

#[test]
fn test_connection_requires_runtime() {
    let broker = MockBroker::new();

    let result = MqttConnection::with_transport(test_config("no-runtime"), Arc::new(broker));

    assert!(matches!(result, Err(MqttError::Config(_))));
}
