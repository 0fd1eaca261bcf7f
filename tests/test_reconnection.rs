//! Reconnection and connection observer tests
//!
//! The broker drops the link; the connection must report the loss, fail
//! in-flight operations and come back after the reconnect delay.


use mqtt_session::testing::{wait_until, MessageCollector, MockBroker, ObserverEvent, RecordingObserver};
use mqtt_session::{
    ConnectionObserver, ConnectionState, MqttConnection, MqttError, MqttMessage, QoS,
};
use rumqttc::mqttbytes::v4::{Packet, PubRec, Publish};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connection, open_connection, test_config, wait_for_state, WAIT};

#[tokio::test(start_paused = true)]
async fn test_observer_sees_loss_and_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let observer = RecordingObserver::new();
    let conn = connection(&broker, test_config("observed"));
    conn.set_connection_observer(Some(observer.clone()));
    conn.open().await.unwrap();

    // Act
    broker.drop_connections();
    assert!(wait_until(WAIT, || observer.established_count() == 2).await);

    // Assert
    let events = observer.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], ObserverEvent::Established { reconnected: false });
    assert!(matches!(
        &events[1],
        ObserverEvent::Lost {
            will_reconnect: true,
            cause: MqttError::ConnectionLost { .. }
        }
    ));
    assert_eq!(events[2], ObserverEvent::Established { reconnected: true });
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(broker.connects().len(), 2);
}

#[tokio::test]
async fn test_close_is_not_reported_as_loss() {
    let broker = MockBroker::new();
    let observer = RecordingObserver::new();
    let conn = connection(&broker, test_config("quiet-close"));
    conn.set_connection_observer(Some(observer.clone()));
    conn.open().await.unwrap();

    conn.close().await.unwrap();

    assert_eq!(observer.events(), vec![ObserverEvent::Established { reconnected: false }]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempts_are_not_reported_to_observer() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let observer = RecordingObserver::new();
    let conn = connection(&broker, test_config("unlucky"));
    conn.set_connection_observer(Some(observer.clone()));

    // Act
    let open = conn.open();
    assert!(wait_until(WAIT, || broker.connection_attempts() >= 3).await);
    broker.set_reachable(true);
    open.await.unwrap();

    // Assert
    assert_eq!(observer.events(), vec![ObserverEvent::Established { reconnected: false }]);
}

#[tokio::test(start_paused = true)]
async fn test_loss_without_reconnect_closes_connection() {
    // Arrange
    let broker = MockBroker::new();
    let observer = RecordingObserver::new();
    let mut config = test_config("one-shot");
    config.reconnect = false;
    let conn = connection(&broker, config);
    conn.set_connection_observer(Some(observer.clone()));
    conn.open().await.unwrap();

    // Act
    broker.drop_connections();

    // Assert
    assert!(wait_for_state(&conn, ConnectionState::Closed).await);
    assert!(wait_until(WAIT, || observer.lost_count() == 1).await);
    assert!(matches!(
        &observer.events()[1],
        ObserverEvent::Lost {
            will_reconnect: false,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connection_attempts(), 1);
    assert_eq!(observer.established_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_operations_fail_on_connection_loss() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "in-flight").await;
    broker.set_ack_publishes(false);
    broker.set_ack_subscribes(false);
    let publish = conn.publish(MqttMessage::new("jobs/1", QoS::AtLeastOnce, "x"));
    let subscribe = conn.subscribe("jobs/#", QoS::AtLeastOnce, None);
    assert_eq!(conn.pending_operations(), 2);

    // Act
    broker.drop_connections();

    // Assert
    assert!(matches!(publish.await, Err(MqttError::ConnectionLost { .. })));
    assert!(matches!(subscribe.await, Err(MqttError::ConnectionLost { .. })));
    assert_eq!(conn.pending_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_operations_fail_fast_while_reconnecting() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "waiting").await;
    broker.set_reachable(false);

    // Act
    broker.drop_connections();
    assert!(wait_until(WAIT, || !conn.is_open()).await);
    let result = conn
        .publish(MqttMessage::new("late/data", QoS::AtLeastOnce, "x"))
        .await;

    // Assert
    assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_are_not_restored_automatically() {
    // Arrange
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "forgetful").await;
    let received = MessageCollector::new();
    conn.subscribe("news/#", QoS::AtLeastOnce, Some(received.handler()))
        .await
        .unwrap();

    // Act
    broker.drop_connections();
    assert!(wait_until(WAIT, || broker.connects().len() == 2 && conn.is_open()).await);
    broker.inject(MqttMessage::new("news/today", QoS::AtLeastOnce, "headline"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Assert: the broker forgot the clean session, nothing is resubscribed
    assert!(received.is_empty());
    assert_eq!(broker.subscribe_requests().len(), 1);
    assert!(broker.active_subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_observer_resubscribes_after_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let received = MessageCollector::new();
    let observer = RecordingObserver::new();
    observer.resubscribe_on_connect("news/#", QoS::AtLeastOnce, Some(received.handler()));
    let conn = connection(&broker, test_config("resubscriber"));
    conn.set_connection_observer(Some(observer.clone()));
    conn.open().await.unwrap();
    assert!(wait_until(WAIT, || broker.active_subscriptions().len() == 1).await);

    // Act
    broker.drop_connections();
    assert!(wait_until(WAIT, || {
        observer.established_count() == 2 && broker.active_subscriptions().len() == 1
    })
    .await);
    broker.inject(MqttMessage::new("news/today", QoS::AtLeastOnce, "headline"));

    // Assert
    assert!(received.wait_for(1, WAIT).await);
    assert_eq!(received.payloads(), vec!["headline"]);
    assert_eq!(conn.subscriptions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_session_keeps_delivering_after_reconnect() {
    // Arrange
    let broker = MockBroker::new();
    let mut config = test_config("durable");
    config.clean_session = false;
    let conn = connection(&broker, config);
    conn.open().await.unwrap();
    let received = MessageCollector::new();
    conn.subscribe("orders/#", QoS::AtLeastOnce, Some(received.handler()))
        .await
        .unwrap();

    // Act
    broker.drop_connections();
    assert!(wait_until(WAIT, || broker.connects().len() == 2 && conn.is_open()).await);
    broker.inject(MqttMessage::new("orders/7", QoS::AtLeastOnce, "shipped"));

    // Assert: the broker kept the subscription and the handler is still registered
    assert!(received.wait_for(1, WAIT).await);
    assert_eq!(broker.subscribe_requests().len(), 1);
    assert!(broker.connects().iter().all(|c| !c.clean_session));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_drops_recover_each_time() {
    // Arrange
    let broker = MockBroker::new();
    let observer = RecordingObserver::new();
    let conn = connection(&broker, test_config("resilient"));
    conn.set_connection_observer(Some(observer.clone()));
    conn.open().await.unwrap();

    // Act
    for round in 2..=5 {
        broker.drop_connections();
        assert!(
            wait_until(WAIT, || observer.established_count() == round).await,
            "no reconnect in round {round}"
        );
    }

    // Assert
    assert_eq!(observer.lost_count(), 4);
    assert_eq!(broker.connects().len(), 5);
    assert_eq!(broker.session_count(), 1);
    assert_eq!(
        conn.publish(MqttMessage::new("after/drops", QoS::AtLeastOnce, "ok"))
            .await,
        Ok(())
    );
}

fn exactly_once(pkid: u16, payload: &str) -> Packet {
    let mut publish = Publish::new("orders/1", QoS::ExactlyOnce, payload.as_bytes().to_vec());
    publish.pkid = pkid;
    Packet::Publish(publish)
}

fn pubrec_count(broker: &MockBroker, pkid: u16) -> usize {
    let wanted = Packet::PubRec(PubRec::new(pkid));
    broker
        .client_frames()
        .iter()
        .filter(|frame| **frame == wanted)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_clean_session_forgets_unreleased_exactly_once_ids() {
    // Arrange: a QoS 2 delivery is interrupted between PUBREC and PUBREL
    let broker = MockBroker::new();
    let conn = open_connection(&broker, "fresh-ids").await;
    let received = MessageCollector::new();
    conn.subscribe("orders/#", QoS::ExactlyOnce, Some(received.handler()))
        .await
        .unwrap();
    broker.set_release_incoming(false);
    broker.send_to_clients(exactly_once(7, "first"));
    assert!(wait_until(WAIT, || pubrec_count(&broker, 7) == 1).await);

    // Act: the new clean session reuses the packet id
    broker.drop_connections();
    assert!(wait_until(WAIT, || broker.connects().len() == 2 && conn.is_open()).await);
    broker.send_to_clients(exactly_once(7, "second"));

    // Assert
    assert!(received.wait_for(2, WAIT).await);
    assert_eq!(received.payloads(), vec!["first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn test_resumed_session_still_suppresses_redelivery() {
    // Arrange
    let broker = MockBroker::new();
    let mut config = test_config("resumed-ids");
    config.clean_session = false;
    let conn = connection(&broker, config);
    conn.open().await.unwrap();
    let received = MessageCollector::new();
    conn.subscribe("orders/#", QoS::ExactlyOnce, Some(received.handler()))
        .await
        .unwrap();
    broker.set_release_incoming(false);
    broker.send_to_clients(exactly_once(7, "first"));
    assert!(wait_until(WAIT, || pubrec_count(&broker, 7) == 1).await);

    // Act: the broker resumes the session and redelivers the same id
    broker.drop_connections();
    assert!(wait_until(WAIT, || broker.connects().len() == 2 && conn.is_open()).await);
    broker.send_to_clients(exactly_once(7, "first"));

    // Assert: acknowledged again, delivered once
    assert!(wait_until(WAIT, || pubrec_count(&broker, 7) == 2).await);
    assert_eq!(received.payloads(), vec!["first"]);
}

struct PanickingObserver {
    calls: AtomicUsize,
}

impl ConnectionObserver for PanickingObserver {
    fn on_connection_lost(&self, _connection: &MqttConnection, _will_reconnect: bool, _cause: &MqttError) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("observer failure on loss");
    }

    fn on_connection_established(&self, _connection: &MqttConnection, _reconnected: bool) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("observer failure on connect");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_observer_does_not_break_connection() {
    // Arrange
    let broker = MockBroker::new();
    let observer = Arc::new(PanickingObserver {
        calls: AtomicUsize::new(0),
    });
    let conn = connection(&broker, test_config("robust"));
    conn.set_connection_observer(Some(observer.clone()));

    // Act
    let opened = conn.open().await;
    broker.drop_connections();
    assert!(wait_until(WAIT, || observer.calls.load(Ordering::SeqCst) == 3).await);

    // Assert
    assert_eq!(opened, Ok(()));
    assert!(wait_for_state(&conn, ConnectionState::Open).await);
    assert_eq!(
        conn.publish(MqttMessage::new("still/up", QoS::AtLeastOnce, "ok"))
            .await,
        Ok(())
    );
}

#[tokio::test(start_paused = true)]
async fn test_observer_may_close_connection_from_callback() {
    // Arrange
    struct CloseOnLoss;
    impl ConnectionObserver for CloseOnLoss {
        fn on_connection_lost(&self, connection: &MqttConnection, _will_reconnect: bool, _cause: &MqttError) {
            drop(connection.close());
        }
    }
    let broker = MockBroker::new();
    let conn = connection(&broker, test_config("self-closing"));
    conn.set_connection_observer(Some(Arc::new(CloseOnLoss)));
    conn.open().await.unwrap();

    // Act
    broker.drop_connections();

    // Assert
    assert!(wait_for_state(&conn, ConnectionState::Closed).await);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connection_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Closed);
}
