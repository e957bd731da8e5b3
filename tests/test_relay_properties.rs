//! Behavioural properties of the relay core
//!
//! Runs the registry, sessions and fan-out bus together against a mock
//! broker and the in-memory store.

mod test_helpers;

use futures::future::join_all;
use mqtt_relay::bus::ChannelObserver;
use mqtt_relay::error::RelayError;
use mqtt_relay::persistence::Persistence;
use mqtt_relay::protocol::LiveEvent;
use mqtt_relay::testing::{FailingObserver, LinkOperation};
use rumqttc::QoS;
use std::sync::Arc;
use test_helpers::{
    seed_connection, seed_topic, stored_flag, test_relay, wait_for_flag, wait_for_messages,
};

#[tokio::test]
async fn test_concurrent_connects_leave_one_session() {
    let relay = test_relay();
    seed_connection(&relay.store, 1, "broker", 1883).await;
    let attempts = (0..6).map(|_| {
        let service = relay.service.clone();
        tokio::spawn(async move { service.registry().connect(1).await })
    });
    let results = join_all(attempts).await;

    let succeeded = results
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|result| match result {
            Ok(()) => true,
            Err(RelayError::Superseded { .. }) => false,
            Err(other) => panic!("unexpected connect failure: {other}"),
        })
        .count();

    assert!(succeeded >= 1);
    assert_eq!(relay.service.registry().session_count().await, 1);
    assert_eq!(relay.connector.open_links(1), 1);
    assert!(relay.service.registry().status(1).await);
    assert!(stored_flag(&relay.store, 1).await);
}

#[tokio::test]
async fn test_disconnect_always_clears_flag() {
    let relay = test_relay();
    seed_connection(&relay.store, 2, "broker", 1883).await;
    let registry = relay.service.registry();

    registry.connect(2).await.unwrap();
    assert!(stored_flag(&relay.store, 2).await);
    registry.disconnect(2).await;
    assert!(!stored_flag(&relay.store, 2).await);

    // Again with no session at all
    registry.disconnect(2).await;
    assert!(!stored_flag(&relay.store, 2).await);
}

#[tokio::test]
async fn test_persisted_topics_resubscribed_on_connect() {
    let relay = test_relay();
    seed_connection(&relay.store, 3, "broker", 1883).await;
    seed_topic(&relay.store, 3, "plant/line1/temp", 0).await;
    seed_topic(&relay.store, 3, "plant/line2/temp", 1).await;

    relay.service.registry().connect(3).await.unwrap();

    let link = relay.connector.latest_link(3).unwrap();
    let mut subscribed: Vec<String> = link
        .subscribe_calls()
        .into_iter()
        .map(|(topic, _)| topic)
        .collect();
    subscribed.sort();
    assert_eq!(subscribed, vec!["plant/line1/temp", "plant/line2/temp"]);

    link.inject("plant/line1/temp", "20.5", QoS::AtMostOnce, false)
        .await;
    link.inject("plant/line2/temp", "21.0", QoS::AtLeastOnce, false)
        .await;

    assert!(wait_for_messages(&relay.store, 2).await);
    let messages = relay.store.get_messages(Some(3), 10).await.unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_automatic_reconnect_reissues_subscriptions() {
    let relay = test_relay();
    seed_connection(&relay.store, 4, "broker", 1883).await;
    let registry = relay.service.registry();
    registry.connect(4).await.unwrap();
    registry.subscribe(4, "alarms/#", 1).await.unwrap();
    let link = relay.connector.latest_link(4).unwrap();

    link.drop_link("keepalive timeout").await;
    assert!(wait_for_flag(&relay.store, 4, false).await);
    assert!(!registry.status(4).await);

    link.restore().await;
    assert!(wait_for_flag(&relay.store, 4, true).await);
    assert!(registry.status(4).await);

    let alarm_subscribes = link
        .operations()
        .into_iter()
        .filter(|op| matches!(op, LinkOperation::Subscribe { topic, .. } if topic == "alarms/#"))
        .count();
    assert_eq!(alarm_subscribes, 2);
}

#[tokio::test]
async fn test_failing_observer_does_not_block_others() {
    let relay = test_relay();
    seed_connection(&relay.store, 5, "broker", 1883).await;
    relay.service.registry().connect(5).await.unwrap();

    let bus = relay.service.bus();
    let (first, mut first_rx) = ChannelObserver::channel();
    let (second, mut second_rx) = ChannelObserver::channel();
    bus.register(Arc::new(first));
    let failing = bus.register(Arc::new(FailingObserver));
    bus.register(Arc::new(second));

    relay
        .connector
        .latest_link(5)
        .unwrap()
        .inject("line/state", "running", QoS::AtMostOnce, false)
        .await;

    let first_event = first_rx.recv().await.unwrap();
    let second_event = second_rx.recv().await.unwrap();
    assert!(matches!(first_event.as_ref(), LiveEvent::MqttMessage(m) if m.topic == "line/state"));
    assert!(matches!(second_event.as_ref(), LiveEvent::MqttMessage(_)));
    assert!(!bus.is_registered(failing));
    assert_eq!(bus.observer_count(), 2);
}

#[tokio::test]
async fn test_unsubscribe_twice_keeps_one_record() {
    let relay = test_relay();
    seed_connection(&relay.store, 6, "broker", 1883).await;
    let registry = relay.service.registry();
    registry.connect(6).await.unwrap();

    registry.subscribe(6, "sensors/humidity", 1).await.unwrap();
    registry.subscribe(6, "sensors/humidity", 2).await.unwrap();
    registry.unsubscribe(6, "sensors/humidity").await.unwrap();
    registry.unsubscribe(6, "sensors/humidity").await.unwrap();

    let topics = relay.store.get_topics_by_connection(6).await.unwrap();
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].qos, 2);
    assert!(!topics[0].is_subscribed);
}

#[tokio::test]
async fn test_end_to_end_inbound_message() {
    let relay = test_relay();
    let connection = seed_connection(&relay.store, 7, "broker", 1883).await;
    assert_eq!(connection.broker_address(), "mqtt://broker:1883");
    seed_topic(&relay.store, 7, "sensors/temp", 1).await;

    let (observer_a, mut rx_a) = ChannelObserver::channel();
    let (observer_b, mut rx_b) = ChannelObserver::channel();
    relay.service.bus().register(Arc::new(observer_a));
    relay.service.bus().register(Arc::new(observer_b));

    relay.service.registry().connect(7).await.unwrap();
    assert!(relay.service.registry().status(7).await);
    assert!(stored_flag(&relay.store, 7).await);

    let link = relay.connector.latest_link(7).unwrap();
    assert_eq!(
        link.subscribe_calls(),
        vec![("sensors/temp".to_string(), QoS::AtLeastOnce)]
    );

    link.inject("sensors/temp", r#"{"t":22.5}"#, QoS::AtLeastOnce, false)
        .await;

    for rx in [&mut rx_a, &mut rx_b] {
        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            LiveEvent::MqttMessage(message) => {
                assert_eq!(message.connection_id, 7);
                assert_eq!(message.topic, "sensors/temp");
                assert_eq!(message.qos, 1);
                assert!(!message.retain);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    let stored = relay.store.get_messages(Some(7), 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].payload, r#"{"t":22.5}"#);

    let topics = relay.store.get_topics_by_connection(7).await.unwrap();
    assert_eq!(topics[0].message_count, 1);
}

#[tokio::test]
async fn test_message_survives_store_failure_on_previous_one() {
    let relay = test_relay();
    seed_connection(&relay.store, 8, "broker", 1883).await;
    relay.service.registry().connect(8).await.unwrap();
    let link = relay.connector.latest_link(8).unwrap();

    relay.store.fail_message_writes(true);
    link.inject("meter/kwh", "1.2", QoS::AtMostOnce, false).await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    relay.store.fail_message_writes(false);
    link.inject("meter/kwh", "1.3", QoS::AtMostOnce, false).await;

    assert!(wait_for_messages(&relay.store, 1).await);
    assert!(relay.service.registry().status(8).await);
}
