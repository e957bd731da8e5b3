//! Test helpers and utilities for integration tests

use chrono::Utc;
use mqtt_relay::config::RelayConfig;
use mqtt_relay::persistence::{Connection, MemoryStore, NewTopic, Persistence};
use mqtt_relay::service::RelayService;
use mqtt_relay::testing::MockConnector;
use std::sync::Arc;
use std::time::Duration;

/// A relay wired to a mock broker and an in-memory store
#[allow(dead_code)]
pub struct TestRelay {
    pub service: Arc<RelayService>,
    pub connector: MockConnector,
    pub store: Arc<MemoryStore>,
}

/// Configuration with short timeouts for tests
#[allow(dead_code)]
pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.mqtt.connect_timeout_secs = 2;
    config.mqtt.ack_timeout_secs = 1;
    config.gateway.shutdown_grace_secs = 2;
    config
}

#[allow(dead_code)]
pub fn test_relay() -> TestRelay {
    let connector = MockConnector::new();
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(RelayService::new(
        &test_config(),
        Arc::new(connector.clone()),
        store.clone(),
    ));
    TestRelay {
        service,
        connector,
        store,
    }
}

/// Store a connection under a fixed id
#[allow(dead_code)]
pub async fn seed_connection(store: &MemoryStore, id: i64, broker: &str, port: u16) -> Connection {
    store
        .insert_connection(Connection {
            id,
            name: format!("connection {id}"),
            broker_url: broker.to_string(),
            port,
            protocol: "mqtt".to_string(),
            client_id: format!("dashboard-{id}"),
            username: None,
            password: None,
            use_auth: false,
            is_connected: false,
            user_id: 1,
            created_at: Utc::now(),
        })
        .await
}

/// Persist a topic as subscribed
#[allow(dead_code)]
pub async fn seed_topic(store: &MemoryStore, connection_id: i64, topic: &str, qos: u8) {
    store
        .create_topic(NewTopic {
            connection_id,
            topic: topic.to_string(),
            qos,
            is_subscribed: true,
        })
        .await
        .unwrap();
}

#[allow(dead_code)]
pub async fn stored_flag(store: &MemoryStore, id: i64) -> bool {
    store.get_connection(id).await.unwrap().unwrap().is_connected
}

/// Wait up to a second for the store to hold `count` messages
#[allow(dead_code)]
pub async fn wait_for_messages(store: &MemoryStore, count: usize) -> bool {
    for _ in 0..200 {
        if store.message_count().await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Wait up to a second for the stored connected flag to reach `expected`
#[allow(dead_code)]
pub async fn wait_for_flag(store: &MemoryStore, id: i64, expected: bool) -> bool {
    for _ in 0..200 {
        if stored_flag(store, id).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
