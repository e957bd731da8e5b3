//! In-memory persistence backend
//!
//! Used by the binary when no external store is wired in, and by tests as
//! the fake persistence port. Message writes can be forced to fail so the
//! swallow-and-log paths of the core can be exercised.

use super::{
    extract_derived_fields, key_type, Connection, ConnectionPatch, KeyValue, Message,
    NewConnection, NewMessage, NewTopic, Persistence, PersistenceError, PersistenceResult,
    TopicKey, TopicPatch, TopicSubscription,
};
use crate::config::ConnectionSeed;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct StoreState {
    connections: BTreeMap<i64, Connection>,
    topics: BTreeMap<i64, TopicSubscription>,
    messages: Vec<Message>,
    topic_keys: BTreeMap<(String, String), TopicKey>,
    next_connection_id: i64,
    next_topic_id: i64,
    next_message_id: i64,
    next_topic_key_id: i64,
}

impl StoreState {
    fn allocate(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }

    fn record_topic_keys(&mut self, message: &Message, seen_at: DateTime<Utc>) {
        let Some(keys) = &message.extracted_keys else {
            return;
        };
        for (name, value) in keys {
            let slot = (message.topic.clone(), name.clone());
            if let Some(entry) = self.topic_keys.get_mut(&slot) {
                entry.key_type = key_type(value).to_string();
                entry.last_value = value.clone();
                entry.value_count += 1;
                entry.last_seen_at = seen_at;
                continue;
            }
            let id = Self::allocate(&mut self.next_topic_key_id);
            self.topic_keys.insert(
                slot,
                TopicKey {
                    id,
                    topic: message.topic.clone(),
                    key_name: name.clone(),
                    key_type: key_type(value).to_string(),
                    last_value: value.clone(),
                    value_count: 1,
                    first_seen_at: seen_at,
                    last_seen_at: seen_at,
                },
            );
        }
    }
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    fail_message_writes: AtomicBool,
    fail_connection_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated from configuration seeds
    pub async fn from_seeds(seeds: &[ConnectionSeed]) -> PersistenceResult<Self> {
        let store = Self::new();
        for seed in seeds {
            let connection = store
                .create_connection(NewConnection {
                    name: seed.name.clone(),
                    broker_url: seed.broker_url.clone(),
                    port: seed.port,
                    protocol: seed.protocol.clone(),
                    client_id: seed.client_id.clone(),
                    username: seed.username.clone(),
                    password: seed.password(),
                    use_auth: seed.use_auth,
                    user_id: seed.user_id,
                })
                .await?;

            for topic in &seed.topics {
                store
                    .create_topic(NewTopic {
                        connection_id: connection.id,
                        topic: topic.topic.clone(),
                        qos: topic.qos,
                        is_subscribed: true,
                    })
                    .await?;
            }

            info!(
                connection_id = connection.id,
                broker = %connection.broker_address(),
                topics = seed.topics.len(),
                "Seeded broker connection"
            );
        }
        Ok(store)
    }

    /// Make every subsequent `create_message` fail
    pub fn fail_message_writes(&self, fail: bool) {
        self.fail_message_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `update_connection` fail
    pub fn fail_connection_updates(&self, fail: bool) {
        self.fail_connection_updates.store(fail, Ordering::SeqCst);
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Store a connection under its own id, replacing any existing row
    pub async fn insert_connection(&self, connection: Connection) -> Connection {
        let mut state = self.state.write().await;
        state.next_connection_id = state.next_connection_id.max(connection.id);
        state.connections.insert(connection.id, connection.clone());
        connection
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_connection(&self, id: i64) -> PersistenceResult<Option<Connection>> {
        Ok(self.state.read().await.connections.get(&id).cloned())
    }

    async fn list_connections(&self) -> PersistenceResult<Vec<Connection>> {
        Ok(self.state.read().await.connections.values().cloned().collect())
    }

    async fn create_connection(&self, new: NewConnection) -> PersistenceResult<Connection> {
        if new.broker_url.trim().is_empty() {
            return Err(PersistenceError::InvalidRecord {
                message: "broker_url is required".to_string(),
            });
        }

        let mut state = self.state.write().await;
        let id = StoreState::allocate(&mut state.next_connection_id);
        let connection = Connection {
            id,
            name: new.name,
            broker_url: new.broker_url,
            port: new.port,
            protocol: new.protocol,
            client_id: new.client_id,
            username: new.username,
            password: new.password,
            use_auth: new.use_auth,
            is_connected: false,
            user_id: new.user_id,
            created_at: Utc::now(),
        };
        state.connections.insert(id, connection.clone());
        Ok(connection)
    }

    async fn update_connection(
        &self,
        id: i64,
        patch: ConnectionPatch,
    ) -> PersistenceResult<Option<Connection>> {
        if self.fail_connection_updates.load(Ordering::SeqCst) {
            return Err(PersistenceError::backend("connection updates disabled"));
        }

        let mut state = self.state.write().await;
        let Some(connection) = state.connections.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(is_connected) = patch.is_connected {
            connection.is_connected = is_connected;
        }
        Ok(Some(connection.clone()))
    }

    async fn delete_connection(&self, id: i64) -> PersistenceResult<bool> {
        let mut state = self.state.write().await;
        let existed = state.connections.remove(&id).is_some();
        state.topics.retain(|_, topic| topic.connection_id != id);
        state.messages.retain(|message| message.connection_id != id);
        Ok(existed)
    }

    async fn get_topics_by_connection(
        &self,
        connection_id: i64,
    ) -> PersistenceResult<Vec<TopicSubscription>> {
        Ok(self
            .state
            .read()
            .await
            .topics
            .values()
            .filter(|topic| topic.connection_id == connection_id)
            .cloned()
            .collect())
    }

    async fn create_topic(&self, new: NewTopic) -> PersistenceResult<TopicSubscription> {
        let topic_name = new.topic.trim().to_string();
        if topic_name.is_empty() {
            return Err(PersistenceError::InvalidRecord {
                message: "topic cannot be empty".to_string(),
            });
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state
            .topics
            .values_mut()
            .find(|t| t.connection_id == new.connection_id && t.topic == topic_name)
        {
            existing.qos = new.qos;
            existing.is_subscribed = new.is_subscribed;
            debug!(topic_id = existing.id, topic = %topic_name, "Updated existing topic record");
            return Ok(existing.clone());
        }

        let id = StoreState::allocate(&mut state.next_topic_id);
        let topic = TopicSubscription {
            id,
            connection_id: new.connection_id,
            topic: topic_name,
            qos: new.qos,
            is_subscribed: new.is_subscribed,
            message_count: 0,
            last_message_at: None,
        };
        state.topics.insert(id, topic.clone());
        Ok(topic)
    }

    async fn update_topic(
        &self,
        topic_id: i64,
        patch: TopicPatch,
    ) -> PersistenceResult<Option<TopicSubscription>> {
        let mut state = self.state.write().await;
        let Some(topic) = state.topics.get_mut(&topic_id) else {
            return Ok(None);
        };
        if let Some(qos) = patch.qos {
            topic.qos = qos;
        }
        if let Some(is_subscribed) = patch.is_subscribed {
            topic.is_subscribed = is_subscribed;
        }
        Ok(Some(topic.clone()))
    }

    async fn create_message(&self, new: NewMessage) -> PersistenceResult<Message> {
        if self.fail_message_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::backend("message writes disabled"));
        }

        let derived = extract_derived_fields(&new.payload);
        let now = Utc::now();

        let mut state = self.state.write().await;
        let id = StoreState::allocate(&mut state.next_message_id);
        let message = Message {
            id,
            connection_id: new.connection_id,
            topic: new.topic,
            payload: new.payload,
            qos: new.qos,
            retain: new.retain,
            timestamp: now,
            extracted_keys: derived.extracted_keys,
            latitude: derived.latitude,
            longitude: derived.longitude,
            device_id: derived.device_id,
        };

        if let Some(topic) = state
            .topics
            .values_mut()
            .find(|t| t.connection_id == message.connection_id && t.topic == message.topic)
        {
            topic.message_count += 1;
            topic.last_message_at = Some(now);
        }

        state.record_topic_keys(&message, now);
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages(
        &self,
        connection_id: Option<i64>,
        limit: usize,
    ) -> PersistenceResult<Vec<Message>> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .rev()
            .filter(|m| connection_id.map_or(true, |id| m.connection_id == id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_messages_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> PersistenceResult<Vec<Message>> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .rev()
            .filter(|m| m.topic == topic)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_topic_keys(&self, topic: &str) -> PersistenceResult<Vec<TopicKey>> {
        Ok(self
            .state
            .read()
            .await
            .topic_keys
            .values()
            .filter(|key| key.topic == topic)
            .cloned()
            .collect())
    }

    async fn get_key_values(
        &self,
        topic: &str,
        key_name: &str,
        limit: usize,
    ) -> PersistenceResult<Vec<KeyValue>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.topic == topic)
            .filter_map(|m| {
                let value = m.extracted_keys.as_ref()?.get(key_name)?;
                Some(KeyValue {
                    message_id: m.id,
                    connection_id: m.connection_id,
                    value: value.clone(),
                    timestamp: m.timestamp,
                })
            })
            .take(limit)
            .collect())
    }

    async fn clear_messages(&self, connection_id: Option<i64>) -> PersistenceResult<u64> {
        let mut state = self.state.write().await;
        let before = state.messages.len();
        match connection_id {
            Some(id) => state.messages.retain(|m| m.connection_id != id),
            None => state.messages.clear(),
        }
        Ok((before - state.messages.len()) as u64)
    }
}
