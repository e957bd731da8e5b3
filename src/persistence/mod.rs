//! Persistence port consumed by the relay core
//!
//! The core never issues queries of its own. It depends on the contracts of
//! [`Persistence`]: topic creation is an upsert keyed by
//! `(connection_id, topic)`, and message creation either stores a complete
//! row (derived fields included) or fails.

pub mod extract;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub use extract::{extract_derived_fields, key_type, DerivedFields};
pub use memory::MemoryStore;

/// A registered broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: i64,
    pub name: String,
    /// Broker host, without scheme or port
    pub broker_url: String,
    pub port: u16,
    /// Transport scheme: mqtt, mqtts, ws, wss (tcp/ssl accepted as aliases)
    pub protocol: String,
    pub client_id: String,
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub use_auth: bool,
    pub is_connected: bool,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    /// Credentials to present, only when auth is enabled and both parts exist
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if !self.use_auth {
            return None;
        }
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// `scheme://host:port` as shown to operators
    pub fn broker_address(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.broker_url, self.port)
    }
}

/// Fields accepted when registering a connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewConnection {
    pub name: String,
    pub broker_url: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_auth: bool,
    #[serde(default = "default_user_id")]
    pub user_id: i64,
}

fn default_protocol() -> String {
    "mqtt".to_string()
}

fn default_user_id() -> i64 {
    1
}

/// Partial connection update; the relay core only ever touches `is_connected`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionPatch {
    pub is_connected: Option<bool>,
}

impl ConnectionPatch {
    pub fn connected(is_connected: bool) -> Self {
        Self {
            is_connected: Some(is_connected),
        }
    }
}

/// A topic subscription, unique per `(connection_id, topic)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicSubscription {
    pub id: i64,
    pub connection_id: i64,
    pub topic: String,
    pub qos: u8,
    pub is_subscribed: bool,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTopic {
    pub connection_id: i64,
    pub topic: String,
    pub qos: u8,
    pub is_subscribed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicPatch {
    pub qos: Option<u8>,
    pub is_subscribed: Option<bool>,
}

/// A stored message, inbound or outbound
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub connection_id: i64,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub timestamp: DateTime<Utc>,
    pub extracted_keys: Option<BTreeMap<String, Value>>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub device_id: Option<String>,
}

/// Catalogue entry for a key seen in a topic's payloads, unique per
/// `(topic, key_name)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicKey {
    pub id: i64,
    pub topic: String,
    /// Dotted path as produced by payload flattening
    pub key_name: String,
    pub key_type: String,
    pub last_value: Value,
    pub value_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One observed value of a topic key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub message_id: i64,
    pub connection_id: i64,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub connection_id: i64,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage backend failure: {message}")]
    Backend { message: String },
    #[error("Invalid record: {message}")]
    InvalidRecord { message: String },
}

impl PersistenceError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Storage operations the relay depends on
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_connection(&self, id: i64) -> PersistenceResult<Option<Connection>>;

    async fn list_connections(&self) -> PersistenceResult<Vec<Connection>>;

    async fn create_connection(&self, new: NewConnection) -> PersistenceResult<Connection>;

    /// Returns `None` when the connection does not exist
    async fn update_connection(
        &self,
        id: i64,
        patch: ConnectionPatch,
    ) -> PersistenceResult<Option<Connection>>;

    /// Removes the connection along with its topics and messages
    async fn delete_connection(&self, id: i64) -> PersistenceResult<bool>;

    async fn get_topics_by_connection(
        &self,
        connection_id: i64,
    ) -> PersistenceResult<Vec<TopicSubscription>>;

    /// Upsert on `(connection_id, topic)`: an existing row has its qos and
    /// flag updated in place
    async fn create_topic(&self, new: NewTopic) -> PersistenceResult<TopicSubscription>;

    async fn update_topic(
        &self,
        topic_id: i64,
        patch: TopicPatch,
    ) -> PersistenceResult<Option<TopicSubscription>>;

    /// Stores a message with derived fields populated and folds its
    /// extracted keys into the topic-key catalogue
    async fn create_message(&self, new: NewMessage) -> PersistenceResult<Message>;

    /// Newest first
    async fn get_messages(
        &self,
        connection_id: Option<i64>,
        limit: usize,
    ) -> PersistenceResult<Vec<Message>>;

    /// Newest first, across every connection
    async fn get_messages_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> PersistenceResult<Vec<Message>>;

    /// Ordered by key name
    async fn get_topic_keys(&self, topic: &str) -> PersistenceResult<Vec<TopicKey>>;

    /// Stored values of one key, newest first
    async fn get_key_values(
        &self,
        topic: &str,
        key_name: &str,
        limit: usize,
    ) -> PersistenceResult<Vec<KeyValue>>;

    /// Returns the number of rows removed
    async fn clear_messages(&self, connection_id: Option<i64>) -> PersistenceResult<u64>;
}
