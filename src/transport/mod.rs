//! Broker transport layer
//!
//! This module provides the seam between broker sessions and the network:
//! a [`BrokerConnector`] opens links and a [`BrokerLink`] carries requests
//! for one open link. The production implementation lives in [`mqtt`];
//! tests substitute the mock connector from [`crate::testing`].

use crate::config::MqttSection;
use crate::error::{RelayError, RelayResult};
use crate::persistence::Connection;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub mod mqtt;

/// Transport scheme of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl BrokerScheme {
    pub fn parse(scheme: &str) -> RelayResult<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(BrokerScheme::Tcp),
            "mqtts" | "ssl" => Ok(BrokerScheme::Tls),
            "ws" => Ok(BrokerScheme::Ws),
            "wss" => Ok(BrokerScheme::Wss),
            other => Err(RelayError::invalid_input(format!(
                "unsupported broker scheme '{other}'"
            ))),
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, BrokerScheme::Ws | BrokerScheme::Wss)
    }

    fn url_scheme(self) -> &'static str {
        match self {
            BrokerScheme::Tcp => "mqtt",
            BrokerScheme::Tls => "mqtts",
            BrokerScheme::Ws => "ws",
            BrokerScheme::Wss => "wss",
        }
    }
}

/// Everything needed to open one broker link
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOptions {
    pub connection_id: i64,
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    /// Only meaningful for WebSocket schemes
    pub path: String,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect_period: Duration,
    pub request_capacity: usize,
}

const DEFAULT_WS_PATH: &str = "/mqtt";

impl BrokerOptions {
    /// Derive link options from a stored connection and the relay's tuning
    pub fn from_connection(connection: &Connection, tuning: &MqttSection) -> RelayResult<Self> {
        let scheme = BrokerScheme::parse(&connection.protocol)?;

        let raw = connection.broker_url.trim();
        let raw = raw.split_once("://").map_or(raw, |(_, rest)| rest);
        let (host, path) = match raw.split_once('/') {
            Some((host, path)) => (host, format!("/{path}")),
            None => (raw, DEFAULT_WS_PATH.to_string()),
        };
        if host.is_empty() {
            return Err(RelayError::invalid_input(format!(
                "connection {} has no broker host",
                connection.id
            )));
        }

        let client_id = if connection.client_id.trim().is_empty() {
            format!("relay-{}", uuid::Uuid::new_v4().simple())
        } else {
            connection.client_id.trim().to_string()
        };

        Ok(Self {
            connection_id: connection.id,
            scheme,
            host: host.to_string(),
            port: connection.port,
            path,
            client_id,
            credentials: connection
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            keep_alive: tuning.keep_alive(),
            clean_session: tuning.clean_session,
            reconnect_period: tuning.reconnect_period(),
            request_capacity: tuning.request_capacity,
        })
    }

    /// Full broker URL; WebSocket transports need it as the broker address
    pub fn broker_url(&self) -> RelayResult<String> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme.url_scheme(), self.host))
            .map_err(|e| RelayError::invalid_input(format!("invalid broker host: {e}")))?;
        url.set_port(Some(self.port))
            .map_err(|_| RelayError::invalid_input("broker URL cannot carry a port"))?;
        if self.scheme.is_websocket() {
            url.set_path(&self.path);
        }
        Ok(url.to_string())
    }
}

/// A publish pushed by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Lifecycle and traffic events emitted by an open link, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(InboundPublish),
    /// Link came back after an automatic reconnect
    Online,
    /// Link dropped; the transport will retry on its own
    Offline(String),
    /// Link terminated for good
    Closed,
}

/// An open link plus the stream of its events
pub struct OpenedLink {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Requests against one open broker link.
///
/// Each request resolves on the broker's acknowledgment. Callers bound the
/// wait themselves.
#[async_trait::async_trait]
pub trait BrokerLink: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> RelayResult<()>;

    async fn unsubscribe(&self, topic: &str) -> RelayResult<()>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool)
        -> RelayResult<()>;

    /// Best-effort graceful close; safe on a link that never came up
    async fn disconnect(&self) -> RelayResult<()>;

    /// True only while the broker handshake is complete and the link is up
    fn is_connected(&self) -> bool;
}

/// Opens broker links
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Resolves once the broker has acknowledged the connection
    async fn open(&self, options: &BrokerOptions) -> RelayResult<OpenedLink>;
}

/// Convert a numeric QoS level
pub fn qos_from_u8(level: u8) -> RelayResult<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(RelayError::invalid_input(format!(
            "QoS must be 0, 1 or 2, got {other}"
        ))),
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
