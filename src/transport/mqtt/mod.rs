//! rumqttc-backed broker links
//!
//! The module keeps pure logic apart from I/O so most of it can be tested
//! without a broker:
//!
//! - [`connection`] - option building, state transitions, error classification
//! - [`message_handler`] - routing of polled rumqttc events
//! - [`acks`] - correlation of requests with broker acknowledgments
//! - [`client`] - the connector, the link and its event-loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_relay::transport::mqtt::RumqttConnector;
//! use mqtt_relay::transport::{BrokerConnector, BrokerOptions, BrokerScheme};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let options = BrokerOptions {
//!     connection_id: 1,
//!     scheme: BrokerScheme::Tcp,
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     path: "/mqtt".to_string(),
//!     client_id: "dashboard-1".to_string(),
//!     credentials: None,
//!     keep_alive: Duration::from_secs(60),
//!     clean_session: true,
//!     reconnect_period: Duration::from_secs(5),
//!     request_capacity: 10,
//! };
//!
//! let opened = RumqttConnector::new().open(&options).await?;
//! opened.link.subscribe("sensors/#", rumqttc::QoS::AtLeastOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod acks;
pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttConnector, RumqttLink};
pub use connection::{ConnectionState, LinkFailure};
