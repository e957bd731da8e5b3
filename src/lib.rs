//! MQTT relay
//!
//! Manages any number of independent MQTT broker connections inside one
//! process, persists every inbound and outbound message, and fans each one
//! out to the browser sessions watching live traffic.
//!
//! # Overview
//!
//! - [`registry::ConnectionRegistry`] keeps at most one [`session::BrokerSession`]
//!   per connection id
//! - [`session::BrokerSession`] owns one broker link, replays persisted
//!   subscriptions on connect and stores every message it sees
//! - [`bus::FanoutBus`] hands each stored message to every registered observer
//! - [`gateway::LiveGateway`] turns browser WebSockets into observers
//! - [`api`] is the warp HTTP surface over [`service::RelayService`]
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_relay::protocol::LiveEvent;
//! use mqtt_relay::{FanoutBus, ChannelObserver};
//! use std::sync::Arc;
//!
//! let bus = FanoutBus::new();
//! let (observer, mut rx) = ChannelObserver::channel();
//! bus.register(Arc::new(observer));
//!
//! let report = bus.broadcast(LiveEvent::connection_established());
//! assert_eq!(report.delivered, 1);
//! assert!(rx.try_recv().is_ok());
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod session;
pub mod testing;
pub mod transport;

pub use bus::{ChannelObserver, FanoutBus, Observer};
pub use config::{RelayConfig, ConfigError};
pub use error::{RelayError, RelayResult};
pub use gateway::LiveGateway;
pub use persistence::{MemoryStore, Persistence};
pub use registry::ConnectionRegistry;
pub use service::RelayService;
pub use session::BrokerSession;
pub use transport::mqtt::RumqttConnector;
