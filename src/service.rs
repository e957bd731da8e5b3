//! Relay service object
//!
//! Owns the registry, the fan-out bus and the live gateway, and is handed by
//! reference to the HTTP layer. There is no process-wide state besides the
//! metrics collector; `shutdown` drains everything explicitly.

use crate::bus::FanoutBus;
use crate::config::{validate_scheme, RelayConfig};
use crate::error::{RelayError, RelayResult};
use crate::gateway::LiveGateway;
use crate::observability::metrics::metrics;
use crate::persistence::{Connection, NewConnection, Persistence, TopicSubscription};
use crate::registry::ConnectionRegistry;
use crate::session::SessionContext;
use crate::transport::BrokerConnector;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct RelayService {
    registry: ConnectionRegistry,
    bus: Arc<FanoutBus>,
    gateway: LiveGateway,
    persistence: Arc<dyn Persistence>,
    stopped: AtomicBool,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: &'static str,
    pub sessions: usize,
    pub connected: usize,
    pub observers: usize,
    pub channels: usize,
    pub timestamp: u64,
}

impl RelayService {
    pub fn new(
        config: &RelayConfig,
        connector: Arc<dyn BrokerConnector>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let bus = Arc::new(FanoutBus::new());
        let ctx = SessionContext {
            connector,
            persistence: persistence.clone(),
            bus: bus.clone(),
            tuning: config.mqtt.clone(),
        };
        Self {
            registry: ConnectionRegistry::new(ctx),
            gateway: LiveGateway::new(bus.clone(), &config.gateway),
            bus,
            persistence,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    pub fn gateway(&self) -> &LiveGateway {
        &self.gateway
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub async fn list_connections(&self) -> RelayResult<Vec<Connection>> {
        Ok(self.persistence.list_connections().await?)
    }

    pub async fn create_connection(&self, new: NewConnection) -> RelayResult<Connection> {
        validate_scheme(&new.protocol)?;
        if new.port == 0 {
            return Err(RelayError::invalid_input("port must be between 1 and 65535"));
        }
        let connection = self.persistence.create_connection(new).await?;
        info!(
            connection_id = connection.id,
            broker = %connection.broker_address(),
            "Connection registered"
        );
        Ok(connection)
    }

    /// Tear down any live session, then remove the connection and its history
    pub async fn delete_connection(&self, connection_id: i64) -> RelayResult<()> {
        if self.persistence.get_connection(connection_id).await?.is_none() {
            return Err(RelayError::NotFound { connection_id });
        }
        self.registry.disconnect(connection_id).await;
        self.persistence.delete_connection(connection_id).await?;
        info!(connection_id, "Connection deleted");
        Ok(())
    }

    pub async fn topics(&self, connection_id: i64) -> RelayResult<Vec<TopicSubscription>> {
        if self.persistence.get_connection(connection_id).await?.is_none() {
            return Err(RelayError::NotFound { connection_id });
        }
        Ok(self.persistence.get_topics_by_connection(connection_id).await?)
    }

    pub async fn health(&self) -> HealthReport {
        let ids = self.registry.connection_ids().await;
        let mut connected = 0;
        for id in &ids {
            if self.registry.status(*id).await {
                connected += 1;
            }
        }
        let status = if self.stopped.load(Ordering::SeqCst) {
            "stopping"
        } else if connected < ids.len() {
            "degraded"
        } else {
            "healthy"
        };
        HealthReport {
            status,
            sessions: ids.len(),
            connected,
            observers: self.bus.observer_count(),
            channels: self.gateway.active_channels(),
            timestamp: metrics().get_metrics().timestamp,
        }
    }

    /// Close every browser channel, then every broker session
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Relay shutdown initiated");
        self.gateway.shutdown().await;
        self.registry.shutdown().await;
        info!("Relay shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::persistence::MemoryStore;
    use crate::testing::MockConnector;

    fn new_connection(protocol: &str) -> NewConnection {
        NewConnection {
            name: "line 3".to_string(),
            broker_url: "broker".to_string(),
            port: 1883,
            protocol: protocol.to_string(),
            client_id: "dash".to_string(),
            username: None,
            password: None,
            use_auth: false,
            user_id: 1,
        }
    }

    fn service() -> (RelayService, MockConnector) {
        let connector = MockConnector::new();
        let service = RelayService::new(
            &RelayConfig::default(),
            Arc::new(connector.clone()),
            Arc::new(MemoryStore::new()),
        );
        (service, connector)
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_scheme() {
        let (service, _) = service();
        let result = service.create_connection(new_connection("amqp")).await;
        assert!(matches!(
            result,
            Err(RelayError::Config(ConfigError::UnsupportedScheme(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_tears_down_session_first() {
        let (service, connector) = service();
        let created = service.create_connection(new_connection("mqtt")).await.unwrap();
        service.registry().connect(created.id).await.unwrap();
        let link = connector.latest_link(created.id).unwrap();

        service.delete_connection(created.id).await.unwrap();

        assert!(link.is_closed());
        assert_eq!(service.registry().session_count().await, 0);
        assert!(service
            .persistence()
            .get_connection(created.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_connection() {
        let (service, _) = service();
        assert!(matches!(
            service.delete_connection(41).await,
            Err(RelayError::NotFound { connection_id: 41 })
        ));
    }

    #[tokio::test]
    async fn test_health_reports_degraded_link() {
        let (service, connector) = service();
        let created = service.create_connection(new_connection("mqtt")).await.unwrap();
        service.registry().connect(created.id).await.unwrap();
        assert_eq!(service.health().await.status, "healthy");

        connector
            .latest_link(created.id)
            .unwrap()
            .drop_link("keepalive timeout")
            .await;

        let report = service.health().await;
        assert_eq!(report.status, "degraded");
        assert_eq!(report.sessions, 1);
        assert_eq!(report.connected, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (service, connector) = service();
        let created = service.create_connection(new_connection("ws")).await.unwrap();
        service.registry().connect(created.id).await.unwrap();

        service.shutdown().await;
        service.shutdown().await;

        assert_eq!(connector.open_links(created.id), 0);
        assert_eq!(service.health().await.status, "stopping");
    }
}
