//! Broker session: one live link to one broker, scoped to one connection id
//!
//! A session owns the link handle and an event pump task. The pump persists
//! every inbound publish and hands the stored row to the fan-out bus, and it
//! mirrors link drops and recoveries into the connection's `is_connected`
//! flag. The flag writes for connect and disconnect belong to the registry,
//! which orders them against newer sessions. Persistence is best-effort on
//! every path: a failed write is logged and never fails the link or the
//! caller's network operation.

use crate::bus::FanoutBus;
use crate::config::MqttSection;
use crate::error::{RelayError, RelayResult};
use crate::observability::metrics::metrics;
use crate::persistence::{
    Connection, ConnectionPatch, NewMessage, NewTopic, Persistence, TopicPatch,
};
use crate::protocol::LiveEvent;
use crate::transport::{
    qos_from_u8, qos_to_u8, BrokerConnector, BrokerLink, BrokerOptions, InboundPublish, LinkEvent,
};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Collaborators every session needs
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn BrokerConnector>,
    pub persistence: Arc<dyn Persistence>,
    pub bus: Arc<FanoutBus>,
    pub tuning: MqttSection,
}

/// How long `close` waits for the event pump to finish its current event
const PUMP_STOP_GRACE: Duration = Duration::from_secs(2);

pub struct BrokerSession {
    connection: Connection,
    link: Arc<dyn BrokerLink>,
    ctx: SessionContext,
    pump: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl BrokerSession {
    /// Connect, start the event pump and replay subscribed topics.
    ///
    /// The handshake is bounded by the configured connect timeout. Replay
    /// failures are logged per topic and do not fail the open. The stored
    /// flag is left to the caller.
    pub async fn open(connection: Connection, ctx: SessionContext) -> RelayResult<Self> {
        let connection_id = connection.id;
        let options = BrokerOptions::from_connection(&connection, &ctx.tuning)?;
        let limit = ctx.tuning.connect_timeout();

        metrics().connect_attempt();
        info!(
            connection_id,
            broker = %connection.broker_address(),
            "Opening broker session"
        );

        let opened = match tokio::time::timeout(limit, ctx.connector.open(&options)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                metrics().connect_failed();
                warn!(connection_id, error = %e, "Broker connect failed");
                return Err(e);
            }
            Err(_) => {
                metrics().connect_failed();
                warn!(connection_id, timeout_secs = limit.as_secs(), "Broker connect timed out");
                return Err(RelayError::ConnectTimeout {
                    secs: limit.as_secs(),
                });
            }
        };

        metrics().connect_established();

        let (stop_tx, stop_rx) = watch::channel(false);
        let pump = tokio::spawn(
            pump_events(
                connection_id,
                opened.events,
                stop_rx,
                ctx.persistence.clone(),
                ctx.bus.clone(),
            )
            .instrument(crate::session_span!(connection_id)),
        );

        let session = Self {
            connection,
            link: opened.link,
            ctx,
            pump: Mutex::new(Some(pump)),
            stop_tx,
            closed: AtomicBool::new(false),
        };
        session.replay_subscriptions().await;
        Ok(session)
    }

    pub fn connection_id(&self) -> i64 {
        self.connection.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// True only while the link itself reports connected
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.link.is_connected()
    }

    pub async fn subscribe(&self, topic: &str, qos: u8) -> RelayResult<()> {
        let level = self.precheck(topic, qos)?;
        with_ack_timeout(
            self.ctx.tuning.ack_timeout(),
            "subscribe",
            self.link.subscribe(topic, level),
        )
        .await?;

        info!(connection_id = self.connection.id, topic, qos, "Subscribed");
        self.upsert_topic(topic, qos, true).await;
        Ok(())
    }

    /// The stored subscription is flagged, never removed
    pub async fn unsubscribe(&self, topic: &str) -> RelayResult<()> {
        if topic.trim().is_empty() {
            return Err(RelayError::EmptyTopic);
        }
        self.check_connected()?;
        with_ack_timeout(
            self.ctx.tuning.ack_timeout(),
            "unsubscribe",
            self.link.unsubscribe(topic),
        )
        .await?;

        info!(connection_id = self.connection.id, topic, "Unsubscribed");
        self.mark_unsubscribed(topic).await;
        Ok(())
    }

    /// Publish, then store and broadcast the message like an inbound one
    pub async fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> RelayResult<()> {
        let level = self.precheck(topic, qos)?;
        let result = with_ack_timeout(
            self.ctx.tuning.ack_timeout(),
            "publish",
            self.link
                .publish(topic, Bytes::copy_from_slice(payload.as_bytes()), level, retain),
        )
        .await;
        if let Err(e) = result {
            metrics().publish_failed();
            return Err(e);
        }

        metrics().message_published();
        debug!(connection_id = self.connection.id, topic, qos, retain, "Published");
        store_and_broadcast(
            self.ctx.persistence.as_ref(),
            &self.ctx.bus,
            NewMessage {
                connection_id: self.connection.id,
                topic: topic.to_string(),
                payload: payload.to_string(),
                qos,
                retain,
            },
        )
        .await;
        Ok(())
    }

    /// Tear the link down. Safe to call repeatedly and on a half-open link.
    ///
    /// The pump finishes the event it is handling first, so a message that
    /// was stored is also broadcast.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection_id = self.connection.id;

        // Stop the pump first so a late link event cannot flip the flag back.
        let _ = self.stop_tx.send(true);
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(PUMP_STOP_GRACE, &mut pump).await.is_err() {
                warn!(connection_id, "Session event pump did not stop, aborting");
                pump.abort();
            }
        }

        if let Err(e) = self.link.disconnect().await {
            warn!(connection_id, error = %e, "Broker link teardown failed");
        }
        metrics().session_closed();
        info!(connection_id, "Broker session closed");
    }

    fn precheck(&self, topic: &str, qos: u8) -> RelayResult<rumqttc::QoS> {
        if topic.trim().is_empty() {
            return Err(RelayError::EmptyTopic);
        }
        let level = qos_from_u8(qos)?;
        self.check_connected()?;
        Ok(level)
    }

    fn check_connected(&self) -> RelayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::ClientNotConnected {
                connection_id: self.connection.id,
            })
        }
    }

    async fn replay_subscriptions(&self) {
        let connection_id = self.connection.id;
        let topics = match self.ctx.persistence.get_topics_by_connection(connection_id).await {
            Ok(topics) => topics,
            Err(e) => {
                warn!(connection_id, error = %e, "Could not load topics to re-subscribe");
                return;
            }
        };

        for stored in topics.into_iter().filter(|t| t.is_subscribed) {
            let level = match qos_from_u8(stored.qos) {
                Ok(level) => level,
                Err(e) => {
                    warn!(connection_id, topic = %stored.topic, error = %e, "Skipping stored topic");
                    continue;
                }
            };
            let result = with_ack_timeout(
                self.ctx.tuning.ack_timeout(),
                "subscribe",
                self.link.subscribe(&stored.topic, level),
            )
            .await;
            match result {
                Ok(()) => {
                    debug!(connection_id, topic = %stored.topic, qos = qos_to_u8(level), "Re-subscribed");
                    self.upsert_topic(&stored.topic, stored.qos, true).await;
                }
                Err(e) => {
                    warn!(connection_id, topic = %stored.topic, error = %e, "Re-subscribe failed");
                }
            }
        }
    }

    async fn upsert_topic(&self, topic: &str, qos: u8, is_subscribed: bool) {
        let result = self
            .ctx
            .persistence
            .create_topic(NewTopic {
                connection_id: self.connection.id,
                topic: topic.to_string(),
                qos,
                is_subscribed,
            })
            .await;
        if let Err(e) = result {
            metrics().persistence_failed();
            warn!(connection_id = self.connection.id, topic, error = %e, "Failed to store subscription");
        }
    }

    async fn mark_unsubscribed(&self, topic: &str) {
        let connection_id = self.connection.id;
        let stored = match self.ctx.persistence.get_topics_by_connection(connection_id).await {
            Ok(topics) => topics.into_iter().find(|t| t.topic == topic),
            Err(e) => {
                metrics().persistence_failed();
                warn!(connection_id, topic, error = %e, "Failed to load subscription");
                return;
            }
        };
        let Some(stored) = stored else {
            return;
        };

        let patch = TopicPatch {
            is_subscribed: Some(false),
            ..Default::default()
        };
        if let Err(e) = self.ctx.persistence.update_topic(stored.id, patch).await {
            metrics().persistence_failed();
            warn!(connection_id, topic, error = %e, "Failed to flag subscription");
        }
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

/// Bound a broker round trip by the acknowledgment timeout
pub async fn with_ack_timeout<F>(limit: Duration, operation: &'static str, request: F) -> RelayResult<()>
where
    F: Future<Output = RelayResult<()>>,
{
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::AckTimeout {
            operation,
            secs: limit.as_secs(),
        }),
    }
}

async fn pump_events(
    connection_id: i64,
    mut events: mpsc::Receiver<LinkEvent>,
    mut stop_rx: watch::Receiver<bool>,
    persistence: Arc<dyn Persistence>,
    bus: Arc<FanoutBus>,
) {
    loop {
        // An event being handled is never interrupted; stop is only
        // observed between events.
        let event = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stop| *stop) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            LinkEvent::Message(inbound) => {
                handle_inbound(connection_id, inbound, persistence.as_ref(), &bus).await;
            }
            LinkEvent::Online => {
                info!(connection_id, "Broker link back online");
                record_connected(persistence.as_ref(), connection_id, true).await;
            }
            LinkEvent::Offline(reason) => {
                metrics().link_dropped();
                warn!(connection_id, reason = %reason, "Broker link offline");
                record_connected(persistence.as_ref(), connection_id, false).await;
            }
            LinkEvent::Closed => {
                record_connected(persistence.as_ref(), connection_id, false).await;
                break;
            }
        }
    }
    debug!(connection_id, "Session event pump stopped");
}

async fn handle_inbound(
    connection_id: i64,
    inbound: InboundPublish,
    persistence: &dyn Persistence,
    bus: &FanoutBus,
) {
    metrics().message_received();
    debug!(connection_id, topic = %inbound.topic, bytes = inbound.payload.len(), "Inbound publish");
    store_and_broadcast(
        persistence,
        bus,
        NewMessage {
            connection_id,
            topic: inbound.topic,
            payload: String::from_utf8_lossy(&inbound.payload).into_owned(),
            qos: qos_to_u8(inbound.qos),
            retain: inbound.retain,
        },
    )
    .await;
}

async fn store_and_broadcast(persistence: &dyn Persistence, bus: &FanoutBus, new: NewMessage) {
    let connection_id = new.connection_id;
    match persistence.create_message(new).await {
        Ok(message) => {
            bus.broadcast(LiveEvent::mqtt_message(message));
        }
        Err(e) => {
            metrics().persistence_failed();
            warn!(connection_id, error = %e, "Failed to store message, skipping broadcast");
        }
    }
}

/// Best-effort write of the connection's live flag
pub(crate) async fn record_connected(persistence: &dyn Persistence, connection_id: i64, connected: bool) {
    match persistence
        .update_connection(connection_id, ConnectionPatch::connected(connected))
        .await
    {
        Ok(Some(_)) => debug!(connection_id, connected, "Connection flag updated"),
        Ok(None) => debug!(connection_id, "Connection row missing, flag not updated"),
        Err(e) => {
            metrics().persistence_failed();
            warn!(connection_id, connected, error = %e, "Failed to update connection flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelObserver;
    use crate::persistence::MemoryStore;
    use crate::testing::{AckMode, LinkOperation, MockConnector, OpenMode};
    use chrono::Utc;
    use rumqttc::QoS;

    fn connection(id: i64) -> Connection {
        Connection {
            id,
            name: format!("conn-{id}"),
            broker_url: "broker".to_string(),
            port: 1883,
            protocol: "mqtt".to_string(),
            client_id: format!("dash-{id}"),
            username: None,
            password: None,
            use_auth: false,
            is_connected: false,
            user_id: 1,
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        connector: MockConnector,
        store: Arc<MemoryStore>,
        bus: Arc<FanoutBus>,
        ctx: SessionContext,
    }

    async fn fixture(id: i64) -> Fixture {
        let connector = MockConnector::new();
        let store = Arc::new(MemoryStore::new());
        store.insert_connection(connection(id)).await;
        let bus = Arc::new(FanoutBus::new());
        let tuning = MqttSection {
            connect_timeout_secs: 1,
            ack_timeout_secs: 1,
            ..MqttSection::default()
        };
        let ctx = SessionContext {
            connector: Arc::new(connector.clone()),
            persistence: store.clone(),
            bus: bus.clone(),
            tuning,
        };
        Fixture {
            connector,
            store,
            bus,
            ctx,
        }
    }

    async fn stored_flag(store: &MemoryStore, id: i64) -> bool {
        store.get_connection(id).await.unwrap().unwrap().is_connected
    }

    #[tokio::test]
    async fn test_open_replays_subscribed_topics() {
        let fx = fixture(1).await;
        for (topic, subscribed) in [("a/1", true), ("a/2", false)] {
            fx.store
                .create_topic(NewTopic {
                    connection_id: 1,
                    topic: topic.to_string(),
                    qos: 1,
                    is_subscribed: subscribed,
                })
                .await
                .unwrap();
        }

        let session = BrokerSession::open(connection(1), fx.ctx.clone()).await.unwrap();

        assert!(session.is_connected());
        let link = fx.connector.latest_link(1).unwrap();
        assert_eq!(link.subscribe_calls(), vec![("a/1".to_string(), QoS::AtLeastOnce)]);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let fx = fixture(2).await;
        fx.connector.set_open_mode(OpenMode::Hang);

        let result = BrokerSession::open(connection(2), fx.ctx.clone()).await;
        assert!(matches!(result, Err(RelayError::ConnectTimeout { secs: 1 })));
        assert!(!stored_flag(&fx.store, 2).await);
    }

    #[tokio::test]
    async fn test_auth_failure_propagates() {
        let fx = fixture(3).await;
        fx.connector.set_open_mode(OpenMode::RejectCredentials);

        let result = BrokerSession::open(connection(3), fx.ctx.clone()).await;
        assert!(matches!(result, Err(RelayError::AuthFailure { .. })));
    }

    #[tokio::test]
    async fn test_empty_topic_rejected_locally() {
        let fx = fixture(4).await;
        let session = BrokerSession::open(connection(4), fx.ctx.clone()).await.unwrap();

        assert!(matches!(session.subscribe("   ", 0).await, Err(RelayError::EmptyTopic)));
        assert!(matches!(session.publish("", "x", 0, false).await, Err(RelayError::EmptyTopic)));
        let link = fx.connector.latest_link(4).unwrap();
        assert!(link.operations().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejected_by_broker_is_not_stored() {
        let fx = fixture(5).await;
        let session = BrokerSession::open(connection(5), fx.ctx.clone()).await.unwrap();
        fx.connector.latest_link(5).unwrap().set_ack_mode(AckMode::Reject);

        let result = session.subscribe("denied/#", 1).await;
        assert!(matches!(result, Err(RelayError::BrokerReject { .. })));
        assert!(fx.store.get_topics_by_connection(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_request_times_out() {
        let fx = fixture(6).await;
        let session = BrokerSession::open(connection(6), fx.ctx.clone()).await.unwrap();
        fx.connector.latest_link(6).unwrap().set_ack_mode(AckMode::Hang);

        let result = session.publish("t", "x", 1, false).await;
        assert!(matches!(
            result,
            Err(RelayError::AckTimeout {
                operation: "publish",
                ..
            })
        ));
        assert_eq!(fx.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_stores_and_broadcasts() {
        let fx = fixture(7).await;
        let (observer, mut rx) = ChannelObserver::channel();
        fx.bus.register(Arc::new(observer));
        let session = BrokerSession::open(connection(7), fx.ctx.clone()).await.unwrap();

        session.publish("cmd/pump", r#"{"on":true}"#, 0, true).await.unwrap();

        let stored = fx.store.get_messages(Some(7), 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].retain);
        match rx.try_recv().unwrap().as_ref() {
            LiveEvent::MqttMessage(message) => assert_eq!(message.topic, "cmd/pump"),
            other => panic!("unexpected event {other:?}"),
        }
        let link = fx.connector.latest_link(7).unwrap();
        assert!(matches!(
            link.operations().last(),
            Some(LinkOperation::Publish { retain: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_inbound_persistence_failure_is_swallowed() {
        let fx = fixture(8).await;
        let session = BrokerSession::open(connection(8), fx.ctx.clone()).await.unwrap();
        let link = fx.connector.latest_link(8).unwrap();

        fx.store.fail_message_writes(true);
        link.inject("t", "lost", QoS::AtMostOnce, false).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.store.fail_message_writes(false);
        link.inject("t", "kept", QoS::AtMostOnce, false).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = fx.store.get_messages(Some(8), 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, "kept");
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_offline_and_online_mirror_flag() {
        let fx = fixture(9).await;
        let session = BrokerSession::open(connection(9), fx.ctx.clone()).await.unwrap();
        let link = fx.connector.latest_link(9).unwrap();

        link.drop_link("keepalive timeout").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_connected());
        assert!(!stored_flag(&fx.store, 9).await);
        assert!(matches!(
            session.subscribe("t", 0).await,
            Err(RelayError::ClientNotConnected { connection_id: 9 })
        ));

        link.restore().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_connected());
        assert!(stored_flag(&fx.store, 9).await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = fixture(10).await;
        let session = BrokerSession::open(connection(10), fx.ctx.clone()).await.unwrap();

        session.close().await;
        session.close().await;

        assert!(!session.is_connected());
        let link = fx.connector.latest_link(10).unwrap();
        assert!(link.is_closed());
        assert_eq!(
            link.operations()
                .iter()
                .filter(|op| **op == LinkOperation::Disconnect)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_close_never_splits_store_from_broadcast() {
        for id in 20..40 {
            let fx = fixture(id).await;
            let (observer, mut rx) = ChannelObserver::channel();
            fx.bus.register(Arc::new(observer));
            let session = BrokerSession::open(connection(id), fx.ctx.clone()).await.unwrap();
            let link = fx.connector.latest_link(id).unwrap();

            link.inject("meter/kwh", "1.5", QoS::AtMostOnce, false).await;
            tokio::task::yield_now().await;
            session.close().await;

            let stored = fx.store.get_messages(Some(id), 10).await.unwrap().len();
            let mut broadcast = 0;
            while rx.try_recv().is_ok() {
                broadcast += 1;
            }
            assert_eq!(stored, broadcast, "connection {id}");
        }
    }

    #[tokio::test]
    async fn test_store_failures_on_flag_writes_do_not_fail_operations() {
        let fx = fixture(11).await;
        fx.store.fail_connection_updates(true);

        let session = BrokerSession::open(connection(11), fx.ctx.clone()).await.unwrap();
        let link = fx.connector.latest_link(11).unwrap();
        link.drop_link("keepalive timeout").await;
        link.restore().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.is_connected());
        session.subscribe("plant/#", 1).await.unwrap();
        session.close().await;
        assert!(link.is_closed());
    }
}
