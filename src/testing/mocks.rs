//! Mock implementations for testing
//!
//! Provides a mock broker connector and link, a failing fan-out observer
//! and an in-memory browser socket, so sessions, the registry and the
//! gateway can be exercised without a broker or a browser.

use crate::bus::{DeliveryError, Observer};
use crate::error::{RelayError, RelayResult};
use crate::protocol::LiveEvent;
use crate::transport::{
    BrokerConnector, BrokerLink, BrokerOptions, InboundPublish, LinkEvent, OpenedLink,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::{Sink, Stream};
use rumqttc::QoS;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use warp::ws::Message as WsMessage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the mock broker answers a connection attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    #[default]
    Accept,
    RejectCredentials,
    Unreachable,
    /// Never answer; the caller's connect timeout has to fire
    Hang,
}

/// How the mock broker answers subscribe/unsubscribe/publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    #[default]
    Accept,
    Reject,
    /// Never acknowledge
    Hang,
}

/// Operation recorded by a [`MockLink`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOperation {
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Disconnect,
}

#[derive(Default)]
struct MockBrokerState {
    open_mode: Mutex<OpenMode>,
    ack_mode: Mutex<AckMode>,
    open_delay: Mutex<Duration>,
    links: Mutex<Vec<Arc<MockLink>>>,
    open_calls: AtomicU64,
}

/// Mock connector; clones share the same broker state
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockBrokerState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open_mode(&self, mode: OpenMode) {
        *lock(&self.state.open_mode) = mode;
    }

    /// Applies to links opened from now on
    pub fn set_ack_mode(&self, mode: AckMode) {
        *lock(&self.state.ack_mode) = mode;
    }

    /// Delay before each handshake completes
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.state.open_delay) = delay;
    }

    pub fn open_count(&self) -> u64 {
        self.state.open_calls.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        lock(&self.state.links).clone()
    }

    /// Most recently opened link for a connection
    pub fn latest_link(&self, connection_id: i64) -> Option<Arc<MockLink>> {
        lock(&self.state.links)
            .iter()
            .rev()
            .find(|link| link.connection_id == connection_id)
            .cloned()
    }

    /// Links for a connection that have not been closed
    pub fn open_links(&self, connection_id: i64) -> usize {
        lock(&self.state.links)
            .iter()
            .filter(|link| link.connection_id == connection_id && !link.is_closed())
            .count()
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn open(&self, options: &BrokerOptions) -> RelayResult<OpenedLink> {
        self.state.open_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.state.open_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mode = *lock(&self.state.open_mode);
        match mode {
            OpenMode::Accept => {}
            OpenMode::RejectCredentials => {
                return Err(RelayError::AuthFailure {
                    message: "broker refused credentials: BadUserNamePassword".to_string(),
                })
            }
            OpenMode::Unreachable => {
                return Err(RelayError::network("Connection refused (os error 111)"))
            }
            OpenMode::Hang => return std::future::pending().await,
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        let link = Arc::new(MockLink {
            connection_id: options.connection_id,
            options: options.clone(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            ack_mode: Mutex::new(*lock(&self.state.ack_mode)),
            operations: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(BTreeMap::new()),
            events_tx,
        });
        lock(&self.state.links).push(link.clone());

        Ok(OpenedLink {
            link,
            events: events_rx,
        })
    }
}

/// Mock link that records operations and lets tests drive broker events
pub struct MockLink {
    connection_id: i64,
    options: BrokerOptions,
    connected: AtomicBool,
    closed: AtomicBool,
    ack_mode: Mutex<AckMode>,
    operations: Mutex<Vec<LinkOperation>>,
    subscriptions: Mutex<BTreeMap<String, QoS>>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl MockLink {
    pub fn connection_id(&self) -> i64 {
        self.connection_id
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        *lock(&self.ack_mode) = mode;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<LinkOperation> {
        lock(&self.operations).clone()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                LinkOperation::Subscribe { topic, qos } => Some((topic, qos)),
                _ => None,
            })
            .collect()
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).keys().cloned().collect()
    }

    /// Simulate a publish pushed by the broker
    pub async fn inject(&self, topic: &str, payload: &str, qos: QoS, retain: bool) {
        let _ = self
            .events_tx
            .send(LinkEvent::Message(InboundPublish {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload.as_bytes()),
                qos,
                retain,
            }))
            .await;
    }

    /// Simulate the link dropping while the transport keeps retrying
    pub async fn drop_link(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events_tx
            .send(LinkEvent::Offline(reason.to_string()))
            .await;
    }

    /// Simulate an automatic reconnect; held subscriptions are re-issued
    pub async fn restore(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let held: Vec<(String, QoS)> = lock(&self.subscriptions)
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect();
        for (topic, qos) in held {
            self.record(LinkOperation::Subscribe { topic, qos });
        }
        let _ = self.events_tx.send(LinkEvent::Online).await;
    }

    fn record(&self, operation: LinkOperation) {
        lock(&self.operations).push(operation);
    }

    fn check_connected(&self) -> RelayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::ClientNotConnected {
                connection_id: self.connection_id,
            })
        }
    }

    async fn acknowledge(&self) -> RelayResult<()> {
        let mode = *lock(&self.ack_mode);
        match mode {
            AckMode::Accept => Ok(()),
            AckMode::Reject => Err(RelayError::broker_reject(
                "broker refused subscription: [Failure]",
            )),
            AckMode::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl BrokerLink for MockLink {
    async fn subscribe(&self, topic: &str, qos: QoS) -> RelayResult<()> {
        self.check_connected()?;
        self.record(LinkOperation::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        self.acknowledge().await?;
        lock(&self.subscriptions).insert(topic.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> RelayResult<()> {
        self.check_connected()?;
        self.record(LinkOperation::Unsubscribe {
            topic: topic.to_string(),
        });
        self.acknowledge().await?;
        lock(&self.subscriptions).remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> RelayResult<()> {
        self.check_connected()?;
        self.record(LinkOperation::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        self.acknowledge().await
    }

    async fn disconnect(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.record(LinkOperation::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.subscriptions).clear();
        let _ = self.events_tx.try_send(LinkEvent::Closed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_closed()
    }
}

/// Observer whose channel always fails
#[derive(Debug, Default)]
pub struct FailingObserver;

impl Observer for FailingObserver {
    fn deliver(&self, _event: &Arc<LiveEvent>) -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("send on a broken channel".to_string()))
    }
}

/// In-memory stand-in for a browser WebSocket.
///
/// The gateway writes into `sent` and reads whatever the test pushes with
/// [`BrowserHandle::send`].
pub struct MockSocket {
    outbound: fmpsc::UnboundedSender<WsMessage>,
    inbound: fmpsc::UnboundedReceiver<Result<WsMessage, std::io::Error>>,
    accepted: usize,
    /// Once this many frames are written, writes never become ready again
    stall_after: Option<usize>,
}

/// Test-side end of a [`MockSocket`]
pub struct BrowserHandle {
    pub sent: fmpsc::UnboundedReceiver<WsMessage>,
    inbound: fmpsc::UnboundedSender<Result<WsMessage, std::io::Error>>,
}

impl MockSocket {
    pub fn pair() -> (Self, BrowserHandle) {
        Self::build(None)
    }

    /// A browser that stops reading after `frames` writes, like a peer
    /// whose TCP window has filled up
    pub fn stalling_after(frames: usize) -> (Self, BrowserHandle) {
        Self::build(Some(frames))
    }

    fn build(stall_after: Option<usize>) -> (Self, BrowserHandle) {
        let (outbound_tx, outbound_rx) = fmpsc::unbounded();
        let (inbound_tx, inbound_rx) = fmpsc::unbounded();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
                accepted: 0,
                stall_after,
            },
            BrowserHandle {
                sent: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    fn is_stalled(&self) -> bool {
        self.stall_after.is_some_and(|limit| self.accepted >= limit)
    }
}

impl BrowserHandle {
    /// Push a frame as if the browser had sent it
    pub fn send(&self, message: WsMessage) {
        let _ = self.inbound.unbounded_send(Ok(message));
    }

    /// Simulate a transport error on the browser side
    pub fn fail(&self, reason: &str) {
        let _ = self
            .inbound
            .unbounded_send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, reason.to_string())));
    }
}

impl Sink<WsMessage> for MockSocket {
    type Error = fmpsc::SendError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.is_stalled() {
            return Poll::Pending;
        }
        Pin::new(&mut this.outbound).poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: WsMessage) -> Result<(), Self::Error> {
        let this = self.get_mut();
        this.accepted += 1;
        Pin::new(&mut this.outbound).start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().outbound).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.is_stalled() {
            return Poll::Pending;
        }
        Pin::new(&mut this.outbound).poll_close(cx)
    }
}

impl Stream for MockSocket {
    type Item = Result<WsMessage, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inbound).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttSection;
    use crate::persistence::Connection;

    fn options(id: i64) -> BrokerOptions {
        let connection = Connection {
            id,
            name: "mock".to_string(),
            broker_url: "broker".to_string(),
            port: 1883,
            protocol: "mqtt".to_string(),
            client_id: format!("mock-{id}"),
            username: None,
            password: None,
            use_auth: false,
            is_connected: false,
            user_id: 1,
            created_at: chrono::Utc::now(),
        };
        BrokerOptions::from_connection(&connection, &MqttSection::default()).unwrap()
    }

    #[tokio::test]
    async fn test_mock_link_records_operations() {
        let connector = MockConnector::new();
        let opened = connector.open(&options(1)).await.unwrap();

        opened.link.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();
        opened
            .link
            .publish("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await
            .unwrap();

        let link = connector.latest_link(1).unwrap();
        assert_eq!(link.subscribe_calls(), vec![("a/b".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(link.operations().len(), 2);
        assert_eq!(connector.open_links(1), 1);
    }

    #[tokio::test]
    async fn test_mock_link_events_flow() {
        let connector = MockConnector::new();
        let mut opened = connector.open(&options(2)).await.unwrap();
        let link = connector.latest_link(2).unwrap();

        link.inject("t", "1", QoS::AtMostOnce, false).await;
        link.drop_link("reset").await;
        assert!(!opened.link.is_connected());
        link.restore().await;

        assert!(matches!(opened.events.recv().await, Some(LinkEvent::Message(_))));
        assert_eq!(
            opened.events.recv().await,
            Some(LinkEvent::Offline("reset".to_string()))
        );
        assert_eq!(opened.events.recv().await, Some(LinkEvent::Online));
        assert!(opened.link.is_connected());
    }

    #[tokio::test]
    async fn test_open_modes() {
        let connector = MockConnector::new();
        connector.set_open_mode(OpenMode::RejectCredentials);
        assert!(matches!(
            connector.open(&options(3)).await,
            Err(RelayError::AuthFailure { .. })
        ));

        connector.set_open_mode(OpenMode::Unreachable);
        assert!(matches!(
            connector.open(&options(3)).await,
            Err(RelayError::NetworkError { .. })
        ));
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = MockConnector::new();
        let opened = connector.open(&options(4)).await.unwrap();
        opened.link.disconnect().await.unwrap();
        opened.link.disconnect().await.unwrap();

        let link = connector.latest_link(4).unwrap();
        assert!(link.is_closed());
        assert_eq!(
            link.operations()
                .iter()
                .filter(|op| **op == LinkOperation::Disconnect)
                .count(),
            1
        );
        assert!(matches!(
            opened.link.subscribe("x", QoS::AtMostOnce).await,
            Err(RelayError::ClientNotConnected { .. })
        ));
    }
}
