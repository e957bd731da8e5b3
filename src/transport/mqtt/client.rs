//! Impure I/O for broker links
//!
//! [`RumqttConnector`] opens a rumqttc client and hands its event loop to a
//! supervisor task. The supervisor forwards publishes and lifecycle changes
//! as [`LinkEvent`]s, binds acknowledgments to waiting requests and, after
//! an automatic reconnect, re-issues every subscription the link holds.

use super::acks::{AckKind, AckOutcome, AckTracker, Completion};
use super::connection::{
    configure_mqtt_options, determine_next_state, handshake_result, ConnectionEvent,
    ConnectionState, LinkFailure,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::{RelayError, RelayResult};
use crate::transport::{BrokerConnector, BrokerLink, BrokerOptions, LinkEvent, OpenedLink};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the per-link event channel
const EVENT_BUFFER: usize = 256;

/// How long a graceful disconnect may take before the task is aborted
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Opens real broker links with rumqttc
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn open(&self, options: &BrokerOptions) -> RelayResult<OpenedLink> {
        let mqtt_options = configure_mqtt_options(options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.request_capacity);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let requests = RequestPipe::new(client);
        let supervisor = Supervisor {
            connection_id: options.connection_id,
            reconnect_period: options.reconnect_period,
            requests: requests.clone(),
            state_tx,
            events_tx,
        };
        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));

        let link = Arc::new(RumqttLink {
            connection_id: options.connection_id,
            requests,
            state_rx: state_rx.clone(),
            shutdown_tx,
            handle: std::sync::Mutex::new(Some(handle)),
        });

        // Dropping `link` on failure drops the shutdown sender, which stops
        // the supervisor.
        wait_for_connection_confirmation(state_rx).await?;
        info!(
            connection_id = options.connection_id,
            host = %options.host,
            port = options.port,
            "Broker link established"
        );

        Ok(OpenedLink {
            link,
            events: events_rx,
        })
    }
}

async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
) -> RelayResult<()> {
    loop {
        if let Some(result) = handshake_result(&state_rx.borrow_and_update()) {
            return result;
        }
        if state_rx.changed().await.is_err() {
            return Err(RelayError::network("broker event loop stopped"));
        }
    }
}

/// A request the link can issue through rumqttc
enum Request {
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

impl Request {
    fn kind(&self) -> AckKind {
        match self {
            Request::Subscribe { .. } => AckKind::Subscribe,
            Request::Unsubscribe { .. } => AckKind::Unsubscribe,
            Request::Publish { .. } => AckKind::Publish,
        }
    }

    fn completion(&self) -> Completion {
        match self {
            Request::Publish {
                qos: QoS::AtMostOnce,
                ..
            } => Completion::OnWrite,
            _ => Completion::OnAck,
        }
    }
}

/// Serialized path from callers into the rumqttc request channel.
///
/// Queueing a waiter and handing the request to the client happen under one
/// lock so waiters line up with the order packets are written.
#[derive(Clone)]
struct RequestPipe {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    order: Arc<Mutex<()>>,
    subscriptions: Arc<std::sync::Mutex<BTreeMap<String, QoS>>>,
}

impl RequestPipe {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            acks: Arc::new(AckTracker::new()),
            order: Arc::new(Mutex::new(())),
            subscriptions: Arc::new(std::sync::Mutex::new(BTreeMap::new())),
        }
    }

    async fn issue(&self, request: Request) -> RelayResult<()> {
        let kind = request.kind();
        let rx = {
            let _order = self.order.lock().await;
            let rx = self.acks.enqueue(kind, request.completion());
            let sent = match request {
                Request::Subscribe { topic, qos } => self.client.subscribe(topic, qos).await,
                Request::Unsubscribe { topic } => self.client.unsubscribe(topic).await,
                Request::Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                } => self.client.publish_bytes(topic, qos, retain, payload).await,
            };
            if let Err(e) = sent {
                self.acks.cancel_last(kind);
                return Err(RelayError::network(format!("request not accepted: {e}")));
            }
            rx
        };

        match rx.await {
            Ok(AckOutcome::Accepted) => Ok(()),
            Ok(AckOutcome::Rejected(reason)) => Err(RelayError::broker_reject(reason)),
            Ok(AckOutcome::LinkLost(reason)) => Err(RelayError::network(reason)),
            Err(_) => Err(RelayError::network("broker link closed")),
        }
    }

    fn track(&self, topic: &str, qos: QoS) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), qos);
    }

    fn untrack(&self, topic: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    fn tracked(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect()
    }

    /// Re-issue tracked subscriptions after an automatic reconnect
    async fn resubscribe(self, connection_id: i64) {
        for (topic, qos) in self.tracked() {
            match self
                .issue(Request::Subscribe {
                    topic: topic.clone(),
                    qos,
                })
                .await
            {
                Ok(()) => debug!(connection_id, topic = %topic, "Re-subscribed after reconnect"),
                Err(e) => warn!(connection_id, topic = %topic, error = %e, "Re-subscribe failed"),
            }
        }
    }
}

/// Owns the rumqttc event loop for one link
struct Supervisor {
    connection_id: i64,
    reconnect_period: Duration,
    requests: RequestPipe,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl Supervisor {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        let connection_id = self.connection_id;
        debug!(connection_id, "Broker event loop started");
        let mut ever_connected = false;
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                polled = event_loop.poll() => match polled {
                    Ok(event) => match MessageHandler::route_event(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            let _ = self
                                .state_tx
                                .send(determine_next_state(ConnectionEvent::ConnAckReceived));
                            if ever_connected {
                                let _ = self.events_tx.send(LinkEvent::Online).await;
                                tokio::spawn(self.requests.clone().resubscribe(connection_id));
                            }
                            ever_connected = true;
                            attempts = 0;
                        }
                        EventRoute::MessageReceived(inbound) => {
                            if self.events_tx.send(LinkEvent::Message(inbound)).await.is_err() {
                                debug!(connection_id, "Event receiver gone, stopping");
                                break;
                            }
                        }
                        EventRoute::RequestWritten { kind, pkid } => {
                            self.requests.acks.written(kind, pkid);
                        }
                        EventRoute::Acknowledged { kind, pkid, outcome } => {
                            self.requests.acks.acknowledged(kind, pkid, outcome);
                        }
                        EventRoute::DisconnectSent => break,
                        EventRoute::Disconnected => {
                            attempts += 1;
                            let _ = self.state_tx.send(determine_next_state(
                                ConnectionEvent::BrokerDisconnected { attempt: attempts },
                            ));
                            self.requests.acks.fail_in_flight("broker closed the session");
                            let _ = self
                                .events_tx
                                .send(LinkEvent::Offline("broker closed the session".into()))
                                .await;
                        }
                        EventRoute::Infrastructure => {}
                    },
                    Err(e) => {
                        let failure = LinkFailure::classify(&e);
                        attempts += 1;
                        let _ = self.state_tx.send(determine_next_state(ConnectionEvent::LinkError {
                            failure: failure.clone(),
                            ever_connected,
                            attempt: attempts,
                        }));
                        if !ever_connected {
                            error!(connection_id, error = %e, "Broker handshake failed");
                            break;
                        }

                        self.requests.acks.fail_in_flight(failure.reason());
                        let _ = self
                            .events_tx
                            .send(LinkEvent::Offline(failure.reason().to_string()))
                            .await;
                        if !interruptible_sleep(&mut shutdown_rx, self.reconnect_period).await {
                            break;
                        }
                    }
                }
            }
        }

        self.requests.acks.fail_all("broker link closed");
        if ever_connected {
            let _ = self.state_tx.send(determine_next_state(ConnectionEvent::Closed));
        }
        let _ = self.events_tx.send(LinkEvent::Closed).await;
        debug!(connection_id, "Broker event loop stopped");
    }
}

/// Returns false if shutdown was requested during the delay
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

/// One open rumqttc-backed link
pub struct RumqttLink {
    connection_id: i64,
    requests: RequestPipe,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RumqttLink {
    fn check_connected(&self) -> RelayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::ClientNotConnected {
                connection_id: self.connection_id,
            })
        }
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn subscribe(&self, topic: &str, qos: QoS) -> RelayResult<()> {
        self.check_connected()?;
        self.requests
            .issue(Request::Subscribe {
                topic: topic.to_string(),
                qos,
            })
            .await?;
        self.requests.track(topic, qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> RelayResult<()> {
        self.check_connected()?;
        self.requests.untrack(topic);
        self.requests
            .issue(Request::Unsubscribe {
                topic: topic.to_string(),
            })
            .await
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> RelayResult<()> {
        self.check_connected()?;
        self.requests
            .issue(Request::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .await
    }

    async fn disconnect(&self) -> RelayResult<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        let mut stopped = false;
        if self.is_connected() {
            match self.requests.client.try_disconnect() {
                Ok(()) => {
                    stopped = tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
                        .await
                        .is_ok();
                }
                Err(e) => {
                    debug!(connection_id = self.connection_id, error = %e, "Disconnect request not queued");
                }
            }
        }

        if !stopped {
            let _ = self.shutdown_tx.send(true);
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                warn!(connection_id = self.connection_id, "Broker event loop did not stop, aborting");
                handle.abort();
            }
        }

        info!(connection_id = self.connection_id, "Broker link closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), ConnectionState::Connected)
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
