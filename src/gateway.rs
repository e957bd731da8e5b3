//! Live transport gateway: bridges browser WebSockets to the fan-out bus
//!
//! Each channel gets a `connection_status` event before anything else, is
//! then registered on the bus, and is sent a ping every interval. A
//! channel whose previous ping is still unanswered when the next one is due
//! is terminated. Every write is bounded by the ping interval, so a browser
//! that stops reading is dropped instead of wedging the loop, and its
//! bounded event queue overflowing removes it from the bus. On shutdown
//! every open channel receives a close frame (1000, "Server shutting down").

use crate::bus::{ChannelObserver, FanoutBus, ObserverId, Observer};
use crate::config::GatewaySection;
use crate::observability::metrics::metrics;
use crate::protocol::LiveEvent;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use warp::ws::Message;

pub const SHUTDOWN_CLOSE_CODE: u16 = 1000;
pub const SHUTDOWN_CLOSE_REASON: &str = "Server shutting down";

/// Why a channel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEnd {
    ClosedByPeer,
    SendFailed,
    PingTimeout,
    /// A write did not complete within the ping interval
    Stalled,
    Dropped,
    Shutdown,
}

pub struct LiveGateway {
    bus: Arc<FanoutBus>,
    ping_interval: Duration,
    shutdown_grace: Duration,
    max_frame_bytes: usize,
    observer_queue: usize,
    shutdown_tx: watch::Sender<bool>,
    active_tx: watch::Sender<usize>,
}

impl LiveGateway {
    pub fn new(bus: Arc<FanoutBus>, config: &GatewaySection) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (active_tx, _) = watch::channel(0);
        Self {
            bus,
            ping_interval: config.ping_interval(),
            shutdown_grace: config.shutdown_grace(),
            max_frame_bytes: config.max_frame_bytes,
            observer_queue: config.observer_queue,
            shutdown_tx,
            active_tx,
        }
    }

    /// Override the ping interval (tests use sub-second values)
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn active_channels(&self) -> usize {
        *self.active_tx.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Drive one browser channel until it ends
    pub async fn serve_channel<S, E>(&self, socket: S) -> ChannelEnd
    where
        S: Sink<Message> + Stream<Item = Result<Message, E>> + Send,
        <S as Sink<Message>>::Error: Display,
        E: Display,
    {
        let (mut sink, mut stream) = socket.split();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let write_limit = self.ping_interval;

        if *shutdown_rx.borrow_and_update() {
            let _ = send_within(&mut sink, shutdown_frame(), write_limit).await;
            return ChannelEnd::Shutdown;
        }

        metrics().channel_opened();
        let (observer, mut rx) = ChannelObserver::with_capacity(self.observer_queue);
        // Queued before registration so it precedes every bus event.
        if observer
            .deliver(&Arc::new(LiveEvent::connection_established()))
            .is_err()
        {
            return ChannelEnd::SendFailed;
        }
        let guard = ChannelGuard::register(&self.bus, &self.active_tx, Arc::new(observer));
        debug!(observer_id = guard.observer_id, "Live channel opened");

        let mut pinger = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        pinger.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        let end = loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = send_within(&mut sink, shutdown_frame(), write_limit).await;
                        break ChannelEnd::Shutdown;
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        // The bus let go of the observer: queue overflow or delivery failure.
                        break ChannelEnd::Dropped;
                    };
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode live event");
                            continue;
                        }
                    };
                    if let Err(end) = send_within(&mut sink, Message::text(text), write_limit).await {
                        debug!(observer_id = guard.observer_id, ?end, "Live channel write failed");
                        break end;
                    }
                }
                _ = pinger.tick() => {
                    if awaiting_pong {
                        metrics().ping_timed_out();
                        warn!(observer_id = guard.observer_id, "Live channel missed a pong, terminating");
                        break ChannelEnd::PingTimeout;
                    }
                    awaiting_pong = true;
                    if let Err(end) = send_within(&mut sink, Message::ping(Vec::new()), write_limit).await {
                        break end;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(message)) if message.is_pong() => awaiting_pong = false,
                    Some(Ok(message)) if message.is_close() => break ChannelEnd::ClosedByPeer,
                    // Browsers only listen on this channel.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(observer_id = guard.observer_id, error = %e, "Live channel read failed");
                        break ChannelEnd::ClosedByPeer;
                    }
                    None => break ChannelEnd::ClosedByPeer,
                },
            }
        };

        if end == ChannelEnd::Stalled {
            metrics().channel_stalled();
            warn!(observer_id = guard.observer_id, "Live channel stopped reading, terminating");
        }
        drop(guard);
        let _ = tokio::time::timeout(write_limit, sink.close()).await;
        debug!(?end, "Live channel closed");
        end
    }

    /// Close every channel and wait, up to the grace period, for them to go
    pub async fn shutdown(&self) {
        let open = self.active_channels();
        info!(channels = open, "Closing live channels");
        self.shutdown_tx.send_replace(true);

        let mut active_rx = self.active_tx.subscribe();
        if tokio::time::timeout(self.shutdown_grace, active_rx.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            warn!(
                remaining = self.active_channels(),
                "Live channels still open after shutdown grace"
            );
        }
    }
}

/// Write one frame, giving up once `limit` has passed
async fn send_within<S>(sink: &mut S, message: Message, limit: Duration) -> Result<(), ChannelEnd>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "Live channel send failed");
            Err(ChannelEnd::SendFailed)
        }
        Err(_) => Err(ChannelEnd::Stalled),
    }
}

fn shutdown_frame() -> Message {
    Message::close_with(SHUTDOWN_CLOSE_CODE, SHUTDOWN_CLOSE_REASON)
}

/// Deregisters the observer and releases the active slot exactly once
struct ChannelGuard<'a> {
    bus: &'a FanoutBus,
    active: &'a watch::Sender<usize>,
    observer_id: ObserverId,
}

impl<'a> ChannelGuard<'a> {
    fn register(
        bus: &'a FanoutBus,
        active: &'a watch::Sender<usize>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        active.send_modify(|n| *n += 1);
        let observer_id = bus.register(observer);
        Self {
            bus,
            active,
            observer_id,
        }
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.bus.deregister(self.observer_id);
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}
