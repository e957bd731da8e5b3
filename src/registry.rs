//! Connection registry: the authoritative table of live broker sessions
//!
//! At most one session exists per connection id. Every `connect` and
//! `disconnect` bumps a per-id generation; a connect whose generation is no
//! longer current when its handshake finishes tears its own session down
//! and reports [`RelayError::Superseded`] instead of installing it.
//!
//! The registry owns the stored `is_connected` writes for connect and
//! disconnect. They happen under the table's write lock, and only for the
//! current generation, so a stale attempt cannot overwrite a newer state.

use crate::error::{RelayError, RelayResult};
use crate::session::{record_connected, BrokerSession, SessionContext};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct ConnectionRegistry {
    ctx: SessionContext,
    sessions: RwLock<HashMap<i64, Arc<BrokerSession>>>,
    generations: Mutex<HashMap<i64, u64>>,
}

impl ConnectionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    fn bump_generation(&self, connection_id: i64) -> u64 {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = generations.entry(connection_id).or_insert(0);
        *generation += 1;
        *generation
    }

    fn is_current(&self, connection_id: i64, generation: u64) -> bool {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection_id)
            .is_some_and(|current| *current == generation)
    }

    /// Replace any session for `connection_id` with a freshly opened one
    pub async fn connect(&self, connection_id: i64) -> RelayResult<()> {
        let generation = self.bump_generation(connection_id);

        let connection = self
            .ctx
            .persistence
            .get_connection(connection_id)
            .await?
            .ok_or(RelayError::NotFound { connection_id })?;

        self.retire(connection_id).await;

        let opened = BrokerSession::open(connection, self.ctx.clone()).await;

        // Flag writes below happen under the table lock so they order with
        // installs and removals of newer sessions. A stale attempt never
        // writes what it saw.
        let mut sessions = self.sessions.write().await;
        let current = self.is_current(connection_id, generation);
        let session = match opened {
            Ok(session) => Arc::new(session),
            Err(e) => {
                if current {
                    record_connected(self.ctx.persistence.as_ref(), connection_id, false).await;
                } else {
                    debug!(connection_id, generation, error = %e, "Stale connect failed");
                }
                return Err(e);
            }
        };

        if !current {
            // The stale session's pump may have written; restore the newer state.
            let live = sessions
                .get(&connection_id)
                .is_some_and(|s| s.is_connected());
            record_connected(self.ctx.persistence.as_ref(), connection_id, live).await;
            drop(sessions);
            session.close().await;
            warn!(connection_id, generation, "Connect superseded by a newer request");
            return Err(RelayError::Superseded { connection_id });
        }

        let connected = session.is_connected();
        let previous = sessions.insert(connection_id, session);
        record_connected(self.ctx.persistence.as_ref(), connection_id, connected).await;
        drop(sessions);
        if let Some(previous) = previous {
            previous.close().await;
        }

        info!(connection_id, generation, "Broker session registered");
        Ok(())
    }

    /// Remove and close any session; the stored flag ends up false unless a
    /// newer connect installed a session meanwhile
    pub async fn disconnect(&self, connection_id: i64) {
        self.bump_generation(connection_id);
        let session = self.sessions.write().await.remove(&connection_id);
        match session {
            Some(session) => session.close().await,
            None => debug!(connection_id, "No live session to disconnect"),
        }
        self.settle_disconnected(connection_id).await;
    }

    /// Write `false` unless a newer session now owns the flag
    async fn settle_disconnected(&self, connection_id: i64) {
        let sessions = self.sessions.read().await;
        if sessions.contains_key(&connection_id) {
            debug!(connection_id, "Newer session installed, leaving its flag");
            return;
        }
        record_connected(self.ctx.persistence.as_ref(), connection_id, false).await;
    }

    /// Present in the table and the link itself reports connected
    pub async fn status(&self, connection_id: i64) -> bool {
        self.sessions
            .read()
            .await
            .get(&connection_id)
            .is_some_and(|session| session.is_connected())
    }

    pub async fn session(&self, connection_id: i64) -> RelayResult<Arc<BrokerSession>> {
        self.sessions
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or(RelayError::ClientNotConnected { connection_id })
    }

    pub async fn subscribe(&self, connection_id: i64, topic: &str, qos: u8) -> RelayResult<()> {
        self.session(connection_id).await?.subscribe(topic, qos).await
    }

    pub async fn unsubscribe(&self, connection_id: i64, topic: &str) -> RelayResult<()> {
        self.session(connection_id).await?.unsubscribe(topic).await
    }

    pub async fn publish(
        &self,
        connection_id: i64,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> RelayResult<()> {
        self.session(connection_id)
            .await?
            .publish(topic, payload, qos, retain)
            .await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn connection_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let drained: Vec<(i64, Arc<BrokerSession>)> = self.sessions.write().await.drain().collect();
        for (connection_id, _) in &drained {
            self.bump_generation(*connection_id);
        }
        info!(sessions = drained.len(), "Closing all broker sessions");
        join_all(drained.iter().map(|(_, session)| session.close())).await;
        for (connection_id, _) in &drained {
            self.settle_disconnected(*connection_id).await;
        }
    }

    async fn retire(&self, connection_id: i64) {
        let existing = self.sessions.write().await.remove(&connection_id);
        if let Some(existing) = existing {
            debug!(connection_id, "Retiring existing session before reconnect");
            existing.close().await;
        }
    }
}
