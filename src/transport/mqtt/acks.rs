//! Correlation of requests with broker acknowledgments
//!
//! rumqttc assigns packet ids inside its event loop, so a request only
//! learns its id when the matching `Outgoing` event is polled. Requests of
//! one kind leave the client in the order they were queued; the tracker
//! keeps a FIFO of waiters per kind and binds the front waiter to the id
//! reported by the next outgoing event of that kind.
//!
//! After a reconnect rumqttc writes unacknowledged QoS 1/2 publishes again
//! under their original ids. Those writes belong to waiters that are already
//! bound, so they never consume a queued waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// When a waiter is satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// QoS 0 publishes: done once written
    OnWrite,
    OnAck,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Accepted,
    Rejected(String),
    LinkLost(String),
}

struct Waiter {
    completion: Completion,
    tx: oneshot::Sender<AckOutcome>,
}

#[derive(Default)]
struct Pending {
    queued: HashMap<AckKind, VecDeque<Waiter>>,
    in_flight: HashMap<(AckKind, u16), oneshot::Sender<AckOutcome>>,
}

#[derive(Default)]
pub struct AckTracker {
    pending: Mutex<Pending>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter; the caller must issue the request before anyone else
    /// queues one of the same kind
    pub fn enqueue(&self, kind: AckKind, completion: Completion) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock()
            .queued
            .entry(kind)
            .or_default()
            .push_back(Waiter { completion, tx });
        rx
    }

    /// Undo the most recent `enqueue` when the request never reached the client
    pub fn cancel_last(&self, kind: AckKind) {
        if let Some(queue) = self.lock().queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    /// A request of `kind` was written with `pkid`
    pub fn written(&self, kind: AckKind, pkid: u16) {
        let mut pending = self.lock();
        if pending.in_flight.contains_key(&(kind, pkid)) {
            // Retransmission of a request that is already bound
            return;
        }
        let Some(waiter) = pending.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };
        match waiter.completion {
            Completion::OnWrite => {
                let _ = waiter.tx.send(AckOutcome::Accepted);
            }
            Completion::OnAck => {
                pending.in_flight.insert((kind, pkid), waiter.tx);
            }
        }
    }

    pub fn acknowledged(&self, kind: AckKind, pkid: u16, outcome: AckOutcome) {
        if let Some(tx) = self.lock().in_flight.remove(&(kind, pkid)) {
            let _ = tx.send(outcome);
        }
    }

    /// The link dropped. Written subscribes and unsubscribes are failed;
    /// written publishes stay bound to their id because rumqttc retransmits
    /// them after the reconnect. Queued requests are written afterwards.
    pub fn fail_in_flight(&self, reason: &str) {
        let failed: Vec<_> = {
            let mut pending = self.lock();
            let lost: Vec<(AckKind, u16)> = pending
                .in_flight
                .keys()
                .filter(|(kind, _)| *kind != AckKind::Publish)
                .copied()
                .collect();
            lost.into_iter()
                .filter_map(|key| pending.in_flight.remove(&key))
                .collect()
        };
        for tx in failed {
            let _ = tx.send(AckOutcome::LinkLost(reason.to_string()));
        }
    }

    /// Fail everything; used when the link is closing
    pub fn fail_all(&self, reason: &str) {
        let mut pending = self.lock();
        let queued: Vec<_> = pending
            .queued
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|w| w.tx))
            .collect();
        let in_flight: Vec<_> = pending.in_flight.drain().map(|(_, tx)| tx).collect();
        drop(pending);
        for tx in queued.into_iter().chain(in_flight) {
            let _ = tx.send(AckOutcome::LinkLost(reason.to_string()));
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_resolves_matching_waiter() {
        let tracker = AckTracker::new();
        let first = tracker.enqueue(AckKind::Subscribe, Completion::OnAck);
        let second = tracker.enqueue(AckKind::Subscribe, Completion::OnAck);

        tracker.written(AckKind::Subscribe, 1);
        tracker.written(AckKind::Subscribe, 2);
        tracker.acknowledged(AckKind::Subscribe, 2, AckOutcome::Rejected("nope".into()));
        tracker.acknowledged(AckKind::Subscribe, 1, AckOutcome::Accepted);

        assert_eq!(first.await.unwrap(), AckOutcome::Accepted);
        assert_eq!(second.await.unwrap(), AckOutcome::Rejected("nope".into()));
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_qos0_publish_completes_on_write() {
        let tracker = AckTracker::new();
        let rx = tracker.enqueue(AckKind::Publish, Completion::OnWrite);
        tracker.written(AckKind::Publish, 0);
        assert_eq!(rx.await.unwrap(), AckOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_kinds_do_not_share_queues() {
        let tracker = AckTracker::new();
        let sub = tracker.enqueue(AckKind::Subscribe, Completion::OnAck);
        let unsub = tracker.enqueue(AckKind::Unsubscribe, Completion::OnAck);

        tracker.written(AckKind::Unsubscribe, 5);
        tracker.written(AckKind::Subscribe, 5);
        tracker.acknowledged(AckKind::Unsubscribe, 5, AckOutcome::Accepted);

        assert_eq!(unsub.await.unwrap(), AckOutcome::Accepted);
        assert_eq!(tracker.in_flight_count(), 1);
        tracker.acknowledged(AckKind::Subscribe, 5, AckOutcome::Accepted);
        assert_eq!(sub.await.unwrap(), AckOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_link_loss_fails_only_in_flight() {
        let tracker = AckTracker::new();
        let written = tracker.enqueue(AckKind::Subscribe, Completion::OnAck);
        let mut queued = tracker.enqueue(AckKind::Subscribe, Completion::OnAck);
        tracker.written(AckKind::Subscribe, 1);

        tracker.fail_in_flight("connection reset");

        assert!(matches!(written.await.unwrap(), AckOutcome::LinkLost(_)));
        assert!(queued.try_recv().is_err());

        tracker.fail_all("closing");
        assert!(matches!(queued.await.unwrap(), AckOutcome::LinkLost(_)));
    }

    #[tokio::test]
    async fn test_publish_retransmit_keeps_its_own_waiter() {
        let tracker = AckTracker::new();
        let first = tracker.enqueue(AckKind::Publish, Completion::OnAck);
        tracker.written(AckKind::Publish, 7);
        let mut second = tracker.enqueue(AckKind::Publish, Completion::OnAck);

        tracker.fail_in_flight("connection reset");
        // Reconnect: the unacknowledged publish goes out again, then the queued one
        tracker.written(AckKind::Publish, 7);
        tracker.written(AckKind::Publish, 8);

        tracker.acknowledged(AckKind::Publish, 7, AckOutcome::Accepted);
        assert_eq!(first.await.unwrap(), AckOutcome::Accepted);
        assert!(second.try_recv().is_err());

        tracker.acknowledged(AckKind::Publish, 8, AckOutcome::Accepted);
        assert_eq!(second.await.unwrap(), AckOutcome::Accepted);
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn test_cancel_last_removes_unsent_waiter() {
        let tracker = AckTracker::new();
        let _rx = tracker.enqueue(AckKind::Publish, Completion::OnAck);
        tracker.cancel_last(AckKind::Publish);
        tracker.written(AckKind::Publish, 1);
        assert_eq!(tracker.in_flight_count(), 0);
    }
}
