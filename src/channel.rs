//! Dual-path signal channel for a single call.
//!
//! Bundles the ephemeral broadcast topic and the durable record row into
//! one per-call subscription. Ephemeral sends attempted before the broker
//! confirms the subscription are queued and flushed in order, never
//! dropped by this layer; loss past that point is an accepted property of
//! the ephemeral path and is why answer/hangup are duplicated onto the
//! durable path.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::signal::{SessionDescription, SignalBody, SignalMessage};
use crate::store::{CallRecordStore, StoreError};
use crate::types::call::{CallId, CallRecord, RecordStatus, UserId};

/// Failure on the ephemeral broadcast path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broadcast topic unavailable: {0}")]
    Unavailable(String),
}

/// Ephemeral broadcast transport: best-effort delivery to currently
/// subscribed listeners only.
#[async_trait]
pub trait SignalBroker: Send + Sync {
    /// Subscribe to a topic. Returning means the subscription is live.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<SignalMessage>, BrokerError>;

    async fn publish(&self, topic: &str, message: SignalMessage) -> Result<(), BrokerError>;
}

/// What the channel feeds into the session's event stream.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The broadcast subscription is live; queued sends are flushing.
    Ready,
    /// A broadcast signal from the peer (own echoes already filtered).
    Message(SignalMessage),
    /// The durable record row changed.
    Record(CallRecord),
}

struct ChannelInner {
    call_id: CallId,
    local_user: UserId,
    store: Arc<dyn CallRecordStore>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    pump: JoinHandle<()>,
    record_watch: JoinHandle<()>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.pump.abort();
        self.record_watch.abort();
    }
}

/// Per-call handle over both delivery paths. One per session, closed at
/// teardown. Clones share the same subscription.
#[derive(Clone)]
pub struct SignalChannel {
    inner: Arc<ChannelInner>,
}

impl SignalChannel {
    /// Broadcast topic name for a call.
    pub fn topic(call_id: &CallId) -> String {
        format!("call:{call_id}")
    }

    /// Open both paths. Subscription happens on the pump task;
    /// [`ChannelEvent::Ready`] is emitted once the broker confirms.
    pub fn open(
        call_id: CallId,
        local_user: UserId,
        broker: Arc<dyn SignalBroker>,
        store: Arc<dyn CallRecordStore>,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_pump(
            call_id.clone(),
            local_user.clone(),
            broker,
            outbound_rx,
            events.clone(),
        ));
        let record_watch = tokio::spawn(run_record_watch(call_id.clone(), store.clone(), events));
        Self {
            inner: Arc::new(ChannelInner {
                call_id,
                local_user,
                store,
                outbound,
                pump,
                record_watch,
            }),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    /// Queue a broadcast send. Never blocks; messages queued before the
    /// subscription is confirmed flush in order once it is.
    pub fn send_ephemeral(&self, body: SignalBody) {
        let message = SignalMessage::new(
            self.inner.call_id.clone(),
            self.inner.local_user.clone(),
            body,
        );
        if self.inner.outbound.send(message).is_err() {
            debug!("ephemeral send after close for call {}", self.inner.call_id);
        }
    }

    /// Persist the initiator's record, which carries the offer.
    pub async fn send_durable_offer(&self, record: CallRecord) -> Result<(), StoreError> {
        self.inner.store.create(record).await
    }

    /// Persist the answer and flip the record to active.
    pub async fn send_durable_answer(&self, answer: SessionDescription) -> Result<(), StoreError> {
        self.inner.store.update_answer(&self.inner.call_id, answer).await
    }

    /// Persist a terminal status.
    pub async fn send_durable_status(&self, status: RecordStatus) -> Result<(), StoreError> {
        self.inner.store.update_status(&self.inner.call_id, status).await
    }

    /// Drop both subscriptions. Idempotent; clones held by in-flight tasks
    /// stay usable for durable sends but see the broadcast side closed.
    pub fn close(&self) {
        self.inner.pump.abort();
        self.inner.record_watch.abort();
    }
}

/// Single task owning both broadcast directions: subscribes, flushes the
/// queued outbound sends in order, then forwards inbound and outbound
/// traffic until the channel closes.
async fn run_pump(
    call_id: CallId,
    local_user: UserId,
    broker: Arc<dyn SignalBroker>,
    mut outbound: mpsc::UnboundedReceiver<SignalMessage>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let topic = SignalChannel::topic(&call_id);
    let mut inbound = match broker.subscribe(&topic).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("broadcast subscribe failed for {topic}: {e}");
            return;
        }
    };
    if events.send(ChannelEvent::Ready).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Some(message) => {
                    // Channels may echo our own sends.
                    if message.from == local_user {
                        continue;
                    }
                    if message.call_id != call_id {
                        debug!("signal for foreign call {} on {topic}", message.call_id);
                        continue;
                    }
                    if events.send(ChannelEvent::Message(message)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            queued = outbound.recv() => match queued {
                Some(message) => {
                    let kind = message.body.kind();
                    if let Err(e) = broker.publish(&topic, message).await {
                        warn!("failed to publish {kind} on {topic}: {e}");
                    }
                }
                None => break,
            },
        }
    }
}

async fn run_record_watch(
    call_id: CallId,
    store: Arc<dyn CallRecordStore>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut updates = match store.subscribe(&call_id).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("record subscribe failed for call {call_id}: {e}");
            return;
        }
    };
    while let Some(record) = updates.recv().await {
        if events.send(ChannelEvent::Record(record)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::CandidateInit;
    use crate::testkit::{LoopbackBroker, MemoryRecordStore};
    use std::time::Duration;

    fn candidate_body(n: usize) -> SignalBody {
        SignalBody::Candidate(CandidateInit::new(format!("candidate:{n}")))
    }

    /// Sends queued before the subscription confirms flush in order.
    #[tokio::test]
    async fn test_pre_subscription_sends_flush_in_order() {
        let broker = LoopbackBroker::new();
        let store = MemoryRecordStore::new();
        let call_id = CallId::new("CALL1");
        let (events_tx, mut events_rx) = mpsc::channel(16);

        // An independent listener joins before the channel exists, so it
        // observes everything the flush delivers.
        let mut listener = broker
            .subscribe(&SignalChannel::topic(&call_id))
            .await
            .unwrap();

        let channel = SignalChannel::open(
            call_id.clone(),
            UserId::new("alice"),
            broker.clone(),
            store,
            events_tx,
        );
        // Queue immediately, before the pump task has had a chance to
        // subscribe.
        for n in 0..3 {
            channel.send_ephemeral(candidate_body(n));
        }

        loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
                .await
                .expect("channel event")
            {
                Some(ChannelEvent::Ready) => break,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
        channel.send_ephemeral(candidate_body(3));

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let message = tokio::time::timeout(Duration::from_secs(1), listener.recv())
                .await
                .expect("broadcast message")
                .expect("broker closed");
            if let SignalBody::Candidate(c) = message.body {
                seen.push(c.candidate);
            }
        }
        assert_eq!(
            seen,
            ["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
        );
    }

    /// Own echoes never surface as channel events.
    #[tokio::test]
    async fn test_own_echo_is_filtered() {
        let broker = LoopbackBroker::new();
        let store = MemoryRecordStore::new();
        let call_id = CallId::new("CALL2");
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let channel = SignalChannel::open(
            call_id.clone(),
            UserId::new("alice"),
            broker.clone(),
            store,
            events_tx,
        );

        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("channel event")
        {
            Some(ChannelEvent::Ready) => {}
            other => panic!("expected Ready, got {other:?}"),
        }

        // The loopback broker echoes to every subscriber, including us.
        channel.send_ephemeral(SignalBody::Hangup);
        // A peer message does surface.
        broker
            .publish(
                &SignalChannel::topic(&call_id),
                SignalMessage::new(call_id.clone(), UserId::new("bob"), SignalBody::Hangup),
            )
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("channel event")
        {
            Some(ChannelEvent::Message(message)) => {
                assert_eq!(message.from, UserId::new("bob"));
            }
            other => panic!("expected peer message, got {other:?}"),
        }
    }

    /// Signals tagged with a different call id never surface.
    #[tokio::test]
    async fn test_foreign_call_id_is_discarded() {
        let broker = LoopbackBroker::new();
        let store = MemoryRecordStore::new();
        let call_id = CallId::new("CALL3");
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let _channel = SignalChannel::open(
            call_id.clone(),
            UserId::new("alice"),
            broker.clone(),
            store,
            events_tx,
        );

        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("channel event")
        {
            Some(ChannelEvent::Ready) => {}
            other => panic!("expected Ready, got {other:?}"),
        }

        let topic = SignalChannel::topic(&call_id);
        broker
            .publish(
                &topic,
                SignalMessage::new(CallId::new("OTHER"), UserId::new("bob"), SignalBody::Hangup),
            )
            .await
            .unwrap();
        broker
            .publish(
                &topic,
                SignalMessage::new(call_id.clone(), UserId::new("bob"), SignalBody::Hangup),
            )
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("channel event")
        {
            Some(ChannelEvent::Message(message)) => {
                // Only the correctly tagged hangup came through.
                assert_eq!(message.call_id, call_id);
            }
            other => panic!("expected peer message, got {other:?}"),
        }
    }
}
