//! In-memory collaborator implementations for tests and examples.
//!
//! These stand in for the relational store, the realtime broker, and the
//! capture/transport engine so the signaling core can be exercised
//! end-to-end inside a single process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::channel::{BrokerError, SignalBroker};
use crate::media::{
    MediaConstraints, MediaEngine, MediaError, MediaHandle, MediaStream, Transport,
    TransportConfig, TransportError, TransportEvent, TransportState,
};
use crate::signal::{CandidateInit, SessionDescription, SignalMessage};
use crate::store::{
    CallLogEntry, CallRecordStore, Conversations, NotificationService, StoreError, UserDirectory,
};
use crate::types::call::{CallId, CallRecord, ConversationId, Peer, RecordStatus, UserId};

const WATCHER_CAPACITY: usize = 64;

/// Record store backed by a map, with live row and inbox subscriptions.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<StoreInner>,
    fail_writes: AtomicBool,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<CallId, CallRecord>,
    row_watchers: HashMap<CallId, Vec<mpsc::Sender<CallRecord>>>,
    inbox_watchers: HashMap<UserId, Vec<mpsc::Sender<CallRecord>>>,
}

impl StoreInner {
    fn notify_row(&mut self, record: &CallRecord) {
        if let Some(watchers) = self.row_watchers.get_mut(&record.id) {
            watchers.retain(|tx| tx.try_send(record.clone()).is_ok());
        }
    }
}

impl MemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent writes fail with `StoreError::Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn get(&self, id: &CallId) -> Option<CallRecord> {
        self.inner.lock().await.records.get(id).cloned()
    }

    pub async fn records(&self) -> Vec<CallRecord> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CallRecordStore for MemoryRecordStore {
    async fn create(&self, record: CallRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.records.insert(record.id.clone(), record.clone());
        if let Some(watchers) = inner.inbox_watchers.get_mut(&record.receiver_id) {
            watchers.retain(|tx| tx.try_send(record.clone()).is_ok());
        }
        Ok(())
    }

    async fn update_answer(
        &self,
        id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.answer = Some(answer);
        record.status = RecordStatus::Active;
        let record = record.clone();
        inner.notify_row(&record);
        Ok(())
    }

    async fn update_status(&self, id: &CallId, status: RecordStatus) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.status = status;
        let record = record.clone();
        inner.notify_row(&record);
        Ok(())
    }

    async fn subscribe(&self, id: &CallId) -> Result<mpsc::Receiver<CallRecord>, StoreError> {
        let (tx, rx) = mpsc::channel(WATCHER_CAPACITY);
        self.inner
            .lock()
            .await
            .row_watchers
            .entry(id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_invitations(
        &self,
        user: &UserId,
    ) -> Result<mpsc::Receiver<CallRecord>, StoreError> {
        let (tx, rx) = mpsc::channel(WATCHER_CAPACITY);
        self.inner
            .lock()
            .await
            .inbox_watchers
            .entry(user.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// Broadcast broker that fans out to every subscriber on a topic,
/// including the publisher's own subscription, so self-echo filtering is
/// exercised the way a real broadcast topic would.
#[derive(Default)]
pub struct LoopbackBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<SignalMessage>>>>,
}

impl LoopbackBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SignalBroker for LoopbackBroker {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<SignalMessage>, BrokerError> {
        let (tx, rx) = mpsc::channel(WATCHER_CAPACITY);
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, message: SignalMessage) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.try_send(message.clone()).is_ok());
        }
        Ok(())
    }
}

/// Media handle recording track state for assertions.
#[derive(Debug)]
pub struct FakeStream {
    id: String,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeStream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }
}

impl MediaStream for FakeStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Scriptable transport that mimics the connectivity engine: once it has a
/// local stream and a remote description it reports `Connected` and hands
/// over a remote stream.
pub struct FakeTransport {
    id: usize,
    events: mpsc::Sender<TransportEvent>,
    local_candidate_count: usize,
    applied_remote: Mutex<Vec<SessionDescription>>,
    remote_candidates: Mutex<Vec<CandidateInit>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new(id: usize, events: mpsc::Sender<TransportEvent>, local_candidate_count: usize) -> Self {
        Self {
            id,
            events,
            local_candidate_count,
            applied_remote: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn applied_remote(&self) -> Vec<SessionDescription> {
        self.applied_remote.lock().await.clone()
    }

    pub async fn remote_candidates(&self) -> Vec<CandidateInit> {
        self.remote_candidates.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn emit_local_candidates(&self) {
        for n in 0..self.local_candidate_count {
            let candidate = CandidateInit::new(format!("candidate:fake-{}-{n}", self.id));
            let _ = self
                .events
                .send(TransportEvent::LocalCandidate(candidate))
                .await;
        }
    }

    async fn maybe_connect(&self) {
        if self.closed.load(Ordering::SeqCst)
            || !self.has_local.load(Ordering::SeqCst)
            || !self.has_remote.load(Ordering::SeqCst)
            || self.connected.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let _ = self
            .events
            .send(TransportEvent::StateChanged(TransportState::Connecting))
            .await;
        let remote = FakeStream::new(format!("remote-{}", self.id));
        let _ = self.events.send(TransportEvent::RemoteStream(remote)).await;
        let _ = self
            .events
            .send(TransportEvent::StateChanged(TransportState::Connected))
            .await;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn add_local_stream(&self, _stream: MediaHandle) -> Result<(), TransportError> {
        self.has_local.store(true, Ordering::SeqCst);
        self.maybe_connect().await;
        Ok(())
    }

    async fn produce_offer(&self) -> Result<SessionDescription, TransportError> {
        self.emit_local_candidates().await;
        Ok(SessionDescription::offer(format!("v=0 offer-{}", self.id)))
    }

    async fn produce_answer(&self) -> Result<SessionDescription, TransportError> {
        self.emit_local_candidates().await;
        Ok(SessionDescription::answer(format!("v=0 answer-{}", self.id)))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.applied_remote.lock().await.push(description);
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect().await;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        self.remote_candidates.lock().await.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Media engine producing [`FakeStream`]s and [`FakeTransport`]s, with
/// knobs for scripted failures and introspection for assertions.
pub struct FakeMediaEngine {
    deny_media: AtomicBool,
    fail_negotiation: AtomicBool,
    local_candidate_count: usize,
    acquired: Mutex<Vec<Arc<FakeStream>>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    counter: AtomicUsize,
}

impl FakeMediaEngine {
    pub fn new() -> Arc<Self> {
        Self::with_local_candidates(2)
    }

    /// Engine whose transports emit `count` local candidates per produced
    /// description.
    pub fn with_local_candidates(count: usize) -> Arc<Self> {
        Arc::new(Self {
            deny_media: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
            local_candidate_count: count,
            acquired: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        })
    }

    /// Make `acquire` fail with `PermissionDenied`.
    pub fn deny_media(&self) {
        self.deny_media.store(true, Ordering::SeqCst);
    }

    /// Make `create_transport` fail.
    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    pub async fn acquired(&self) -> Vec<Arc<FakeStream>> {
        self.acquired.lock().await.clone()
    }

    pub async fn acquire_count(&self) -> usize {
        self.acquired.lock().await.len()
    }

    pub async fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().await.clone()
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<MediaHandle, MediaError> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let stream = FakeStream::new(format!("local-{n}"));
        self.acquired.lock().await.push(stream.clone());
        Ok(stream)
    }

    async fn create_transport(
        &self,
        _config: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("injected failure".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport::new(n, events, self.local_candidate_count));
        self.transports.lock().await.push(transport.clone());
        Ok(transport)
    }
}

/// Directory over a fixed set of peers.
#[derive(Default)]
pub struct StaticDirectory {
    peers: Mutex<HashMap<UserId, Peer>>,
}

impl StaticDirectory {
    pub fn with_peers(peers: impl IntoIterator<Item = Peer>) -> Arc<Self> {
        let map = peers.into_iter().map(|p| (p.id.clone(), p)).collect();
        Arc::new(Self {
            peers: Mutex::new(map),
        })
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup(&self, id: &UserId) -> Option<Peer> {
        self.peers.lock().await.get(id).cloned()
    }
}

/// Conversation collaborator recording posted lifecycle markers.
#[derive(Default)]
pub struct MemoryConversations {
    log: Mutex<Vec<(ConversationId, CallId, CallLogEntry)>>,
}

impl MemoryConversations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn log(&self) -> Vec<(ConversationId, CallId, CallLogEntry)> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl Conversations for MemoryConversations {
    async fn direct_conversation(&self, with: &UserId) -> Result<ConversationId, StoreError> {
        Ok(ConversationId::new(format!("conv:{with}")))
    }

    async fn post_event(
        &self,
        conversation: &ConversationId,
        call_id: &CallId,
        entry: CallLogEntry,
    ) -> Result<(), StoreError> {
        self.log
            .lock()
            .await
            .push((conversation.clone(), call_id.clone(), entry));
        Ok(())
    }
}

/// Notification recorder.
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<Peer>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn notified(&self) -> Vec<Peer> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify_incoming_call(&self, caller: &Peer) {
        self.notified.lock().await.push(caller.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_notifies_inbox_on_create() {
        let store = MemoryRecordStore::new();
        let bob = UserId::new("bob");
        let mut inbox = store.subscribe_invitations(&bob).await.unwrap();

        let record = CallRecord::pending(
            CallId::new("CALL1"),
            ConversationId::new("conv-1"),
            UserId::new("alice"),
            bob,
            SessionDescription::offer("v=0"),
        );
        store.create(record.clone()).await.unwrap();

        let seen = inbox.recv().await.unwrap();
        assert_eq!(seen.id, record.id);
        assert_eq!(seen.status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_store_notifies_row_on_update() {
        let store = MemoryRecordStore::new();
        let id = CallId::new("CALL2");
        let record = CallRecord::pending(
            id.clone(),
            ConversationId::new("conv-1"),
            UserId::new("alice"),
            UserId::new("bob"),
            SessionDescription::offer("v=0"),
        );
        store.create(record).await.unwrap();

        let mut row = store.subscribe(&id).await.unwrap();
        store
            .update_answer(&id, SessionDescription::answer("v=0"))
            .await
            .unwrap();
        let seen = row.recv().await.unwrap();
        assert_eq!(seen.status, RecordStatus::Active);
        assert!(seen.answer.is_some());

        store.update_status(&id, RecordStatus::Ended).await.unwrap();
        let seen = row.recv().await.unwrap();
        assert_eq!(seen.status, RecordStatus::Ended);
    }

    #[tokio::test]
    async fn test_broker_echoes_to_publisher() {
        let broker = LoopbackBroker::new();
        let mut rx = broker.subscribe("call:X").await.unwrap();
        let message = SignalMessage::new(
            CallId::new("X"),
            UserId::new("alice"),
            crate::signal::SignalBody::Hangup,
        );
        broker.publish("call:X", message.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_fake_transport_connects_after_both_directions() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = FakeTransport::new(0, tx, 0);
        transport
            .add_local_stream(FakeStream::new("s"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        transport
            .apply_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            [TransportState::Connecting, TransportState::Connected]
        );
    }
}
