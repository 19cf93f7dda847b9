//! A single call attempt: the state machine plus signal routing.
//!
//! A session is owned exclusively by the manager's event loop; every
//! method runs on that loop, so fields need no synchronization. Work that
//! awaits a collaborator (media acquisition, transport setup, durable
//! writes) runs in spawned tasks whose completions re-enter the loop as
//! [`SessionEvent`]s tagged with this session's call id; completions that
//! outlive the session are discarded by the manager.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::candidates::CandidateBuffer;
use crate::channel::{ChannelEvent, SignalChannel};
use crate::events::CallEvent;
use crate::manager::{CallManagerConfig, CallServices, CallSnapshot};
use crate::media::{
    MediaConstraints, MediaError, MediaHandle, Transport, TransportError, TransportEvent,
    TransportState,
};
use crate::signal::{CandidateInit, SessionDescription, SignalBody, SignalMessage};
use crate::state::{CallStatus, CallTransition};
use crate::store::{CallLogEntry, StoreError};
use crate::types::call::{
    CallDirection, CallEndReason, CallId, CallRecord, ConversationId, Peer, RecordStatus, UserId,
};

/// Completions and inbound traffic for one session, routed by call id.
pub(crate) enum SessionEvent {
    Channel(ChannelEvent),
    /// Local capture finished (or failed).
    MediaReady(Result<MediaHandle, MediaError>),
    /// Transport created and the local description produced.
    NegotiationReady(Result<Negotiated, TransportError>),
    /// The remote answer was handed to the transport.
    AnswerApplied(Result<(), TransportError>),
    /// The durable offer write finished.
    OfferPersisted(Result<ConversationId, StoreError>),
    /// The durable answer write finished.
    AnswerPersisted(Result<(), StoreError>),
    Transport(TransportEvent),
    RingTimeout,
}

impl SessionEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Channel(ChannelEvent::Ready) => "channel-ready",
            Self::Channel(ChannelEvent::Message(_)) => "signal",
            Self::Channel(ChannelEvent::Record(_)) => "record-update",
            Self::MediaReady(_) => "media-ready",
            Self::NegotiationReady(_) => "negotiation-ready",
            Self::AnswerApplied(_) => "answer-applied",
            Self::OfferPersisted(_) => "offer-persisted",
            Self::AnswerPersisted(_) => "answer-persisted",
            Self::Transport(_) => "transport-event",
            Self::RingTimeout => "ring-timeout",
        }
    }
}

/// Product of the transport-setup task: the live transport and the local
/// description it produced (offer when dialing, answer when accepting).
pub(crate) struct Negotiated {
    pub transport: Arc<dyn Transport>,
    pub local_description: SessionDescription,
}

pub(crate) type SessionEventSender = mpsc::Sender<(CallId, SessionEvent)>;

/// The in-memory, client-owned half of one call attempt.
pub(crate) struct CallSession {
    call_id: CallId,
    direction: CallDirection,
    status: CallStatus,
    other_party: Peer,
    local_user: UserId,
    conversation: Option<ConversationId>,

    channel: SignalChannel,
    channel_ready: bool,
    buffer: CandidateBuffer,

    /// Inbound offer held until `answer` acquires media (incoming only).
    /// Scoped to this session; never global state.
    stashed_offer: Option<SessionDescription>,
    /// Outgoing offer held until the channel subscription confirms, so the
    /// record is never created before we can hear the fast-path answer.
    unsent_offer: Option<SessionDescription>,
    /// Set once the durable record exists; gates hangup/status sends.
    record_created: bool,
    /// Local candidates already signalled; sent again when the answer
    /// arrives, because the peer could not have been subscribed for the
    /// early ones.
    sent_candidates: Vec<CandidateInit>,
    answer_applied: bool,

    transport: Option<Arc<dyn Transport>>,
    /// Serializes remote-candidate application once the buffer opens.
    candidate_tx: Option<mpsc::UnboundedSender<CandidateInit>>,
    local_media: Option<MediaHandle>,
    remote_media: Option<MediaHandle>,
    is_muted: bool,
    is_video_enabled: bool,

    services: CallServices,
    config: CallManagerConfig,
    emitter: SessionEventSender,
    snapshot_tx: Arc<watch::Sender<CallSnapshot>>,
    event_bus: broadcast::Sender<CallEvent>,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallSession {
    /// Begin an outgoing call. The manager guarantees no session exists.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_outgoing(
        local_user: UserId,
        other: Peer,
        services: CallServices,
        config: CallManagerConfig,
        emitter: SessionEventSender,
        snapshot_tx: Arc<watch::Sender<CallSnapshot>>,
        event_bus: broadcast::Sender<CallEvent>,
    ) -> Self {
        let call_id = CallId::generate();
        info!("starting call {} to {}", call_id, other.id);

        let mut session = Self::new(
            call_id,
            CallDirection::Outgoing,
            local_user,
            other,
            services,
            config,
            emitter,
            snapshot_tx,
            event_bus,
        );
        session.transition(CallTransition::DialStarted);
        session.start_ring_timer();

        // Media first; transport setup and the offer follow its completion.
        let media = session.services.media.clone();
        session.spawn_completion(async move {
            SessionEvent::MediaReady(media.acquire(MediaConstraints::default()).await)
        });
        session.publish_snapshot();
        session
    }

    /// Register a ringing invitation addressed to the local user. The
    /// manager has already resolved the caller and checked for busy.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_incoming(
        local_user: UserId,
        caller: Peer,
        record: CallRecord,
        services: CallServices,
        config: CallManagerConfig,
        emitter: SessionEventSender,
        snapshot_tx: Arc<watch::Sender<CallSnapshot>>,
        event_bus: broadcast::Sender<CallEvent>,
    ) -> Self {
        info!("incoming call {} from {}", record.id, caller.id);

        let mut session = Self::new(
            record.id.clone(),
            CallDirection::Incoming,
            local_user,
            caller.clone(),
            services,
            config,
            emitter,
            snapshot_tx,
            event_bus,
        );
        session.conversation = Some(record.conversation_id.clone());
        session.stashed_offer = Some(record.offer);
        session.record_created = true;
        session.transition(CallTransition::OfferReceived);
        session.start_ring_timer();

        if let Some(notifications) = session.services.notifications.clone() {
            let peer = caller.clone();
            tokio::spawn(async move {
                notifications.notify_incoming_call(&peer).await;
            });
        }
        let _ = session.event_bus.send(CallEvent::Incoming {
            call_id: session.call_id.clone(),
            from: caller,
        });
        session.publish_snapshot();
        session
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        call_id: CallId,
        direction: CallDirection,
        local_user: UserId,
        other_party: Peer,
        services: CallServices,
        config: CallManagerConfig,
        emitter: SessionEventSender,
        snapshot_tx: Arc<watch::Sender<CallSnapshot>>,
        event_bus: broadcast::Sender<CallEvent>,
    ) -> Self {
        // Subscribe before anything else happens on this call, so neither
        // the fast-path answer nor early candidates can be missed.
        let (channel_tx, mut channel_rx) = mpsc::channel(32);
        let channel = SignalChannel::open(
            call_id.clone(),
            local_user.clone(),
            services.broker.clone(),
            services.store.clone(),
            channel_tx,
        );
        let bridge_tx = emitter.clone();
        let bridge_id = call_id.clone();
        tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if bridge_tx
                    .send((bridge_id.clone(), SessionEvent::Channel(event)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Self {
            call_id,
            direction,
            status: CallStatus::Idle,
            other_party,
            local_user,
            conversation: None,
            channel,
            channel_ready: false,
            buffer: CandidateBuffer::new(),
            stashed_offer: None,
            unsent_offer: None,
            record_created: false,
            sent_candidates: Vec::new(),
            answer_applied: false,
            transport: None,
            candidate_tx: None,
            local_media: None,
            remote_media: None,
            is_muted: false,
            is_video_enabled: true,
            services,
            config,
            emitter,
            snapshot_tx,
            event_bus,
            ring_timer: None,
        }
    }

    pub(crate) fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub(crate) fn status(&self) -> CallStatus {
        self.status
    }

    /// Accept the ringing invitation. No-op outside `incoming`.
    pub(crate) fn answer(&mut self) {
        if !self.status.can_answer() {
            debug!("answer ignored in {:?}", self.status);
            return;
        }
        self.transition(CallTransition::AnswerStarted);
        self.stop_ring_timer();
        self.publish_snapshot();

        let media = self.services.media.clone();
        self.spawn_completion(async move {
            SessionEvent::MediaReady(media.acquire(MediaConstraints::default()).await)
        });
    }

    /// Local termination from any non-idle state.
    pub(crate) fn hang_up(&mut self) {
        if self.status.is_idle() {
            return;
        }
        let reason = if self.status == CallStatus::Incoming {
            CallEndReason::Declined
        } else {
            CallEndReason::Hangup
        };
        info!("call {} ended locally ({reason:?})", self.call_id);
        self.end(reason);
    }

    pub(crate) fn toggle_mute(&mut self) {
        let Some(stream) = &self.local_media else {
            return;
        };
        self.is_muted = !self.is_muted;
        stream.set_audio_enabled(!self.is_muted);
        self.publish_snapshot();
    }

    pub(crate) fn toggle_video(&mut self) {
        let Some(stream) = &self.local_media else {
            return;
        };
        self.is_video_enabled = !self.is_video_enabled;
        stream.set_video_enabled(self.is_video_enabled);
        self.publish_snapshot();
    }

    /// Route one event. The manager drops the session once its status has
    /// returned to idle.
    pub(crate) fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Channel(ChannelEvent::Ready) => self.on_channel_ready(),
            SessionEvent::Channel(ChannelEvent::Message(message)) => self.on_signal(message),
            SessionEvent::Channel(ChannelEvent::Record(record)) => self.on_record(record),
            SessionEvent::MediaReady(result) => self.on_media_ready(result),
            SessionEvent::NegotiationReady(result) => self.on_negotiation_ready(result),
            SessionEvent::AnswerApplied(result) => self.on_answer_applied(result),
            SessionEvent::OfferPersisted(result) => self.on_offer_persisted(result),
            SessionEvent::AnswerPersisted(result) => self.on_answer_persisted(result),
            SessionEvent::Transport(event) => self.on_transport_event(event),
            SessionEvent::RingTimeout => self.on_ring_timeout(),
        }
    }

    fn on_channel_ready(&mut self) {
        self.channel_ready = true;
        if self.direction == CallDirection::Outgoing {
            self.maybe_persist_offer();
        }
    }

    fn on_media_ready(&mut self, result: Result<MediaHandle, MediaError>) {
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                warn!("media acquisition failed for call {}: {e}", self.call_id);
                self.end(CallEndReason::MediaFailed(e));
                return;
            }
        };
        self.local_media = Some(handle.clone());
        self.publish_snapshot();

        // Transport setup continues off-loop; its completion re-enters as
        // NegotiationReady.
        let media = self.services.media.clone();
        let transport_config = self.config.transport.clone();
        let remote_offer = self.stashed_offer.take();
        let direction = self.direction;

        let (transport_tx, mut transport_rx) = mpsc::channel(64);
        let forward_tx = self.emitter.clone();
        let forward_id = self.call_id.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                if forward_tx
                    .send((forward_id.clone(), SessionEvent::Transport(event)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        self.spawn_completion(async move {
            let result = async {
                let transport = media.create_transport(&transport_config, transport_tx).await?;
                transport.add_local_stream(handle).await?;
                let local_description = match direction {
                    CallDirection::Outgoing => transport.produce_offer().await?,
                    CallDirection::Incoming => {
                        let offer = remote_offer.ok_or_else(|| {
                            TransportError::Negotiation("no stored offer to apply".into())
                        })?;
                        transport.apply_remote_description(offer).await?;
                        transport.produce_answer().await?
                    }
                };
                Ok(Negotiated {
                    transport,
                    local_description,
                })
            }
            .await;
            SessionEvent::NegotiationReady(result)
        });
    }

    fn on_negotiation_ready(&mut self, result: Result<Negotiated, TransportError>) {
        let negotiated = match result {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!("negotiation failed for call {}: {e}", self.call_id);
                self.end(CallEndReason::TransportFailed);
                return;
            }
        };
        self.transport = Some(negotiated.transport);

        match self.direction {
            CallDirection::Outgoing => {
                // The offer rides in the durable record; wait for the
                // channel subscription so the fast-path answer cannot be
                // missed between create and subscribe.
                self.unsent_offer = Some(negotiated.local_description);
                self.maybe_persist_offer();
            }
            CallDirection::Incoming => {
                // The remote offer is applied; flush buffered candidates
                // before anything else reaches the transport.
                self.open_candidate_gate();

                let answer = negotiated.local_description;
                // Fast path first: the initiator is likely subscribed.
                self.channel.send_ephemeral(SignalBody::Answer(answer.clone()));
                // Slow path: authoritative, reaches a late subscriber.
                let channel = self.channel.clone();
                self.spawn_completion(async move {
                    SessionEvent::AnswerPersisted(channel.send_durable_answer(answer).await)
                });
            }
        }
    }

    fn maybe_persist_offer(&mut self) {
        if !self.channel_ready {
            return;
        }
        let Some(offer) = self.unsent_offer.take() else {
            return;
        };
        let conversations = self.services.conversations.clone();
        let channel = self.channel.clone();
        let local = self.local_user.clone();
        let other = self.other_party.id.clone();
        let call_id = self.call_id.clone();
        self.spawn_completion(async move {
            let result = async {
                let conversation = conversations.direct_conversation(&other).await?;
                let record = CallRecord::pending(call_id, conversation.clone(), local, other, offer);
                channel.send_durable_offer(record).await?;
                Ok(conversation)
            }
            .await;
            SessionEvent::OfferPersisted(result)
        });
    }

    fn on_offer_persisted(&mut self, result: Result<ConversationId, StoreError>) {
        match result {
            Ok(conversation) => {
                debug!("call {} record persisted", self.call_id);
                self.record_created = true;
                self.conversation = Some(conversation);
                self.post_log(CallLogEntry::CallStarted);
            }
            Err(e) => {
                // Without the record the receiver can never learn about
                // this call.
                warn!("offer persist failed for call {}: {e}", self.call_id);
                self.end(CallEndReason::SignalingFailed(e));
            }
        }
    }

    fn on_answer_persisted(&mut self, result: Result<(), StoreError>) {
        match result {
            Ok(()) => {
                debug!("call {} answer persisted", self.call_id);
                self.post_log(CallLogEntry::CallJoined);
            }
            Err(e) => {
                warn!("answer persist failed for call {}: {e}", self.call_id);
                self.end(CallEndReason::SignalingFailed(e));
            }
        }
    }

    fn on_signal(&mut self, message: SignalMessage) {
        match message.body {
            SignalBody::Answer(answer) => self.on_answer(answer),
            SignalBody::Candidate(candidate) => self.on_remote_candidate(candidate),
            SignalBody::Hangup => {
                info!("call {} hung up by peer", self.call_id);
                self.teardown(CallEndReason::RemoteHangup);
            }
            SignalBody::Offer(_) => {
                // Offers travel on the durable path; one here is noise.
                debug!("unexpected broadcast offer for call {}", self.call_id);
            }
        }
    }

    fn on_record(&mut self, record: CallRecord) {
        match record.status {
            RecordStatus::Ended | RecordStatus::Rejected => {
                info!(
                    "call {} marked {} remotely",
                    self.call_id,
                    record.status.as_str()
                );
                self.teardown(CallEndReason::RemoteHangup);
            }
            RecordStatus::Active => {
                // Durable copy of the answer; the broadcast fast path may
                // already have applied it.
                if let Some(answer) = record.answer {
                    self.on_answer(answer);
                }
            }
            RecordStatus::Pending => {}
        }
    }

    /// Apply the peer's answer exactly once; duplicates and late arrivals
    /// are no-ops, whichever path they came in on.
    fn on_answer(&mut self, answer: SessionDescription) {
        if self.direction != CallDirection::Outgoing
            || self.answer_applied
            || self.status != CallStatus::Calling
        {
            debug!("ignoring answer for call {} in {:?}", self.call_id, self.status);
            return;
        }
        let Some(transport) = self.transport.clone() else {
            debug!("answer before negotiation for call {}", self.call_id);
            return;
        };
        self.answer_applied = true;

        // The peer was not subscribed when the early candidates went out;
        // send them again now that it is listening.
        for candidate in self.sent_candidates.clone() {
            self.channel.send_ephemeral(SignalBody::Candidate(candidate));
        }

        self.spawn_completion(async move {
            SessionEvent::AnswerApplied(transport.apply_remote_description(answer).await)
        });
    }

    fn on_answer_applied(&mut self, result: Result<(), TransportError>) {
        match result {
            Ok(()) => {
                debug!("remote answer applied for call {}", self.call_id);
                self.open_candidate_gate();
            }
            Err(e) => {
                warn!("applying answer failed for call {}: {e}", self.call_id);
                self.end(CallEndReason::TransportFailed);
            }
        }
    }

    /// Start the serialized candidate feed and flush the buffer through it
    /// in arrival order.
    fn open_candidate_gate(&mut self) {
        if self.candidate_tx.is_some() {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<CandidateInit>();
        let call_id = self.call_id.clone();
        tokio::spawn(async move {
            // A single consumer keeps application in arrival order.
            while let Some(candidate) = rx.recv().await {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    debug!("candidate rejected for call {call_id}: {e}");
                }
            }
        });

        let drained = self.buffer.drain();
        if !drained.is_empty() {
            debug!(
                "flushing {} buffered candidates for call {}",
                drained.len(),
                self.call_id
            );
        }
        for candidate in drained {
            let _ = tx.send(candidate);
        }
        self.candidate_tx = Some(tx);
    }

    fn on_remote_candidate(&mut self, candidate: CandidateInit) {
        if let Some(candidate) = self.buffer.push(candidate) {
            if let Some(tx) = &self.candidate_tx {
                let _ = tx.send(candidate);
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                // Ephemeral only; the channel queues until subscribed.
                self.sent_candidates.push(candidate.clone());
                self.channel.send_ephemeral(SignalBody::Candidate(candidate));
            }
            TransportEvent::RemoteStream(stream) => {
                self.remote_media = Some(stream);
                self.publish_snapshot();
            }
            TransportEvent::StateChanged(state) => self.on_transport_state(state),
        }
    }

    fn on_transport_state(&mut self, state: TransportState) {
        if state.is_fatal() {
            warn!("transport failed for call {}", self.call_id);
            self.end(CallEndReason::TransportFailed);
            return;
        }
        if state == TransportState::Connected
            && self.transition(CallTransition::TransportConnected)
        {
            info!("call {} connected", self.call_id);
            self.stop_ring_timer();
            self.publish_snapshot();
            let _ = self.event_bus.send(CallEvent::Connected {
                call_id: self.call_id.clone(),
            });
        }
    }

    fn on_ring_timeout(&mut self) {
        if matches!(self.status, CallStatus::Calling | CallStatus::Incoming) {
            info!("call {} timed out ringing", self.call_id);
            self.end(CallEndReason::Timeout);
        }
    }

    /// Signal termination to the peer, then release everything.
    fn end(&mut self, reason: CallEndReason) {
        if self.status.is_idle() {
            return;
        }
        if self.record_created {
            // Fast path to whoever is subscribed; the durable write below
            // is the authoritative copy.
            self.channel.send_ephemeral(SignalBody::Hangup);
            let channel = self.channel.clone();
            let status = reason.record_status();
            let call_id = self.call_id.clone();
            tokio::spawn(async move {
                // Redundant once the ephemeral hangup lands, so a failure
                // here is logged, not fatal.
                if let Err(e) = channel.send_durable_status(status).await {
                    warn!("failed to mark call {call_id} {}: {e}", status.as_str());
                }
            });
            self.post_log(CallLogEntry::CallEnded);
        }
        self.teardown(reason);
    }

    /// Release everything owned by this attempt. Runs fully on every exit
    /// path and is safe to reach twice.
    fn teardown(&mut self, reason: CallEndReason) {
        if self.status.is_idle() {
            return;
        }
        self.transition(CallTransition::TornDown);
        self.stop_ring_timer();
        if let Some(transport) = self.transport.take() {
            tokio::spawn(async move {
                transport.close().await;
            });
        }
        self.candidate_tx = None;
        self.buffer.clear();
        if let Some(stream) = self.local_media.take() {
            stream.stop();
        }
        self.remote_media = None;
        self.stashed_offer = None;
        self.unsent_offer = None;
        self.sent_candidates.clear();
        self.channel.close();
        self.publish_snapshot();
        let _ = self.event_bus.send(CallEvent::Ended {
            call_id: self.call_id.clone(),
            reason,
        });
    }

    fn post_log(&self, entry: CallLogEntry) {
        let Some(conversation) = self.conversation.clone() else {
            return;
        };
        let conversations = self.services.conversations.clone();
        let call_id = self.call_id.clone();
        tokio::spawn(async move {
            if let Err(e) = conversations.post_event(&conversation, &call_id, entry).await {
                debug!("failed to post {entry:?} for call {call_id}: {e}");
            }
        });
    }

    /// Apply a transition; invalid ones are logged and ignored.
    fn transition(&mut self, transition: CallTransition) -> bool {
        match self.status.apply(transition) {
            Ok(next) => {
                self.status = next;
                true
            }
            Err(e) => {
                debug!("call {}: {e}", self.call_id);
                false
            }
        }
    }

    fn start_ring_timer(&mut self) {
        let timeout = self.config.ring_timeout;
        let tx = self.emitter.clone();
        let call_id = self.call_id.clone();
        self.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send((call_id, SessionEvent::RingTimeout)).await;
        }));
    }

    fn stop_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn spawn_completion<F>(&self, work: F)
    where
        F: std::future::Future<Output = SessionEvent> + Send + 'static,
    {
        let tx = self.emitter.clone();
        let call_id = self.call_id.clone();
        tokio::spawn(async move {
            let event = work.await;
            let _ = tx.send((call_id, event)).await;
        });
    }

    fn publish_snapshot(&self) {
        let snapshot = if self.status.is_idle() {
            CallSnapshot::default()
        } else {
            CallSnapshot {
                status: self.status,
                other_party: Some(self.other_party.clone()),
                local_media: self.local_media.clone(),
                remote_media: self.remote_media.clone(),
                is_muted: self.is_muted,
                is_video_enabled: self.is_video_enabled,
            }
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // The manager drops sessions only after teardown; this is the
        // backstop for abnormal paths.
        self.stop_ring_timer();
        self.channel.close();
        if let Some(stream) = self.local_media.take() {
            stream.stop();
        }
        if let Some(transport) = self.transport.take() {
            tokio::spawn(async move {
                transport.close().await;
            });
        }
    }
}
