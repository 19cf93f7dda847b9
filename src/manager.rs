//! Process-wide call orchestration.
//!
//! One [`CallManager`] exists per logged-in user. It owns at most one
//! call session at a time, listens for
//! invitations addressed to the local user for the lifetime of the login,
//! and exposes the start/answer/end/toggle operations plus a read-only
//! snapshot surface to the UI. Operations attempted in a state that does
//! not permit them are no-ops, never errors.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::CallError;
use crate::events::{CHANNEL_CAPACITY, CallEvent};
use crate::media::{MediaEngine, MediaHandle, TransportConfig};
use crate::session::{CallSession, SessionEvent};
use crate::state::CallStatus;
use crate::store::{CallRecordStore, Conversations, NotificationService, UserDirectory};
use crate::types::call::{CallId, CallRecord, Peer, RecordStatus, UserId};

/// Collaborators the call subsystem drives.
#[derive(Clone)]
pub struct CallServices {
    pub store: Arc<dyn CallRecordStore>,
    pub broker: Arc<dyn crate::channel::SignalBroker>,
    pub media: Arc<dyn MediaEngine>,
    pub directory: Arc<dyn UserDirectory>,
    pub conversations: Arc<dyn Conversations>,
    pub notifications: Option<Arc<dyn NotificationService>>,
}

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Ring period before an unanswered call times out.
    pub ring_timeout: Duration,
    /// Handed to the transport collaborator when a call transport is
    /// created.
    pub transport: TransportConfig,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            transport: TransportConfig::default(),
        }
    }
}

/// Read-only surface consumed by the UI.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub other_party: Option<Peer>,
    pub local_media: Option<MediaHandle>,
    pub remote_media: Option<MediaHandle>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
}

#[derive(Debug)]
enum ManagerCommand {
    Start(Peer),
    Answer,
    End,
    ToggleMute,
    ToggleVideo,
    Shutdown,
}

/// Handle onto the call subsystem. Cheap to clone; all clones drive the
/// same event loop.
#[derive(Clone)]
pub struct CallManager {
    commands: mpsc::Sender<ManagerCommand>,
    snapshot_rx: watch::Receiver<CallSnapshot>,
    event_bus: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Spawn the manager for `local_user`. Subscribes once to the user's
    /// invitation inbox; the loop runs until [`shutdown`](Self::shutdown)
    /// or the last handle is dropped.
    pub async fn spawn(
        local_user: UserId,
        services: CallServices,
        config: CallManagerConfig,
    ) -> Result<Self, CallError> {
        let invitations = services.store.subscribe_invitations(&local_user).await?;
        let (command_tx, command_rx) = mpsc::channel(16);
        let (session_tx, session_rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (event_bus, _) = broadcast::channel(CHANNEL_CAPACITY);

        let task = ManagerTask {
            local_user,
            services,
            config,
            commands: command_rx,
            invitations,
            invitations_open: true,
            session_events: session_rx,
            session_tx,
            snapshot_tx: Arc::new(snapshot_tx),
            event_bus: event_bus.clone(),
            session: None,
        };
        tokio::spawn(task.run());

        Ok(Self {
            commands: command_tx,
            snapshot_rx,
            event_bus,
        })
    }

    /// Dial `other`. No-op while any session exists.
    pub async fn start_call(&self, other: Peer) -> Result<(), CallError> {
        self.send(ManagerCommand::Start(other)).await
    }

    /// Accept the ringing invitation. No-op unless one is ringing.
    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.send(ManagerCommand::Answer).await
    }

    /// Hang up, decline, or cancel, whichever the current state calls for.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.send(ManagerCommand::End).await
    }

    pub async fn toggle_mute(&self) -> Result<(), CallError> {
        self.send(ManagerCommand::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<(), CallError> {
        self.send(ManagerCommand::ToggleVideo).await
    }

    /// Stop the loop, ending any live call first.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.send(ManagerCommand::Shutdown).await
    }

    /// Current observable state.
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch the observable state for changes.
    pub fn observe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to discrete call events.
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_bus.subscribe()
    }

    async fn send(&self, command: ManagerCommand) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::ManagerStopped)
    }
}

struct ManagerTask {
    local_user: UserId,
    services: CallServices,
    config: CallManagerConfig,
    commands: mpsc::Receiver<ManagerCommand>,
    invitations: mpsc::Receiver<CallRecord>,
    invitations_open: bool,
    session_events: mpsc::Receiver<(CallId, SessionEvent)>,
    /// Kept so the session-event channel never closes under the loop.
    session_tx: mpsc::Sender<(CallId, SessionEvent)>,
    snapshot_tx: Arc<watch::Sender<CallSnapshot>>,
    event_bus: broadcast::Sender<CallEvent>,
    session: Option<CallSession>,
}

enum Arm {
    Command(Option<ManagerCommand>),
    Invitation(CallRecord),
    InvitationsClosed,
    Session(CallId, SessionEvent),
}

impl ManagerTask {
    async fn run(mut self) {
        info!("call manager started for {}", self.local_user);
        loop {
            let arm = tokio::select! {
                command = self.commands.recv() => Arm::Command(command),
                invitation = self.invitations.recv(), if self.invitations_open => {
                    match invitation {
                        Some(record) => Arm::Invitation(record),
                        None => Arm::InvitationsClosed,
                    }
                }
                event = self.session_events.recv() => {
                    // Never closes: we hold a sender.
                    match event {
                        Some((call_id, event)) => Arm::Session(call_id, event),
                        None => continue,
                    }
                }
            };
            match arm {
                Arm::Command(None) | Arm::Command(Some(ManagerCommand::Shutdown)) => break,
                Arm::Command(Some(command)) => self.handle_command(command),
                Arm::Invitation(record) => self.handle_invitation(record).await,
                Arm::InvitationsClosed => {
                    warn!("invitation inbox closed for {}", self.local_user);
                    self.invitations_open = false;
                }
                Arm::Session(call_id, event) => self.handle_session_event(call_id, event),
            }
        }
        // Any live call goes down with the manager.
        if let Some(session) = self.session.as_mut() {
            session.hang_up();
        }
        self.session = None;
        info!("call manager stopped for {}", self.local_user);
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Start(other) => self.start_call(other),
            ManagerCommand::Answer => {
                if let Some(session) = self.session.as_mut() {
                    session.answer();
                }
            }
            ManagerCommand::End => {
                if let Some(session) = self.session.as_mut() {
                    session.hang_up();
                }
            }
            ManagerCommand::ToggleMute => {
                if let Some(session) = self.session.as_mut() {
                    session.toggle_mute();
                }
            }
            ManagerCommand::ToggleVideo => {
                if let Some(session) = self.session.as_mut() {
                    session.toggle_video();
                }
            }
            ManagerCommand::Shutdown => unreachable!("handled in run"),
        }
        self.reap();
    }

    fn start_call(&mut self, other: Peer) {
        if self.session.is_some() {
            warn!("start_call ignored: a call is already in progress");
            return;
        }
        if other.id == self.local_user {
            warn!("start_call ignored: cannot call self");
            return;
        }
        self.session = Some(CallSession::start_outgoing(
            self.local_user.clone(),
            other,
            self.services.clone(),
            self.config.clone(),
            self.session_tx.clone(),
            self.snapshot_tx.clone(),
            self.event_bus.clone(),
        ));
    }

    async fn handle_invitation(&mut self, record: CallRecord) {
        if record.status != RecordStatus::Pending || record.receiver_id != self.local_user {
            return;
        }
        if self.session.is_some() {
            // Busy: dropped before any UI surfaces it; the caller's ring
            // timeout ends the attempt.
            debug!("invitation {} dropped: busy", record.id);
            return;
        }
        let Some(caller) = self.services.directory.lookup(&record.initiator_id).await else {
            warn!(
                "invitation {} dropped: unknown caller {}",
                record.id, record.initiator_id
            );
            return;
        };
        self.session = Some(CallSession::start_incoming(
            self.local_user.clone(),
            caller,
            record,
            self.services.clone(),
            self.config.clone(),
            self.session_tx.clone(),
            self.snapshot_tx.clone(),
            self.event_bus.clone(),
        ));
    }

    fn handle_session_event(&mut self, call_id: CallId, event: SessionEvent) {
        match self.session.as_mut() {
            Some(session) if *session.call_id() == call_id => {
                session.handle_event(event);
                self.reap();
            }
            _ => self.discard_stale(call_id, event),
        }
    }

    /// Drop the session once it has returned to idle.
    fn reap(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.status().is_idle())
        {
            self.session = None;
        }
    }

    /// A completion outlived its session. Release anything it carries so
    /// cancellation mid-acquisition never leaks a device or a record.
    fn discard_stale(&self, call_id: CallId, event: SessionEvent) {
        match event {
            SessionEvent::MediaReady(Ok(stream)) => {
                debug!("releasing media acquired for dead call {call_id}");
                stream.stop();
            }
            SessionEvent::NegotiationReady(Ok(negotiated)) => {
                debug!("closing transport created for dead call {call_id}");
                tokio::spawn(async move {
                    negotiated.transport.close().await;
                });
            }
            SessionEvent::OfferPersisted(Ok(_)) => {
                // The record landed after its session died; retire it so
                // the receiver does not ring a ghost call.
                let store = self.services.store.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.update_status(&call_id, RecordStatus::Ended).await {
                        debug!("failed to retire orphaned call {call_id}: {e}");
                    }
                });
            }
            other => {
                debug!("discarding stale {} for call {call_id}", other.name());
            }
        }
    }
}
