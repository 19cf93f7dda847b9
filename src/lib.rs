//! Call signaling for a real-time chat application.
//!
//! This crate establishes, maintains, and tears down one-to-one
//! audio/video sessions by exchanging session descriptions and
//! connectivity candidates over two delivery paths (a durable persisted
//! call record and an ephemeral broadcast topic) while a state machine
//! enforces a single active call per user.
//!
//! # Architecture
//!
//! - [`CallManager`]: process-wide entry point; owns at most one session,
//!   watches the invitation inbox, and exposes the operations and the
//!   observable surface the UI consumes
//! - [`CallStatus`] & transitions: the per-call state machine
//! - [`SignalChannel`]: the durable + ephemeral delivery paths of one call
//! - [`CandidateBuffer`]: FIFO for connectivity messages that arrive
//!   before the transport can take them
//! - Collaborator traits ([`MediaEngine`], [`Transport`],
//!   [`CallRecordStore`], [`UserDirectory`], ...) keep capture, peer
//!   transport, and persistence outside this crate
//!
//! Media capture, the peer connection itself, and the relational store are
//! external collaborators; in-memory stand-ins for all of them live in
//! [`testkit`].

pub mod candidates;
pub mod channel;
pub mod error;
pub mod events;
pub mod manager;
pub mod media;
pub mod signal;
pub mod state;
pub mod store;
pub mod testkit;
pub mod types;

mod session;

pub use candidates::CandidateBuffer;
pub use channel::{BrokerError, ChannelEvent, SignalBroker, SignalChannel};
pub use error::CallError;
pub use events::CallEvent;
pub use manager::{CallManager, CallManagerConfig, CallServices, CallSnapshot};
pub use media::{
    MediaConstraints, MediaEngine, MediaError, MediaHandle, MediaStream, Transport,
    TransportConfig, TransportError, TransportEvent, TransportState,
};
pub use signal::{CandidateInit, SdpKind, SessionDescription, SignalBody, SignalMessage};
pub use state::{CallStatus, CallTransition, InvalidTransition};
pub use store::{
    CallLogEntry, CallRecordStore, Conversations, NotificationService, StoreError, UserDirectory,
};
pub use types::call::{
    CallDirection, CallEndReason, CallId, CallRecord, ConversationId, Peer, RecordStatus, UserId,
};
