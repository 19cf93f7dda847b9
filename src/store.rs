//! Durable-record, directory, conversation, and notification collaborators.
//!
//! These are thin seams over the application's relational store and
//! platform services. The call core only creates and mutates rows and
//! reacts to the subscriptions; everything else about persistence is the
//! collaborator's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signal::SessionDescription;
use crate::types::call::{CallId, CallRecord, ConversationId, Peer, RecordStatus, UserId};

/// Failure talking to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("call record not found: {0}")]
    NotFound(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for call metadata.
///
/// The store owns the uniqueness invariant (at most one pending/active
/// record per participant pair); this crate relies on it but does not
/// enforce it.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create(&self, record: CallRecord) -> Result<(), StoreError>;

    /// Store the receiver's answer and move the record to `active`.
    async fn update_answer(
        &self,
        id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), StoreError>;

    async fn update_status(&self, id: &CallId, status: RecordStatus) -> Result<(), StoreError>;

    /// Updates to a single call row.
    async fn subscribe(&self, id: &CallId) -> Result<mpsc::Receiver<CallRecord>, StoreError>;

    /// Newly created records addressed to `user` as receiver.
    async fn subscribe_invitations(
        &self,
        user: &UserId,
    ) -> Result<mpsc::Receiver<CallRecord>, StoreError>;
}

/// User directory lookups for caller/callee display data.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, id: &UserId) -> Option<Peer>;
}

/// Lifecycle markers posted into the conversation timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLogEntry {
    CallStarted,
    CallJoined,
    CallEnded,
}

/// Conversation collaborator: resolves the 1:1 conversation for a pair and
/// records call lifecycle markers in it.
#[async_trait]
pub trait Conversations: Send + Sync {
    /// The direct conversation with `with`, created if necessary.
    async fn direct_conversation(&self, with: &UserId) -> Result<ConversationId, StoreError>;

    /// Post a lifecycle marker. Best-effort; failures never affect the call.
    async fn post_event(
        &self,
        conversation: &ConversationId,
        call_id: &CallId,
        entry: CallLogEntry,
    ) -> Result<(), StoreError>;
}

/// Push/OS notification surface for incoming calls.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify_incoming_call(&self, caller: &Peer);
}
