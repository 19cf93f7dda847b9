//! Identity and call-record types shared across the crate.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::media::MediaError;
use crate::signal::SessionDescription;
use crate::store::StoreError;

/// Caller-generated call identifier (32 uppercase hex chars).
///
/// Generated locally before the durable record exists, so both sides can
/// subscribe to id-scoped updates before the record is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a collision-resistant id.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Directory identity of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of a 1:1 conversation in the messaging store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Directory entry for a call participant, as surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
        }
    }
}

/// Which side of the call the local user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Durable status column of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Active,
    Ended,
    Rejected,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
        }
    }
}

/// Why a session left the non-idle states.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEndReason {
    /// Local user hung up.
    Hangup,
    /// Peer hung up, or the record was marked terminal remotely.
    RemoteHangup,
    /// Receiver declined before answering.
    Declined,
    /// Ring period elapsed without an answer.
    Timeout,
    /// Local media could not be acquired.
    MediaFailed(MediaError),
    /// A durable offer/answer write failed.
    SignalingFailed(StoreError),
    /// The transport reported a fatal connectivity failure.
    TransportFailed,
}

impl CallEndReason {
    /// Terminal status the durable record is moved to for this reason.
    pub fn record_status(&self) -> RecordStatus {
        match self {
            Self::Declined => RecordStatus::Rejected,
            _ => RecordStatus::Ended,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::MediaFailed(_) | Self::SignalingFailed(_) | Self::TransportFailed
        )
    }
}

/// Durable, server-owned call row.
///
/// Created by the initiator before any negotiation message is sent; the
/// receiver mutates it once (answer + status to active); either party moves
/// it to a terminal status. The owning store enforces that at most one
/// pending/active row exists per participant pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub initiator_id: UserId,
    pub receiver_id: UserId,
    pub status: RecordStatus,
    pub offer: SessionDescription,
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    /// Row as created by the initiator, before any reply.
    pub fn pending(
        id: CallId,
        conversation_id: ConversationId,
        initiator_id: UserId,
        receiver_id: UserId,
        offer: SessionDescription,
    ) -> Self {
        Self {
            id,
            conversation_id,
            initiator_id,
            receiver_id,
            status: RecordStatus::Pending,
            offer,
            answer: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_hex() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(
            a.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        );
    }

    #[test]
    fn test_record_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RecordStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::from_str::<RecordStatus>("\"rejected\"").unwrap(),
            RecordStatus::Rejected
        );
    }

    #[test]
    fn test_end_reason_maps_to_record_status() {
        assert_eq!(CallEndReason::Declined.record_status(), RecordStatus::Rejected);
        assert_eq!(CallEndReason::Hangup.record_status(), RecordStatus::Ended);
        assert_eq!(CallEndReason::Timeout.record_status(), RecordStatus::Ended);
        assert_eq!(
            CallEndReason::TransportFailed.record_status(),
            RecordStatus::Ended
        );
    }

    #[test]
    fn test_pending_record_shape() {
        let record = CallRecord::pending(
            CallId::generate(),
            ConversationId::new("conv-1"),
            UserId::new("alice"),
            UserId::new("bob"),
            SessionDescription::offer("v=0"),
        );
        assert_eq!(record.status, RecordStatus::Pending);
        assert!(record.answer.is_none());
    }
}
