//! Signal envelope exchanged over both delivery paths.
//!
//! Every message carries the call id it belongs to and the sender's
//! identity; receivers drop foreign ids and their own echoes.

use serde::{Deserialize, Serialize};

use crate::types::call::{CallId, UserId};

/// Which side of the negotiation a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session-description blob produced by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Opaque connectivity-candidate blob exchanged to establish the peer
/// transport path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Payload variants of the signal envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum SignalBody {
    /// Initial session description. Travels on the durable path only.
    Offer(SessionDescription),
    /// Reply description. Sent ephemeral first, then persisted.
    Answer(SessionDescription),
    /// Connectivity candidate. Ephemeral path only.
    Candidate(CandidateInit),
    /// Best-effort termination; the durable status update is authoritative.
    Hangup,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::Hangup => "hangup",
        }
    }
}

/// Envelope carried on both the ephemeral and the durable path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "callId")]
    pub call_id: CallId,
    pub from: UserId,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalMessage {
    pub fn new(call_id: CallId, from: UserId, body: SignalBody) -> Self {
        Self { call_id, from, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: SignalBody) -> SignalMessage {
        SignalMessage::new(CallId::new("CALL1"), UserId::new("alice"), body)
    }

    #[test]
    fn test_envelope_shape() {
        let msg = message(SignalBody::Answer(SessionDescription::answer("v=0")));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["callId"], "CALL1");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["payload"]["sdp"], "v=0");
        assert_eq!(json["payload"]["type"], "answer");
    }

    #[test]
    fn test_candidate_wire_names() {
        let candidate = CandidateInit {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(message(SignalBody::Candidate(candidate))).unwrap();
        assert_eq!(json["payload"]["sdpMid"], "0");
        assert_eq!(json["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_hangup_has_no_payload() {
        let json = serde_json::to_value(message(SignalBody::Hangup)).unwrap();
        assert_eq!(json["type"], "hangup");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let bodies = [
            SignalBody::Offer(SessionDescription::offer("o")),
            SignalBody::Answer(SessionDescription::answer("a")),
            SignalBody::Candidate(CandidateInit::new("candidate:1")),
            SignalBody::Hangup,
        ];
        for body in bodies {
            let msg = message(body);
            let json = serde_json::to_string(&msg).unwrap();
            let back: SignalMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let msg = message(SignalBody::Hangup);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.body.kind());
    }
}
