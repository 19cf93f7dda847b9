//! Call session state machine.

use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of the local call session.
///
/// `Idle` is both the initial and the terminal state; a session object
/// exists only while the status is non-idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    /// Outgoing: offer on its way, waiting for the answer.
    Calling,
    /// Incoming: invitation received, ringing locally.
    Incoming,
    /// Incoming: user accepted, negotiation reply in flight.
    Answering,
    /// Transport reported connectivity; media is flowing.
    Connected,
}

impl CallStatus {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn can_answer(self) -> bool {
        matches!(self, Self::Incoming)
    }

    /// Apply a transition, yielding the next state.
    ///
    /// Callers treat an `Err` as a no-op; out-of-order input never panics.
    pub fn apply(self, transition: CallTransition) -> Result<CallStatus, InvalidTransition> {
        use CallStatus::*;
        use CallTransition::*;
        match (self, transition) {
            (Idle, DialStarted) => Ok(Calling),
            (Idle, OfferReceived) => Ok(Incoming),
            (Incoming, AnswerStarted) => Ok(Answering),
            (Calling, TransportConnected) | (Answering, TransportConnected) => Ok(Connected),
            // Teardown is the identity on idle so it can run twice safely.
            (_, TornDown) => Ok(Idle),
            (from, attempted) => Err(InvalidTransition { from, attempted }),
        }
    }
}

/// Events that move the session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// `start` accepted; the outgoing attempt begins.
    DialStarted,
    /// An invitation addressed to the local user arrived.
    OfferReceived,
    /// The local user accepted a ringing invitation.
    AnswerStarted,
    /// The transport collaborator reported connectivity.
    TransportConnected,
    /// Hangup, rejection, timeout, or error released the session.
    TornDown,
}

/// A transition attempted from a state that does not permit it.
#[derive(Debug, Clone, Error)]
#[error("invalid transition {attempted:?} from {from:?}")]
pub struct InvalidTransition {
    pub from: CallStatus,
    pub attempted: CallTransition,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flow: Idle → Calling → Connected → Idle
    #[test]
    fn test_outgoing_flow() {
        let status = CallStatus::Idle;
        let status = status.apply(CallTransition::DialStarted).unwrap();
        assert_eq!(status, CallStatus::Calling);
        let status = status.apply(CallTransition::TransportConnected).unwrap();
        assert_eq!(status, CallStatus::Connected);
        let status = status.apply(CallTransition::TornDown).unwrap();
        assert!(status.is_idle());
    }

    /// Flow: Idle → Incoming → Answering → Connected → Idle
    #[test]
    fn test_incoming_flow() {
        let status = CallStatus::Idle;
        let status = status.apply(CallTransition::OfferReceived).unwrap();
        assert_eq!(status, CallStatus::Incoming);
        assert!(status.can_answer());
        let status = status.apply(CallTransition::AnswerStarted).unwrap();
        assert_eq!(status, CallStatus::Answering);
        let status = status.apply(CallTransition::TransportConnected).unwrap();
        assert!(status.is_connected());
        let status = status.apply(CallTransition::TornDown).unwrap();
        assert!(status.is_idle());
    }

    /// Teardown is valid from every state, including idle.
    #[test]
    fn test_teardown_from_every_state() {
        for status in [
            CallStatus::Idle,
            CallStatus::Calling,
            CallStatus::Incoming,
            CallStatus::Answering,
            CallStatus::Connected,
        ] {
            assert_eq!(status.apply(CallTransition::TornDown).unwrap(), CallStatus::Idle);
        }
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        // Cannot answer without an invitation.
        assert!(CallStatus::Idle.apply(CallTransition::AnswerStarted).is_err());
        // Cannot connect before dialing or answering.
        assert!(
            CallStatus::Idle
                .apply(CallTransition::TransportConnected)
                .is_err()
        );
        assert!(
            CallStatus::Incoming
                .apply(CallTransition::TransportConnected)
                .is_err()
        );
        // A live session cannot start a second attempt.
        assert!(CallStatus::Calling.apply(CallTransition::DialStarted).is_err());
        assert!(
            CallStatus::Connected
                .apply(CallTransition::OfferReceived)
                .is_err()
        );
        // Answering twice is not a valid edge.
        assert!(
            CallStatus::Answering
                .apply(CallTransition::AnswerStarted)
                .is_err()
        );
    }

    #[test]
    fn test_connected_is_reachable_from_both_directions() {
        assert_eq!(
            CallStatus::Calling
                .apply(CallTransition::TransportConnected)
                .unwrap(),
            CallStatus::Connected
        );
        assert_eq!(
            CallStatus::Answering
                .apply(CallTransition::TransportConnected)
                .unwrap(),
            CallStatus::Connected
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&CallStatus::Answering).unwrap(),
            "\"answering\""
        );
        assert_eq!(serde_json::to_string(&CallStatus::Idle).unwrap(), "\"idle\"");
    }
}
