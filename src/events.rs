//! Discrete call events surfaced to the application.

use crate::types::call::{CallEndReason, CallId, Peer};

/// Buffer size of the event broadcast channel; slow consumers lose the
/// oldest events, never the live state (which the snapshot carries).
pub(crate) const CHANNEL_CAPACITY: usize = 100;

/// Something the UI should react to beyond the snapshot surface.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An invitation addressed to the local user started ringing.
    Incoming { call_id: CallId, from: Peer },
    /// The transport reported connectivity; the call is live.
    Connected { call_id: CallId },
    /// The session was released, for `reason`.
    Ended {
        call_id: CallId,
        reason: CallEndReason,
    },
}
