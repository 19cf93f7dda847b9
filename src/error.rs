//! Call-related error types.

use thiserror::Error;

use crate::channel::BrokerError;
use crate::media::{MediaError, TransportError};
use crate::state::InvalidTransition;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access failed: {0}")]
    Media(#[from] MediaError),

    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("signal delivery failed: {0}")]
    Store(#[from] StoreError),

    #[error("broadcast path failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call manager is not running")]
    ManagerStopped,
}
