//! Collaborator seams for media capture and the peer transport.
//!
//! The capture/transport engine itself is out of scope; this crate drives
//! it through these traits and reacts to the events it feeds back. Either a
//! platform-native implementation or a third-party peer library can sit
//! behind [`Transport`]; both satisfy the same contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signal::{CandidateInit, SessionDescription};

/// Why local capture could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied for camera/microphone")]
    PermissionDenied,
    #[error("no camera or microphone found")]
    DeviceNotFound,
    #[error("camera/microphone is already in use")]
    DeviceBusy,
    #[error("media devices not supported in this context")]
    NotSupported,
}

/// Fatal transport-side failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport is closed")]
    Closed,
}

/// A handle on a set of live tracks (local capture or remote playback).
///
/// Exclusively owned by the call session. `stop` releases the underlying
/// devices and must be idempotent.
pub trait MediaStream: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn stop(&self);
}

pub type MediaHandle = Arc<dyn MediaStream>;

/// Capture constraints for [`MediaEngine::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Connectivity state reported by the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// `Failed` is the only state that ends the call; `Disconnected` may
    /// still recover inside the engine.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// An event produced by the transport collaborator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local connectivity candidate is ready to signal to the peer.
    LocalCandidate(CandidateInit),
    /// Remote tracks arrived.
    RemoteStream(MediaHandle),
    /// Connectivity state changed.
    StateChanged(TransportState),
}

/// Configuration handed to the transport collaborator when a call's
/// transport is created.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub stun_servers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
                "stun:stun2.l.google.com:19302".into(),
                "stun:global.stun.twilio.com:3478".into(),
            ],
        }
    }
}

/// The peer-transport engine for one call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn add_local_stream(&self, stream: MediaHandle) -> Result<(), TransportError>;
    async fn produce_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn produce_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError>;
    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Factory for local capture and per-call transports.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaHandle, MediaError>;

    /// Create the transport for one call. Events flow through `events`
    /// until the transport is closed.
    async fn create_transport(
        &self,
        config: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
