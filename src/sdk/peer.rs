//! Seam to the host's peer-connection and media-capture primitives.
//!
//! The SDK never generates SDP or touches codecs itself; it drives a
//! [`PeerConnection`] produced by an application-supplied [`PeerFactory`] and
//! listens to the [`PeerEvent`]s the implementation reports back.

use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    NotRequested,
    Pending,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAudioState {
    pub is_muted: bool,
    pub permission_state: PermissionState,
}

/// Signals raised by a peer connection implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalIceCandidate(IceCandidate),
    IceConnectionStateChanged(IceConnectionState),
    ConnectionStateChanged(PeerConnectionState),
    DataChannelOpened,
    DataChannelClosed,
    DataChannelMessage(String),
    /// A remote media track started playing.
    TrackStarted(MediaKind),
    /// The local microphone track is live.
    InputAudioStarted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("Media capture failed: {0}")]
    Media(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Peer connection is closed")]
    Closed,
}

/// A single peer connection with an ordered data channel.
#[async_trait]
pub trait PeerConnection: Send {
    /// Request microphone access and attach the capture track.
    async fn capture_input_audio(&mut self) -> Result<(), PeerError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Send a text frame over the data channel, verbatim.
    fn send_data(&mut self, data: &str) -> Result<(), PeerError>;
    fn set_input_muted(&mut self, muted: bool);
    async fn close(&mut self);
}

/// Creates peer connections; one per negotiation attempt.
pub trait PeerFactory: Send + Sync {
    /// # Errors
    /// Returns an error if the host cannot create a peer connection.
    fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}
