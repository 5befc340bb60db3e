//! Offer/answer and ICE exchange for one peer connection at a time.
//!
//! The coordinator is owned by the session task and driven from there: it is
//! fed remote signalling messages and the events of its current peer, and
//! answers with [`NegotiationEvent`]s for the session to publish. Every
//! failure ends in [`NegotiationCoordinator::teardown`] and a `Closed` event
//! carrying the reason.

use super::buffer::ReadyBuffer;
use super::events::ConnectionClosedCode;
use super::peer::{
    IceConnectionState, MediaKind, PeerConfig, PeerConnection, PeerConnectionState, PeerError, PeerEvent,
    PeerFactory, PermissionState,
};
use super::signalling::SignallingChannel;
use crate::protocol::{IceCandidate, OfferPayload, SessionDescription, SignalBody, SignalMessage};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// The media connection is up. Raised once per negotiation.
    Established,
    Closed {
        code: ConnectionClosedCode,
        reason: Option<String>,
    },
    Warning(String),
    DataMessage(String),
    TrackStarted(MediaKind),
    InputAudioStarted,
}

/// Remote candidates are held in `remote_candidates` until the answer lands;
/// the buffer being open is what "has remote answer" means.
#[derive(Debug, Default)]
struct NegotiationState {
    has_local_offer: bool,
    remote_candidates: ReadyBuffer<IceCandidate>,
}

pub struct NegotiationCoordinator {
    factory: Arc<dyn PeerFactory>,
    channel: SignallingChannel,
    config: PeerConfig,
    disable_input_audio: bool,
    peer: Option<Box<dyn PeerConnection>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    state: NegotiationState,
    established: bool,
    permission: PermissionState,
    input_muted: bool,
}

impl NegotiationCoordinator {
    #[must_use]
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        channel: SignallingChannel,
        config: PeerConfig,
        disable_input_audio: bool,
    ) -> Self {
        Self {
            factory,
            channel,
            config,
            disable_input_audio,
            peer: None,
            peer_events: None,
            state: NegotiationState::default(),
            established: false,
            permission: PermissionState::NotRequested,
            input_muted: false,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.peer.is_some()
    }

    #[must_use]
    pub const fn has_local_offer(&self) -> bool {
        self.state.has_local_offer
    }

    #[must_use]
    pub const fn has_remote_answer(&self) -> bool {
        self.state.remote_candidates.is_ready()
    }

    #[must_use]
    pub const fn input_permission(&self) -> PermissionState {
        self.permission
    }

    #[must_use]
    pub const fn is_input_muted(&self) -> bool {
        self.input_muted
    }

    /// Create a fresh peer, produce the local offer and send it. Any previous
    /// peer is torn down first.
    ///
    /// Returns `Some(Closed { .. })` if negotiation could not start.
    pub async fn start(&mut self) -> Option<NegotiationEvent> {
        self.teardown().await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.factory.create(self.config.clone(), events_tx) {
            Ok(peer) => {
                self.peer = Some(peer);
                self.peer_events = Some(events_rx);
            }
            Err(err) => return Some(self.fail(err).await),
        }

        match self.create_local_offer().await {
            Ok(offer) => {
                self.state.has_local_offer = true;
                tracing::debug!(session_id = self.channel.session_id(), "Sending local offer");
                self.channel.send(SignalBody::Offer(OfferPayload {
                    connection_description: offer,
                    user_uid: self.channel.session_id().to_string(),
                }));
                None
            }
            Err(err) => Some(self.fail(err).await),
        }
    }

    async fn create_local_offer(&mut self) -> std::result::Result<SessionDescription, PeerError> {
        let Some(peer) = self.peer.as_mut() else {
            return Err(PeerError::Closed);
        };

        if !self.disable_input_audio {
            self.permission = PermissionState::Pending;
            match peer.capture_input_audio().await {
                Ok(()) => {
                    self.permission = PermissionState::Granted;
                    if self.input_muted {
                        peer.set_input_muted(true);
                    }
                }
                Err(err) => {
                    if matches!(err, PeerError::PermissionDenied(_)) {
                        self.permission = PermissionState::Denied;
                    }
                    return Err(err);
                }
            }
        }

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Route a negotiation message from the signalling channel.
    pub async fn on_remote_message(&mut self, message: SignalMessage) -> Option<NegotiationEvent> {
        match message.body {
            SignalBody::Answer(answer) => self.apply_answer(answer).await,
            SignalBody::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            SignalBody::EndSession(reason) => {
                tracing::info!(session_id = %message.session_id, "Session ended by server: {reason}");
                self.teardown().await;
                Some(NegotiationEvent::Closed {
                    code: ConnectionClosedCode::Normal,
                    reason: Some(reason).filter(|r| !r.is_empty()),
                })
            }
            SignalBody::Warning(warning) => {
                tracing::warn!(session_id = %message.session_id, "Server warning: {warning}");
                Some(NegotiationEvent::Warning(warning))
            }
            other => {
                tracing::warn!(action = other.action_kind(), "Ignoring unknown signal action");
                None
            }
        }
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Option<NegotiationEvent> {
        if self.has_remote_answer() {
            tracing::warn!("Ignoring duplicate remote answer");
            return None;
        }
        let result = match self.peer.as_mut() {
            Some(peer) => peer.set_remote_description(answer).await,
            None => {
                tracing::debug!("Ignoring remote answer without an active peer");
                return None;
            }
        };
        if let Err(err) = result {
            return Some(self.fail(err).await);
        }

        let buffered = self.state.remote_candidates.open();
        if !buffered.is_empty() {
            tracing::debug!(count = buffered.len(), "Applying buffered remote ICE candidates");
        }
        for candidate in buffered {
            if let Err(err) = self.add_candidate(candidate).await {
                return Some(self.fail(err).await);
            }
        }
        None
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Option<NegotiationEvent> {
        if self.peer.is_none() {
            tracing::debug!("Ignoring remote ICE candidate without an active peer");
            return None;
        }
        match self.state.remote_candidates.push(candidate) {
            Some(candidate) => {
                if let Err(err) = self.add_candidate(candidate).await {
                    return Some(self.fail(err).await);
                }
            }
            None => tracing::trace!("Buffering remote ICE candidate until the answer is applied"),
        }
        None
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> std::result::Result<(), PeerError> {
        match self.peer.as_mut() {
            Some(peer) => peer.add_ice_candidate(candidate).await,
            None => Err(PeerError::Closed),
        }
    }

    /// Next event from the current peer. Pends while there is none.
    pub async fn next_peer_event(&mut self) -> PeerEvent {
        if let Some(events) = self.peer_events.as_mut() {
            if let Some(event) = events.recv().await {
                return event;
            }
        }
        std::future::pending().await
    }

    pub async fn on_peer_event(&mut self, event: PeerEvent) -> Option<NegotiationEvent> {
        match event {
            PeerEvent::LocalIceCandidate(candidate) => {
                self.channel.send(SignalBody::IceCandidate(candidate));
                None
            }
            PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected | IceConnectionState::Completed)
            | PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected) => self.mark_established(),
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Closed | PeerConnectionState::Failed) => {
                if self.peer.is_none() {
                    return None;
                }
                tracing::error!(session_id = self.channel.session_id(), "Peer connection closed unexpectedly");
                self.teardown().await;
                Some(NegotiationEvent::Closed {
                    code: ConnectionClosedCode::WebrtcFailure,
                    reason: Some("peer connection closed".to_string()),
                })
            }
            PeerEvent::IceConnectionStateChanged(state) => {
                tracing::debug!(?state, "ICE connection state changed");
                None
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::debug!(?state, "Peer connection state changed");
                None
            }
            PeerEvent::DataChannelOpened => {
                tracing::debug!("Data channel opened");
                None
            }
            PeerEvent::DataChannelClosed => {
                tracing::debug!("Data channel closed");
                None
            }
            PeerEvent::DataChannelMessage(data) => Some(NegotiationEvent::DataMessage(data)),
            PeerEvent::TrackStarted(kind) => Some(NegotiationEvent::TrackStarted(kind)),
            PeerEvent::InputAudioStarted => Some(NegotiationEvent::InputAudioStarted),
        }
    }

    fn mark_established(&mut self) -> Option<NegotiationEvent> {
        if self.established || self.peer.is_none() {
            return None;
        }
        self.established = true;
        tracing::info!(session_id = self.channel.session_id(), "Peer connection established");
        Some(NegotiationEvent::Established)
    }

    /// Send a free-form message over the data channel.
    ///
    /// # Errors
    /// Returns `SessionNotStarted` without a peer, or the peer's send error.
    pub fn send_data(&mut self, data: &str) -> Result<()> {
        let peer = self.peer.as_mut().ok_or(Error::SessionNotStarted)?;
        peer.send_data(data)?;
        Ok(())
    }

    pub fn set_input_muted(&mut self, muted: bool) {
        self.input_muted = muted;
        if self.permission != PermissionState::Granted {
            return;
        }
        if let Some(peer) = self.peer.as_mut() {
            peer.set_input_muted(muted);
        }
    }

    async fn fail(&mut self, err: PeerError) -> NegotiationEvent {
        let code = match err {
            PeerError::PermissionDenied(_) => ConnectionClosedCode::MicrophonePermissionDenied,
            _ => ConnectionClosedCode::WebrtcFailure,
        };
        tracing::error!(session_id = self.channel.session_id(), ?code, "Negotiation failed: {err}");
        self.teardown().await;
        NegotiationEvent::Closed {
            code,
            reason: Some(err.to_string()),
        }
    }

    /// Close the current peer and forget all negotiation state. Idempotent.
    pub async fn teardown(&mut self) {
        self.peer_events = None;
        if let Some(mut peer) = self.peer.take() {
            tracing::debug!(session_id = self.channel.session_id(), "Closing peer connection");
            peer.close().await;
        }
        self.state = NegotiationState::default();
        self.established = false;
    }
}
