//! In-memory transports and peers for unit tests.

use super::peer::{PeerConfig, PeerConnection, PeerError, PeerEvent, PeerFactory};
use crate::protocol::{IceCandidate, SessionDescription, SignalMessage};
use crate::transport::{BoxFuture, SignalConnector, SignalLink};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub enum LinkInput {
    Message(SignalMessage),
    Close,
}

pub struct MockLink {
    inbound: mpsc::UnboundedReceiver<LinkInput>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

/// Server side of a [`MockLink`]. Dropping `inbound` closes the link.
pub struct LinkRemote {
    pub inbound: mpsc::UnboundedSender<LinkInput>,
    pub outbound: mpsc::UnboundedReceiver<SignalMessage>,
}

pub fn mock_link() -> (MockLink, LinkRemote) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        MockLink { inbound: in_rx, outbound: out_tx },
        LinkRemote { inbound: in_tx, outbound: out_rx },
    )
}

impl SignalLink for MockLink {
    fn send(&mut self, message: SignalMessage) -> BoxFuture<'_, Result<()>> {
        let result = self.outbound.send(message).map_err(|_| Error::ConnectionClosed);
        Box::pin(async move { result })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<SignalMessage>>> {
        Box::pin(async move {
            match self.inbound.recv().await {
                Some(LinkInput::Message(message)) => Ok(Some(message)),
                Some(LinkInput::Close) | None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.inbound.close();
        Box::pin(async { Ok(()) })
    }
}

pub enum ConnectOutcome {
    Link(MockLink),
    Fail,
    Hang,
}

/// Hands out scripted outcomes, one per connect; fails once the script is spent.
pub struct MockConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn scripted(outcomes: Vec<ConnectOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, outcome: ConnectOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SignalConnector for MockConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn SignalLink>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match outcome {
                Some(ConnectOutcome::Link(link)) => Ok(Box::new(link) as Box<dyn SignalLink>),
                Some(ConnectOutcome::Hang) => std::future::pending().await,
                Some(ConnectOutcome::Fail) | None => Err(Error::ConnectionClosed),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    Created(usize),
    CaptureAudio,
    CreateOffer,
    SetLocal(String),
    SetRemote(String),
    AddCandidate(String),
    SendData(String),
    Muted(bool),
    Close,
}

#[derive(Default)]
struct MockPeerShared {
    ops: Mutex<Vec<PeerOp>>,
    capture_error: Mutex<Option<PeerError>>,
    offer_error: Mutex<Option<PeerError>>,
}

impl MockPeerShared {
    fn record(&self, op: PeerOp) {
        self.ops.lock().unwrap().push(op);
    }
}

/// Records every operation performed on the peers it creates.
#[derive(Default)]
pub struct MockPeerFactory {
    shared: Arc<MockPeerShared>,
    senders: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_capture(&self, error: PeerError) {
        *self.shared.capture_error.lock().unwrap() = Some(error);
    }

    pub fn fail_offer(&self, error: PeerError) {
        *self.shared.offer_error.lock().unwrap() = Some(error);
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.shared.ops.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// Raise an event on the most recently created peer.
    pub fn emit(&self, event: PeerEvent) {
        let senders = self.senders.lock().unwrap();
        if let Some(sender) = senders.last() {
            let _ = sender.send(event);
        }
    }

    /// Candidates applied to peers so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }
}

impl PeerFactory for MockPeerFactory {
    fn create(
        &self,
        _config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> std::result::Result<Box<dyn PeerConnection>, PeerError> {
        let mut senders = self.senders.lock().unwrap();
        senders.push(events);
        self.shared.record(PeerOp::Created(senders.len()));
        Ok(Box::new(MockPeer { shared: Arc::clone(&self.shared) }))
    }
}

struct MockPeer {
    shared: Arc<MockPeerShared>,
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn capture_input_audio(&mut self) -> std::result::Result<(), PeerError> {
        self.shared.record(PeerOp::CaptureAudio);
        self.shared.capture_error.lock().unwrap().clone().map_or(Ok(()), Err)
    }

    async fn create_offer(&mut self) -> std::result::Result<SessionDescription, PeerError> {
        self.shared.record(PeerOp::CreateOffer);
        if let Some(error) = self.shared.offer_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(SessionDescription::offer("v=0 local"))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> std::result::Result<(), PeerError> {
        self.shared.record(PeerOp::SetLocal(description.sdp));
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> std::result::Result<(), PeerError> {
        self.shared.record(PeerOp::SetRemote(description.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> std::result::Result<(), PeerError> {
        self.shared.record(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn send_data(&mut self, data: &str) -> std::result::Result<(), PeerError> {
        self.shared.record(PeerOp::SendData(data.to_string()));
        Ok(())
    }

    fn set_input_muted(&mut self, muted: bool) {
        self.shared.record(PeerOp::Muted(muted));
    }

    async fn close(&mut self) {
        self.shared.record(PeerOp::Close);
    }
}
