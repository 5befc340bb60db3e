#![allow(dead_code)]

use async_trait::async_trait;
use persona_rt::protocol::{IceCandidate, SessionDescription, SignalMessage};
use persona_rt::sdk::peer::{PeerConfig, PeerConnection, PeerError, PeerEvent, PeerFactory};
use persona_rt::transport::{BoxFuture, SignalConnector, SignalLink};
use persona_rt::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Server end of a [`ChannelLink`]: push inbound messages, read what the
/// client sent. Dropping `inbound` closes the link.
pub struct ServerEnd {
    pub inbound: mpsc::UnboundedSender<SignalMessage>,
    pub outbound: mpsc::UnboundedReceiver<SignalMessage>,
}

pub struct ChannelLink {
    inbound: mpsc::UnboundedReceiver<SignalMessage>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

pub fn channel_link() -> (ChannelLink, ServerEnd) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        ChannelLink { inbound: in_rx, outbound: out_tx },
        ServerEnd { inbound: in_tx, outbound: out_rx },
    )
}

impl SignalLink for ChannelLink {
    fn send(&mut self, message: SignalMessage) -> BoxFuture<'_, Result<()>> {
        let result = self.outbound.send(message).map_err(|_| Error::ConnectionClosed);
        Box::pin(async move { result })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<SignalMessage>>> {
        Box::pin(async move { Ok(self.inbound.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.inbound.close();
        Box::pin(async { Ok(()) })
    }
}

/// Hands out queued links, one per connect; refuses once the queue is empty.
#[derive(Default)]
pub struct QueueConnector {
    links: Mutex<VecDeque<ChannelLink>>,
    attempts: AtomicUsize,
}

impl QueueConnector {
    pub fn with_links(count: usize) -> (Arc<Self>, Vec<ServerEnd>) {
        let connector = Arc::new(Self::default());
        let ends = (0..count).map(|_| connector.add_link()).collect();
        (connector, ends)
    }

    pub fn add_link(&self) -> ServerEnd {
        let (link, end) = channel_link();
        self.links.lock().unwrap().push_back(link);
        end
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SignalConnector for QueueConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn SignalLink>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let link = self.links.lock().unwrap().pop_front();
        Box::pin(async move {
            match link {
                Some(link) => Ok(Box::new(link) as Box<dyn SignalLink>),
                None => Err(Error::ConnectionClosed),
            }
        })
    }
}

#[derive(Default)]
struct PeerLog {
    remote_descriptions: Vec<String>,
    candidates: Vec<String>,
    data: Vec<String>,
    closed: usize,
}

/// A scripted media stack: every peer accepts what it is given and records it.
#[derive(Default)]
pub struct FakeMedia {
    log: Arc<Mutex<PeerLog>>,
    peers: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    deny_microphone: bool,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying_microphone() -> Arc<Self> {
        Arc::new(Self {
            deny_microphone: true,
            ..Self::default()
        })
    }

    pub fn peers_created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Raise an event on the newest peer.
    pub fn emit(&self, event: PeerEvent) {
        if let Some(peer) = self.peers.lock().unwrap().last() {
            let _ = peer.send(event);
        }
    }

    pub fn remote_descriptions(&self) -> Vec<String> {
        self.log.lock().unwrap().remote_descriptions.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.log.lock().unwrap().candidates.clone()
    }

    pub fn data_sent(&self) -> Vec<String> {
        self.log.lock().unwrap().data.clone()
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

impl PeerFactory for FakeMedia {
    fn create(
        &self,
        _config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> std::result::Result<Box<dyn PeerConnection>, PeerError> {
        self.peers.lock().unwrap().push(events);
        Ok(Box::new(FakePeer {
            log: Arc::clone(&self.log),
            deny_microphone: self.deny_microphone,
        }))
    }
}

struct FakePeer {
    log: Arc<Mutex<PeerLog>>,
    deny_microphone: bool,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn capture_input_audio(&mut self) -> std::result::Result<(), PeerError> {
        if self.deny_microphone {
            return Err(PeerError::PermissionDenied("NotAllowedError".to_string()));
        }
        Ok(())
    }

    async fn create_offer(&mut self) -> std::result::Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn set_local_description(&mut self, _description: SessionDescription) -> std::result::Result<(), PeerError> {
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> std::result::Result<(), PeerError> {
        self.log.lock().unwrap().remote_descriptions.push(description.sdp);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> std::result::Result<(), PeerError> {
        self.log.lock().unwrap().candidates.push(candidate.candidate);
        Ok(())
    }

    fn send_data(&mut self, data: &str) -> std::result::Result<(), PeerError> {
        self.log.lock().unwrap().data.push(data.to_string());
        Ok(())
    }

    fn set_input_muted(&mut self, _muted: bool) {}

    async fn close(&mut self) {
        self.log.lock().unwrap().closed += 1;
    }
}
