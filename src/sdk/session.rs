use super::config::SessionOptions;
use super::events::{ConnectionClosedCode, EventStream, SessionEvent};
use super::history::{MessageHistory, ReasoningHistory};
use super::negotiation::{NegotiationCoordinator, NegotiationEvent};
use super::peer::{InputAudioState, MediaKind, PeerConfig, PeerFactory};
use super::signalling::{ChannelEvent, ChannelPolicy, ChannelState, SignallingChannel};
use super::stream::{CorrelatedStream, StreamListeners};
use super::tools::{ToolCallDispatcher, ToolCallEvent, ToolCallHandler, ToolHandlerRegistration};
use crate::protocol::{DataChannelFrame, SignalBody, SignalMessage};
use crate::transport::SignalConnector;
use crate::transport::rest::{EngineApiClient, SessionDescriptor};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const EVENT_QUEUE_CAPACITY: usize = 128;
const COMMAND_QUEUE_CAPACITY: usize = 64;

enum Command {
    Connect { respond: oneshot::Sender<Result<()>> },
    SendControl { content: String, respond: oneshot::Sender<Result<()>> },
    SetInputMuted { muted: bool, respond: oneshot::Sender<InputAudioState> },
    InputAudioState { respond: oneshot::Sender<InputAudioState> },
    PeerActive { respond: oneshot::Sender<bool> },
    Disconnect { respond: oneshot::Sender<()> },
}

/// Cloneable control surface of a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: Arc<str>,
    sender: mpsc::Sender<Command>,
    channel: SignallingChannel,
    listeners: StreamListeners,
    tools: ToolCallDispatcher,
    engine: EngineApiClient,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Connect signalling and negotiate the media connection. Resolves once
    /// the local offer has been sent.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` if the session closed before negotiation
    /// started; the reason is published as a `ConnectionClosed` event.
    pub async fn connect(&self) -> Result<()> {
        self.request(|respond| Command::Connect { respond }).await?
    }

    /// Send a free-form message over the data channel, verbatim.
    ///
    /// # Errors
    /// Returns an error if there is no open peer connection.
    pub async fn send_control_message(&self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.request(|respond| Command::SendControl { content, respond }).await?
    }

    /// Have the persona say `content` verbatim, through the engine's HTTP API.
    ///
    /// # Errors
    /// Returns `SessionNotStarted` if there is no peer connection yet, or the
    /// HTTP error if the engine rejects the command.
    pub async fn talk(&self, content: impl Into<String>) -> Result<()> {
        if !self.request(|respond| Command::PeerActive { respond }).await? {
            return Err(Error::SessionNotStarted);
        }
        self.engine.send_talk_command(&content.into()).await
    }

    /// Open an input stream. A correlation id is generated when none is given.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an empty correlation id, or
    /// `ConnectionClosed` once the session has ended.
    #[allow(clippy::result_large_err)]
    pub fn open_correlated_stream(&self, correlation_id: Option<String>) -> Result<CorrelatedStream> {
        if self.sender.is_closed() || self.channel.state() == ChannelState::Failed {
            return Err(Error::ConnectionClosed);
        }
        let correlation_id = match correlation_id {
            Some(id) if id.is_empty() => {
                return Err(Error::InvalidConfig("correlation id must not be empty".to_string()));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        Ok(CorrelatedStream::open(correlation_id, self.channel.clone(), self.listeners.clone()))
    }

    pub fn register_tool_handler(&self, tool_name: impl Into<String>, handler: ToolCallHandler) -> ToolHandlerRegistration {
        self.tools.register_handler(tool_name, handler)
    }

    /// # Errors
    /// Returns `ConnectionClosed` once the session has ended.
    pub async fn mute_input_audio(&self) -> Result<InputAudioState> {
        self.request(|respond| Command::SetInputMuted { muted: true, respond }).await
    }

    /// # Errors
    /// Returns `ConnectionClosed` once the session has ended.
    pub async fn unmute_input_audio(&self) -> Result<InputAudioState> {
        self.request(|respond| Command::SetInputMuted { muted: false, respond }).await
    }

    /// # Errors
    /// Returns `ConnectionClosed` once the session has ended.
    pub async fn input_audio_state(&self) -> Result<InputAudioState> {
        self.request(|respond| Command::InputAudioState { respond }).await
    }

    /// Stop signalling and close the peer connection. Safe to call again.
    pub async fn disconnect(&self) {
        if self.request(|respond| Command::Disconnect { respond }).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "Session already closed");
        }
        self.channel.stop();
    }
}

/// A persona session. Events are read with [`next_event`](Self::next_event)
/// or [`events`](Self::events); the queue must be drained for the session to
/// make progress.
pub struct Session {
    handle: SessionHandle,
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl Session {
    /// Build a session over the given transports. Must be called inside a
    /// tokio runtime.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the options are invalid.
    #[allow(clippy::result_large_err)]
    pub fn from_parts(
        descriptor: SessionDescriptor,
        options: SessionOptions,
        connector: Arc<dyn SignalConnector>,
        peer_factory: Arc<dyn PeerFactory>,
    ) -> Result<Self> {
        let options = options.with_server_policy(&descriptor.policy);
        options.validate()?;

        let session_id = descriptor.session_id;
        let engine = EngineApiClient::new(descriptor.engine_url, session_id.clone())?;
        let (channel, channel_events) =
            SignallingChannel::spawn(session_id.clone(), connector, ChannelPolicy::from_options(&options));
        let mut coordinator = NegotiationCoordinator::new(
            peer_factory,
            channel.clone(),
            PeerConfig { ice_servers: descriptor.ice_servers },
            options.disable_input_audio,
        );
        if options.start_muted {
            coordinator.set_input_muted(true);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let listeners = StreamListeners::new();
        let (tools, tool_outcomes) = ToolCallDispatcher::new();

        let task = SessionTask {
            session_id: session_id.clone(),
            channel: channel.clone(),
            coordinator,
            listeners: listeners.clone(),
            tools: tools.clone(),
            messages: MessageHistory::new(),
            reasoning: ReasoningHistory::new(),
            events: event_tx,
            connect_waiters: Vec::new(),
            closed: false,
        };
        tokio::spawn(task.run(cmd_rx, channel_events, tool_outcomes));

        Ok(Self {
            handle: SessionHandle {
                session_id: session_id.into(),
                sender: cmd_tx,
                channel,
                listeners,
                tools,
                engine,
            },
            event_rx,
        })
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        self.handle.session_id()
    }

    /// # Errors
    /// See [`SessionHandle::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.handle.connect().await
    }

    /// # Errors
    /// See [`SessionHandle::send_control_message`].
    pub async fn send_control_message(&self, content: impl Into<String>) -> Result<()> {
        self.handle.send_control_message(content).await
    }

    /// # Errors
    /// See [`SessionHandle::talk`].
    pub async fn talk(&self, content: impl Into<String>) -> Result<()> {
        self.handle.talk(content).await
    }

    /// # Errors
    /// See [`SessionHandle::open_correlated_stream`].
    #[allow(clippy::result_large_err)]
    pub fn open_correlated_stream(&self, correlation_id: Option<String>) -> Result<CorrelatedStream> {
        self.handle.open_correlated_stream(correlation_id)
    }

    pub fn register_tool_handler(&self, tool_name: impl Into<String>, handler: ToolCallHandler) -> ToolHandlerRegistration {
        self.handle.register_tool_handler(tool_name, handler)
    }

    /// # Errors
    /// Returns `ConnectionClosed` once the session has ended.
    pub async fn mute_input_audio(&self) -> Result<InputAudioState> {
        self.handle.mute_input_audio().await
    }

    /// # Errors
    /// Returns `ConnectionClosed` once the session has ended.
    pub async fn unmute_input_audio(&self) -> Result<InputAudioState> {
        self.handle.unmute_input_audio().await
    }

    /// # Errors
    /// Returns `ConnectionClosed` once the session has ended.
    pub async fn input_audio_state(&self) -> Result<InputAudioState> {
        self.handle.input_audio_state().await
    }

    pub async fn disconnect(&self) {
        self.handle.disconnect().await;
    }

    /// Await the next session event; `None` once the session has ended and
    /// all events were read.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Stream session events.
    #[must_use]
    pub fn events(&mut self) -> EventStream<'_> {
        EventStream::new(&mut self.event_rx)
    }
}

struct SessionTask {
    session_id: String,
    channel: SignallingChannel,
    coordinator: NegotiationCoordinator,
    listeners: StreamListeners,
    tools: ToolCallDispatcher,
    messages: MessageHistory,
    reasoning: ReasoningHistory,
    events: mpsc::Sender<SessionEvent>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    closed: bool,
}

impl SessionTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut tool_outcomes: mpsc::UnboundedReceiver<ToolCallEvent>,
    ) {
        while !self.closed {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => self.close(None).await,
                },
                event = channel_events.recv() => match event {
                    Some(event) => self.on_channel_event(event).await,
                    None => self.close(None).await,
                },
                Some(outcome) = tool_outcomes.recv() => self.emit(tool_event(outcome)).await,
                peer_event = self.coordinator.next_peer_event() => {
                    if let Some(event) = self.coordinator.on_peer_event(peer_event).await {
                        self.on_negotiation_event(event).await;
                    }
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "Session task finished");
    }

    async fn emit(&mut self, event: SessionEvent) {
        publish(&self.events, event).await;
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { respond } => {
                if self.channel.state() == ChannelState::Connected && self.coordinator.has_local_offer() {
                    let _ = respond.send(Ok(()));
                } else {
                    self.connect_waiters.push(respond);
                    self.channel.request_connect();
                }
            }
            Command::SendControl { content, respond } => {
                let _ = respond.send(self.coordinator.send_data(&content));
            }
            Command::SetInputMuted { muted, respond } => {
                self.coordinator.set_input_muted(muted);
                let _ = respond.send(self.input_audio_state());
            }
            Command::InputAudioState { respond } => {
                let _ = respond.send(self.input_audio_state());
            }
            Command::PeerActive { respond } => {
                let _ = respond.send(self.coordinator.is_active());
            }
            Command::Disconnect { respond } => {
                tracing::info!(session_id = %self.session_id, "Disconnect requested");
                self.close(None).await;
                let _ = respond.send(());
            }
        }
    }

    fn input_audio_state(&self) -> InputAudioState {
        InputAudioState {
            is_muted: self.coordinator.is_input_muted(),
            permission_state: self.coordinator.input_permission(),
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.negotiate().await,
            ChannelEvent::Message(message) => self.on_signal(message).await,
            ChannelEvent::ConnectionFailed => {
                let closed = SessionEvent::ConnectionClosed {
                    code: ConnectionClosedCode::SignallingConnectionFailure,
                    details: Some("signalling reconnect attempts exhausted".to_string()),
                };
                self.close(Some(closed)).await;
            }
        }
    }

    /// Start a fresh negotiation. Runs on every (re)connect of the channel;
    /// any earlier peer is discarded.
    async fn negotiate(&mut self) {
        if self.coordinator.is_active() {
            tracing::info!(session_id = %self.session_id, "Signalling reconnected; renegotiating");
        }
        match self.coordinator.start().await {
            Some(event) => self.on_negotiation_event(event).await,
            None => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    async fn on_signal(&mut self, message: SignalMessage) {
        if let SignalBody::StreamInterrupted(payload) = &message.body {
            let correlation_id = payload.correlation_id.clone();
            if self.listeners.dispatch(&message).is_none() {
                tracing::debug!(%correlation_id, "Interruption for a stream that is not active");
            }
            self.emit(SessionEvent::StreamInterrupted { correlation_id }).await;
            return;
        }

        match message.body {
            SignalBody::SessionReady(_) => {
                self.emit(SessionEvent::SessionReady {
                    session_id: self.session_id.clone(),
                })
                .await;
            }
            SignalBody::Heartbeat => tracing::trace!("Heartbeat from server"),
            body => {
                let message = SignalMessage::new(message.session_id, body);
                if let Some(event) = self.coordinator.on_remote_message(message).await {
                    self.on_negotiation_event(event).await;
                }
            }
        }
    }

    async fn on_negotiation_event(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::Established => self.emit(SessionEvent::ConnectionEstablished).await,
            NegotiationEvent::Closed { code, reason } => {
                self.close(Some(SessionEvent::ConnectionClosed { code, details: reason })).await;
            }
            NegotiationEvent::Warning(warning) => self.emit(SessionEvent::ServerWarning(warning)).await,
            NegotiationEvent::DataMessage(raw) => self.on_data_message(&raw).await,
            NegotiationEvent::TrackStarted(MediaKind::Video) => self.emit(SessionEvent::VideoStreamStarted).await,
            NegotiationEvent::TrackStarted(MediaKind::Audio) => self.emit(SessionEvent::AudioStreamStarted).await,
            NegotiationEvent::InputAudioStarted => self.emit(SessionEvent::InputAudioStreamStarted).await,
        }
    }

    async fn on_data_message(&mut self, raw: &str) {
        let frame = match DataChannelFrame::decode(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, "Dropping data-channel frame: {err}");
                return;
            }
        };

        match frame {
            DataChannelFrame::SpeechText(chunk) => {
                let (event, snapshot) = self.messages.process(&chunk);
                self.emit(SessionEvent::MessageStreamEvent(event)).await;
                if let Some(history) = snapshot {
                    self.emit(SessionEvent::MessageHistoryUpdated(history)).await;
                }
            }
            DataChannelFrame::ReasoningText(chunk) => {
                let (event, snapshot) = self.reasoning.process(&chunk);
                self.emit(SessionEvent::ReasoningStreamEvent(event)).await;
                if let Some(history) = snapshot {
                    self.emit(SessionEvent::ReasoningHistoryUpdated(history)).await;
                }
            }
            DataChannelFrame::ClientToolEvent(event) => self.emit(SessionEvent::ClientToolEvent(event)).await,
            DataChannelFrame::ToolCallStarted(wire) => {
                let started = self.tools.handle_start_event(wire.into());
                self.emit(SessionEvent::ToolCallStarted(started)).await;
            }
            DataChannelFrame::ToolCallCompleted(wire) => {
                let event = self.tools.handle_completed_event(wire.into());
                self.emit(SessionEvent::ToolCallCompleted(event)).await;
            }
            DataChannelFrame::ToolCallFailed(wire) => {
                let event = self.tools.handle_failed_event(wire.into());
                self.emit(SessionEvent::ToolCallFailed(event)).await;
            }
        }
    }

    /// Stop signalling and the peer, optionally publishing a final event.
    async fn close(&mut self, event: Option<SessionEvent>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.channel.stop();
        self.coordinator.teardown().await;
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        if let Some(event) = event {
            tracing::info!(session_id = %self.session_id, ?event, "Session closed");
            self.emit(event).await;
        }
    }
}

async fn publish(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if events.send(event).await.is_err() {
        tracing::trace!("Session event dropped; receiver gone");
    }
}

fn tool_event(event: ToolCallEvent) -> SessionEvent {
    match event {
        ToolCallEvent::Completed(completed) => SessionEvent::ToolCallCompleted(completed),
        ToolCallEvent::Failed(failed) => SessionEvent::ToolCallFailed(failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IceCandidate, SessionDescription, StreamInterruptedPayload};
    use crate::sdk::peer::{IceConnectionState, PeerError, PeerEvent, PermissionState};
    use crate::sdk::testing::{ConnectOutcome, LinkInput, LinkRemote, MockConnector, MockPeerFactory, PeerOp, mock_link};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    const SESSION: &str = "session-1";

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            session_id: SESSION.to_string(),
            engine_url: Url::parse("https://engine.test").unwrap(),
            signalling_url: Url::parse("wss://engine.test/ws?session_id=session-1").unwrap(),
            ice_servers: Vec::new(),
            policy: Default::default(),
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            disable_input_audio: true,
            ..SessionOptions::default()
        }
    }

    struct Harness {
        session: Session,
        connector: Arc<MockConnector>,
        peers: Arc<MockPeerFactory>,
        remote: LinkRemote,
    }

    impl Harness {
        fn new(options: SessionOptions) -> Self {
            let (link, remote) = mock_link();
            let connector = MockConnector::scripted(vec![ConnectOutcome::Link(link)]);
            let peers = MockPeerFactory::new();
            let session = Session::from_parts(descriptor(), options, connector.clone(), peers.clone()).unwrap();
            Self { session, connector, peers, remote }
        }

        fn inject(&self, body: SignalBody) {
            self.remote
                .inbound
                .send(LinkInput::Message(SignalMessage::new(SESSION, body)))
                .unwrap();
        }

        async fn next_event(&mut self) -> SessionEvent {
            tokio::time::timeout(Duration::from_secs(5), self.session.next_event())
                .await
                .expect("timed out waiting for a session event")
                .expect("session event stream ended")
        }

        async fn next_sent(&mut self) -> SignalMessage {
            loop {
                let message = self.remote.outbound.recv().await.unwrap();
                if message.body != SignalBody::Heartbeat {
                    return message;
                }
            }
        }
    }

    #[tokio::test]
    async fn connect_sends_offer_and_reports_established() {
        let mut h = Harness::new(options());
        h.session.connect().await.unwrap();
        assert!(matches!(h.next_sent().await.body, SignalBody::Offer(_)));

        h.inject(SignalBody::Answer(SessionDescription::answer("v=0 remote")));
        h.inject(SignalBody::SessionReady(json!({})));
        assert_eq!(h.next_event().await, SessionEvent::SessionReady { session_id: SESSION.into() });

        h.peers.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        assert_eq!(h.next_event().await, SessionEvent::ConnectionEstablished);
        assert!(h.peers.ops().contains(&PeerOp::SetRemote("v=0 remote".into())));

        h.session.connect().await.unwrap();
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.peers.created(), 1);
    }

    #[tokio::test]
    async fn end_session_closes_normally() {
        let mut h = Harness::new(options());
        h.session.connect().await.unwrap();
        h.inject(SignalBody::EndSession(String::new()));

        assert_eq!(
            h.next_event().await,
            SessionEvent::ConnectionClosed { code: ConnectionClosedCode::Normal, details: None }
        );
        assert_eq!(h.session.next_event().await, None);
        assert!(h.peers.ops().contains(&PeerOp::Close));
        assert!(matches!(h.session.connect().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn permission_denied_surfaces_as_closed_code() {
        let mut h = Harness::new(SessionOptions::default());
        h.peers.fail_capture(PeerError::PermissionDenied("blocked".into()));

        assert!(matches!(h.session.connect().await, Err(Error::ConnectionClosed)));
        match h.next_event().await {
            SessionEvent::ConnectionClosed { code, .. } => {
                assert_eq!(code, ConnectionClosedCode::MicrophonePermissionDenied);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_signalling_reports_connection_failure() {
        let connector = MockConnector::scripted(Vec::new());
        let peers = MockPeerFactory::new();
        let options = SessionOptions { max_reconnect_attempts: 2, ..options() };
        let mut session = Session::from_parts(descriptor(), options, connector.clone(), peers).unwrap();

        assert!(session.connect().await.is_err());
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::ConnectionClosed {
                code: ConnectionClosedCode::SignallingConnectionFailure,
                details: Some("signalling reconnect attempts exhausted".into()),
            })
        );
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn reconnect_renegotiates_from_scratch() {
        let mut h = Harness::new(options());
        h.session.connect().await.unwrap();
        let _offer = h.next_sent().await;
        h.inject(SignalBody::Answer(SessionDescription::answer("v=0 first")));
        h.peers.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        assert_eq!(h.next_event().await, SessionEvent::ConnectionEstablished);

        let (link, remote) = mock_link();
        h.connector.push(ConnectOutcome::Link(link));
        h.remote.inbound.send(LinkInput::Close).unwrap();
        h.remote = remote;

        assert!(matches!(h.next_sent().await.body, SignalBody::Offer(_)));
        assert_eq!(h.peers.created(), 2);

        // Candidates for the new peer wait for the new answer.
        h.inject(SignalBody::IceCandidate(IceCandidate::new("late")));
        h.inject(SignalBody::Answer(SessionDescription::answer("v=0 second")));
        h.inject(SignalBody::SessionReady(json!({})));
        assert!(matches!(h.next_event().await, SessionEvent::SessionReady { .. }));
        assert_eq!(h.peers.applied_candidates(), vec!["late"]);

        h.peers.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        assert_eq!(h.next_event().await, SessionEvent::ConnectionEstablished);
    }

    #[tokio::test]
    async fn transcripts_build_history() {
        let mut h = Harness::new(options());
        h.session.connect().await.unwrap();

        let frame = |content: &str, end: bool| {
            json!({
                "messageType": "speechText",
                "data": {
                    "message_id": "m1",
                    "content_index": 0,
                    "content": content,
                    "role": "persona",
                    "end_of_speech": end,
                    "interrupted": false
                }
            })
            .to_string()
        };
        h.peers.emit(PeerEvent::DataChannelMessage("not json".into()));
        h.peers.emit(PeerEvent::DataChannelMessage(frame("Hi", false)));
        h.peers.emit(PeerEvent::DataChannelMessage(frame(" there", true)));

        assert!(matches!(h.next_event().await, SessionEvent::MessageStreamEvent(e) if e.content == "Hi"));
        assert!(matches!(h.next_event().await, SessionEvent::MessageStreamEvent(e) if e.end_of_speech));
        match h.next_event().await {
            SessionEvent::MessageHistoryUpdated(history) => {
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].content, "Hi there");
                assert_eq!(history[0].id, "persona::m1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn client_tool_started(tool_name: &str, call_id: &str) -> PeerEvent {
        let frame = json!({
            "messageType": "toolCallStarted",
            "data": {
                "event_uid": format!("evt-{call_id}"),
                "session_id": SESSION,
                "tool_call_id": call_id,
                "tool_name": tool_name,
                "tool_type": "client",
                "arguments": { "q": 1 },
                "timestamp": "2026-01-01T00:00:00Z"
            }
        });
        PeerEvent::DataChannelMessage(frame.to_string())
    }

    #[tokio::test]
    async fn client_tool_calls_complete_through_session() {
        let mut h = Harness::new(options());
        let _registration = h.session.register_tool_handler(
            "X",
            ToolCallHandler::new().on_start(|_| async { Ok(Some("42".to_string())) }),
        );
        h.session.connect().await.unwrap();
        h.peers.emit(client_tool_started("X", "call-1"));

        assert!(matches!(h.next_event().await, SessionEvent::ToolCallStarted(_)));
        match h.next_event().await {
            SessionEvent::ToolCallCompleted(done) => {
                assert_eq!(done.result, json!("42"));
                assert_eq!(done.info.tool_call_id, "call-1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_tool_can_call_back_into_its_session() {
        let mut h = Harness::new(options());
        let handle = h.session.handle();
        let _registration = h.session.register_tool_handler(
            "X",
            ToolCallHandler::new().on_start(move |_| {
                let handle = handle.clone();
                async move {
                    handle.send_control_message("{\"from\":\"tool\"}").await?;
                    let state = handle.input_audio_state().await?;
                    Ok::<_, Error>(Some(format!("muted={}", state.is_muted)))
                }
            }),
        );
        h.session.connect().await.unwrap();
        h.peers.emit(client_tool_started("X", "call-1"));

        assert!(matches!(h.next_event().await, SessionEvent::ToolCallStarted(_)));
        match h.next_event().await {
            SessionEvent::ToolCallCompleted(done) => assert_eq!(done.result, json!("muted=false")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(h.peers.ops().contains(&PeerOp::SendData("{\"from\":\"tool\"}".into())));
    }

    async fn panicking_tool(_: crate::sdk::tools::ToolCallStarted) -> Result<Option<String>> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn panicking_tool_handler_fails_only_its_call() {
        let mut h = Harness::new(options());
        let _registration = h.session.register_tool_handler("X", ToolCallHandler::new().on_start(panicking_tool));
        h.session.connect().await.unwrap();
        h.peers.emit(client_tool_started("X", "call-1"));

        assert!(matches!(h.next_event().await, SessionEvent::ToolCallStarted(_)));
        match h.next_event().await {
            SessionEvent::ToolCallFailed(failed) => assert!(failed.error_message.contains("handler bug")),
            other => panic!("unexpected event {other:?}"),
        }

        assert!(h.session.input_audio_state().await.is_ok());
        h.inject(SignalBody::EndSession(String::new()));
        assert_eq!(
            h.next_event().await,
            SessionEvent::ConnectionClosed { code: ConnectionClosedCode::Normal, details: None }
        );
    }

    #[tokio::test]
    async fn signals_keep_flowing_while_a_tool_is_running() {
        let mut h = Harness::new(options());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(Some(release_rx)));
        let _registration = h.session.register_tool_handler(
            "slow",
            ToolCallHandler::new().on_start(move |_| {
                let release = release_rx.lock().unwrap().take();
                async move {
                    if let Some(release) = release {
                        let _ = release.await;
                    }
                    Ok(Some("done".to_string()))
                }
            }),
        );
        h.session.connect().await.unwrap();
        h.peers.emit(client_tool_started("slow", "call-1"));
        assert!(matches!(h.next_event().await, SessionEvent::ToolCallStarted(_)));

        h.inject(SignalBody::StreamInterrupted(StreamInterruptedPayload { correlation_id: "talk-1".into() }));
        assert_eq!(
            h.next_event().await,
            SessionEvent::StreamInterrupted { correlation_id: "talk-1".into() }
        );

        release_tx.send(()).unwrap();
        match h.next_event().await {
            SessionEvent::ToolCallCompleted(done) => assert_eq!(done.result, json!("done")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn talk_requires_a_peer_connection() {
        let h = Harness::new(options());
        assert!(matches!(h.session.talk("hello").await, Err(Error::SessionNotStarted)));
    }

    #[tokio::test]
    async fn streams_send_input_and_observe_interruptions() {
        let mut h = Harness::new(options());
        h.session.connect().await.unwrap();
        let _offer = h.next_sent().await;

        assert!(matches!(
            h.session.open_correlated_stream(Some(String::new())),
            Err(Error::InvalidConfig(_))
        ));
        let generated = h.session.open_correlated_stream(None).unwrap();
        assert!(!generated.correlation_id().is_empty());

        let stream = h.session.open_correlated_stream(Some("talk-1".into())).unwrap();
        stream.send_chunk("hello", false).unwrap();
        match h.next_sent().await.body {
            SignalBody::StreamInput(input) => {
                assert!(input.start_of_speech);
                assert_eq!(input.correlation_id, "talk-1");
            }
            other => panic!("unexpected message {other:?}"),
        }

        h.inject(SignalBody::StreamInterrupted(StreamInterruptedPayload { correlation_id: "talk-1".into() }));
        assert_eq!(
            h.next_event().await,
            SessionEvent::StreamInterrupted { correlation_id: "talk-1".into() }
        );
        assert_eq!(stream.state(), crate::sdk::stream::StreamState::Interrupted);
    }

    #[tokio::test]
    async fn control_messages_and_mute_reach_the_peer() {
        let h = Harness::new(SessionOptions { start_muted: true, ..SessionOptions::default() });
        assert!(matches!(
            h.session.send_control_message("early").await,
            Err(Error::SessionNotStarted)
        ));
        h.session.connect().await.unwrap();

        h.session.send_control_message("{\"hello\":1}").await.unwrap();
        let state = h.session.input_audio_state().await.unwrap();
        assert!(state.is_muted);
        assert_eq!(state.permission_state, PermissionState::Granted);

        let state = h.session.unmute_input_audio().await.unwrap();
        assert!(!state.is_muted);

        let ops = h.peers.ops();
        assert!(ops.contains(&PeerOp::SendData("{\"hello\":1}".into())));
        assert!(ops.contains(&PeerOp::Muted(true)));
        assert!(ops.contains(&PeerOp::Muted(false)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut h = Harness::new(options());
        h.session.connect().await.unwrap();
        h.session.disconnect().await;
        h.session.disconnect().await;

        assert_eq!(h.session.next_event().await, None);
        let closes = h.peers.ops().into_iter().filter(|op| *op == PeerOp::Close).count();
        assert_eq!(closes, 1);
        assert!(matches!(
            h.session.open_correlated_stream(None),
            Err(Error::ConnectionClosed)
        ));
    }
}
