use super::history::{Message, MessageStreamEvent, ReasoningMessage, ReasoningStreamEvent};
use super::tools::{ClientToolEvent, ToolCallCompleted, ToolCallFailed, ToolCallStarted};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Why a session's connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionClosedCode {
    #[serde(rename = "CONNECTION_CLOSED_CODE_NORMAL")]
    Normal,
    #[serde(rename = "CONNECTION_CLOSED_CODE_MICROPHONE_PERMISSION_DENIED")]
    MicrophonePermissionDenied,
    #[serde(rename = "CONNECTION_CLOSED_CODE_WEBRTC_FAILURE")]
    WebrtcFailure,
    #[serde(rename = "CONNECTION_CLOSED_CODE_SIGNALLING_CLIENT_CONNECTION_FAILURE")]
    SignallingConnectionFailure,
}

impl ConnectionClosedCode {
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Normal => "The session ended normally",
            Self::MicrophonePermissionDenied => "Microphone access was denied",
            Self::WebrtcFailure => "The media connection failed",
            Self::SignallingConnectionFailure => "The signalling server could not be reached",
        }
    }
}

impl std::fmt::Display for ConnectionClosedCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Everything a session reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionEstablished,
    /// Terminal. No further events follow for this session.
    ConnectionClosed {
        code: ConnectionClosedCode,
        details: Option<String>,
    },
    SessionReady {
        session_id: String,
    },
    ServerWarning(String),
    StreamInterrupted {
        correlation_id: String,
    },
    MessageStreamEvent(MessageStreamEvent),
    MessageHistoryUpdated(Vec<Message>),
    ReasoningStreamEvent(ReasoningStreamEvent),
    ReasoningHistoryUpdated(Vec<ReasoningMessage>),
    ClientToolEvent(ClientToolEvent),
    ToolCallStarted(ToolCallStarted),
    ToolCallCompleted(ToolCallCompleted),
    ToolCallFailed(ToolCallFailed),
    InputAudioStreamStarted,
    VideoStreamStarted,
    AudioStreamStarted,
}

impl SessionEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

pub struct EventStream<'a> {
    rx: &'a mut mpsc::Receiver<SessionEvent>,
}

impl<'a> EventStream<'a> {
    #[must_use]
    pub const fn new(rx: &'a mut mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for EventStream<'_> {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
