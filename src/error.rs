use crate::sdk::peer::PeerError;
use crate::sdk::stream::StreamState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of bootstrap API failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    UsageLimitReached,
    ValidationError,
    AuthenticationError,
    ServerError,
    MaxConcurrentSessionsReached,
    SpendCapReached,
    ServiceBusy,
    NoPlanFound,
    #[serde(other)]
    UnknownError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub status: u16,
    pub message: String,
    /// Server-provided detail, when the response body carried one.
    pub cause: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}, HTTP {})", self.message, self.code, self.status)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Session API error: {0}")]
    Api(ApiError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("The connection was closed")]
    ConnectionClosed,

    #[error("Session is not started")]
    SessionNotStarted,

    #[error("Stream {correlation_id} is not in an active state: {state:?}")]
    InactiveStream {
        correlation_id: String,
        state: StreamState,
    },

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Tool handler failed: {0}")]
    ToolHandler(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
