//! High-level SDK facade over the persona session protocol.
//!
//! [`PersonaClient::builder`] bootstraps a [`Session`]; the session composes a
//! signalling channel, peer negotiation, correlated input streams and tool-call
//! dispatch, and reports everything through one [`SessionEvent`] stream. The
//! lower-level pieces stay public for callers that want to drive them directly.

pub mod buffer;
mod builder;
pub mod config;
pub mod events;
pub mod history;
pub mod negotiation;
pub mod peer;
mod session;
pub mod signalling;
pub mod stream;
pub mod tools;

#[cfg(test)]
mod testing;

pub use builder::{PersonaClient, PersonaClientBuilder};
pub use config::{ClientContext, ClientMetadata, ReconnectPolicyParams, SessionOptions};
pub use events::{ConnectionClosedCode, EventStream, SessionEvent};
pub use history::{Message, MessageRole, MessageStreamEvent, ReasoningMessage, ReasoningStreamEvent};
pub use peer::{
    IceServer, InputAudioState, MediaKind, PeerConfig, PeerConnection, PeerError, PeerEvent, PeerFactory,
    PermissionState,
};
pub use session::{Session, SessionHandle};
pub use signalling::{ChannelEvent, ChannelPolicy, ChannelState, SignallingChannel};
pub use stream::{CorrelatedStream, StreamState};
pub use tools::{
    ClientToolEvent, ToolCallCompleted, ToolCallDispatcher, ToolCallFailed, ToolCallHandler, ToolCallInfo,
    ToolCallStarted, ToolFuture, ToolHandlerRegistration,
};
