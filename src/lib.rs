#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Client SDK for realtime persona sessions.
//!
//! ```no_run
//! # async fn run(peers: std::sync::Arc<dyn persona_rt::PeerFactory>) -> persona_rt::Result<()> {
//! use persona_rt::{PersonaClient, SessionEvent};
//!
//! let mut session = PersonaClient::builder()
//!     .session_token("token-from-your-backend")
//!     .peer_factory(peers)
//!     .start_session()
//!     .await?;
//! session.connect().await?;
//!
//! let talk = session.open_correlated_stream(None)?;
//! talk.send_chunk("Hello there", true)?;
//!
//! while let Some(event) = session.next_event().await {
//!     if let SessionEvent::ConnectionClosed { code, .. } = event {
//!         println!("closed: {code}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod protocol;
pub mod sdk;
pub mod transport;

pub use error::{ApiError, ApiErrorCode, Error, Result};
pub use protocol::{DataChannelFrame, SignalAction, SignalBody, SignalMessage};
pub use sdk::{
    ConnectionClosedCode, CorrelatedStream, EventStream, InputAudioState, PeerConnection, PeerEvent, PeerFactory,
    PersonaClient, PersonaClientBuilder, Session, SessionEvent, SessionHandle, SessionOptions, StreamState,
    ToolCallHandler, ToolHandlerRegistration,
};
pub use transport::rest::{CoreApiClient, Credentials, EngineApiClient, PersonaConfig, SessionDescriptor};
pub use transport::{SignalConnector, SignalLink};
