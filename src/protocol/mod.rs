//! Wire types for the signalling bus and the peer data channel.

pub mod data_channel;
pub mod signal;

pub use data_channel::DataChannelFrame;
pub use signal::{
    IceCandidate, OfferPayload, SdpType, SessionDescription, SignalAction, SignalBody, SignalMessage,
    StreamInputPayload, StreamInterruptedPayload,
};
