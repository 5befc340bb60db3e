//! Transport adapters: the signalling link seam, WebSocket signalling and the
//! REST bootstrap client.

pub mod rest;
pub mod ws;

use crate::protocol::SignalMessage;
use crate::Result;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One established connection to the signalling bus.
///
/// `next_message` must be cancel-safe: the signalling channel polls it inside
/// `tokio::select!` alongside its timers and command queue.
pub trait SignalLink: Send {
    fn send(&mut self, message: SignalMessage) -> BoxFuture<'_, Result<()>>;
    /// `Ok(None)` means the transport closed.
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<SignalMessage>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Opens links to the signalling bus; called once per (re)connect attempt.
pub trait SignalConnector: Send + Sync {
    /// Resolves once the handshake is acknowledged.
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn SignalLink>>>;
}
