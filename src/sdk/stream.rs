//! Chunked, interruptible input streams keyed by correlation id.
//!
//! Speech input and chat input share this state machine: a stream sends
//! `StreamInput` chunks until the caller sends a final one, or until the
//! server interrupts it with a matching `StreamInterrupted` signal.

use super::signalling::SignallingChannel;
use crate::protocol::{SignalBody, SignalMessage, StreamInputPayload};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unstarted,
    Streaming,
    Ended,
    Interrupted,
}

impl StreamState {
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Unstarted | Self::Streaming)
    }
}

#[derive(Debug)]
struct StreamCore {
    correlation_id: String,
    state: Mutex<StreamState>,
}

impl StreamCore {
    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active streams listening for interruption, by correlation id.
#[derive(Debug, Clone, Default)]
pub struct StreamListeners {
    inner: Arc<Mutex<HashMap<String, Arc<StreamCore>>>>,
}

impl StreamListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<StreamCore>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn attach(&self, core: Arc<StreamCore>) {
        let previous = self.entries().insert(core.correlation_id.clone(), core);
        if let Some(previous) = previous {
            if previous.state().is_active() {
                tracing::warn!(
                    correlation_id = %previous.correlation_id,
                    "Replacing an active stream with the same correlation id"
                );
            }
        }
    }

    /// Remove `core` if it is still the registered listener for its id.
    fn detach(&self, core: &Arc<StreamCore>) {
        let mut entries = self.entries();
        if entries.get(&core.correlation_id).is_some_and(|current| Arc::ptr_eq(current, core)) {
            entries.remove(&core.correlation_id);
        }
    }

    /// Apply a `StreamInterrupted` signal to the matching stream, if any.
    /// Returns the interrupted correlation id.
    pub fn dispatch(&self, message: &SignalMessage) -> Option<String> {
        let SignalBody::StreamInterrupted(payload) = &message.body else {
            return None;
        };
        let core = self.entries().remove(&payload.correlation_id)?;
        let mut state = core.state();
        if !state.is_active() {
            return None;
        }
        *state = StreamState::Interrupted;
        tracing::debug!(correlation_id = %core.correlation_id, "Stream interrupted by server");
        Some(core.correlation_id.clone())
    }
}

/// One logical utterance sent as a sequence of chunks.
#[derive(Debug)]
pub struct CorrelatedStream {
    core: Arc<StreamCore>,
    channel: SignallingChannel,
    listeners: StreamListeners,
}

impl CorrelatedStream {
    /// Open a stream and start listening for its interruption.
    #[must_use]
    pub fn open(correlation_id: impl Into<String>, channel: SignallingChannel, listeners: StreamListeners) -> Self {
        let core = Arc::new(StreamCore {
            correlation_id: correlation_id.into(),
            state: Mutex::new(StreamState::Unstarted),
        });
        listeners.attach(Arc::clone(&core));
        Self { core, channel, listeners }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.core.correlation_id
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.core.state()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Send one chunk; `is_final` ends the stream.
    ///
    /// # Errors
    /// Returns `InactiveStream` if the stream already ended or was interrupted.
    #[allow(clippy::result_large_err)]
    pub fn send_chunk(&self, content: &str, is_final: bool) -> Result<()> {
        let start_of_speech = {
            let mut state = self.core.state();
            if !state.is_active() {
                return Err(Error::InactiveStream {
                    correlation_id: self.core.correlation_id.clone(),
                    state: *state,
                });
            }
            let starting = *state == StreamState::Unstarted;
            *state = if is_final { StreamState::Ended } else { StreamState::Streaming };
            starting
        };

        self.channel.send(SignalBody::StreamInput(StreamInputPayload {
            content: content.to_string(),
            start_of_speech,
            end_of_speech: is_final,
            correlation_id: self.core.correlation_id.clone(),
        }));

        if is_final {
            self.listeners.detach(&self.core);
        }
        Ok(())
    }

    /// End a streaming utterance with an empty final chunk. Does nothing,
    /// apart from a warning, unless the stream is currently streaming.
    pub fn end_explicitly(&self) {
        match self.state() {
            StreamState::Streaming => {
                if let Err(err) = self.send_chunk("", true) {
                    tracing::warn!(correlation_id = self.correlation_id(), "Could not end stream: {err}");
                }
            }
            StreamState::Ended => {
                tracing::warn!(correlation_id = self.correlation_id(), "Stream already ended");
            }
            state => {
                tracing::warn!(correlation_id = self.correlation_id(), ?state, "Stream is not streaming; nothing to end");
            }
        }
    }
}

impl Drop for CorrelatedStream {
    fn drop(&mut self) {
        self.listeners.detach(&self.core);
    }
}
