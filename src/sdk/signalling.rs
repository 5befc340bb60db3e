//! Session-scoped signalling channel.
//!
//! A spawned task owns the transport link, the outbound buffer and both
//! timers (reconnect backoff and heartbeat). Callers talk to it through a
//! cloneable [`SignallingChannel`] handle; inbound traffic and lifecycle
//! changes arrive on the [`ChannelEvent`] receiver returned by
//! [`SignallingChannel::spawn`].

use super::buffer::ReadyBuffer;
use super::config::SessionOptions;
use crate::protocol::{SignalBody, SignalMessage};
use crate::transport::{BoxFuture, SignalConnector, SignalLink};
use crate::{Error, Result};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Handshake acknowledged; raised on the first connect and on every reconnect.
    Connected,
    /// An inbound message for this channel's session, in transport order.
    Message(SignalMessage),
    /// Reconnect budget exhausted. Terminal.
    ConnectionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl ChannelPolicy {
    #[must_use]
    pub const fn from_options(options: &SessionOptions) -> Self {
        Self {
            max_reconnect_attempts: options.max_reconnect_attempts,
            reconnect_base_delay: options.reconnect_base_delay(),
            heartbeat_interval: options.heartbeat_interval(),
        }
    }
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self::from_options(&SessionOptions::default())
    }
}

enum Command {
    Connect(Option<oneshot::Sender<Result<()>>>),
    Send(SignalBody),
    Stop,
}

/// Handle to a running signalling channel.
#[derive(Clone)]
pub struct SignallingChannel {
    session_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for SignallingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignallingChannel")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SignallingChannel {
    /// Spawn the channel task. It stays idle in `Disconnected` until
    /// [`connect`](Self::connect) is called.
    #[must_use]
    pub fn spawn(
        session_id: impl Into<String>,
        connector: Arc<dyn SignalConnector>,
        policy: ChannelPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let session_id: String = session_id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let stopped = Arc::new(AtomicBool::new(false));

        let task = ChannelTask {
            session_id: session_id.clone(),
            connector,
            policy,
            events: event_tx,
            state: state_tx,
            stopped: Arc::clone(&stopped),
            link: None,
            connecting: None,
            reconnect_at: None,
            heartbeat: None,
            outbound: ReadyBuffer::new(),
            attempts: 0,
            waiters: Vec::new(),
        };
        tokio::spawn(task.run(cmd_rx));

        let channel = Self {
            session_id: session_id.into(),
            commands: cmd_tx,
            state: state_rx,
            stopped,
        };
        (channel, event_rx)
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Connect and wait for the handshake. A no-op while already connecting
    /// or connected; the call then resolves with the pending attempt.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` if the channel was stopped or the reconnect
    /// budget ran out before a connection was established.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(Some(tx)))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Start connecting without waiting for the outcome.
    pub fn request_connect(&self) {
        if self.commands.send(Command::Connect(None)).is_err() {
            tracing::debug!(session_id = %self.session_id, "Connect requested on a stopped channel");
        }
    }

    /// Queue a message for this channel's session. Never fails; messages sent
    /// while disconnected are delivered on the next successful connect.
    pub fn send(&self, body: SignalBody) {
        if self.commands.send(Command::Send(body)).is_err() {
            tracing::debug!(session_id = %self.session_id, "Dropping signal message for a stopped channel");
        }
    }

    /// Stop the channel for good. Timers are cancelled and no reconnect
    /// happens after this returns. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Stop);
    }
}

struct ChannelTask {
    session_id: String,
    connector: Arc<dyn SignalConnector>,
    policy: ChannelPolicy,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    stopped: Arc<AtomicBool>,
    link: Option<Box<dyn SignalLink>>,
    connecting: Option<BoxFuture<'static, Result<Box<dyn SignalLink>>>>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    outbound: ReadyBuffer<SignalMessage>,
    attempts: u32,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ChannelTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Connect(waiter)) => self.connect(waiter),
                    Some(Command::Send(body)) => self.send(body).await,
                    Some(Command::Stop) | None => break,
                },
                result = connect_outcome(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result).await;
                }
                () = backoff_elapsed(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.begin_connect();
                }
                () = heartbeat_tick(&mut self.heartbeat) => self.send(SignalBody::Heartbeat).await,
                inbound = next_inbound(&mut self.link) => self.on_inbound(inbound).await,
            }
        }
        self.shutdown().await;
    }

    fn current_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(session_id = %self.session_id, ?previous, ?state, "Signalling state changed");
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn settle_waiters(&mut self, outcome: impl Fn() -> Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome());
        }
    }

    fn connect(&mut self, waiter: Option<oneshot::Sender<Result<()>>>) {
        match self.current_state() {
            ChannelState::Connected => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelState::Failed => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(Error::ConnectionClosed));
                }
            }
            ChannelState::Connecting => self.waiters.extend(waiter),
            ChannelState::Disconnected => {
                self.waiters.extend(waiter);
                // A scheduled reconnect is already on its way.
                if self.reconnect_at.is_none() {
                    self.begin_connect();
                }
            }
        }
    }

    fn begin_connect(&mut self) {
        tracing::debug!(session_id = %self.session_id, attempt = self.attempts, "Opening signalling connection");
        self.set_state(ChannelState::Connecting);
        self.connecting = Some(self.connector.connect());
    }

    async fn on_connect_result(&mut self, result: Result<Box<dyn SignalLink>>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.on_connected().await;
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, "Signalling connection attempt failed: {err}");
                self.on_transport_lost();
            }
        }
    }

    async fn on_connected(&mut self) {
        tracing::info!(session_id = %self.session_id, "Signalling channel connected");
        self.attempts = 0;
        self.set_state(ChannelState::Connected);

        let period = self.policy.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        let buffered = self.outbound.open();
        if !buffered.is_empty() {
            tracing::debug!(session_id = %self.session_id, count = buffered.len(), "Flushing buffered signal messages");
        }
        if !self.flush(buffered).await {
            return;
        }

        self.emit(ChannelEvent::Connected);
        self.settle_waiters(|| Ok(()));
    }

    /// Deliver buffered messages in order. On a send failure the unsent tail
    /// goes back to the buffer and the transport is treated as lost.
    async fn flush(&mut self, buffered: Vec<SignalMessage>) -> bool {
        let mut pending = buffered.into_iter();
        while let Some(message) = pending.next() {
            let Some(link) = self.link.as_mut() else {
                self.outbound.pause(std::iter::once(message).chain(pending));
                return false;
            };
            if let Err(err) = link.send(message.clone()).await {
                tracing::error!(session_id = %self.session_id, "Failed to flush buffered signal message: {err}");
                self.outbound.pause(std::iter::once(message).chain(pending));
                self.on_transport_lost();
                return false;
            }
        }
        true
    }

    async fn send(&mut self, body: SignalBody) {
        if self.current_state() == ChannelState::Failed {
            tracing::debug!(session_id = %self.session_id, action = body.action_kind(), "Dropping signal message on a failed channel");
            return;
        }
        let message = SignalMessage::new(self.session_id.clone(), body);
        let Some(message) = self.outbound.push(message) else {
            return;
        };
        if let Some(link) = self.link.as_mut() {
            let action = message.action_kind().to_string();
            if let Err(err) = link.send(message).await {
                tracing::error!(session_id = %self.session_id, %action, "Failed to send signal message: {err}");
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Result<Option<SignalMessage>>) {
        match inbound {
            Ok(Some(message)) => {
                if message.session_id == self.session_id {
                    self.emit(ChannelEvent::Message(message));
                } else {
                    tracing::debug!(
                        session_id = %self.session_id,
                        foreign = %message.session_id,
                        "Ignoring signal message for another session"
                    );
                }
            }
            Ok(None) => {
                tracing::info!(session_id = %self.session_id, "Signalling transport closed");
                self.on_transport_lost();
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, "Signalling transport error: {err}");
                if let Some(mut link) = self.link.take() {
                    let _ = link.close().await;
                }
                self.on_transport_lost();
            }
        }
    }

    fn on_transport_lost(&mut self) {
        self.link = None;
        self.heartbeat = None;
        self.outbound.pause(std::iter::empty());
        self.attempts += 1;

        if self.attempts <= self.policy.max_reconnect_attempts {
            let delay = self.policy.reconnect_base_delay * self.attempts;
            tracing::info!(
                session_id = %self.session_id,
                attempt = self.attempts,
                max = self.policy.max_reconnect_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling signalling reconnect"
            );
            self.set_state(ChannelState::Disconnected);
            self.reconnect_at = Some(Box::pin(tokio::time::sleep(delay)));
        } else {
            tracing::error!(
                session_id = %self.session_id,
                attempts = self.attempts - 1,
                "Signalling reconnect budget exhausted"
            );
            self.set_state(ChannelState::Failed);
            self.emit(ChannelEvent::ConnectionFailed);
            self.settle_waiters(|| Err(Error::ConnectionClosed));
        }
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.heartbeat = None;
        self.connecting = None;
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.close().await {
                tracing::debug!(session_id = %self.session_id, "Error closing signalling link: {err}");
            }
        }
        self.outbound.clear();
        self.set_state(ChannelState::Failed);
        self.settle_waiters(|| Err(Error::ConnectionClosed));
        tracing::info!(session_id = %self.session_id, "Signalling channel stopped");
    }
}

async fn connect_outcome(
    pending: &mut Option<BoxFuture<'static, Result<Box<dyn SignalLink>>>>,
) -> Result<Box<dyn SignalLink>> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn backoff_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_inbound(link: &mut Option<Box<dyn SignalLink>>) -> Result<Option<SignalMessage>> {
    match link {
        Some(link) => link.next_message().await,
        None => std::future::pending().await,
    }
}
