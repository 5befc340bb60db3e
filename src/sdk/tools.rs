use crate::protocol::data_channel::{WireToolCallBase, WireToolCallCompleted, WireToolCallFailed, WireToolCallStarted};
use crate::{Error, Result};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use crate::protocol::data_channel::ClientToolEvent;

pub type ToolFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type StartHandler = Box<dyn Fn(ToolCallStarted) -> ToolFuture<Result<Option<String>>> + Send + Sync>;
type CompleteHandler = Box<dyn Fn(ToolCallCompleted) -> ToolFuture<Result<()>> + Send + Sync>;
type FailHandler = Box<dyn Fn(ToolCallFailed) -> ToolFuture<Result<()>> + Send + Sync>;

/// Tool type of calls executed entirely by the application.
pub const CLIENT_TOOL_TYPE: &str = "client";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallInfo {
    pub event_uid: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_subtype: Option<String>,
    pub arguments: Map<String, Value>,
    pub timestamp: String,
    pub timestamp_user_action: String,
    pub user_action_correlation_id: String,
    pub used_outside_engine: bool,
}

impl ToolCallInfo {
    #[must_use]
    pub fn is_client_side(&self) -> bool {
        self.tool_type == CLIENT_TOOL_TYPE
    }

    fn restamped(&self) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..self.clone()
        }
    }
}

impl From<WireToolCallBase> for ToolCallInfo {
    fn from(wire: WireToolCallBase) -> Self {
        Self {
            event_uid: wire.event_uid,
            session_id: wire.session_id,
            tool_call_id: wire.tool_call_id,
            tool_name: wire.tool_name,
            tool_type: wire.tool_type,
            tool_subtype: wire.tool_subtype,
            arguments: wire.arguments,
            timestamp: wire.timestamp,
            timestamp_user_action: wire.timestamp_user_action,
            user_action_correlation_id: wire.user_action_correlation_id,
            used_outside_engine: wire.used_outside_engine,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStarted {
    #[serde(flatten)]
    pub info: ToolCallInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallCompleted {
    #[serde(flatten)]
    pub info: ToolCallInfo,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents_accessed: Option<Vec<String>>,
    /// Milliseconds since the matching start event; 0 when none was seen.
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFailed {
    #[serde(flatten)]
    pub info: ToolCallInfo,
    pub error_message: String,
    pub execution_time_ms: u64,
}

impl From<WireToolCallStarted> for ToolCallStarted {
    fn from(wire: WireToolCallStarted) -> Self {
        Self { info: wire.base.into() }
    }
}

impl From<WireToolCallCompleted> for ToolCallCompleted {
    fn from(wire: WireToolCallCompleted) -> Self {
        Self {
            info: wire.base.into(),
            result: wire.result,
            documents_accessed: wire.documents_accessed,
            execution_time_ms: 0,
        }
    }
}

impl From<WireToolCallFailed> for ToolCallFailed {
    fn from(wire: WireToolCallFailed) -> Self {
        Self {
            info: wire.base.into(),
            error_message: wire.error_message,
            execution_time_ms: 0,
        }
    }
}

/// Outcome of a client tool, settled after its `on_start` handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallEvent {
    Completed(ToolCallCompleted),
    Failed(ToolCallFailed),
}

/// Callbacks for one tool. For client tools, the value returned by
/// `on_start` becomes the call's result.
#[derive(Default)]
pub struct ToolCallHandler {
    on_start: Option<StartHandler>,
    on_complete: Option<CompleteHandler>,
    on_fail: Option<FailHandler>,
}

impl ToolCallHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_start<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolCallStarted) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move |event| Box::pin(handler(event))));
        self
    }

    #[must_use]
    pub fn on_complete<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolCallCompleted) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_complete = Some(Box::new(move |event| Box::pin(handler(event))));
        self
    }

    #[must_use]
    pub fn on_fail<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolCallFailed) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_fail = Some(Box::new(move |event| Box::pin(handler(event))));
        self
    }
}

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub call_id: String,
    pub payload: ToolCallInfo,
    pub started_at: Instant,
}

struct Registration {
    id: u64,
    handler: Arc<ToolCallHandler>,
}

#[derive(Default)]
struct DispatcherState {
    handlers: HashMap<String, Registration>,
    pending: HashMap<String, PendingToolCall>,
    next_id: u64,
}

/// Removes one handler registration. Dropping it keeps the handler registered.
#[derive(Debug)]
#[must_use = "call unregister() to remove the handler"]
pub struct ToolHandlerRegistration {
    state: Weak<Mutex<DispatcherState>>,
    tool_name: String,
    id: u64,
}

impl ToolHandlerRegistration {
    /// Remove this registration, unless a later one already replaced it.
    pub fn unregister(self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.handlers.get(&self.tool_name).is_some_and(|r| r.id == self.id) {
            state.handlers.remove(&self.tool_name);
            tracing::debug!(tool = %self.tool_name, "Tool handler unregistered");
        }
    }
}

/// Matches tool-call start/complete/fail events to registered handlers and
/// pending calls.
///
/// Handlers never run on the caller's task: each hook is spawned, and panics
/// inside a hook are caught and treated as handler errors. The completion or
/// failure synthesized for a client tool arrives on the receiver returned by
/// [`new`](Self::new).
#[derive(Clone)]
pub struct ToolCallDispatcher {
    state: Arc<Mutex<DispatcherState>>,
    outcomes: mpsc::UnboundedSender<ToolCallEvent>,
}

impl std::fmt::Debug for ToolCallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ToolCallDispatcher")
            .field("handlers", &state.handlers.keys().collect::<Vec<_>>())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl ToolCallDispatcher {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ToolCallEvent>) {
        let (outcomes, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            state: Arc::default(),
            outcomes,
        };
        (dispatcher, rx)
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register callbacks for `tool_name`, replacing any earlier registration.
    pub fn register_handler(&self, tool_name: impl Into<String>, handler: ToolCallHandler) -> ToolHandlerRegistration {
        let tool_name = tool_name.into();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let replaced = state
            .handlers
            .insert(tool_name.clone(), Registration { id, handler: Arc::new(handler) })
            .is_some();
        tracing::debug!(tool = %tool_name, replaced, "Tool handler registered");
        ToolHandlerRegistration {
            state: Arc::downgrade(&self.state),
            tool_name,
            id,
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn pending_call(&self, call_id: &str) -> Option<PendingToolCall> {
        self.lock().pending.get(call_id).cloned()
    }

    fn handler_for(&self, tool_name: &str) -> Option<Arc<ToolCallHandler>> {
        self.lock().handlers.get(tool_name).map(|r| Arc::clone(&r.handler))
    }

    /// Remove the pending entry for the call and return its elapsed time
    /// in milliseconds.
    fn finish(&self, info: &ToolCallInfo) -> u64 {
        let pending = self.lock().pending.remove(&info.tool_call_id);
        pending.map_or(0, |call| {
            let elapsed = Instant::now().saturating_duration_since(call.started_at);
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
    }

    /// Record the call as pending and spawn the tool's `on_start`. Returns the
    /// start event right away. For client tools the handler's outcome is
    /// later delivered as a completion or failure.
    pub fn handle_start_event(&self, event: ToolCallStarted) -> ToolCallStarted {
        let call_id = event.info.tool_call_id.clone();
        self.lock().pending.insert(
            call_id.clone(),
            PendingToolCall {
                call_id,
                payload: event.info.clone(),
                started_at: Instant::now(),
            },
        );

        let Some(handler) = self.handler_for(&event.info.tool_name) else {
            tracing::debug!(tool = %event.info.tool_name, "No handler registered for tool");
            return event;
        };
        if handler.on_start.is_none() {
            return event;
        }

        let dispatcher = self.clone();
        let started = event.clone();
        tokio::spawn(async move {
            let outcome = match handler.on_start.as_ref() {
                Some(on_start) => guarded("start", async { on_start(started.clone()).await }).await,
                None => return,
            };
            if let Some(settled) = dispatcher.settle_start(started, outcome).await {
                if dispatcher.outcomes.send(settled).is_err() {
                    tracing::trace!("Tool outcome dropped; session gone");
                }
            }
        });
        event
    }

    async fn settle_start(&self, event: ToolCallStarted, outcome: Result<Option<String>>) -> Option<ToolCallEvent> {
        if !event.info.is_client_side() {
            if let Err(err) = outcome {
                tracing::error!(tool = %event.info.tool_name, "Tool start handler failed: {err}");
            }
            return None;
        }

        let settled = match outcome {
            Ok(result) => {
                let mut completed = ToolCallCompleted {
                    info: event.info.restamped(),
                    result: result.map_or(Value::Null, Value::String),
                    documents_accessed: None,
                    execution_time_ms: 0,
                };
                completed.execution_time_ms = self.finish(&completed.info);
                if let Some(handler) = self.handler_for(&completed.info.tool_name) {
                    run_complete_hook(&handler, completed.clone()).await;
                }
                ToolCallEvent::Completed(completed)
            }
            Err(err) => {
                tracing::warn!(tool = %event.info.tool_name, "Client tool failed: {err}");
                let mut failed = ToolCallFailed {
                    info: event.info.restamped(),
                    error_message: err.to_string(),
                    execution_time_ms: 0,
                };
                failed.execution_time_ms = self.finish(&failed.info);
                if let Some(handler) = self.handler_for(&failed.info.tool_name) {
                    run_fail_hook(&handler, failed.clone()).await;
                }
                ToolCallEvent::Failed(failed)
            }
        };
        Some(settled)
    }

    /// Close the pending call, fill in its execution time and spawn `on_complete`.
    pub fn handle_completed_event(&self, mut event: ToolCallCompleted) -> ToolCallCompleted {
        event.execution_time_ms = self.finish(&event.info);
        if let Some(handler) = self.handler_for(&event.info.tool_name).filter(|h| h.on_complete.is_some()) {
            let done = event.clone();
            tokio::spawn(async move { run_complete_hook(&handler, done).await });
        }
        event
    }

    /// Close the pending call, fill in its execution time and spawn `on_fail`.
    pub fn handle_failed_event(&self, mut event: ToolCallFailed) -> ToolCallFailed {
        event.execution_time_ms = self.finish(&event.info);
        if let Some(handler) = self.handler_for(&event.info.tool_name).filter(|h| h.on_fail.is_some()) {
            let failed = event.clone();
            tokio::spawn(async move { run_fail_hook(&handler, failed).await });
        }
        event
    }
}

async fn run_complete_hook(handler: &ToolCallHandler, event: ToolCallCompleted) {
    let Some(on_complete) = handler.on_complete.as_ref() else {
        return;
    };
    let tool = event.info.tool_name.clone();
    if let Err(err) = guarded("complete", async { on_complete(event).await }).await {
        tracing::error!(%tool, "Tool complete handler failed: {err}");
    }
}

async fn run_fail_hook(handler: &ToolCallHandler, event: ToolCallFailed) {
    let Some(on_fail) = handler.on_fail.as_ref() else {
        return;
    };
    let tool = event.info.tool_name.clone();
    if let Err(err) = guarded("fail", async { on_fail(event).await }).await {
        tracing::error!(%tool, "Tool fail handler failed: {err}");
    }
}

/// Run a handler future, turning a panic into a `ToolHandler` error.
async fn guarded<T>(hook: &str, handler: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::ToolHandler(format!("{hook} handler panicked: {message}")))
        }
    }
}
