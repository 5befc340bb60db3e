//! Frames received over the ordered data channel of the peer connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "messageType", content = "data")]
pub enum DataChannelFrame {
    #[serde(rename = "speechText")]
    SpeechText(TextMessageEvent),
    #[serde(rename = "reasoningText")]
    ReasoningText(ReasoningTextEvent),
    #[serde(rename = "clientToolEvent")]
    ClientToolEvent(ClientToolEvent),
    #[serde(rename = "toolCallStarted")]
    ToolCallStarted(WireToolCallStarted),
    #[serde(rename = "toolCallCompleted")]
    ToolCallCompleted(WireToolCallCompleted),
    #[serde(rename = "toolCallFailed")]
    ToolCallFailed(WireToolCallFailed),
}

impl DataChannelFrame {
    /// Decode a raw data-channel frame.
    ///
    /// # Errors
    /// Returns an error if the frame is not JSON or names an unknown message type.
    pub fn decode(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A transcript chunk for either side of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextMessageEvent {
    pub message_id: String,
    #[serde(default)]
    pub content_index: u32,
    pub content: String,
    pub role: String,
    #[serde(default)]
    pub end_of_speech: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningTextEvent {
    pub message_id: String,
    pub content: String,
    pub role: String,
    #[serde(default)]
    pub end_of_thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientToolEvent {
    pub event_uid: String,
    pub session_id: String,
    pub event_name: String,
    #[serde(default)]
    pub event_data: Map<String, Value>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub timestamp_user_action: String,
    #[serde(default)]
    pub user_action_correlation_id: String,
}

/// Fields shared by every tool-call lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolCallBase {
    pub event_uid: String,
    #[serde(default)]
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_subtype: Option<String>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub timestamp_user_action: String,
    #[serde(default)]
    pub user_action_correlation_id: String,
    #[serde(default)]
    pub used_outside_engine: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolCallStarted {
    #[serde(flatten)]
    pub base: WireToolCallBase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolCallCompleted {
    #[serde(flatten)]
    pub base: WireToolCallBase,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_accessed: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolCallFailed {
    #[serde(flatten)]
    pub base: WireToolCallBase,
    #[serde(default)]
    pub error_message: String,
}
