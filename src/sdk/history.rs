//! Conversation transcript and reasoning history assembled from data-channel
//! chunks.

use crate::protocol::data_channel::{ReasoningTextEvent, TextMessageEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Persona,
}

impl MessageRole {
    #[must_use]
    pub fn from_wire(role: &str) -> Self {
        if role.eq_ignore_ascii_case("user") { Self::User } else { Self::Persona }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Persona => "persona",
        }
    }
}

fn message_key(role: MessageRole, message_id: &str) -> String {
    format!("{}::{message_id}", role.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStreamEvent {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    pub end_of_speech: bool,
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
pub struct MessageHistory {
    messages: Vec<Message>,
}

impl MessageHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Fold a transcript chunk into the history. Returns the chunk as a stream
    /// event, plus a snapshot of the whole history when the chunk ends speech.
    pub fn process(&mut self, chunk: &TextMessageEvent) -> (MessageStreamEvent, Option<Vec<Message>>) {
        let role = MessageRole::from_wire(&chunk.role);
        let id = message_key(role, &chunk.message_id);
        let event = MessageStreamEvent {
            id: id.clone(),
            content: chunk.content.clone(),
            role,
            end_of_speech: chunk.end_of_speech,
            interrupted: chunk.interrupted,
        };

        let existing = match role {
            MessageRole::User => None,
            MessageRole::Persona => self.messages.iter_mut().find(|m| m.id == id),
        };
        match existing {
            Some(message) => {
                message.content.push_str(&chunk.content);
                message.interrupted |= chunk.interrupted;
            }
            None => self.messages.push(Message {
                id,
                content: chunk.content.clone(),
                role,
                interrupted: chunk.interrupted,
            }),
        }

        let snapshot = chunk.end_of_speech.then(|| self.messages.clone());
        (event, snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStreamEvent {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    pub end_of_thought: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningMessage {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_duration: Option<f64>,
}

#[derive(Debug, Default)]
pub struct ReasoningHistory {
    messages: Vec<ReasoningMessage>,
}

impl ReasoningHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> &[ReasoningMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn process(&mut self, chunk: &ReasoningTextEvent) -> (ReasoningStreamEvent, Option<Vec<ReasoningMessage>>) {
        let role = MessageRole::from_wire(&chunk.role);
        let id = message_key(role, &chunk.message_id);
        let event = ReasoningStreamEvent {
            id: id.clone(),
            content: chunk.content.clone(),
            role,
            end_of_thought: chunk.end_of_thought,
        };

        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.content.push_str(&chunk.content);
            if chunk.thought_duration.is_some() {
                message.thought_duration = chunk.thought_duration;
            }
        } else {
            self.messages.push(ReasoningMessage {
                id,
                content: chunk.content.clone(),
                role,
                thought_duration: chunk.thought_duration,
            });
        }

        let snapshot = chunk.end_of_thought.then(|| self.messages.clone());
        (event, snapshot)
    }
}
