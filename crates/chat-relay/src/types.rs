//! Core conversation types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single chat message. Serializes to the `{role, content}` wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Opaque, stable conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A conversation owned by the caller.
///
/// History is append-only and ordered oldest first; the relay only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    id: ConversationId,
    history: Vec<Message>,
}

impl Conversation {
    /// Start an empty conversation with a fresh id
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty conversation with a caller-chosen id
    pub fn with_id(id: impl Into<ConversationId>) -> Self {
        Self {
            id: id.into(),
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Append a message to the history
    pub fn push(&mut self, message: Message) {
        self.history.push(message);
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Default sampling temperature sent with every request
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Request body for `POST {base_url}/chat/completions`
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub stream: bool,
}

impl ChatRequest {
    /// Build a request from an ordered history
    pub fn new(model: impl Into<String>, messages: &[Message], stream: bool) -> Self {
        Self {
            model: model.into(),
            messages: messages.to_vec(),
            temperature: DEFAULT_TEMPERATURE,
            stream,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// The three consumer channels of a streamed turn, as a single value.
///
/// Used when a turn is delivered over a channel instead of callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Newly available assistant text (never empty)
    Delta { text: String },
    /// The turn finished successfully
    Completed,
    /// The turn failed; no further events follow
    Failed { message: String },
}

impl TurnEvent {
    /// Check if this is a terminal event (Completed or Failed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Completed | TurnEvent::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_chat_request_body() {
        let history = vec![Message::system("be brief"), Message::user("hello")];
        let json = serde_json::to_value(ChatRequest::new("gpt-4o-mini", &history, true)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ],
                "temperature": 0.7,
                "stream": true
            })
        );
    }

    #[test]
    fn test_conversation_keeps_order() {
        let mut conv = Conversation::with_id("c1");
        conv.push(Message::user("one"));
        conv.push(Message::assistant("two"));
        assert_eq!(conv.id().as_str(), "c1");
        let contents: Vec<_> = conv.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two"]);
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        assert_ne!(ConversationId::new(), ConversationId::new());
    }

    #[test]
    fn test_turn_event_tagging() {
        let json = serde_json::to_value(TurnEvent::Delta { text: "He".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "delta", "text": "He"}));
        assert!(TurnEvent::Completed.is_terminal());
        assert!(!TurnEvent::Delta { text: "x".into() }.is_terminal());
    }
}
