//! Message and Conversation domain types.
//!
//! These are the value objects the orchestration engine operates on as
//! it appends user turns, assistant replies, and tool results until a
//! final answer arrives.
//!
//! The central invariant lives here: an assistant message that carries tool
//! calls must be immediately followed, in order, by one tool-result message
//! per call id before any other role appears (a "tool-call chain"). The
//! context window manager enforces it before anything is sent externally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user (or a synthetic steering message from the engine)
    User,
    /// The model
    Assistant,
    /// System instructions (task policy prompt)
    System,
    /// Tool execution result
    Tool,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant message carrying tool calls (call ids preserved).
    pub fn assistant_with_calls(
        content: impl Into<String>,
        tool_calls: Vec<MessageToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            timestamp: Utc::now(),
        }
    }

    /// Whether this is an assistant message that opens a tool-call chain.
    pub fn opens_chain(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// A tool call embedded in an assistant message.
///
/// `arguments` is the raw JSON string exactly as the model produced it.
/// It may be malformed or truncated and is parsed (and possibly repaired)
/// at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

/// An ordered sequence of messages owned by exactly one agent loop.
///
/// Always begins with exactly one system message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered messages (index 0 is the system message)
    pub messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new conversation seeded with a system prompt.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            messages: vec![Message::system(system_prompt)],
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Replace the system prompt (index 0), inserting one if missing.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        match self.messages.first_mut() {
            Some(m) if m.role == Role::System => m.content = prompt.into(),
            _ => self.messages.insert(0, Message::system(prompt)),
        }
        self.updated_at = Utc::now();
    }

    /// The most recent user message content, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Number of messages excluding the leading system message.
    pub fn len_without_system(&self) -> usize {
        match self.messages.first() {
            Some(m) if m.role == Role::System => self.messages.len() - 1,
            _ => self.messages.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Build a landing page");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Build a landing page");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn conversation_starts_with_system() {
        let conv = Conversation::new("You are an autonomous agent.");
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, Role::System);
    }

    #[test]
    fn set_system_prompt_replaces_in_place() {
        let mut conv = Conversation::new("old");
        conv.set_system_prompt("new");
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].content, "new");
    }

    #[test]
    fn last_user_content_finds_most_recent() {
        let mut conv = Conversation::new("sys");
        conv.push(Message::user("first"));
        conv.push(Message::assistant("ok"));
        conv.push(Message::user("second"));
        assert_eq!(conv.last_user_content(), Some("second"));
    }

    #[test]
    fn opens_chain_requires_tool_calls() {
        let plain = Message::assistant("done");
        assert!(!plain.opens_chain());

        let with_calls = Message::assistant_with_calls(
            "",
            vec![MessageToolCall {
                id: "call_1".into(),
                name: "shell".into(),
                arguments: "{}".into(),
            }],
        );
        assert!(with_calls.opens_chain());
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::tool_result("call_9", r#"{"success":true}"#);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::Tool);
        assert_eq!(back.tool_call_id.as_deref(), Some("call_9"));
    }
}
