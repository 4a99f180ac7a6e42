use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub model: Option<String>,
    pub created_at: String,
    /// Unix milliseconds. Only ever moves forward.
    pub last_activity_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

/// Structured piece of a message body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { url: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub reasoning: Option<String>,
    pub is_streaming: bool,
    pub seq: i64,
    pub file_ids: Option<Vec<String>>,
    pub parts: Option<Vec<ContentPart>>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub is_streaming: bool,
    pub file_ids: Option<Vec<String>>,
    pub parts: Option<Vec<ContentPart>>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            is_streaming: false,
            file_ids: None,
            parts: None,
        }
    }

    /// Empty assistant message that a generation grows in place.
    pub fn placeholder() -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            is_streaming: true,
            file_ids: None,
            parts: None,
        }
    }

    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.parts = Some(parts);
        self
    }

    pub fn with_file_ids(mut self, file_ids: Vec<String>) -> Self {
        self.file_ids = Some(file_ids);
        self
    }
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub is_streaming: Option<bool>,
}

impl MessagePatch {
    pub fn progress(content: &str, reasoning: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            reasoning: (!reasoning.is_empty()).then(|| reasoning.to_string()),
            is_streaming: None,
        }
    }

    pub fn finish(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            reasoning: None,
            is_streaming: Some(false),
        }
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        if !reasoning.is_empty() {
            self.reasoning = Some(reasoning.to_string());
        }
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GenerationToken {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub created_at: i64,
}
