pub mod openai;
pub mod sse;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Either a plain string or a list of typed parts, as the completions API accepts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReasoningOptions {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningOptions>,
}

impl ChatRequest {
    /// Streaming request with reasoning output switched on.
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            reasoning: Some(ReasoningOptions { enabled: true }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Raw response body, chunk by chunk, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, LlmError>>;

/// A streaming chat-completions endpoint.
///
/// Dropping the returned stream tears down the underlying request, which is
/// how a caller aborts an in-flight read.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn open_stream(&self, api_key: &str, request: &ChatRequest)
        -> Result<ByteStream, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_request_body_shape() {
        let request = ChatRequest::streaming(
            "openai/gpt-4o",
            vec![
                ChatMessage::text("user", "hi"),
                ChatMessage {
                    role: "user".into(),
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: "what is this?".into(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: "https://files.example/a.png".into(),
                            },
                        },
                    ]),
                },
            ],
        );

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "openai/gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["reasoning"]["enabled"], true);
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["messages"][1]["content"][0]["type"], "text");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "https://files.example/a.png"
        );
    }

    #[test]
    fn test_llm_error_serializes_as_message() {
        let err = LlmError::Api {
            status: 401,
            message: "bad key".into(),
        };
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            "\"API error: 401 - bad key\""
        );
    }
}
