use super::{ByteStream, ChatRequest, CompletionProvider, LlmError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiClient {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        // No overall request timeout: a stream legitimately stays open for minutes.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn open_stream(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ByteStream, LlmError> {
        let mut req = self
            .client
            .post(self.completions_url())
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(request);

        if !api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        tracing::debug!(
            model = %request.model,
            message_count = request.messages.len(),
            "opening completion stream"
        );
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(LlmError::from));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::sse::{SseEvent, SseParser, StreamDelta};
    use crate::llm::ChatMessage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Serves one canned HTTP response and hands back the raw request.
    async fn serve_once(response: String) -> (OpenAiClient, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        let client = OpenAiClient::new(OpenAiConfig {
            base_url,
            ..Default::default()
        })
        .unwrap();
        (client, server)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn http_response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::streaming("openai/gpt-4o", vec![ChatMessage::text("user", "hi")])
    }

    #[tokio::test]
    async fn test_open_stream_maps_error_status() {
        let (client, server) = serve_once(http_response(
            "401 Unauthorized",
            "application/json",
            r#"{"error":{"message":"invalid key"}}"#,
        ))
        .await;

        let result = client.open_stream("sk-test", &request()).await;

        assert!(matches!(
            result,
            Err(LlmError::Api { status: 401, ref message }) if message.contains("invalid key")
        ));
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/chat/completions "));
        assert!(raw
            .to_ascii_lowercase()
            .contains("authorization: bearer sk-test"));
        assert!(raw.contains(r#""stream":true"#));
    }

    #[tokio::test]
    async fn test_open_stream_yields_event_stream_body() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        let (client, server) = serve_once(http_response("200 OK", "text/event-stream", body)).await;

        let mut stream = client.open_stream("sk-test", &request()).await.unwrap();
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        while let Some(chunk) = stream.next().await {
            events.extend(parser.feed(&chunk.unwrap()).unwrap());
        }

        assert_eq!(
            events,
            vec![
                SseEvent::Delta(StreamDelta {
                    content: Some("Hi".into()),
                    reasoning: None,
                }),
                SseEvent::Done,
            ]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_stream_without_key_sends_no_authorization() {
        let (client, server) = serve_once(http_response("200 OK", "text/event-stream", "")).await;

        client.open_stream("", &request()).await.unwrap();

        let raw = server.await.unwrap();
        assert!(!raw.to_ascii_lowercase().contains("authorization:"));
    }

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        let client = OpenAiClient::new(OpenAiConfig {
            base_url: "http://localhost:8080/v1/".into(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            client.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_default_config_points_at_hosted_endpoint() {
        let config = OpenAiConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
    }
}
