//! Incremental decoder for `data: <json>` event streams.

use super::LlmError;
use serde::Deserialize;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
/// Longest line accepted before the body is rejected.
pub const MAX_LINE_BYTES: usize = 1 << 20;
const PREVIEW_BYTES: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

impl StreamDelta {
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(StreamDelta),
    Done,
    /// The provider reported a failure inside the stream body.
    Error(String),
}

#[derive(Deserialize)]
struct StreamRecord {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamRecordError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<RecordDelta>,
}

#[derive(Deserialize)]
struct RecordDelta {
    content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct StreamRecordError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

/// Buffers bytes until a full line is available, so records and multi-byte
/// characters split across chunks decode intact.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    head: Vec<u8>,
    saw_record: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, LlmError> {
        if self.head.len() < PREVIEW_BYTES {
            let take = (PREVIEW_BYTES - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.parse_line(&line) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            return Err(LlmError::Parse(format!(
                "stream line exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }
        Ok(events)
    }

    /// Flushes a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(&rest).into_iter().collect()
    }

    /// The start of the body when it held no well-formed `data:` record at
    /// all, i.e. the provider answered with something other than an event stream.
    pub fn unrecognized_body(&self) -> Option<String> {
        if self.saw_record {
            return None;
        }
        let head = String::from_utf8_lossy(&self.head);
        let head = head.trim();
        Some(if head.is_empty() {
            "empty response body".to_string()
        } else {
            format!("unexpected response body: {}", head)
        })
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        // Comments (`: keep-alive`) and `event:`/`id:` fields carry nothing for us
        let payload = line.strip_prefix(DATA_PREFIX)?.trim_start();
        if payload == DONE_SENTINEL {
            self.saw_record = true;
            return Some(SseEvent::Done);
        }

        match serde_json::from_str::<StreamRecord>(payload) {
            Ok(record) => {
                self.saw_record = true;
                record_event(record)
            }
            Err(e) => {
                tracing::warn!(error = %e, record = %payload, "skipping malformed stream record");
                None
            }
        }
    }
}

fn record_event(record: StreamRecord) -> Option<SseEvent> {
    if let Some(err) = record.error {
        let message = err.message.unwrap_or_else(|| "unknown provider error".to_string());
        let detail = match err.code {
            Some(code) => format!("{} (code {})", message, code),
            None => message,
        };
        return Some(SseEvent::Error(detail));
    }

    let delta = record
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .map(|delta| StreamDelta {
            content: delta.content,
            reasoning: delta.reasoning,
        })
        .unwrap_or_default();

    if delta.is_empty() {
        None
    } else {
        Some(SseEvent::Delta(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> SseEvent {
        SseEvent::Delta(StreamDelta {
            content: Some(text.to_string()),
            reasoning: None,
        })
    }

    #[test]
    fn test_parses_content_and_done() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n",
            )
            .unwrap();

        assert_eq!(events, vec![content("Hello"), SseEvent::Done]);
    }

    #[test]
    fn test_record_split_across_chunks() {
        let mut parser = SseParser::new();

        assert!(parser.feed(b"data: {\"choices\":[{\"del").unwrap().is_empty());
        let events = parser.feed(b"ta\":{\"content\":\"Hi\"}}]}\n").unwrap();

        assert_eq!(events, vec![content("Hi")]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut parser = SseParser::new();
        let mut events = parser.feed(&line[..split]).unwrap();
        events.extend(parser.feed(&line[split..]).unwrap());

        assert_eq!(events, vec![content("héllo")]);
    }

    #[test]
    fn test_reasoning_delta() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"data: {\"choices\":[{\"delta\":{\"reasoning\":\"let me think\"}}]}\n")
            .unwrap();

        assert_eq!(
            events,
            vec![SseEvent::Delta(StreamDelta {
                content: None,
                reasoning: Some("let me think".into()),
            })]
        );
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\
              data: {not json\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
            )
            .unwrap();

        assert_eq!(events, vec![content("a"), content("b")]);
    }

    #[test]
    fn test_ignores_comments_blank_lines_and_empty_deltas() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(
                b": OPENROUTER PROCESSING\r\n\r\n\
              data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\r\n\
              data: {\"choices\":[]}\r\n",
            )
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(parser.unrecognized_body(), None);
    }

    #[test]
    fn test_body_without_records_is_unrecognized() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"{\"error\":{\"message\":\"bad model\"}}\n<html>502 Bad Gateway</html>")
            .unwrap();
        assert!(events.is_empty());
        assert!(parser.finish().is_empty());

        let detail = parser.unrecognized_body().unwrap();
        assert!(detail.contains("bad model"));
        assert!(detail.contains("502 Bad Gateway"));
    }

    #[test]
    fn test_empty_body_is_unrecognized() {
        let parser = SseParser::new();

        assert_eq!(
            parser.unrecognized_body().as_deref(),
            Some("empty response body")
        );
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let mut parser = SseParser::new();
        let mut chunk = b"data: ".to_vec();
        chunk.resize(MAX_LINE_BYTES + 1, b'a');

        assert!(matches!(parser.feed(&chunk), Err(LlmError::Parse(_))));
    }

    #[test]
    fn test_error_record_surfaces_as_error() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"data: {\"error\":{\"message\":\"overloaded\",\"code\":502}}\n")
            .unwrap();

        assert_eq!(
            events,
            vec![SseEvent::Error("overloaded (code 502)".to_string())]
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: [DONE]").unwrap().is_empty());

        assert_eq!(parser.finish(), vec![SseEvent::Done]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_data_prefix_without_space() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"data:{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")
            .unwrap();

        assert_eq!(events, vec![content("x")]);
    }
}
