use bytes::Bytes;
use futures::Stream;
use manifold_core::error::ProxyError;
use std::pin::Pin;
use tokio_stream::StreamExt;

/// One upstream SSE event: optional `event:` name plus the joined `data:`
/// payload. `[DONE]` arrives as a normal event with that literal data.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Parse a byte stream into SSE events. Handles `event:`/`data:` prefixes,
/// multi-line data, comments, and CRLF boundaries. There is no line-length
/// cap; chunks are bounded only by upstream framing.
pub fn parse_sse_stream(
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> Pin<Box<dyn Stream<Item = Result<SseEvent, ProxyError>> + Send>> {
    Box::pin(event_stream(byte_stream))
}

struct SseState {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
}

fn event_stream(
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = Result<SseEvent, ProxyError>> + Send {
    futures::stream::unfold(
        SseState {
            stream: Box::pin(byte_stream),
            buffer: String::new(),
        },
        |mut state| async move {
            loop {
                if let Some(pos) = find_event_boundary(&state.buffer) {
                    let block = state.buffer[..pos].to_string();
                    let skip = if state.buffer[pos..].starts_with("\r\n\r\n") {
                        4
                    } else {
                        2
                    };
                    state.buffer = state.buffer[pos + skip..].to_string();

                    if let Some(event) = parse_event_block(&block) {
                        return Some((Ok(event), state));
                    }
                    continue;
                }

                match state.stream.next().await {
                    Some(Ok(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => state.buffer.push_str(text),
                        Err(e) => {
                            return Some((
                                Err(ProxyError::Internal(format!(
                                    "invalid UTF-8 in SSE stream: {e}"
                                ))),
                                state,
                            ));
                        }
                    },
                    Some(Err(e)) => {
                        return Some((Err(ProxyError::Network(e.to_string())), state));
                    }
                    None => {
                        // Stream ended; flush any trailing partial block.
                        if !state.buffer.trim().is_empty() {
                            let block = std::mem::take(&mut state.buffer);
                            if let Some(event) = parse_event_block(&block) {
                                return Some((Ok(event), state));
                            }
                        }
                        return None;
                    }
                }
            }
        },
    )
}

fn find_event_boundary(s: &str) -> Option<usize> {
    match (s.find("\n\n"), s.find("\r\n\r\n")) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse one SSE event block. Returns `None` for comment-only or empty
/// blocks.
fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();

    for line in block.lines() {
        let line = line.trim_start_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
        }
        // id: and retry: fields are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event_type,
        data: data_lines.join("\n"),
    })
}

/// Extract the JSON payload from a raw SSE line: strips an optional
/// `data:` prefix and rejects `event:`-only lines and the `[DONE]`
/// sentinel.
pub fn extract_json_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("event:") {
        return None;
    }
    let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if payload == "[DONE]" || !payload.starts_with(['{', '[']) {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_block_basic() {
        let event = parse_event_block("data: {\"hello\": \"world\"}").unwrap();
        assert!(event.event.is_none());
        assert_eq!(event.data, "{\"hello\": \"world\"}");
    }

    #[test]
    fn test_parse_event_block_with_event_type() {
        let event =
            parse_event_block("event: message_start\ndata: {\"type\": \"message_start\"}").unwrap();
        assert_eq!(event.event.as_deref(), Some("message_start"));
        assert_eq!(event.data, "{\"type\": \"message_start\"}");
    }

    #[test]
    fn test_parse_event_block_done() {
        let event = parse_event_block("data: [DONE]").unwrap();
        assert!(event.is_done());
    }

    #[test]
    fn test_parse_event_block_multiline_data() {
        let event = parse_event_block("data: line1\ndata: line2").unwrap();
        assert_eq!(event.data, "line1\nline2");
    }

    #[test]
    fn test_parse_event_block_comment() {
        assert!(parse_event_block(": keep-alive").is_none());
    }

    #[test]
    fn test_extract_json_payload() {
        assert_eq!(
            extract_json_payload("data: {\"a\":1}"),
            Some("{\"a\":1}")
        );
        assert_eq!(extract_json_payload("data: [DONE]"), None);
        assert_eq!(extract_json_payload("event: ping"), None);
        assert_eq!(extract_json_payload("{\"bare\":true}"), Some("{\"bare\":true}"));
        assert_eq!(extract_json_payload("not json"), None);
    }
}
