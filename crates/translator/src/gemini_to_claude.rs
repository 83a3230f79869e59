use crate::openai_to_claude::sse;
use crate::{BlockKind, DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a complete Gemini response into a Claude message.
pub fn translate_non_stream(
    ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;

    let model = resp
        .get("modelVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(ctx.model);

    let candidate = resp
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first());

    let mut content = Vec::new();
    let mut has_tool_use = false;

    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                    let mut block = json!({"type": "thinking", "thinking": text});
                    if let Some(sig) = part.get("thoughtSignature").and_then(|s| s.as_str()) {
                        block["signature"] = json!(sig);
                    }
                    content.push(block);
                } else {
                    content.push(json!({"type": "text", "text": text}));
                }
            } else if let Some(fc) = part.get("functionCall") {
                has_tool_use = true;
                content.push(json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                    "name": fc.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                    "input": fc.get("args").cloned().unwrap_or(json!({})),
                }));
            }
        }
    }

    let stop_reason = map_stop_reason(
        candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|v| v.as_str()),
        has_tool_use,
    );

    let mut claude_resp = json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
    });

    if let Some(usage) = convert_usage(&resp) {
        claude_resp["usage"] = usage;
    }

    serde_json::to_string(&claude_resp).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Translate Gemini stream chunks into Claude SSE events, assembling
/// content blocks from the thought/text/functionCall part alternation.
pub fn translate_stream(
    ctx: &TranslateContext,
    _event_type: Option<&str>,
    data: &[u8],
    state: &mut StreamState,
) -> Result<Vec<String>, ProxyError> {
    let mut events = Vec::new();

    if data == DONE {
        flush_terminal(state, &mut events)?;
        return Ok(events);
    }

    let resp: Value = serde_json::from_slice(data)?;

    if !state.message_started {
        state.message_started = true;
        state.response_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        state.model = resp
            .get("modelVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(ctx.model)
            .to_string();
        state.block_index = -1;
        events.push(sse(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": state.response_id,
                    "type": "message",
                    "role": "assistant",
                    "model": state.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }
            }),
        )?);
    }

    let candidate = resp
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first());

    let mut saw_tool_use = false;
    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                    ensure_block(state, BlockKind::Thinking, &mut events)?;
                    events.push(sse(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": state.block_index,
                            "delta": {"type": "thinking_delta", "thinking": text},
                        }),
                    )?);
                    if let Some(sig) = part.get("thoughtSignature").and_then(|s| s.as_str()) {
                        events.push(sse(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": state.block_index,
                                "delta": {"type": "signature_delta", "signature": sig},
                            }),
                        )?);
                    }
                } else {
                    ensure_block(state, BlockKind::Text, &mut events)?;
                    events.push(sse(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": state.block_index,
                            "delta": {"type": "text_delta", "text": text},
                        }),
                    )?);
                }
            } else if let Some(fc) = part.get("functionCall") {
                saw_tool_use = true;
                // Gemini delivers complete calls; open a tool block, emit
                // the full arguments, and close it immediately.
                close_block(state, &mut events)?;
                state.block_index += 1;
                let args = fc.get("args").cloned().unwrap_or(json!({}));
                events.push(sse(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": state.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                            "name": fc.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                            "input": {},
                        },
                    }),
                )?);
                events.push(sse(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": state.block_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": serde_json::to_string(&args).unwrap_or_default(),
                        },
                    }),
                )?);
                events.push(sse(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": state.block_index}),
                )?);
            }
        }
    }

    if let Some(u) = resp.get("usageMetadata") {
        state.input_tokens = u
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(state.input_tokens);
        state.output_tokens = u
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(state.output_tokens);
        state.cached_tokens = u
            .get("cachedContentTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(state.cached_tokens);
    }

    if let Some(finish) = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
        && !state.finish_sent
    {
        state.finish_sent = true;
        close_block(state, &mut events)?;
        let mut usage = json!({
            "input_tokens": state.input_tokens,
            "output_tokens": state.output_tokens,
        });
        if state.cached_tokens > 0 {
            usage["cache_read_input_tokens"] = json!(state.cached_tokens);
        }
        events.push(sse(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": map_stop_reason(Some(finish), saw_tool_use),
                    "stop_sequence": null,
                },
                "usage": usage,
            }),
        )?);
    }

    Ok(events)
}

fn flush_terminal(state: &mut StreamState, events: &mut Vec<String>) -> Result<(), ProxyError> {
    if state.done_sent {
        return Ok(());
    }
    state.done_sent = true;
    close_block(state, events)?;
    if state.message_started && !state.finish_sent {
        state.finish_sent = true;
        events.push(sse(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {
                    "input_tokens": state.input_tokens,
                    "output_tokens": state.output_tokens,
                },
            }),
        )?);
    }
    if state.message_started {
        events.push(sse("message_stop", json!({"type": "message_stop"}))?);
    }
    Ok(())
}

fn ensure_block(
    state: &mut StreamState,
    kind: BlockKind,
    events: &mut Vec<String>,
) -> Result<(), ProxyError> {
    if state.block_open && state.block_kind == kind {
        return Ok(());
    }
    close_block(state, events)?;
    state.block_index += 1;
    state.block_open = true;
    state.block_kind = kind;
    let content_block = match kind {
        BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
        _ => json!({"type": "text", "text": ""}),
    };
    events.push(sse(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": state.block_index,
            "content_block": content_block,
        }),
    )?);
    Ok(())
}

fn close_block(state: &mut StreamState, events: &mut Vec<String>) -> Result<(), ProxyError> {
    if !state.block_open {
        return Ok(());
    }
    state.block_open = false;
    state.block_kind = BlockKind::None;
    events.push(sse(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": state.block_index}),
    )?);
    Ok(())
}

fn map_stop_reason(reason: Option<&str>, has_tool_use: bool) -> &'static str {
    if has_tool_use {
        return "tool_use";
    }
    match reason {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

fn convert_usage(resp: &Value) -> Option<Value> {
    let u = resp.get("usageMetadata")?;
    let input = u
        .get("promptTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = u
        .get("candidatesTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let mut usage = json!({"input_tokens": input, "output_tokens": output});
    if let Some(cached) = u.get("cachedContentTokenCount").and_then(|v| v.as_u64())
        && cached > 0
    {
        usage["cache_read_input_tokens"] = json!(cached);
    }
    Some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TranslateContext<'static> {
        TranslateContext {
            model: "gemini-2.5-pro",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn test_non_stream_thought_and_tool() {
        let resp = json!({
            "modelVersion": "gemini-2.5-pro",
            "candidates": [{
                "content": {"parts": [
                    {"text": "pondering", "thought": true, "thoughtSignature": "s1"},
                    {"text": "the answer"},
                    {"functionCall": {"name": "run", "args": {"cmd": "ls"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["content"][0]["type"], "thinking");
        assert_eq!(v["content"][0]["signature"], "s1");
        assert_eq!(v["content"][1]["text"], "the answer");
        assert_eq!(v["content"][2]["type"], "tool_use");
        assert_eq!(v["stop_reason"], "tool_use");
        assert_eq!(v["usage"]["input_tokens"], 10);
    }

    #[test]
    fn test_stream_thought_text_alternation() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for chunk in [
            json!({"candidates": [{"content": {"parts": [{"text": "think", "thought": true}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "reply"}]}}]}),
            json!({"candidates": [{"finishReason": "STOP"}],
                   "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3}}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap(),
            );
        }
        all.extend(translate_stream(&ctx(), None, DONE, &mut state).unwrap());

        let kinds: Vec<&str> = all
            .iter()
            .map(|e| e.split('\n').next().unwrap().strip_prefix("event: ").unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "content_block_start", // thinking
                "content_block_delta",
                "content_block_stop",
                "content_block_start", // text
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(all[7].contains("\"output_tokens\":3"));
    }

    #[test]
    fn test_stream_function_call_block() {
        let mut state = StreamState::default();
        let chunk = json!({"candidates": [{
            "content": {"parts": [{"functionCall": {"name": "run", "args": {"cmd": "ls"}}}]},
            "finishReason": "STOP"
        }]});
        let events =
            translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap();
        let start = events
            .iter()
            .find(|e| e.starts_with("event: content_block_start"))
            .unwrap();
        assert!(start.contains("tool_use"));
        let delta = events
            .iter()
            .find(|e| e.contains("input_json_delta"))
            .unwrap();
        assert!(delta.contains("\\\"cmd\\\""));
        assert!(events.iter().any(|e| e.contains("\"stop_reason\":\"tool_use\"")));
    }
}
