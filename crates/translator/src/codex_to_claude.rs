use crate::openai_to_claude::sse;
use crate::{BlockKind, DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a complete Responses API object into a Claude message.
pub fn translate_non_stream(
    ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;
    let resp = resp.get("response").cloned().unwrap_or(resp);

    let model = resp
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(ctx.model);

    let mut content: Vec<Value> = Vec::new();
    let mut has_tool_use = false;

    if let Some(output) = resp.get("output").and_then(|o| o.as_array()) {
        for item in output {
            match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "reasoning" => {
                    let text: String = item
                        .get("summary")
                        .and_then(|s| s.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|s| s.get("text").and_then(|t| t.as_str()))
                                .collect::<Vec<_>>()
                                .join("")
                        })
                        .unwrap_or_default();
                    if !text.is_empty() {
                        content.push(json!({"type": "thinking", "thinking": text}));
                    }
                }
                "message" => {
                    if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                        for part in parts {
                            if part.get("type").and_then(|t| t.as_str()) == Some("output_text")
                                && let Some(text) = part.get("text").and_then(|t| t.as_str())
                            {
                                content.push(json!({"type": "text", "text": text}));
                            }
                        }
                    }
                }
                "function_call" => {
                    has_tool_use = true;
                    let arguments = item
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}");
                    content.push(json!({
                        "type": "tool_use",
                        "id": item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or(""),
                        "name": item.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "input": serde_json::from_str::<Value>(arguments).unwrap_or(json!({})),
                    }));
                }
                _ => {}
            }
        }
    }

    let stop_reason = if has_tool_use {
        "tool_use"
    } else {
        match resp.get("status").and_then(|s| s.as_str()) {
            Some("incomplete") => "max_tokens",
            _ => "end_turn",
        }
    };

    let mut claude_resp = json!({
        "id": format!("msg_{}", resp.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
    });

    if let Some(u) = resp.get("usage") {
        claude_resp["usage"] = convert_usage(u);
    }

    serde_json::to_string(&claude_resp).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Translate Responses API stream events into Claude SSE events.
pub fn translate_stream(
    ctx: &TranslateContext,
    event_type: Option<&str>,
    data: &[u8],
    state: &mut StreamState,
) -> Result<Vec<String>, ProxyError> {
    let mut events = Vec::new();

    if data == DONE {
        flush_terminal(state, &mut events)?;
        return Ok(events);
    }

    let event: Value = serde_json::from_slice(data)?;
    let kind = event_type
        .or_else(|| event.get("type").and_then(|t| t.as_str()))
        .unwrap_or("");

    match kind {
        "response.created" => {
            let resp = event.get("response");
            state.message_started = true;
            state.response_id = format!(
                "msg_{}",
                resp.and_then(|r| r.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
            );
            state.model = resp
                .and_then(|r| r.get("model"))
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

        "response.output_item.added" => {
            if let Some(item) = event.get("item")
                && item.get("type").and_then(|t| t.as_str()) == Some("function_call")
            {
                close_block(state, &mut events)?;
                state.block_index += 1;
                state.block_open = true;
                state.block_kind = BlockKind::ToolUse;
                events.push(sse(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": state.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": item
                                .get("call_id")
                                .or_else(|| item.get("id"))
                                .and_then(|v| v.as_str())
                                .unwrap_or(""),
                            "name": item.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                            "input": {},
                        },
                    }),
                )?);
            }
        }

        "response.output_item.done" => {
            if state.block_kind == BlockKind::ToolUse {
                close_block(state, &mut events)?;
            }
        }

        "response.output_text.delta" => {
            if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                ensure_block(state, BlockKind::Text, &mut events)?;
                events.push(sse(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": state.block_index,
                        "delta": {"type": "text_delta", "text": delta},
                    }),
                )?);
            }
        }

        "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
            if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                ensure_block(state, BlockKind::Thinking, &mut events)?;
                events.push(sse(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": state.block_index,
                        "delta": {"type": "thinking_delta", "thinking": delta},
                    }),
                )?);
            }
        }

        "response.function_call_arguments.delta" => {
            if let Some(delta) = event.get("delta").and_then(|d| d.as_str())
                && state.block_kind == BlockKind::ToolUse
            {
                events.push(sse(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": state.block_index,
                        "delta": {"type": "input_json_delta", "partial_json": delta},
                    }),
                )?);
            }
        }

        "response.completed" => {
            if !state.finish_sent {
                state.finish_sent = true;
                close_block(state, &mut events)?;
                let usage = event.get("response").and_then(|r| r.get("usage"));
                let stop_reason = if state.saw_tool_block() {
                    "tool_use"
                } else {
                    "end_turn"
                };
                events.push(sse(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                        "usage": usage.map(convert_usage).unwrap_or(json!({
                            "input_tokens": 0,
                            "output_tokens": 0,
                        })),
                    }),
                )?);
            }
            if !state.done_sent {
                state.done_sent = true;
                events.push(sse("message_stop", json!({"type": "message_stop"}))?);
            }
        }

        _ => {}
    }

    Ok(events)
}

impl StreamState {
    /// Whether any tool_use block was opened during this stream.
    fn saw_tool_block(&self) -> bool {
        self.current_tool_call_index >= 0 || self.block_kind == BlockKind::ToolUse
    }
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
                "usage": {"input_tokens": 0, "output_tokens": 0},
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
    if state.block_kind == BlockKind::ToolUse {
        state.current_tool_call_index += 1;
    }
    state.block_open = false;
    state.block_kind = BlockKind::None;
    events.push(sse(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": state.block_index}),
    )?);
    Ok(())
}

fn convert_usage(u: &Value) -> Value {
    let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let mut out = json!({"input_tokens": input, "output_tokens": output});
    if let Some(cached) = u
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64())
        && cached > 0
    {
        out["cache_read_input_tokens"] = json!(cached);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TranslateContext<'static> {
        TranslateContext {
            model: "gpt-5-codex",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn test_non_stream_full_output() {
        let resp = json!({
            "id": "resp_1",
            "model": "gpt-5-codex",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "think"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "done"}]},
                {"type": "function_call", "call_id": "call_2", "name": "shell",
                 "arguments": "{\"cmd\":\"ls\"}"}
            ],
            "usage": {"input_tokens": 8, "output_tokens": 4,
                      "input_tokens_details": {"cached_tokens": 2}}
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["content"][0]["type"], "thinking");
        assert_eq!(v["content"][1]["text"], "done");
        assert_eq!(v["content"][2]["input"]["cmd"], "ls");
        assert_eq!(v["stop_reason"], "tool_use");
        assert_eq!(v["usage"]["cache_read_input_tokens"], 2);
    }

    #[test]
    fn test_stream_text_lifecycle() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for event in [
            json!({"type": "response.created", "response": {"id": "r1", "model": "gpt-5-codex"}}),
            json!({"type": "response.reasoning_summary_text.delta", "delta": "plan"}),
            json!({"type": "response.output_text.delta", "delta": "hello"}),
            json!({"type": "response.completed",
                   "response": {"usage": {"input_tokens": 3, "output_tokens": 2}}}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, event.to_string().as_bytes(), &mut state).unwrap(),
            );
        }
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
    }

    #[test]
    fn test_stream_tool_call() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for event in [
            json!({"type": "response.created", "response": {"id": "r2", "model": "m"}}),
            json!({"type": "response.output_item.added",
                   "item": {"type": "function_call", "call_id": "call_3", "name": "grep"}}),
            json!({"type": "response.function_call_arguments.delta", "delta": "{}"}),
            json!({"type": "response.output_item.done", "item": {"type": "function_call"}}),
            json!({"type": "response.completed", "response": {}}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, event.to_string().as_bytes(), &mut state).unwrap(),
            );
        }
        assert!(all.iter().any(|e| e.contains("call_3")));
        assert!(all.iter().any(|e| e.contains("input_json_delta")));
        assert!(all.iter().any(|e| e.contains("\"stop_reason\":\"tool_use\"")));
    }
}
