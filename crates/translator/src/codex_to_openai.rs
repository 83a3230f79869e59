use crate::{DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a complete Responses API object into an OpenAI chat
/// completion.
pub fn translate_non_stream(
    ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;
    // Non-stream bodies may arrive as a bare response object or wrapped in
    // a `response.completed` event.
    let resp = resp.get("response").cloned().unwrap_or(resp);

    let id = resp.get("id").and_then(|v| v.as_str()).unwrap_or("");
    let model = resp
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(ctx.model);
    let created = resp
        .get("created_at")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    if let Some(output) = resp.get("output").and_then(|o| o.as_array()) {
        for item in output {
            match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "message" => {
                    if let Some(contents) = item.get("content").and_then(|c| c.as_array()) {
                        for c in contents {
                            if c.get("type").and_then(|t| t.as_str()) == Some("output_text")
                                && let Some(t) = c.get("text").and_then(|t| t.as_str())
                            {
                                text.push_str(t);
                            }
                        }
                    }
                }
                "reasoning" => {
                    if let Some(summary) = item.get("summary").and_then(|s| s.as_array()) {
                        for s in summary {
                            if let Some(t) = s.get("text").and_then(|t| t.as_str()) {
                                reasoning.push_str(t);
                            }
                        }
                    }
                }
                "function_call" => {
                    tool_calls.push(json!({
                        "id": item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or(""),
                        "type": "function",
                        "function": {
                            "name": item.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                            "arguments": item
                                .get("arguments")
                                .and_then(|a| a.as_str())
                                .unwrap_or("{}"),
                        },
                        "index": tool_calls.len(),
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls"
    } else {
        match resp.get("status").and_then(|s| s.as_str()) {
            Some("incomplete") => "length",
            _ => "stop",
        }
    };

    let content_val = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    let mut message = json!({"role": "assistant", "content": content_val});
    if !reasoning.is_empty() {
        message["reasoning_content"] = Value::String(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let mut chat_resp = json!({
        "id": format!("chatcmpl-{id}"),
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });

    if let Some(usage) = convert_usage(resp.get("usage")) {
        chat_resp["usage"] = usage;
    }

    serde_json::to_string(&chat_resp).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Translate Responses API stream events into OpenAI chat completion
/// chunks. Event names arrive in the JSON `type` field (Codex WS re-frames
/// everything as data-only lines).
pub fn translate_stream(
    ctx: &TranslateContext,
    event_type: Option<&str>,
    data: &[u8],
    state: &mut StreamState,
) -> Result<Vec<String>, ProxyError> {
    if data == DONE {
        if state.done_sent {
            return Ok(vec![]);
        }
        state.done_sent = true;
        return Ok(vec!["[DONE]".to_string()]);
    }

    let event: Value = serde_json::from_slice(data)?;
    let kind = event_type
        .or_else(|| event.get("type").and_then(|t| t.as_str()))
        .unwrap_or("");
    let mut chunks = Vec::new();

    match kind {
        "response.created" => {
            if let Some(resp) = event.get("response") {
                state.response_id = format!(
                    "chatcmpl-{}",
                    resp.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")
                );
                state.model = resp
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or(ctx.model)
                    .to_string();
                state.created = resp
                    .get("created_at")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(|| chrono::Utc::now().timestamp());
            }
            state.current_tool_call_index = -1;
            chunks.push(chunk(
                state,
                json!({"role": "assistant", "content": ""}),
                None,
                None,
            )?);
            state.sent_role = true;
        }

        "response.output_item.added" => {
            if let Some(item) = event.get("item")
                && item.get("type").and_then(|t| t.as_str()) == Some("function_call")
            {
                state.current_tool_call_index += 1;
                let call_id = item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let name = item.get("name").and_then(|n| n.as_str()).unwrap_or("");
                state.pending_tool_id = call_id.to_string();
                state.pending_tool_name = name.to_string();
                chunks.push(chunk(
                    state,
                    json!({
                        "tool_calls": [{
                            "index": state.current_tool_call_index,
                            "id": call_id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""},
                        }],
                    }),
                    None,
                    None,
                )?);
            }
        }

        "response.output_text.delta" => {
            if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                chunks.push(chunk(state, json!({"content": delta}), None, None)?);
            }
        }

        "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
            if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                chunks.push(chunk(state, json!({"reasoning_content": delta}), None, None)?);
            }
        }

        "response.function_call_arguments.delta" => {
            if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                chunks.push(chunk(
                    state,
                    json!({
                        "tool_calls": [{
                            "index": state.current_tool_call_index,
                            "function": {"arguments": delta},
                        }],
                    }),
                    None,
                    None,
                )?);
            }
        }

        "response.completed" => {
            if !state.finish_sent {
                state.finish_sent = true;
                let finish_reason = if state.current_tool_call_index >= 0 {
                    "tool_calls"
                } else {
                    "stop"
                };
                let usage =
                    convert_usage(event.get("response").and_then(|r| r.get("usage")));
                chunks.push(chunk(state, json!({}), Some(finish_reason), usage)?);
            }
            if !state.done_sent {
                state.done_sent = true;
                chunks.push("[DONE]".to_string());
            }
        }

        // in_progress, content_part boundaries, output_text.done, etc.
        _ => {}
    }

    Ok(chunks)
}

/// Responses clients get the upstream events back unchanged, re-framed as
/// `event:`-tagged SSE lines.
pub fn passthrough_stream(
    _ctx: &TranslateContext,
    event_type: Option<&str>,
    data: &[u8],
    _state: &mut StreamState,
) -> Result<Vec<String>, ProxyError> {
    if data == DONE {
        // The Responses protocol ends on response.completed, not [DONE].
        return Ok(vec![]);
    }
    let text = String::from_utf8_lossy(data).to_string();
    let event = match event_type {
        Some(e) => Some(e.to_string()),
        None => serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string)),
    };
    match event {
        Some(e) => Ok(vec![format!("event: {e}\ndata: {text}")]),
        None => Ok(vec![text]),
    }
}

pub fn passthrough_non_stream(
    _ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    Ok(String::from_utf8_lossy(data).to_string())
}

fn chunk(
    state: &StreamState,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> Result<String, ProxyError> {
    let mut chunk = json!({
        "id": state.response_id,
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": state.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        chunk["usage"] = usage;
    }
    serde_json::to_string(&chunk).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn convert_usage(usage: Option<&Value>) -> Option<Value> {
    let u = usage?;
    let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let reasoning = u
        .get("output_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let cached = u
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total = u
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(input + output);

    let mut out = json!({
        "prompt_tokens": input,
        "completion_tokens": output,
        "total_tokens": total,
    });
    if reasoning > 0 {
        out["completion_tokens_details"] = json!({"reasoning_tokens": reasoning});
    }
    if cached > 0 {
        out["prompt_tokens_details"] = json!({"cached_tokens": cached});
    }
    Some(out)
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
    fn test_non_stream_message_and_reasoning() {
        let resp = json!({
            "id": "resp_1",
            "model": "gpt-5-codex",
            "status": "completed",
            "created_at": 1700000000,
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "plan"}]},
                {"type": "message", "role": "assistant",
                 "content": [{"type": "output_text", "text": "patched"}]}
            ],
            "usage": {
                "input_tokens": 12, "output_tokens": 7, "total_tokens": 19,
                "output_tokens_details": {"reasoning_tokens": 4},
                "input_tokens_details": {"cached_tokens": 6}
            }
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["id"], "chatcmpl-resp_1");
        assert_eq!(v["choices"][0]["message"]["content"], "patched");
        assert_eq!(v["choices"][0]["message"]["reasoning_content"], "plan");
        assert_eq!(v["usage"]["completion_tokens_details"]["reasoning_tokens"], 4);
        assert_eq!(v["usage"]["prompt_tokens_details"]["cached_tokens"], 6);
    }

    #[test]
    fn test_non_stream_function_call() {
        let resp = json!({
            "id": "resp_2",
            "output": [{"type": "function_call", "call_id": "call_7",
                        "name": "shell", "arguments": "{\"cmd\":\"ls\"}"}],
            "status": "completed"
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["choices"][0]["message"]["tool_calls"][0]["id"], "call_7");
        assert_eq!(v["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_stream_lifecycle() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for event in [
            json!({"type": "response.created",
                   "response": {"id": "resp_3", "model": "gpt-5-codex", "created_at": 1}}),
            json!({"type": "response.output_text.delta", "delta": "hel"}),
            json!({"type": "response.output_text.delta", "delta": "lo"}),
            json!({"type": "response.completed",
                   "response": {"usage": {"input_tokens": 2, "output_tokens": 3, "total_tokens": 5}}}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, event.to_string().as_bytes(), &mut state).unwrap(),
            );
        }
        assert_eq!(all.len(), 5); // role, 2 deltas, finish, [DONE]
        let finish: Value = serde_json::from_str(&all[3]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["usage"]["total_tokens"], 5);
        assert_eq!(all[4], "[DONE]");

        // Executor-level DONE after response.completed stays silent.
        assert!(translate_stream(&ctx(), None, DONE, &mut state).unwrap().is_empty());
    }

    #[test]
    fn test_stream_tool_call_deltas() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for event in [
            json!({"type": "response.created", "response": {"id": "r", "model": "m"}}),
            json!({"type": "response.output_item.added",
                   "item": {"type": "function_call", "call_id": "call_9", "name": "shell"}}),
            json!({"type": "response.function_call_arguments.delta", "delta": "{\"cmd\":"}),
            json!({"type": "response.function_call_arguments.delta", "delta": "\"ls\"}"}),
            json!({"type": "response.completed", "response": {}}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, event.to_string().as_bytes(), &mut state).unwrap(),
            );
        }
        let start: Value = serde_json::from_str(&all[1]).unwrap();
        assert_eq!(
            start["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "shell"
        );
        let finish: Value = serde_json::from_str(&all[4]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_passthrough_reframes_events() {
        let mut state = StreamState::default();
        let data = json!({"type": "response.output_text.delta", "delta": "x"});
        let out =
            passthrough_stream(&ctx(), None, data.to_string().as_bytes(), &mut state).unwrap();
        assert!(out[0].starts_with("event: response.output_text.delta\ndata: "));
        assert!(passthrough_stream(&ctx(), None, DONE, &mut state).unwrap().is_empty());
    }
}
