use crate::{BlockKind, DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate an OpenAI Chat Completions request into a Claude Messages
/// request.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let req: Value = serde_json::from_slice(raw_json)?;

    let system_text = extract_system_messages(&req);
    let messages = convert_messages(&req)?;
    let tools = convert_tools(&req);
    let max_tokens = req
        .get("max_tokens")
        .or_else(|| req.get("max_completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(8192);
    let stop_sequences = convert_stop_sequences(&req);

    let mut claude_req = json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
    });

    if !system_text.is_empty() {
        claude_req["system"] = Value::String(system_text);
    }
    if let Some(temp) = req.get("temperature") {
        claude_req["temperature"] = temp.clone();
    }
    if let Some(top_p) = req.get("top_p") {
        claude_req["top_p"] = top_p.clone();
    }
    if let Some(tools) = tools {
        claude_req["tools"] = tools;
    }
    if let Some(stop) = stop_sequences {
        claude_req["stop_sequences"] = stop;
    }
    if stream {
        claude_req["stream"] = Value::Bool(true);
    }
    if let Some(thinking) = req.get("thinking") {
        claude_req["thinking"] = thinking.clone();
    } else if let Some(effort) = req.get("reasoning_effort").and_then(|e| e.as_str()) {
        let budget = match effort {
            "low" => 1024,
            "high" => 32768,
            _ => 16384,
        };
        claude_req["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }
    if let Some(tc) = req.get("tool_choice") {
        claude_req["tool_choice"] = convert_tool_choice(tc);
    }

    serde_json::to_vec(&claude_req).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn extract_system_messages(req: &Value) -> String {
    let mut system_parts = Vec::new();
    if let Some(messages) = req.get("messages").and_then(|m| m.as_array()) {
        for msg in messages {
            let role = msg.get("role").and_then(|r| r.as_str());
            if (role == Some("system") || role == Some("developer"))
                && let Some(content) = msg.get("content")
            {
                match content {
                    Value::String(s) => system_parts.push(s.clone()),
                    Value::Array(parts) => {
                        for part in parts {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                system_parts.push(text.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    system_parts.join("\n\n")
}

fn convert_messages(req: &Value) -> Result<Vec<Value>, ProxyError> {
    let messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::Translation("missing messages field".to_string()))?;

    let mut claude_messages: Vec<Value> = Vec::new();

    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");

        if role == "system" || role == "developer" {
            continue;
        }

        if role == "tool" {
            let tool_call_id = msg
                .get("tool_call_id")
                .or_else(|| msg.get("call_id"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let content_text = match msg.get("content") {
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };

            let tool_result = json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content_text,
            });

            if let Some(last) = claude_messages.last_mut()
                && last.get("role").and_then(|r: &Value| r.as_str()) == Some("user")
                && let Some(arr) = last.get_mut("content").and_then(|c| c.as_array_mut())
            {
                arr.push(tool_result);
                continue;
            }

            claude_messages.push(json!({"role": "user", "content": [tool_result]}));
            continue;
        }

        if role == "assistant" {
            let mut content_blocks = Vec::new();

            if let Some(reasoning) = msg.get("reasoning_content").and_then(|r| r.as_str())
                && !reasoning.is_empty()
            {
                content_blocks.push(json!({"type": "thinking", "thinking": reasoning}));
            }

            if let Some(Value::String(s)) = msg.get("content")
                && !s.is_empty()
            {
                content_blocks.push(json!({"type": "text", "text": s}));
            }

            if let Some(tool_calls) = msg.get("tool_calls").and_then(|tc| tc.as_array()) {
                for tc in tool_calls {
                    let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                        .unwrap_or("");
                    let arguments_str = tc
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}");
                    let input: Value = serde_json::from_str(arguments_str).unwrap_or(json!({}));

                    content_blocks.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    }));
                }
            }

            if content_blocks.is_empty() {
                content_blocks.push(json!({"type": "text", "text": ""}));
            }

            claude_messages.push(json!({"role": "assistant", "content": content_blocks}));
            continue;
        }

        let claude_content = convert_user_content(msg.get("content"));
        claude_messages.push(json!({"role": "user", "content": claude_content}));
    }

    Ok(claude_messages)
}

fn convert_user_content(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Array(parts)) => {
            let mut blocks = Vec::new();
            for part in parts {
                let part_type = part.get("type").and_then(|t| t.as_str()).unwrap_or("");
                match part_type {
                    "text" => {
                        let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    "image_url" => {
                        if let Some(url_obj) = part.get("image_url") {
                            let url = url_obj.get("url").and_then(|u| u.as_str()).unwrap_or("");
                            if let Some(image_block) = convert_image_url(url) {
                                blocks.push(image_block);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Value::Array(blocks)
        }
        _ => Value::String(String::new()),
    }
}

fn convert_image_url(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let parts: Vec<&str> = rest.splitn(2, ',').collect();
        if parts.len() == 2 {
            let media_type = parts[0].split(';').next().unwrap_or("image/png");
            return Some(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": parts[1],
                }
            }));
        }
    }
    Some(json!({
        "type": "image",
        "source": {"type": "url", "url": url}
    }))
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let claude_tools: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let func = tool.get("function")?;
            let name = func.get("name")?.as_str()?;
            let description = func
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("");
            let parameters = func
                .get("parameters")
                .cloned()
                .unwrap_or(json!({"type": "object", "properties": {}}));
            Some(json!({
                "name": name,
                "description": description,
                "input_schema": parameters,
            }))
        })
        .collect();

    if claude_tools.is_empty() {
        None
    } else {
        Some(Value::Array(claude_tools))
    }
}

fn convert_stop_sequences(req: &Value) -> Option<Value> {
    let stop = req.get("stop")?;
    match stop {
        Value::String(s) => Some(json!([s])),
        Value::Array(_) => Some(stop.clone()),
        _ => None,
    }
}

fn convert_tool_choice(tc: &Value) -> Value {
    match tc {
        Value::String(s) => match s.as_str() {
            "none" => json!({"type": "none"}),
            "required" => json!({"type": "any"}),
            _ => json!({"type": "auto"}),
        },
        Value::Object(obj) => {
            if let Some(func) = obj.get("function")
                && let Some(name) = func.get("name").and_then(|n| n.as_str())
            {
                return json!({"type": "tool", "name": name});
            }
            json!({"type": "auto"})
        }
        _ => json!({"type": "auto"}),
    }
}

// ─── OpenAI chat responses → Claude messages ───────────────────────────────

/// Translate a complete OpenAI chat completion into a Claude message.
pub fn translate_non_stream(
    ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;

    let model = resp
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(ctx.model);
    let message = resp
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"));

    let mut content = Vec::new();
    let mut has_tool_use = false;

    if let Some(message) = message {
        if let Some(reasoning) = message.get("reasoning_content").and_then(|r| r.as_str())
            && !reasoning.is_empty()
        {
            content.push(json!({"type": "thinking", "thinking": reasoning}));
        }
        if let Some(text) = message.get("content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
            content.push(json!({"type": "text", "text": text}));
        }
        if let Some(tool_calls) = message.get("tool_calls").and_then(|tc| tc.as_array()) {
            for tc in tool_calls {
                has_tool_use = true;
                let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("");
                let arguments = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|a| a.as_str())
                    .unwrap_or("{}");
                let input: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
                content.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
            }
        }
    }

    let finish = resp
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|f| f.as_str());
    let stop_reason = map_stop_reason(finish, has_tool_use);

    let mut claude_resp = json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
    });

    if let Some(usage) = resp.get("usage") {
        claude_resp["usage"] = convert_usage(usage);
    }

    serde_json::to_string(&claude_resp).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Translate OpenAI chat completion chunks into Claude SSE events. Handles
/// split tool-call argument deltas and empty-name continuations.
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

    let chunk: Value = serde_json::from_slice(data)?;

    if !state.message_started {
        state.message_started = true;
        state.response_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        state.model = chunk
            .get("model")
            .and_then(|m| m.as_str())
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

    let choice = chunk.get("choices").and_then(|c| c.get(0));
    let delta = choice.and_then(|c| c.get("delta"));

    if let Some(delta) = delta {
        if let Some(reasoning) = delta.get("reasoning_content").and_then(|r| r.as_str())
            && !reasoning.is_empty()
        {
            ensure_block(state, BlockKind::Thinking, None, &mut events)?;
            events.push(sse(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "thinking_delta", "thinking": reasoning},
                }),
            )?);
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
            ensure_block(state, BlockKind::Text, None, &mut events)?;
            events.push(sse(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "text_delta", "text": text},
                }),
            )?);
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
            for tc in tool_calls {
                let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("");
                let arguments = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|a| a.as_str())
                    .unwrap_or("");

                // A new call starts when an id arrives or the name changes
                // from the call in flight; argument-only deltas continue it.
                let starts_new = !id.is_empty()
                    || (!name.is_empty()
                        && (state.block_kind != BlockKind::ToolUse
                            || name != state.pending_tool_name));
                if starts_new {
                    state.pending_tool_id = if id.is_empty() {
                        format!("toolu_{}", uuid::Uuid::new_v4().simple())
                    } else {
                        id.to_string()
                    };
                    state.pending_tool_name = name.to_string();
                    let start = json!({
                        "type": "tool_use",
                        "id": state.pending_tool_id,
                        "name": state.pending_tool_name,
                        "input": {},
                    });
                    close_block(state, &mut events)?;
                    open_block(state, BlockKind::ToolUse, start, &mut events)?;
                } else if state.block_kind != BlockKind::ToolUse {
                    // Continuation without an open tool block: tolerate it.
                    let start = json!({
                        "type": "tool_use",
                        "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                        "name": name,
                        "input": {},
                    });
                    close_block(state, &mut events)?;
                    open_block(state, BlockKind::ToolUse, start, &mut events)?;
                }

                if !arguments.is_empty() {
                    events.push(sse(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": state.block_index,
                            "delta": {"type": "input_json_delta", "partial_json": arguments},
                        }),
                    )?);
                }
            }
        }
    }

    if let Some(usage) = chunk.get("usage")
        && usage.is_object()
    {
        state.input_tokens = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(state.input_tokens);
        state.output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(state.output_tokens);
    }

    if let Some(finish) = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|f| f.as_str())
        && !state.finish_sent
    {
        state.finish_sent = true;
        close_block(state, &mut events)?;
        let stop_reason = map_stop_reason(Some(finish), finish == "tool_calls");
        events.push(sse(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": state.input_tokens,
                    "output_tokens": state.output_tokens,
                },
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
    start: Option<Value>,
    events: &mut Vec<String>,
) -> Result<(), ProxyError> {
    if state.block_open && state.block_kind == kind {
        return Ok(());
    }
    close_block(state, events)?;
    let start = start.unwrap_or_else(|| match kind {
        BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
        _ => json!({"type": "text", "text": ""}),
    });
    open_block(state, kind, start, events)
}

fn open_block(
    state: &mut StreamState,
    kind: BlockKind,
    content_block: Value,
    events: &mut Vec<String>,
) -> Result<(), ProxyError> {
    state.block_index += 1;
    state.block_open = true;
    state.block_kind = kind;
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

pub(crate) fn sse(event: &str, value: Value) -> Result<String, ProxyError> {
    let data = serde_json::to_string(&value).map_err(|e| ProxyError::Translation(e.to_string()))?;
    Ok(format!("event: {event}\ndata: {data}"))
}

fn map_stop_reason(finish: Option<&str>, has_tool_use: bool) -> &'static str {
    if has_tool_use {
        return "tool_use";
    }
    match finish {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

fn convert_usage(usage: &Value) -> Value {
    let input = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let mut out = json!({"input_tokens": input, "output_tokens": output});
    if let Some(cached) = usage
        .get("prompt_tokens_details")
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
            model: "glm-4.5",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn test_request_system_and_tools() {
        let req = json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "hi"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "lookup", "description": "d", "parameters": {"type": "object"}
            }}],
            "max_tokens": 100
        });
        let out = translate_request("claude-sonnet-4-5", req.to_string().as_bytes(), true).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["system"], "be helpful");
        assert_eq!(v["model"], "claude-sonnet-4-5");
        assert_eq!(v["tools"][0]["name"], "lookup");
        assert_eq!(v["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(v["stream"], true);
        assert_eq!(v["max_tokens"], 100);
    }

    #[test]
    fn test_request_tool_result_merging() {
        let req = json!({
            "messages": [
                {"role": "assistant", "tool_calls": [
                    {"id": "call_a", "function": {"name": "f", "arguments": "{}"}},
                    {"id": "call_b", "function": {"name": "g", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_a", "content": "ra"},
                {"role": "tool", "tool_call_id": "call_b", "content": "rb"}
            ]
        });
        let out = translate_request("m", req.to_string().as_bytes(), false).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let messages = v["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[1]["content"][0]["tool_use_id"], "call_a");
    }

    #[test]
    fn test_non_stream_tool_calls_to_tool_use() {
        let resp = json!({
            "model": "glm-4.5",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["content"][0]["type"], "tool_use");
        assert_eq!(v["content"][0]["input"]["q"], "x");
        assert_eq!(v["stop_reason"], "tool_use");
        assert_eq!(v["usage"]["input_tokens"], 7);
    }

    #[test]
    fn test_stream_text_framing() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for chunk in [
            json!({"model": "glm-4.5", "choices": [{"delta": {"role": "assistant", "content": "he"}}]}),
            json!({"choices": [{"delta": {"content": "llo"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}],
                   "usage": {"prompt_tokens": 2, "completion_tokens": 1}}),
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
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(all[5].contains("\"output_tokens\":1"));
    }

    #[test]
    fn test_stream_split_tool_arguments() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for chunk in [
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0, "id": "call_9",
                "function": {"name": "search", "arguments": "{\"q\":"}
            }]}}]}),
            // Continuation: no id, empty name, rest of the arguments.
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0, "function": {"name": "", "arguments": "\"rust\"}"}
            }]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap(),
            );
        }

        let starts: Vec<&String> = all
            .iter()
            .filter(|e| e.starts_with("event: content_block_start"))
            .collect();
        assert_eq!(starts.len(), 1, "continuation must not open a new block");
        assert!(starts[0].contains("call_9"));

        let deltas: Vec<&String> = all
            .iter()
            .filter(|e| e.contains("input_json_delta"))
            .collect();
        assert_eq!(deltas.len(), 2);
        assert!(all.iter().any(|e| e.contains("\"stop_reason\":\"tool_use\"")));
    }

    #[test]
    fn test_stream_thinking_then_text_blocks() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        for chunk in [
            json!({"choices": [{"delta": {"reasoning_content": "hmm"}}]}),
            json!({"choices": [{"delta": {"content": "answer"}}]}),
        ] {
            all.extend(
                translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap(),
            );
        }
        // thinking block closed before the text block opens
        let starts: Vec<&String> = all
            .iter()
            .filter(|e| e.starts_with("event: content_block_start"))
            .collect();
        assert_eq!(starts.len(), 2);
        assert!(starts[0].contains("thinking"));
        assert!(starts[1].contains("text"));
    }
}
