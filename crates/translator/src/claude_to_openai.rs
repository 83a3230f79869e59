use crate::{DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a Claude Messages request into an OpenAI Chat Completions
/// request.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let req: Value = serde_json::from_slice(raw_json)?;

    let mut messages: Vec<Value> = Vec::new();

    match req.get("system") {
        Some(Value::String(s)) if !s.is_empty() => {
            messages.push(json!({"role": "system", "content": s}));
        }
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text.join("\n\n")}));
            }
        }
        _ => {}
    }

    for msg in req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::Translation("missing messages field".to_string()))?
    {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match role {
            "assistant" => convert_assistant_message(msg, &mut messages),
            _ => convert_user_message(msg, &mut messages),
        }
    }

    let mut openai_req = json!({
        "model": model,
        "messages": messages,
    });

    if let Some(max) = req.get("max_tokens") {
        openai_req["max_tokens"] = max.clone();
    }
    if let Some(temp) = req.get("temperature") {
        openai_req["temperature"] = temp.clone();
    }
    if let Some(top_p) = req.get("top_p") {
        openai_req["top_p"] = top_p.clone();
    }
    if let Some(stop) = req.get("stop_sequences") {
        openai_req["stop"] = stop.clone();
    }
    if let Some(tools) = convert_tools(&req) {
        openai_req["tools"] = tools;
    }
    if let Some(tc) = req.get("tool_choice") {
        openai_req["tool_choice"] = convert_tool_choice(tc);
    }
    if let Some(budget) = req
        .get("thinking")
        .filter(|t| t.get("type").and_then(|ty| ty.as_str()) == Some("enabled"))
        .and_then(|t| t.get("budget_tokens"))
        .and_then(|b| b.as_i64())
    {
        let effort = if budget <= 1024 {
            "low"
        } else if budget <= 16384 {
            "medium"
        } else {
            "high"
        };
        openai_req["reasoning_effort"] = json!(effort);
    }
    if stream {
        openai_req["stream"] = Value::Bool(true);
    }

    serde_json::to_vec(&openai_req).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn convert_user_message(msg: &Value, messages: &mut Vec<Value>) {
    match msg.get("content") {
        Some(Value::String(s)) => {
            messages.push(json!({"role": "user", "content": s}));
        }
        Some(Value::Array(blocks)) => {
            let mut parts: Vec<Value> = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        parts.push(json!({"type": "text", "text": text}));
                    }
                    "image" => {
                        if let Some(url) = image_source_to_url(block.get("source")) {
                            parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                        }
                    }
                    "tool_result" => {
                        // Tool results become their own `tool` role messages.
                        let tool_use_id = block
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        let content = tool_result_text(block.get("content"));
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                    _ => {}
                }
            }
            if !parts.is_empty() {
                messages.push(json!({"role": "user", "content": parts}));
            }
        }
        _ => {}
    }
}

fn convert_assistant_message(msg: &Value, messages: &mut Vec<Value>) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    if let Some(blocks) = msg.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text" => {
                    text.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or(""));
                }
                "thinking" => {
                    reasoning
                        .push_str(block.get("thinking").and_then(|t| t.as_str()).unwrap_or(""));
                }
                "tool_use" => {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    let input = block.get("input").cloned().unwrap_or(json!({}));
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": serde_json::to_string(&input).unwrap_or_default(),
                        },
                        "index": tool_calls.len(),
                    }));
                }
                _ => {}
            }
        }
    } else if let Some(s) = msg.get("content").and_then(|c| c.as_str()) {
        text.push_str(s);
    }

    let mut out = json!({"role": "assistant"});
    out["content"] = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !reasoning.is_empty() {
        out["reasoning_content"] = Value::String(reasoning);
    }
    if !tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(tool_calls);
    }
    messages.push(out);
}

fn image_source_to_url(source: Option<&Value>) -> Option<String> {
    let source = source?;
    match source.get("type").and_then(|t| t.as_str())? {
        "base64" => {
            let media = source
                .get("media_type")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png");
            let data = source.get("data").and_then(|d| d.as_str())?;
            Some(format!("data:{media};base64,{data}"))
        }
        "url" => source
            .get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let openai_tools: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                    "parameters": tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or(json!({"type": "object", "properties": {}})),
                }
            }))
        })
        .collect();
    if openai_tools.is_empty() {
        None
    } else {
        Some(Value::Array(openai_tools))
    }
}

fn convert_tool_choice(tc: &Value) -> Value {
    match tc.get("type").and_then(|t| t.as_str()) {
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => {
            let name = tc.get("name").and_then(|n| n.as_str()).unwrap_or("");
            json!({"type": "function", "function": {"name": name}})
        }
        _ => json!("auto"),
    }
}

// ─── Claude responses → OpenAI chat completions ────────────────────────────

/// Translate a complete Claude message into an OpenAI chat completion.
pub fn translate_non_stream(
    ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;

    let id = format!(
        "chatcmpl-{}",
        resp.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")
    );
    let model = resp
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(ctx.model)
        .to_string();
    let created = chrono::Utc::now().timestamp();

    let mut text_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut tool_calls = Vec::new();

    if let Some(content) = resp.get("content").and_then(|c| c.as_array()) {
        for block in content {
            match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text" => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        text_parts.push(text.to_string());
                    }
                }
                "thinking" => {
                    if let Some(t) = block.get("thinking").and_then(|t| t.as_str()) {
                        reasoning_parts.push(t.to_string());
                    }
                }
                "tool_use" => {
                    let tc_id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    let input = block.get("input").cloned().unwrap_or(json!({}));
                    tool_calls.push(json!({
                        "id": tc_id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": serde_json::to_string(&input).unwrap_or_default(),
                        },
                        "index": tool_calls.len(),
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason = map_finish_reason(resp.get("stop_reason").and_then(|v| v.as_str()));

    let content_str = text_parts.join("");
    let content_val = if content_str.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(content_str)
    };

    let mut message = json!({
        "role": "assistant",
        "content": content_val,
    });
    if !reasoning_parts.is_empty() {
        message["reasoning_content"] = Value::String(reasoning_parts.join(""));
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let mut openai_resp = json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });

    if let Some(u) = resp.get("usage") {
        let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let mut usage = json!({
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output,
        });
        if let Some(cached) = u.get("cache_read_input_tokens").and_then(|v| v.as_u64())
            && cached > 0
        {
            usage["prompt_tokens_details"] = json!({"cached_tokens": cached});
        }
        openai_resp["usage"] = usage;
    }

    serde_json::to_string(&openai_resp).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Translate Claude SSE events into OpenAI chat completion chunks.
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
    // Claude frames carry the event name both on the SSE line and in the
    // JSON; fall back to the body when the executor passed data only.
    let event_type = event_type
        .or_else(|| event.get("type").and_then(|t| t.as_str()))
        .unwrap_or("");
    let mut chunks = Vec::new();

    match event_type {
        "message_start" => {
            if let Some(msg) = event.get("message") {
                state.response_id = format!(
                    "chatcmpl-{}",
                    msg.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")
                );
                state.model = msg
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or(ctx.model)
                    .to_string();
                state.created = chrono::Utc::now().timestamp();
                state.current_tool_call_index = -1;
                state.input_tokens = msg
                    .get("usage")
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
            }

            chunks.push(chunk(
                state,
                json!({"role": "assistant", "content": ""}),
                None,
                None,
            )?);
            state.sent_role = true;
        }

        "content_block_start" => {
            if let Some(cb) = event.get("content_block")
                && cb.get("type").and_then(|t| t.as_str()) == Some("tool_use")
            {
                state.current_tool_call_index += 1;
                let tc_id = cb.get("id").and_then(|v| v.as_str()).unwrap_or("");
                let name = cb.get("name").and_then(|v| v.as_str()).unwrap_or("");

                chunks.push(chunk(
                    state,
                    json!({
                        "tool_calls": [{
                            "index": state.current_tool_call_index,
                            "id": tc_id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""},
                        }],
                    }),
                    None,
                    None,
                )?);
            }
        }

        "content_block_delta" => {
            if let Some(delta) = event.get("delta") {
                match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text_delta" => {
                        let text = delta.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        chunks.push(chunk(state, json!({"content": text}), None, None)?);
                    }
                    "thinking_delta" => {
                        let t = delta.get("thinking").and_then(|t| t.as_str()).unwrap_or("");
                        chunks.push(chunk(state, json!({"reasoning_content": t}), None, None)?);
                    }
                    "input_json_delta" => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|t| t.as_str())
                            .unwrap_or("");
                        chunks.push(chunk(
                            state,
                            json!({
                                "tool_calls": [{
                                    "index": state.current_tool_call_index,
                                    "function": {"arguments": partial},
                                }],
                            }),
                            None,
                            None,
                        )?);
                    }
                    _ => {}
                }
            }
        }

        "message_delta" => {
            if let Some(delta) = event.get("delta") {
                let finish_reason =
                    map_finish_reason(delta.get("stop_reason").and_then(|v| v.as_str()));

                let usage = event.get("usage").map(|usage| {
                    let output = usage
                        .get("output_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    json!({
                        "prompt_tokens": state.input_tokens,
                        "completion_tokens": output,
                        "total_tokens": state.input_tokens + output,
                    })
                });

                state.finish_sent = true;
                chunks.push(chunk(state, json!({}), Some(finish_reason), usage)?);
            }
        }

        "message_stop" => {
            if !state.done_sent {
                state.done_sent = true;
                chunks.push("[DONE]".to_string());
            }
        }

        // ping, content_block_stop, etc.
        _ => {}
    }

    Ok(chunks)
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

fn map_finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TranslateContext<'static> {
        TranslateContext {
            model: "claude-sonnet-4-5",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn test_request_basic_round_trip() {
        let req = json!({
            "model": "claude-sonnet-4-5",
            "system": "you are terse",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "let me think"},
                    {"type": "text", "text": "hello"},
                    {"type": "tool_use", "id": "toolu_1", "name": "calc", "input": {"a": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "2"}
                ]}
            ],
            "max_tokens": 50,
            "thinking": {"type": "enabled", "budget_tokens": 32768}
        });
        let out = translate_request("glm-4.5", req.to_string().as_bytes(), false).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let messages = v["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["reasoning_content"], "let me think");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "toolu_1");
        assert_eq!(v["reasoning_effort"], "high");
        assert_eq!(v["model"], "glm-4.5");
    }

    #[test]
    fn test_request_image_block() {
        let req = json!({
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "QkFTRQ=="}}
            ]}],
        });
        let out = translate_request("m", req.to_string().as_bytes(), false).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            v["messages"][0]["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,QkFTRQ=="
        );
    }

    #[test]
    fn test_non_stream_blocks() {
        let resp = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "thinking", "thinking": "mull"},
                {"type": "text", "text": "result"},
                {"type": "tool_use", "id": "toolu_2", "name": "f", "input": {}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 4, "output_tokens": 6, "cache_read_input_tokens": 2}
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        let message = &v["choices"][0]["message"];
        assert_eq!(message["content"], "result");
        assert_eq!(message["reasoning_content"], "mull");
        assert_eq!(message["tool_calls"][0]["id"], "toolu_2");
        assert_eq!(v["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(v["usage"]["prompt_tokens_details"]["cached_tokens"], 2);
    }

    #[test]
    fn test_stream_lifecycle() {
        let mut state = StreamState::default();
        let mut all = Vec::new();
        let events: Vec<(&str, Value)> = vec![
            (
                "message_start",
                json!({"type": "message_start", "message": {
                    "id": "msg_x", "model": "claude-sonnet-4-5",
                    "usage": {"input_tokens": 9}
                }}),
            ),
            (
                "content_block_start",
                json!({"type": "content_block_start", "index": 0,
                       "content_block": {"type": "text", "text": ""}}),
            ),
            (
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "text_delta", "text": "hey"}}),
            ),
            (
                "message_delta",
                json!({"type": "message_delta",
                       "delta": {"stop_reason": "end_turn"},
                       "usage": {"output_tokens": 3}}),
            ),
            ("message_stop", json!({"type": "message_stop"})),
        ];
        for (event, data) in events {
            all.extend(
                translate_stream(&ctx(), Some(event), data.to_string().as_bytes(), &mut state)
                    .unwrap(),
            );
        }
        assert_eq!(all.len(), 4); // role, text, finish, [DONE]
        let finish: Value = serde_json::from_str(&all[2]).unwrap();
        assert_eq!(finish["usage"]["prompt_tokens"], 9);
        assert_eq!(finish["usage"]["total_tokens"], 12);
        assert_eq!(all[3], "[DONE]");

        // Executor-level DONE flush after message_stop is a no-op.
        assert!(translate_stream(&ctx(), None, DONE, &mut state).unwrap().is_empty());
    }

    #[test]
    fn test_stream_event_type_from_body() {
        // Codex WS-style delivery: data-only frames, type in the JSON.
        let mut state = StreamState::default();
        let data = json!({"type": "message_start", "message": {"id": "m", "model": "c"}});
        let out = translate_stream(&ctx(), None, data.to_string().as_bytes(), &mut state).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("assistant"));
    }
}
