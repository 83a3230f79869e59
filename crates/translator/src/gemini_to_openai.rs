use crate::{DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a complete Gemini response into an OpenAI chat completion.
pub fn translate_non_stream(
    ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;
    let created = chrono::Utc::now().timestamp();
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    let model = resp
        .get("modelVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(ctx.model)
        .to_string();

    let candidate = resp
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first());

    let mut text_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = "stop";

    if let Some(candidate) = candidate {
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());

        if let Some(parts) = parts {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                        reasoning_parts.push(text.to_string());
                    } else {
                        text_parts.push(text.to_string());
                    }
                } else if let Some(fc) = part.get("functionCall") {
                    let name = fc.get("name").and_then(|n| n.as_str()).unwrap_or("");
                    let args = fc.get("args").cloned().unwrap_or(json!({}));
                    let arguments = serde_json::to_string(&args).unwrap_or_default();

                    tool_calls.push(json!({
                        "id": format!("call_{}", uuid::Uuid::new_v4()),
                        "type": "function",
                        "function": {"name": name, "arguments": arguments},
                        "index": tool_calls.len(),
                    }));
                }
            }
        }

        finish_reason = map_finish_reason(
            candidate.get("finishReason").and_then(|v| v.as_str()),
            !tool_calls.is_empty(),
        );
    }

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

    if let Some(usage) = convert_usage(&resp) {
        openai_resp["usage"] = usage;
    }

    serde_json::to_string(&openai_resp).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Translate one Gemini stream chunk into OpenAI chat completion chunks.
pub fn translate_stream(
    ctx: &TranslateContext,
    _event_type: Option<&str>,
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

    let resp: Value = serde_json::from_slice(data)?;
    let mut chunks = Vec::new();

    if state.response_id.is_empty() {
        state.response_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        state.created = chrono::Utc::now().timestamp();
        state.model = ctx.model.to_string();
        state.current_tool_call_index = -1;

        chunks.push(self::chunk(
            state,
            json!({"role": "assistant", "content": ""}),
            None,
            None,
        )?);
        state.sent_role = true;
    }

    if let Some(model_ver) = resp.get("modelVersion").and_then(|v| v.as_str()) {
        state.model = model_ver.to_string();
    }

    let candidate = resp
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first());

    let mut saw_tool_call = false;
    if let Some(candidate) = candidate {
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());

        if let Some(parts) = parts {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    let delta = if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                        json!({"reasoning_content": text})
                    } else {
                        json!({"content": text})
                    };
                    chunks.push(self::chunk(state, delta, None, None)?);
                } else if let Some(fc) = part.get("functionCall") {
                    saw_tool_call = true;
                    state.current_tool_call_index += 1;
                    let name = fc.get("name").and_then(|n| n.as_str()).unwrap_or("");
                    let args = fc.get("args").cloned().unwrap_or(json!({}));
                    let arguments = serde_json::to_string(&args).unwrap_or_default();

                    let delta = json!({
                        "tool_calls": [{
                            "index": state.current_tool_call_index,
                            "id": format!("call_{}", uuid::Uuid::new_v4()),
                            "type": "function",
                            "function": {"name": name, "arguments": arguments},
                        }],
                    });
                    chunks.push(self::chunk(state, delta, None, None)?);
                }
            }
        }

        if let Some(finish) = candidate.get("finishReason").and_then(|v| v.as_str())
            && !state.finish_sent
        {
            state.finish_sent = true;
            let finish_reason = map_finish_reason(Some(finish), saw_tool_call);
            let usage = convert_usage(&resp);
            chunks.push(self::chunk(
                state,
                json!({}),
                Some(finish_reason),
                usage,
            )?);
        }
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

fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_calls";
    }
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") => "content_filter",
        _ => "stop",
    }
}

fn convert_usage(resp: &Value) -> Option<Value> {
    let u = resp.get("usageMetadata")?;
    let prompt = u
        .get("promptTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = u
        .get("candidatesTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let reasoning = u
        .get("thoughtsTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let cached = u
        .get("cachedContentTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total = u
        .get("totalTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt + completion + reasoning);

    let mut usage = json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion + reasoning,
        "total_tokens": total,
    });
    if reasoning > 0 {
        usage["completion_tokens_details"] = json!({"reasoning_tokens": reasoning});
    }
    if cached > 0 {
        usage["prompt_tokens_details"] = json!({"cached_tokens": cached});
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
    fn test_non_stream_text_and_usage() {
        let resp = json!({
            "candidates": [{
                "content": {"parts": [{"text": "hello"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["choices"][0]["message"]["content"], "hello");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(v["usage"]["prompt_tokens"], 3);
        assert_eq!(v["usage"]["total_tokens"], 5);
    }

    #[test]
    fn test_non_stream_thought_parts() {
        let resp = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "answer"}
                ]},
                "finishReason": "STOP"
            }]
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["choices"][0]["message"]["reasoning_content"], "thinking...");
        assert_eq!(v["choices"][0]["message"]["content"], "answer");
    }

    #[test]
    fn test_non_stream_function_call() {
        let resp = json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "get_weather", "args": {"city": "SF"}}}]},
                "finishReason": "STOP"
            }]
        });
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        let tc = &v["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(tc["function"]["name"], "get_weather");
        assert_eq!(v["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_stream_role_then_content_then_finish() {
        let mut state = StreamState::default();
        let chunk1 = json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]});
        let out1 = translate_stream(&ctx(), None, chunk1.to_string().as_bytes(), &mut state).unwrap();
        assert_eq!(out1.len(), 2); // role chunk + content chunk
        let role: Value = serde_json::from_str(&out1[0]).unwrap();
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");

        let chunk2 = json!({
            "candidates": [{"finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1, "totalTokenCount": 2}
        });
        let out2 = translate_stream(&ctx(), None, chunk2.to_string().as_bytes(), &mut state).unwrap();
        let finish: Value = serde_json::from_str(&out2[0]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["usage"]["total_tokens"], 2);

        let done = translate_stream(&ctx(), None, DONE, &mut state).unwrap();
        assert_eq!(done, vec!["[DONE]".to_string()]);
        // A duplicate DONE flush emits nothing.
        assert!(translate_stream(&ctx(), None, DONE, &mut state).unwrap().is_empty());
    }

    #[test]
    fn test_stream_ids_stable_across_chunks() {
        let mut state = StreamState::default();
        let chunk = json!({"candidates": [{"content": {"parts": [{"text": "a"}]}}]});
        let out1 = translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap();
        let out2 = translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap();
        let first: Value = serde_json::from_str(&out1[1]).unwrap();
        let second: Value = serde_json::from_str(&out2[0]).unwrap();
        assert_eq!(first["id"], second["id"]);
    }
}
