use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate an OpenAI Chat Completions request into a Responses API
/// request for the Codex backend.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let req: Value = serde_json::from_slice(raw_json)?;

    let messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::Translation("missing messages field".to_string()))?;

    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");

        match role {
            "system" | "developer" => {
                if let Some(text) = msg.get("content").and_then(|c| c.as_str()) {
                    instructions.push(text.to_string());
                }
            }
            "tool" => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": msg
                        .get("tool_call_id")
                        .or_else(|| msg.get("call_id"))
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                    "output": msg.get("content").and_then(|c| c.as_str()).unwrap_or(""),
                }));
            }
            "assistant" => {
                let mut content: Vec<Value> = Vec::new();
                if let Some(text) = msg.get("content").and_then(|c| c.as_str())
                    && !text.is_empty()
                {
                    content.push(json!({"type": "output_text", "text": text}));
                }
                if !content.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": content,
                    }));
                }
                if let Some(tool_calls) = msg.get("tool_calls").and_then(|tc| tc.as_array()) {
                    for tc in tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": tc.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                            "name": tc
                                .get("function")
                                .and_then(|f| f.get("name"))
                                .and_then(|n| n.as_str())
                                .unwrap_or(""),
                            "arguments": tc
                                .get("function")
                                .and_then(|f| f.get("arguments"))
                                .and_then(|a| a.as_str())
                                .unwrap_or("{}"),
                        }));
                    }
                }
            }
            _ => {
                input.push(json!({
                    "type": "message",
                    "role": "user",
                    "content": convert_user_content(msg.get("content")),
                }));
            }
        }
    }

    let mut codex_req = json!({
        "model": model,
        "input": input,
        "store": false,
    });

    if !instructions.is_empty() {
        codex_req["instructions"] = json!(instructions.join("\n\n"));
    }
    if let Some(max) = req.get("max_tokens").or_else(|| req.get("max_completion_tokens")) {
        codex_req["max_output_tokens"] = max.clone();
    }
    if let Some(temp) = req.get("temperature") {
        codex_req["temperature"] = temp.clone();
    }
    if let Some(top_p) = req.get("top_p") {
        codex_req["top_p"] = top_p.clone();
    }
    if let Some(tools) = convert_tools(&req) {
        codex_req["tools"] = tools;
    }
    if let Some(tc) = req.get("tool_choice") {
        codex_req["tool_choice"] = convert_tool_choice(tc);
    }
    if let Some(effort) = req.get("reasoning_effort").and_then(|e| e.as_str()) {
        codex_req["reasoning"] = json!({"effort": effort, "summary": "auto"});
    }
    if let Some(parallel) = req.get("parallel_tool_calls") {
        codex_req["parallel_tool_calls"] = parallel.clone();
    }
    if stream {
        codex_req["stream"] = Value::Bool(true);
    }

    serde_json::to_vec(&codex_req).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Requests already in Responses form map onto Codex verbatim, apart from
/// the resolved model name.
pub fn translate_responses_request(
    model: &str,
    raw_json: &[u8],
    stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let mut req: Value = serde_json::from_slice(raw_json)?;
    if let Some(obj) = req.as_object_mut() {
        obj.insert("model".into(), json!(model));
        if stream {
            obj.insert("stream".into(), json!(true));
        }
    }
    serde_json::to_vec(&req).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn convert_user_content(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => json!([{"type": "input_text", "text": s}]),
        Some(Value::Array(parts)) => {
            let mut out = Vec::new();
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        out.push(json!({
                            "type": "input_text",
                            "text": part.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                        }));
                    }
                    "image_url" => {
                        if let Some(url) = part
                            .get("image_url")
                            .and_then(|u| u.get("url"))
                            .and_then(|u| u.as_str())
                        {
                            out.push(json!({"type": "input_image", "image_url": url}));
                        }
                    }
                    _ => {}
                }
            }
            Value::Array(out)
        }
        _ => json!([]),
    }
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let out: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let func = tool.get("function")?;
            let name = func.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "name": name,
                "description": func.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                "parameters": func
                    .get("parameters")
                    .cloned()
                    .unwrap_or(json!({"type": "object", "properties": {}})),
                "strict": false,
            }))
        })
        .collect();
    if out.is_empty() { None } else { Some(Value::Array(out)) }
}

fn convert_tool_choice(tc: &Value) -> Value {
    match tc {
        Value::String(_) => tc.clone(),
        Value::Object(obj) => {
            if let Some(name) = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                return json!({"type": "function", "name": name});
            }
            json!("auto")
        }
        _ => json!("auto"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(req: Value) -> Value {
        let out = translate_request("gpt-5-codex", req.to_string().as_bytes(), true).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_messages_to_input_items() {
        let out = translate(json!({
            "messages": [
                {"role": "system", "content": "rules"},
                {"role": "user", "content": "do the thing"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_5",
                    "function": {"name": "apply_patch", "arguments": "{\"p\":1}"}
                }]},
                {"role": "tool", "tool_call_id": "call_5", "content": "done"}
            ],
            "max_tokens": 64
        }));
        assert_eq!(out["model"], "gpt-5-codex");
        assert_eq!(out["instructions"], "rules");
        assert_eq!(out["max_output_tokens"], 64);
        assert_eq!(out["stream"], true);
        assert_eq!(out["store"], false);

        let input = out["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_5");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "done");
    }

    #[test]
    fn test_image_becomes_input_image() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,XX"}}
            ]}]
        }));
        assert_eq!(out["input"][0]["content"][0]["type"], "input_image");
    }

    #[test]
    fn test_tools_flattened() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"type": "function", "function": {
                "name": "shell", "description": "run", "parameters": {"type": "object"}
            }}],
            "reasoning_effort": "high"
        }));
        assert_eq!(out["tools"][0]["name"], "shell");
        assert!(out["tools"][0].get("function").is_none());
        assert_eq!(out["reasoning"]["effort"], "high");
    }

    #[test]
    fn test_responses_request_identity_with_model() {
        let raw = json!({"model": "alias", "input": [], "previous_response_id": "resp_1"});
        let out =
            translate_responses_request("gpt-5-codex", raw.to_string().as_bytes(), false).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "gpt-5-codex");
        assert_eq!(v["previous_response_id"], "resp_1");
    }
}
