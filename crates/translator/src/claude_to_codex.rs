use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a Claude Messages request into a Responses API request for
/// the Codex backend.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let req: Value = serde_json::from_slice(raw_json)?;

    let mut input: Vec<Value> = Vec::new();

    for msg in req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::Translation("missing messages field".to_string()))?
    {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match msg.get("content") {
            Some(Value::String(s)) => {
                input.push(message_item(role, json!([{
                    "type": if role == "assistant" { "output_text" } else { "input_text" },
                    "text": s,
                }])));
            }
            Some(Value::Array(blocks)) => {
                convert_blocks(role, blocks, &mut input);
            }
            _ => {}
        }
    }

    let mut codex_req = json!({
        "model": model,
        "input": input,
        "store": false,
    });

    match req.get("system") {
        Some(Value::String(s)) if !s.is_empty() => {
            codex_req["instructions"] = json!(s);
        }
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if !text.is_empty() {
                codex_req["instructions"] = json!(text.join("\n\n"));
            }
        }
        _ => {}
    }

    if let Some(max) = req.get("max_tokens") {
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
        codex_req["reasoning"] = json!({"effort": effort, "summary": "auto"});
    }
    if stream {
        codex_req["stream"] = Value::Bool(true);
    }

    serde_json::to_vec(&codex_req).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn message_item(role: &str, content: Value) -> Value {
    json!({
        "type": "message",
        "role": if role == "assistant" { "assistant" } else { "user" },
        "content": content,
    })
}

fn convert_blocks(role: &str, blocks: &[Value], input: &mut Vec<Value>) {
    let mut content: Vec<Value> = Vec::new();
    let text_type = if role == "assistant" {
        "output_text"
    } else {
        "input_text"
    };

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "text" => {
                content.push(json!({
                    "type": text_type,
                    "text": block.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                }));
            }
            "image" => {
                if let Some(source) = block.get("source")
                    && source.get("type").and_then(|t| t.as_str()) == Some("base64")
                {
                    let media = source
                        .get("media_type")
                        .and_then(|m| m.as_str())
                        .unwrap_or("image/png");
                    let data = source.get("data").and_then(|d| d.as_str()).unwrap_or("");
                    content.push(json!({
                        "type": "input_image",
                        "image_url": format!("data:{media};base64,{data}"),
                    }));
                }
            }
            "tool_use" => {
                if !content.is_empty() {
                    input.push(message_item(role, Value::Array(std::mem::take(&mut content))));
                }
                input.push(json!({
                    "type": "function_call",
                    "call_id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                    "name": block.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                    "arguments": serde_json::to_string(
                        block.get("input").unwrap_or(&json!({}))
                    )
                    .unwrap_or_default(),
                }));
            }
            "tool_result" => {
                if !content.is_empty() {
                    input.push(message_item(role, Value::Array(std::mem::take(&mut content))));
                }
                let output = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(inner)) => inner
                        .iter()
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                    "output": output,
                }));
            }
            // Thinking blocks are model output replayed as history; the
            // Responses backend regenerates reasoning itself.
            _ => {}
        }
    }

    if !content.is_empty() {
        input.push(message_item(role, Value::Array(content)));
    }
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let out: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "name": name,
                "description": tool.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                "parameters": tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or(json!({"type": "object", "properties": {}})),
                "strict": false,
            }))
        })
        .collect();
    if out.is_empty() { None } else { Some(Value::Array(out)) }
}

fn convert_tool_choice(tc: &Value) -> Value {
    match tc.get("type").and_then(|t| t.as_str()) {
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => json!({
            "type": "function",
            "name": tc.get("name").and_then(|n| n.as_str()).unwrap_or(""),
        }),
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
    fn test_history_with_tools() {
        let out = translate(json!({
            "system": "project rules",
            "messages": [
                {"role": "user", "content": "fix the bug"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "scan first"},
                    {"type": "text", "text": "on it"},
                    {"type": "tool_use", "id": "toolu_5", "name": "shell", "input": {"cmd": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_5", "content": "src lib"}
                ]}
            ],
            "max_tokens": 128,
            "thinking": {"type": "enabled", "budget_tokens": 800}
        }));
        assert_eq!(out["instructions"], "project rules");
        assert_eq!(out["reasoning"]["effort"], "low");
        assert_eq!(out["max_output_tokens"], 128);

        let input = out["input"].as_array().unwrap();
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["content"][0]["type"], "output_text");
        assert_eq!(input[2]["type"], "function_call");
        assert_eq!(input[2]["call_id"], "toolu_5");
        assert_eq!(input[3]["type"], "function_call_output");
        assert_eq!(input[3]["output"], "src lib");
    }

    #[test]
    fn test_tool_declarations() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"name": "grep", "description": "search", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"}
        }));
        assert_eq!(out["tools"][0]["name"], "grep");
        assert_eq!(out["tool_choice"], "required");
    }
}
