use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate a Claude Messages request into a Gemini `generateContent`
/// request.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    _stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let req: Value = serde_json::from_slice(raw_json)?;
    let _ = model; // travels in the URL

    let mut gemini_req = json!({
        "contents": convert_messages(&req)?,
    });

    if let Some(si) = convert_system(&req) {
        gemini_req["systemInstruction"] = si;
    }
    if let Some(gc) = build_generation_config(&req) {
        gemini_req["generationConfig"] = gc;
    }
    if let Some(tools) = convert_tools(&req) {
        gemini_req["tools"] = tools;
    }
    if let Some(tc) = convert_tool_choice(&req) {
        gemini_req["toolConfig"] = tc;
    }

    serde_json::to_vec(&gemini_req).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn convert_system(req: &Value) -> Option<Value> {
    let parts = match req.get("system")? {
        Value::String(s) if !s.is_empty() => vec![json!({"text": s})],
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .map(|t| json!({"text": t}))
            .collect(),
        _ => return None,
    };
    if parts.is_empty() {
        None
    } else {
        Some(json!({"parts": parts}))
    }
}

fn convert_messages(req: &Value) -> Result<Vec<Value>, ProxyError> {
    let messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::Translation("missing messages field".to_string()))?;

    let mut contents: Vec<Value> = Vec::new();

    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let gemini_role = if role == "assistant" { "model" } else { "user" };

        let parts = match msg.get("content") {
            Some(Value::String(s)) => vec![json!({"text": s})],
            Some(Value::Array(blocks)) => convert_blocks(blocks),
            _ => vec![],
        };
        if parts.is_empty() {
            continue;
        }

        if let Some(last) = contents.last_mut()
            && last.get("role").and_then(|r: &Value| r.as_str()) == Some(gemini_role)
            && let Some(existing) = last.get_mut("parts").and_then(|p| p.as_array_mut())
        {
            existing.extend(parts);
            continue;
        }

        contents.push(json!({"role": gemini_role, "parts": parts}));
    }

    Ok(contents)
}

fn convert_blocks(blocks: &[Value]) -> Vec<Value> {
    let mut parts = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "text" => {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                parts.push(json!({"text": text}));
            }
            "thinking" => {
                let text = block.get("thinking").and_then(|t| t.as_str()).unwrap_or("");
                let mut part = json!({"text": text, "thought": true});
                if let Some(sig) = block.get("signature").and_then(|s| s.as_str()) {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            "image" => {
                if let Some(source) = block.get("source")
                    && source.get("type").and_then(|t| t.as_str()) == Some("base64")
                {
                    parts.push(json!({
                        "inlineData": {
                            "mimeType": source
                                .get("media_type")
                                .and_then(|m| m.as_str())
                                .unwrap_or("image/png"),
                            "data": source.get("data").and_then(|d| d.as_str()).unwrap_or(""),
                        }
                    }));
                }
            }
            "tool_use" => {
                parts.push(json!({
                    "functionCall": {
                        "name": block.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "args": block.get("input").cloned().unwrap_or(json!({})),
                    }
                }));
            }
            "tool_result" => {
                let content = match block.get("content") {
                    Some(Value::String(s)) => {
                        serde_json::from_str(s).unwrap_or(json!({"result": s}))
                    }
                    Some(Value::Array(inner)) => {
                        let text: Vec<&str> = inner
                            .iter()
                            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                            .collect();
                        json!({"result": text.join("\n")})
                    }
                    _ => json!({}),
                };
                // Gemini matches responses by function name, not call id;
                // the name is unknown here, so reuse the tool_use_id.
                parts.push(json!({
                    "functionResponse": {
                        "name": block
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("function"),
                        "response": content,
                    }
                }));
            }
            _ => {}
        }
    }
    parts
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let declarations: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            let mut decl = json!({
                "name": name,
                "description": tool.get("description").and_then(|d| d.as_str()).unwrap_or(""),
            });
            if let Some(schema) = tool.get("input_schema") {
                decl["parameters"] = schema.clone();
            }
            Some(decl)
        })
        .collect();
    if declarations.is_empty() {
        None
    } else {
        Some(json!([{"functionDeclarations": declarations}]))
    }
}

fn convert_tool_choice(req: &Value) -> Option<Value> {
    let tc = req.get("tool_choice")?;
    let config = match tc.get("type").and_then(|t| t.as_str())? {
        "none" => json!({"mode": "NONE"}),
        "any" => json!({"mode": "ANY"}),
        "tool" => {
            let name = tc.get("name").and_then(|n| n.as_str())?;
            json!({"mode": "ANY", "allowedFunctionNames": [name]})
        }
        _ => json!({"mode": "AUTO"}),
    };
    Some(json!({"functionCallingConfig": config}))
}

fn build_generation_config(req: &Value) -> Option<Value> {
    let mut config = json!({});
    let mut has_any = false;

    if let Some(max) = req.get("max_tokens") {
        config["maxOutputTokens"] = max.clone();
        has_any = true;
    }
    if let Some(temp) = req.get("temperature") {
        config["temperature"] = temp.clone();
        has_any = true;
    }
    if let Some(top_p) = req.get("top_p") {
        config["topP"] = top_p.clone();
        has_any = true;
    }
    if let Some(top_k) = req.get("top_k") {
        config["topK"] = top_k.clone();
        has_any = true;
    }
    if let Some(stop) = req.get("stop_sequences") {
        config["stopSequences"] = stop.clone();
        has_any = true;
    }
    if let Some(thinking) = req.get("thinking")
        && thinking.get("type").and_then(|t| t.as_str()) == Some("enabled")
    {
        let budget = thinking
            .get("budget_tokens")
            .and_then(|b| b.as_i64())
            .unwrap_or(8192);
        config["thinkingConfig"] = json!({"thinkingBudget": budget, "includeThoughts": true});
        has_any = true;
    }

    if has_any { Some(config) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(req: Value) -> Value {
        let out = translate_request("gemini-2.5-pro", req.to_string().as_bytes(), false).unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_system_and_thinking_config() {
        let out = translate(json!({
            "system": "stay focused",
            "messages": [{"role": "user", "content": "q"}],
            "max_tokens": 2048,
            "thinking": {"type": "enabled", "budget_tokens": 4096}
        }));
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "stay focused");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(
            out["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            4096
        );
    }

    #[test]
    fn test_tool_use_and_result() {
        let out = translate(json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "plan", "signature": "sig=="},
                    {"type": "tool_use", "id": "toolu_1", "name": "grep", "input": {"pattern": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "{\"hits\":3}"}
                ]}
            ]
        }));
        let model_parts = out["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(model_parts[0]["thought"], true);
        assert_eq!(model_parts[0]["thoughtSignature"], "sig==");
        assert_eq!(model_parts[1]["functionCall"]["name"], "grep");
        let user_parts = out["contents"][1]["parts"].as_array().unwrap();
        assert_eq!(user_parts[0]["functionResponse"]["response"]["hits"], 3);
    }

    #[test]
    fn test_image_inline_data() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/webp", "data": "AA=="}}
            ]}]
        }));
        assert_eq!(
            out["contents"][0]["parts"][0]["inlineData"]["mimeType"],
            "image/webp"
        );
    }

    #[test]
    fn test_tool_choice_any() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": "x"}],
            "tool_choice": {"type": "any"}
        }));
        assert_eq!(out["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
    }
}
