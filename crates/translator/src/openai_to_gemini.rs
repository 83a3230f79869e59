use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Translate an OpenAI Chat Completions request into a Gemini
/// `generateContent` request.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    _stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let req: Value = serde_json::from_slice(raw_json)?;

    let system_instruction = extract_system_instruction(&req);
    let contents = convert_messages(&req)?;
    let tools = convert_tools(&req);
    let tool_config = convert_tool_choice(&req);
    let generation_config = build_generation_config(&req);

    // The model travels in the URL for Gemini, not in the body.
    let _ = model;

    let mut gemini_req = json!({
        "contents": contents,
    });

    if let Some(si) = system_instruction {
        gemini_req["systemInstruction"] = si;
    }
    if let Some(gc) = generation_config {
        gemini_req["generationConfig"] = gc;
    }
    if let Some(tools) = tools {
        gemini_req["tools"] = tools;
    }
    if let Some(tc) = tool_config {
        gemini_req["toolConfig"] = tc;
    }

    serde_json::to_vec(&gemini_req).map_err(|e| ProxyError::Translation(e.to_string()))
}

fn extract_system_instruction(req: &Value) -> Option<Value> {
    let messages = req.get("messages")?.as_array()?;
    let mut system_parts = Vec::new();

    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str());
        if role != Some("system") && role != Some("developer") {
            continue;
        }
        match msg.get("content") {
            Some(Value::String(s)) => system_parts.push(json!({"text": s})),
            Some(Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        system_parts.push(json!({"text": text}));
                    }
                }
            }
            _ => {}
        }
    }

    if system_parts.is_empty() {
        None
    } else {
        Some(json!({"parts": system_parts}))
    }
}

fn convert_messages(req: &Value) -> Result<Vec<Value>, ProxyError> {
    let messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| ProxyError::Translation("missing messages field".to_string()))?;

    let mut contents: Vec<Value> = Vec::new();

    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");

        if role == "system" || role == "developer" {
            continue;
        }

        if role == "tool" {
            let name = msg
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("function");
            let content_text = msg.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let response_val = serde_json::from_str::<Value>(content_text)
                .unwrap_or(json!({"result": content_text}));

            let part = json!({
                "functionResponse": {
                    "name": name,
                    "response": response_val,
                }
            });

            // Tool results ride in a user turn; merge into the previous one
            // when possible.
            if let Some(last) = contents.last_mut()
                && last.get("role").and_then(|r: &Value| r.as_str()) == Some("user")
                && let Some(parts) = last.get_mut("parts").and_then(|p| p.as_array_mut())
            {
                parts.push(part);
                continue;
            }

            contents.push(json!({"role": "user", "parts": [part]}));
            continue;
        }

        let gemini_role = match role {
            "assistant" => "model",
            _ => "user",
        };

        let parts = convert_content_to_parts(msg)?;

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

fn convert_content_to_parts(msg: &Value) -> Result<Vec<Value>, ProxyError> {
    let mut parts = Vec::new();

    // Assistant reasoning replayed from history becomes a thought part.
    if let Some(reasoning) = msg.get("reasoning_content").and_then(|r| r.as_str())
        && !reasoning.is_empty()
    {
        parts.push(json!({"text": reasoning, "thought": true}));
    }

    if let Some(content) = msg.get("content") {
        match content {
            Value::String(s) => {
                parts.push(json!({"text": s}));
            }
            Value::Array(content_parts) => {
                for part in content_parts {
                    let part_type = part.get("type").and_then(|t| t.as_str()).unwrap_or("");
                    match part_type {
                        "text" => {
                            let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                            parts.push(json!({"text": text}));
                        }
                        "image_url" => {
                            if let Some(url_obj) = part.get("image_url") {
                                let url =
                                    url_obj.get("url").and_then(|u| u.as_str()).unwrap_or("");
                                if let Some(inline) = convert_image_url_to_inline(url) {
                                    parts.push(inline);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(tool_calls) = msg.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
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
            let args: Value = serde_json::from_str(arguments_str).unwrap_or(json!({}));

            parts.push(json!({
                "functionCall": {
                    "name": name,
                    "args": args,
                }
            }));
        }
    }

    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    }

    Ok(parts)
}

fn convert_image_url_to_inline(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let parts: Vec<&str> = rest.splitn(2, ',').collect();
        if parts.len() == 2 {
            let mime_type = parts[0].split(';').next().unwrap_or("image/png");
            return Some(json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": parts[1],
                }
            }));
        }
    }
    // Gemini has no URL image source; keep a textual reference.
    Some(json!({"text": format!("[image: {url}]")}))
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let mut function_declarations = Vec::new();

    for tool in tools {
        if let Some(func) = tool.get("function") {
            let name = func.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let description = func
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("");

            let mut decl = json!({
                "name": name,
                "description": description,
            });
            if let Some(params) = func.get("parameters") {
                decl["parameters"] = params.clone();
            }

            function_declarations.push(decl);
        }
    }

    if function_declarations.is_empty() {
        None
    } else {
        Some(json!([{"functionDeclarations": function_declarations}]))
    }
}

fn convert_tool_choice(req: &Value) -> Option<Value> {
    let tc = req.get("tool_choice")?;
    let config = match tc {
        Value::String(s) => match s.as_str() {
            "none" => json!({"mode": "NONE"}),
            "required" => json!({"mode": "ANY"}),
            _ => json!({"mode": "AUTO"}),
        },
        Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())?;
            json!({"mode": "ANY", "allowedFunctionNames": [name]})
        }
        _ => return None,
    };
    Some(json!({"functionCallingConfig": config}))
}

fn build_generation_config(req: &Value) -> Option<Value> {
    let mut config = json!({});
    let mut has_any = false;

    if let Some(temp) = req.get("temperature") {
        config["temperature"] = temp.clone();
        has_any = true;
    }
    if let Some(top_p) = req.get("top_p") {
        config["topP"] = top_p.clone();
        has_any = true;
    }
    if let Some(max) = req.get("max_tokens").or(req.get("max_completion_tokens")) {
        config["maxOutputTokens"] = max.clone();
        has_any = true;
    }
    if let Some(stop) = req.get("stop") {
        match stop {
            Value::String(s) => {
                config["stopSequences"] = json!([s]);
                has_any = true;
            }
            Value::Array(_) => {
                config["stopSequences"] = stop.clone();
                has_any = true;
            }
            _ => {}
        }
    }
    if let Some(effort) = req.get("reasoning_effort").and_then(|e| e.as_str()) {
        let budget = match effort {
            "low" => 1024,
            "high" => 24576,
            _ => 8192,
        };
        config["thinkingConfig"] = json!({"thinkingBudget": budget, "includeThoughts": true});
        has_any = true;
    }
    if let Some(rf) = req.get("response_format")
        && rf.get("type").and_then(|t| t.as_str()) == Some("json_schema")
    {
        config["responseMimeType"] = json!("application/json");
        if let Some(schema) = rf.get("json_schema").and_then(|s| s.get("schema")) {
            config["responseJsonSchema"] = schema.clone();
        }
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
    fn test_system_and_text() {
        let out = translate(json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ]
        }));
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["contents"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn test_tool_call_round_trip_shape() {
        let out = translate(json!({
            "messages": [
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "read_file", "arguments": "{\"path\":\"a\"}"}
                }]},
                {"role": "tool", "name": "read_file", "content": "{\"ok\":true}"}
            ]
        }));
        assert_eq!(
            out["contents"][0]["parts"][0]["functionCall"]["name"],
            "read_file"
        );
        assert_eq!(
            out["contents"][0]["parts"][0]["functionCall"]["args"]["path"],
            "a"
        );
        assert_eq!(
            out["contents"][1]["parts"][0]["functionResponse"]["response"]["ok"],
            true
        );
    }

    #[test]
    fn test_inline_image() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]}]
        }));
        let parts = out["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "AAAA");
    }

    #[test]
    fn test_tool_choice_forced() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": "x"}],
            "tool_choice": {"type": "function", "function": {"name": "search"}}
        }));
        assert_eq!(
            out["toolConfig"]["functionCallingConfig"]["mode"],
            "ANY"
        );
        assert_eq!(
            out["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0],
            "search"
        );
    }

    #[test]
    fn test_reasoning_effort_maps_to_budget() {
        let out = translate(json!({
            "messages": [{"role": "user", "content": "x"}],
            "reasoning_effort": "high"
        }));
        assert_eq!(
            out["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            24576
        );
    }

    #[test]
    fn test_consecutive_roles_merged() {
        let out = translate(json!({
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "user", "content": "b"}
            ]
        }));
        let contents = out["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
    }
}
