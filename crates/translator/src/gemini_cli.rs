use crate::{DONE, StreamState, TranslateContext};
use manifold_core::error::ProxyError;
use serde_json::{Value, json};

/// Unwrap a Gemini-CLI envelope (`{"model": ..., "request": {...}}`) into
/// a plain Gemini `generateContent` request. Payloads that already look
/// like plain Gemini pass through with the model dropped.
pub fn translate_request(
    model: &str,
    raw_json: &[u8],
    _stream: bool,
) -> Result<Vec<u8>, ProxyError> {
    let mut envelope: Value = serde_json::from_slice(raw_json)?;
    let _ = model; // travels in the URL

    let inner = match envelope.get_mut("request") {
        Some(request) => request.take(),
        None => {
            if let Some(obj) = envelope.as_object_mut() {
                obj.remove("model");
            }
            envelope
        }
    };

    serde_json::to_vec(&inner).map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Wrap a complete Gemini response back into the CLI envelope.
pub fn translate_non_stream(
    _ctx: &TranslateContext,
    data: &[u8],
) -> Result<String, ProxyError> {
    let resp: Value = serde_json::from_slice(data)?;
    serde_json::to_string(&json!({"response": resp}))
        .map_err(|e| ProxyError::Translation(e.to_string()))
}

/// Wrap each Gemini stream chunk in the CLI envelope.
pub fn translate_stream(
    _ctx: &TranslateContext,
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
    let chunk: Value = serde_json::from_slice(data)?;
    // Chunks already enveloped (e.g. from an internal endpoint) stay as-is.
    let wrapped = if chunk.get("response").is_some() {
        chunk
    } else {
        json!({"response": chunk})
    };
    Ok(vec![
        serde_json::to_string(&wrapped).map_err(|e| ProxyError::Translation(e.to_string()))?,
    ])
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
    fn test_request_unwraps_envelope() {
        let raw = json!({
            "model": "gemini-2.5-pro",
            "request": {"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}
        });
        let out = translate_request("gemini-2.5-pro", raw.to_string().as_bytes(), false).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert!(v.get("request").is_none());
        assert_eq!(v["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_request_plain_payload_passthrough() {
        let raw = json!({"model": "m", "contents": []});
        let out = translate_request("m", raw.to_string().as_bytes(), false).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert!(v.get("model").is_none());
        assert!(v.get("contents").is_some());
    }

    #[test]
    fn test_response_wrapped() {
        let resp = json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}}]});
        let out = translate_non_stream(&ctx(), resp.to_string().as_bytes()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["response"]["candidates"][0]["content"]["parts"][0]["text"], "ok");
    }

    #[test]
    fn test_stream_chunk_wrapped_once() {
        let mut state = StreamState::default();
        let chunk = json!({"candidates": []});
        let out =
            translate_stream(&ctx(), None, chunk.to_string().as_bytes(), &mut state).unwrap();
        let v: Value = serde_json::from_str(&out[0]).unwrap();
        assert!(v.get("response").is_some());

        let enveloped = json!({"response": {"candidates": []}});
        let out =
            translate_stream(&ctx(), None, enveloped.to_string().as_bytes(), &mut state).unwrap();
        let v: Value = serde_json::from_str(&out[0]).unwrap();
        assert!(v["response"].get("response").is_none());
    }
}
