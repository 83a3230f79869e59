pub mod claude_to_codex;
pub mod claude_to_gemini;
pub mod claude_to_openai;
pub mod codex_to_claude;
pub mod codex_to_openai;
pub mod gemini_cli;
pub mod gemini_to_claude;
pub mod gemini_to_openai;
pub mod openai_to_claude;
pub mod openai_to_codex;
pub mod openai_to_gemini;

use manifold_core::error::ProxyError;
use manifold_core::executor::Format;
use std::collections::HashMap;
use std::sync::Arc;

/// Terminal sentinel handed to stream translators after upstream EOF so
/// they can emit their final flush.
pub const DONE: &[u8] = b"[DONE]";

/// Inputs shared by every response translation of one request.
pub struct TranslateContext<'a> {
    /// The resolved upstream model name.
    pub model: &'a str,
    /// The request exactly as the client sent it.
    pub original_request: &'a [u8],
    /// The request as sent upstream, after translation and rewriting.
    pub translated_request: &'a [u8],
}

/// Kind of the currently open Claude content block when translating *into*
/// Claude SSE framing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    #[default]
    None,
    Text,
    Thinking,
    ToolUse,
}

/// State accumulated over one stream translation. Owned by the invoking
/// stream; allocated once per stream and dropped when it ends. Multi-part
/// assembly (Claude content blocks, Gemini thought/text alternation, split
/// tool-call argument deltas) lives here, never in executors.
#[derive(Debug, Default)]
pub struct StreamState {
    pub response_id: String,
    pub model: String,
    pub created: i64,
    pub sent_role: bool,
    pub current_tool_call_index: i32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cached_tokens: u64,
    /// Claude-target framing: whether message_start has been emitted.
    pub message_started: bool,
    pub block_open: bool,
    pub block_kind: BlockKind,
    pub block_index: i32,
    /// Split tool-call assembly: id/name seen so far for the call in
    /// flight (continuation deltas may arrive with empty names).
    pub pending_tool_id: String,
    pub pending_tool_name: String,
    pub finish_sent: bool,
    pub done_sent: bool,
}

/// Translate a client-schema request into the upstream schema.
pub type RequestTransformFn =
    fn(model: &str, raw_json: &[u8], stream: bool) -> Result<Vec<u8>, ProxyError>;

/// Translate one upstream chunk (a single SSE data payload, or [`DONE`])
/// into zero or more client-schema lines. OpenAI/Gemini-target translators
/// return bare JSON payloads (plus a literal `[DONE]`); Claude-target
/// translators return fully framed `event: ...\ndata: ...` lines.
pub type StreamTransformFn = fn(
    ctx: &TranslateContext,
    event_type: Option<&str>,
    data: &[u8],
    state: &mut StreamState,
) -> Result<Vec<String>, ProxyError>;

/// Translate a complete upstream response body.
pub type NonStreamTransformFn =
    fn(ctx: &TranslateContext, data: &[u8]) -> Result<String, ProxyError>;

/// Render a token-count-only response in the client schema.
pub type TokenCountFn = fn(count: u64) -> String;

pub struct ResponseTransform {
    pub stream: StreamTransformFn,
    pub non_stream: NonStreamTransformFn,
    pub token_count: TokenCountFn,
}

pub struct TranslatorRegistry {
    requests: HashMap<(Format, Format), RequestTransformFn>,
    responses: HashMap<(Format, Format), ResponseTransform>,
}

impl Default for TranslatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        from: Format,
        to: Format,
        request: RequestTransformFn,
        response: ResponseTransform,
    ) {
        self.requests.insert((from, to), request);
        self.responses.insert((from, to), response);
    }

    /// Translate a request. Identity pairs still get the resolved model
    /// written into the payload; an unregistered pair passes the input
    /// bytes through.
    pub fn translate_request(
        &self,
        from: Format,
        to: Format,
        model: &str,
        raw_json: &[u8],
        stream: bool,
    ) -> Result<Vec<u8>, ProxyError> {
        if from == to {
            return replace_model_in_payload(raw_json, model);
        }
        match self.requests.get(&(from, to)) {
            Some(f) => f(model, raw_json, stream),
            None => Ok(raw_json.to_vec()),
        }
    }

    /// Translate a single stream chunk. Pairs are keyed `(client, upstream)`
    /// like requests: `from` is the client schema the output lines are in,
    /// `to` the upstream schema the chunk arrives in.
    pub fn translate_stream(
        &self,
        from: Format,
        to: Format,
        ctx: &TranslateContext,
        event_type: Option<&str>,
        data: &[u8],
        state: &mut StreamState,
    ) -> Result<Vec<String>, ProxyError> {
        if from == to {
            // The [DONE] flush is OpenAI-protocol framing; other identity
            // streams end on their own terminal events.
            if data == DONE {
                return Ok(match from {
                    Format::OpenAI | Format::OpenAIResponses => vec!["[DONE]".to_string()],
                    _ => vec![],
                });
            }
            let text = String::from_utf8_lossy(data).to_string();
            // Keep upstream event framing (Claude, Responses) intact.
            if let Some(event) = event_type {
                return Ok(vec![format!("event: {event}\ndata: {text}")]);
            }
            return Ok(vec![text]);
        }
        match self.responses.get(&(from, to)) {
            Some(rt) => (rt.stream)(ctx, event_type, data, state),
            None => Ok(vec![String::from_utf8_lossy(data).to_string()]),
        }
    }

    pub fn translate_non_stream(
        &self,
        from: Format,
        to: Format,
        ctx: &TranslateContext,
        data: &[u8],
    ) -> Result<String, ProxyError> {
        if from == to {
            return Ok(String::from_utf8_lossy(data).to_string());
        }
        match self.responses.get(&(from, to)) {
            Some(rt) => (rt.non_stream)(ctx, data),
            None => Ok(String::from_utf8_lossy(data).to_string()),
        }
    }

    /// Render a token count in the client schema for the given pair.
    pub fn translate_token_count(&self, from: Format, to: Format, count: u64) -> String {
        match self.responses.get(&(from, to)) {
            Some(rt) => (rt.token_count)(count),
            None => render_token_count_for(from, count),
        }
    }

    pub fn has_response_translator(&self, from: Format, to: Format) -> bool {
        from != to && self.responses.contains_key(&(from, to))
    }
}

/// Replace the `model` field in a JSON payload with the resolved model.
fn replace_model_in_payload(raw_json: &[u8], model: &str) -> Result<Vec<u8>, ProxyError> {
    let mut val: serde_json::Value = serde_json::from_slice(raw_json)?;
    if let Some(obj) = val.as_object_mut()
        && obj.contains_key("model")
    {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(model.to_string()),
        );
    }
    serde_json::to_vec(&val).map_err(|e| ProxyError::Translation(e.to_string()))
}

// ─── Token-count rendering ─────────────────────────────────────────────────

pub fn render_token_count_openai(count: u64) -> String {
    serde_json::json!({"object": "token_count", "total_tokens": count}).to_string()
}

pub fn render_token_count_claude(count: u64) -> String {
    serde_json::json!({"input_tokens": count}).to_string()
}

pub fn render_token_count_gemini(count: u64) -> String {
    serde_json::json!({"totalTokens": count}).to_string()
}

pub fn render_token_count_gemini_cli(count: u64) -> String {
    serde_json::json!({"response": {"totalTokens": count}}).to_string()
}

/// Fallback token-count rendering keyed only by the client schema.
pub fn render_token_count_for(format: Format, count: u64) -> String {
    match format {
        Format::Claude => render_token_count_claude(count),
        Format::Gemini | Format::Antigravity => render_token_count_gemini(count),
        Format::GeminiCli => render_token_count_gemini_cli(count),
        _ => render_token_count_openai(count),
    }
}

// ─── Pipeline ──────────────────────────────────────────────────────────────

pub type RequestHook =
    Box<dyn Fn(Format, Format, &str, Vec<u8>) -> Vec<u8> + Send + Sync>;
pub type ResponseHook = Box<dyn Fn(Format, Format, &str, String) -> String + Send + Sync>;

/// Wraps the registry with ordered middleware hooks around the terminal
/// translation calls. Request hooks see (and may rewrite) the translated
/// upstream payload; response hooks see each translated client line.
pub struct TranslationPipeline {
    registry: Arc<TranslatorRegistry>,
    request_hooks: Vec<RequestHook>,
    response_hooks: Vec<ResponseHook>,
}

impl TranslationPipeline {
    pub fn new(registry: Arc<TranslatorRegistry>) -> Self {
        Self {
            registry,
            request_hooks: Vec::new(),
            response_hooks: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TranslatorRegistry> {
        &self.registry
    }

    pub fn add_request_hook(&mut self, hook: RequestHook) {
        self.request_hooks.push(hook);
    }

    pub fn add_response_hook(&mut self, hook: ResponseHook) {
        self.response_hooks.push(hook);
    }

    pub fn translate_request(
        &self,
        from: Format,
        to: Format,
        model: &str,
        raw_json: &[u8],
        stream: bool,
    ) -> Result<Vec<u8>, ProxyError> {
        let mut payload = self
            .registry
            .translate_request(from, to, model, raw_json, stream)?;
        for hook in &self.request_hooks {
            payload = hook(from, to, model, payload);
        }
        Ok(payload)
    }

    pub fn translate_non_stream(
        &self,
        from: Format,
        to: Format,
        ctx: &TranslateContext,
        data: &[u8],
    ) -> Result<String, ProxyError> {
        let mut out = self.registry.translate_non_stream(from, to, ctx, data)?;
        for hook in &self.response_hooks {
            out = hook(from, to, ctx.model, out);
        }
        Ok(out)
    }

    pub fn translate_stream(
        &self,
        from: Format,
        to: Format,
        ctx: &TranslateContext,
        event_type: Option<&str>,
        data: &[u8],
        state: &mut StreamState,
    ) -> Result<Vec<String>, ProxyError> {
        let lines = self
            .registry
            .translate_stream(from, to, ctx, event_type, data, state)?;
        if self.response_hooks.is_empty() {
            return Ok(lines);
        }
        Ok(lines
            .into_iter()
            .map(|mut line| {
                for hook in &self.response_hooks {
                    line = hook(from, to, ctx.model, line);
                }
                line
            })
            .collect())
    }
}

/// Build the registry covering every supported schema pair.
pub fn build_registry() -> TranslatorRegistry {
    let mut reg = TranslatorRegistry::new();

    // OpenAI clients on Gemini-family upstreams.
    reg.register(
        Format::OpenAI,
        Format::Gemini,
        openai_to_gemini::translate_request,
        ResponseTransform {
            stream: gemini_to_openai::translate_stream,
            non_stream: gemini_to_openai::translate_non_stream,
            token_count: render_token_count_openai,
        },
    );

    // Claude clients on Gemini-family upstreams.
    reg.register(
        Format::Claude,
        Format::Gemini,
        claude_to_gemini::translate_request,
        ResponseTransform {
            stream: gemini_to_claude::translate_stream,
            non_stream: gemini_to_claude::translate_non_stream,
            token_count: render_token_count_claude,
        },
    );

    // Gemini-CLI envelopes on Gemini-family upstreams.
    reg.register(
        Format::GeminiCli,
        Format::Gemini,
        gemini_cli::translate_request,
        ResponseTransform {
            stream: gemini_cli::translate_stream,
            non_stream: gemini_cli::translate_non_stream,
            token_count: render_token_count_gemini_cli,
        },
    );

    // OpenAI clients on a Claude upstream.
    reg.register(
        Format::OpenAI,
        Format::Claude,
        openai_to_claude::translate_request,
        ResponseTransform {
            stream: claude_to_openai::translate_stream,
            non_stream: claude_to_openai::translate_non_stream,
            token_count: render_token_count_openai,
        },
    );

    // Claude clients on OpenAI-compatible upstreams (iFlow, Kimi).
    reg.register(
        Format::Claude,
        Format::OpenAI,
        claude_to_openai::translate_request,
        ResponseTransform {
            stream: openai_to_claude::translate_stream,
            non_stream: openai_to_claude::translate_non_stream,
            token_count: render_token_count_claude,
        },
    );

    // OpenAI chat clients on the Codex Responses upstream.
    reg.register(
        Format::OpenAI,
        Format::Codex,
        openai_to_codex::translate_request,
        ResponseTransform {
            stream: codex_to_openai::translate_stream,
            non_stream: codex_to_openai::translate_non_stream,
            token_count: render_token_count_openai,
        },
    );

    // OpenAI Responses clients map onto Codex almost verbatim.
    reg.register(
        Format::OpenAIResponses,
        Format::Codex,
        openai_to_codex::translate_responses_request,
        ResponseTransform {
            stream: codex_to_openai::passthrough_stream,
            non_stream: codex_to_openai::passthrough_non_stream,
            token_count: render_token_count_openai,
        },
    );

    // Claude clients on the Codex Responses upstream.
    reg.register(
        Format::Claude,
        Format::Codex,
        claude_to_codex::translate_request,
        ResponseTransform {
            stream: codex_to_claude::translate_stream,
            non_stream: codex_to_claude::translate_non_stream,
            token_count: render_token_count_claude,
        },
    );

    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_when_unregistered() {
        let reg = build_registry();
        let raw = br#"{"model":"m","messages":[]}"#;
        let out = reg
            .translate_request(Format::Gemini, Format::OpenAI, "m", raw, false)
            .unwrap();
        assert_eq!(out, raw.to_vec());
        assert!(!reg.has_response_translator(Format::Gemini, Format::OpenAI));
    }

    #[test]
    fn test_identity_replaces_model() {
        let reg = build_registry();
        let raw = br#"{"model":"alias","messages":[]}"#;
        let out = reg
            .translate_request(Format::OpenAI, Format::OpenAI, "resolved", raw, false)
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["model"], "resolved");
    }

    #[test]
    fn test_identity_stream_passthrough() {
        let reg = build_registry();
        let ctx = TranslateContext {
            model: "m",
            original_request: b"{}",
            translated_request: b"{}",
        };
        let mut state = StreamState::default();
        let out = reg
            .translate_stream(
                Format::Gemini,
                Format::Gemini,
                &ctx,
                None,
                br#"{"candidates":[]}"#,
                &mut state,
            )
            .unwrap();
        assert_eq!(out, vec![r#"{"candidates":[]}"#.to_string()]);
    }

    #[test]
    fn test_registered_pairs_present() {
        let reg = build_registry();
        for (from, to) in [
            (Format::OpenAI, Format::Gemini),
            (Format::Claude, Format::Gemini),
            (Format::GeminiCli, Format::Gemini),
            (Format::OpenAI, Format::Claude),
            (Format::Claude, Format::OpenAI),
            (Format::OpenAI, Format::Codex),
            (Format::Claude, Format::Codex),
        ] {
            assert!(
                reg.has_response_translator(from, to),
                "missing pair {from:?}→{to:?}"
            );
        }
    }

    #[test]
    fn test_pipeline_hooks_ordered() {
        let mut pipeline = TranslationPipeline::new(Arc::new(build_registry()));
        pipeline.add_request_hook(Box::new(|_, _, _, mut payload| {
            payload.extend_from_slice(b"1");
            payload
        }));
        pipeline.add_request_hook(Box::new(|_, _, _, mut payload| {
            payload.extend_from_slice(b"2");
            payload
        }));
        let out = pipeline
            .translate_request(Format::Gemini, Format::OpenAI, "m", b"{}", false)
            .unwrap();
        assert!(out.ends_with(b"12"));
    }
}
