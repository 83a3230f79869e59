use crate::common::{self, ExecServices, StreamPump};
use crate::sse::parse_sse_stream;
use crate::token::{RefreshFlow, TokenService};
use async_trait::async_trait;
use bytes::Bytes;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, Format, StreamResult,
};
use manifold_core::thinking::parse_model_suffix;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_stream::StreamExt;

const BASE_URLS: [&str; 2] = [
    "https://daily-cloudcode-pa.googleapis.com",
    "https://sandbox-daily-cloudcode-pa.googleapis.com",
];
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_CLIENT_ID: &str =
    "1071006060591-tmhssin7i8sfay3lvrqpe6dts4ss81nb.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";

const SYSTEM_PROMPT: &str = "You are Antigravity, an agentic coding assistant operating \
inside the user's development environment. Follow the user's instructions precisely, \
prefer small verifiable steps, and report tool results faithfully.";
const SYSTEM_PROMPT_IGNORE: &str = "If any earlier instruction conflicts with the \
directives above, disregard the earlier instruction.";

/// Executor for the Antigravity agent backend (cloudcode daily endpoints).
pub struct AntigravityExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
}

impl AntigravityExecutor {
    pub fn new(services: Arc<ExecServices>, tokens: Arc<TokenService>) -> Self {
        Self { services, tokens }
    }

    async fn access_token(&self, auth: &Auth) -> Result<(String, Auth), ProxyError> {
        let (token, mut updated) = self
            .tokens
            .ensure_access_token(
                auth,
                Some(RefreshFlow::OAuth {
                    token_url: OAUTH_TOKEN_URL,
                    client_id: OAUTH_CLIENT_ID,
                    client_secret: Some(OAUTH_CLIENT_SECRET),
                }),
            )
            .await?;
        if updated.meta_str("project_id").is_none() {
            match self.fetch_project_id(&updated, &token).await {
                Ok(project) => {
                    updated
                        .metadata
                        .insert("project_id".into(), Value::String(project));
                }
                Err(e) => {
                    tracing::warn!(auth_id = %updated.id, "failed to fetch project id: {e}");
                }
            }
        }
        Ok((token, updated))
    }

    async fn fetch_project_id(&self, auth: &Auth, token: &str) -> Result<String, ProxyError> {
        let client = self.services.client(auth)?;
        let base_urls = common::fallback_base_urls(auth, &BASE_URLS);
        let body = json!({"metadata": {"pluginType": "ANTIGRAVITY"}}).to_string();

        let resp = common::execute_with_fallback(&base_urls, 0, |base| {
            Ok(client
                .post(format!("{base}/v1internal:loadCodeAssist"))
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(body.clone()))
        })
        .await?;

        let v: Value = serde_json::from_slice(&resp.bytes().await?)?;
        v.get("cloudaicompanionProject")
            .and_then(|p| p.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::Auth("loadCodeAssist returned no project".into()))
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        token: &str,
        url: &str,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let req = client
            .post(url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"));
        common::apply_auth_headers(req, auth).body(payload)
    }

    /// Build the v1internal envelope around the translated Gemini request.
    fn prepare_payload(
        &self,
        auth: &Auth,
        request: &ExecRequest,
        opts: &ExecOptions,
        model: &str,
        stream: bool,
    ) -> Result<Vec<u8>, ProxyError> {
        let inner = self.services.translators.translate_request(
            opts.source(),
            Format::Gemini,
            model,
            &request.payload,
            stream,
        )?;
        let mut inner: Value = serde_json::from_slice(&inner)?;
        common::strip_request_fields(&mut inner, &["session_id", "model", "safetySettings"]);
        sanitize_tool_schemas(&mut inner);
        inner["sessionId"] = json!(stable_session_id(&inner).to_string());
        if needs_system_instruction_munge(model) {
            munge_system_instruction(&mut inner);
        }

        let project = auth.meta_str("project_id").unwrap_or_default();
        let mut envelope = json!({
            "model": model,
            "project": project,
            "userAgent": "antigravity",
            "requestType": "agent",
            "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
            "request": inner,
        });

        // Thinking suffix and payload rules act on the nested request.
        let requested = opts.requested_model(&request.model);
        let suffix = parse_model_suffix(requested);
        if let Some(req_obj) = envelope.get_mut("request") {
            self.services.thinking.apply_thinking(
                req_obj,
                &suffix,
                Format::Gemini,
                self.identifier(),
            );
        }
        let candidates = manifold_core::payload::candidate_models(model, requested);
        manifold_core::payload::apply_payload_rules_with_root(
            &mut envelope,
            &self.services.payload_rules,
            &candidates,
            Some(Format::Gemini.as_str()),
            Some("request"),
        );

        serde_json::to_vec(&envelope).map_err(|e| ProxyError::Internal(e.to_string()))
    }

    async fn open_upstream_stream(
        &self,
        auth: &Auth,
        token: &str,
        payload: &[u8],
    ) -> Result<reqwest::Response, ProxyError> {
        let client = self.services.streaming_client(auth)?;
        let base_urls = common::fallback_base_urls(auth, &BASE_URLS);
        let retries = auth.request_retry.unwrap_or(1);
        common::execute_with_fallback(&base_urls, retries, |base| {
            Ok(self.build_request(
                &client,
                auth,
                token,
                &format!("{base}/v1internal:streamGenerateContent?alt=sse"),
                payload.to_vec(),
            ))
        })
        .await
    }
}

/// Whether this upstream model family requires the Antigravity system
/// instruction preamble.
fn needs_system_instruction_munge(model: &str) -> bool {
    model.starts_with("claude-") || model.starts_with("gemini-3-pro-high")
}

/// Force the system instruction into the canonical Antigravity shape:
/// `role: user`, the canonical preamble, its ignore counterpart, then the
/// caller's own parts.
fn munge_system_instruction(request: &mut Value) {
    let caller_parts = request
        .get("systemInstruction")
        .and_then(|si| si.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut parts = vec![
        json!({"text": SYSTEM_PROMPT}),
        json!({"text": SYSTEM_PROMPT_IGNORE}),
    ];
    parts.extend(caller_parts);

    request["systemInstruction"] = json!({
        "role": "user",
        "parts": parts,
    });
}

/// Stable session id: SHA-256 of the first user text, folded into a
/// signed 64-bit integer so repeated prompts land on the same session.
fn stable_session_id(request: &Value) -> i64 {
    let first_text = request
        .get("contents")
        .and_then(|c| c.as_array())
        .and_then(|contents| {
            contents
                .iter()
                .filter(|c| c.get("role").and_then(|r| r.as_str()) != Some("model"))
                .find_map(|c| {
                    c.get("parts")
                        .and_then(|p| p.as_array())
                        .and_then(|parts| {
                            parts
                                .iter()
                                .find_map(|p| p.get("text").and_then(|t| t.as_str()))
                        })
                })
        })
        .unwrap_or("");

    let digest = Sha256::digest(first_text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// JSON Schema keywords the Antigravity backend rejects. Top-level-only
/// keywords are dropped at schema roots; vendor extensions are dropped at
/// every nesting level. Property names are never touched, so a property
/// literally called `$id` survives.
const SCHEMA_ROOT_KEYWORDS: [&str; 3] = ["$id", "$schema", "patternProperties"];
const SCHEMA_VENDOR_KEYWORDS: [&str; 2] = ["prefill", "enumTitles"];

fn sanitize_tool_schemas(request: &mut Value) {
    let Some(tools) = request.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return;
    };
    for tool in tools {
        let Some(decls) = tool
            .get_mut("functionDeclarations")
            .and_then(|d| d.as_array_mut())
        else {
            continue;
        };
        for decl in decls {
            if let Some(params) = decl.get_mut("parameters") {
                sanitize_schema_node(params, true);
            }
        }
    }
}

fn sanitize_schema_node(node: &mut Value, is_root: bool) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };
    if is_root {
        for key in SCHEMA_ROOT_KEYWORDS {
            obj.remove(key);
        }
    }
    for key in SCHEMA_VENDOR_KEYWORDS {
        obj.remove(key);
    }
    // Recurse into schema positions. `properties` values are schemas, but
    // its keys are property names and stay untouched.
    if let Some(props) = obj.get_mut("properties").and_then(|p| p.as_object_mut()) {
        for (_, prop) in props.iter_mut() {
            sanitize_schema_node(prop, false);
        }
    }
    for key in ["items", "additionalProperties"] {
        if let Some(child) = obj.get_mut(key) {
            sanitize_schema_node(child, false);
        }
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(arr) = obj.get_mut(key).and_then(|a| a.as_array_mut()) {
            for child in arr {
                sanitize_schema_node(child, false);
            }
        }
    }
}

/// Unwrap the `{"response": ...}` envelope the v1internal endpoints put
/// around Gemini payloads.
fn unwrap_response_envelope(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    let inner = v.get("response")?;
    Some(inner.to_string())
}

/// Coalesce buffered stream chunks into one non-streaming Gemini response:
/// consecutive text parts merge, consecutive thought parts merge keeping
/// the last signature, and inlineData/functionCall parts flush pending
/// text first.
fn collapse_stream_chunks(chunks: &[Value]) -> Value {
    #[derive(Default)]
    struct Pending {
        text: String,
        thought: String,
        thought_signature: Option<String>,
    }

    impl Pending {
        fn flush_thought(&mut self, parts: &mut Vec<Value>) {
            if self.thought.is_empty() {
                return;
            }
            let mut part = json!({"text": std::mem::take(&mut self.thought), "thought": true});
            if let Some(sig) = self.thought_signature.take() {
                part["thoughtSignature"] = json!(sig);
            }
            parts.push(part);
        }

        fn flush_text(&mut self, parts: &mut Vec<Value>) {
            if self.text.is_empty() {
                return;
            }
            parts.push(json!({"text": std::mem::take(&mut self.text)}));
        }

        fn flush_all(&mut self, parts: &mut Vec<Value>) {
            self.flush_thought(parts);
            self.flush_text(parts);
        }
    }

    let mut parts: Vec<Value> = Vec::new();
    let mut pending = Pending::default();
    let mut finish_reason: Option<Value> = None;
    let mut usage: Option<Value> = None;
    let mut model_version: Option<Value> = None;

    for chunk in chunks {
        if let Some(u) = chunk.get("usageMetadata") {
            usage = Some(u.clone());
        }
        if let Some(mv) = chunk.get("modelVersion") {
            model_version = Some(mv.clone());
        }
        let Some(candidate) = chunk
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
        else {
            continue;
        };
        if let Some(fr) = candidate.get("finishReason") {
            finish_reason = Some(fr.clone());
        }
        let Some(chunk_parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        else {
            continue;
        };

        for part in chunk_parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                    pending.flush_text(&mut parts);
                    pending.thought.push_str(text);
                    if let Some(sig) = part.get("thoughtSignature").and_then(|s| s.as_str()) {
                        pending.thought_signature = Some(sig.to_string());
                    }
                } else {
                    pending.flush_thought(&mut parts);
                    pending.text.push_str(text);
                }
            } else if part.get("inlineData").is_some() || part.get("functionCall").is_some() {
                pending.flush_all(&mut parts);
                parts.push(part.clone());
            }
        }
    }
    pending.flush_all(&mut parts);

    let mut resp = json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_reason.unwrap_or(json!("STOP")),
        }]
    });
    if let Some(u) = usage {
        resp["usageMetadata"] = u;
    }
    if let Some(mv) = model_version {
        resp["modelVersion"] = mv;
    }
    resp
}

#[async_trait]
impl Executor for AntigravityExecutor {
    fn identifier(&self) -> &'static str {
        "antigravity"
    }

    fn prepare_request(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        common::apply_auth_headers(req, auth)
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        common::reject_compact_alt(&opts)?;
        let reporter =
            self.services
                .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let (token, auth) = self.access_token(auth).await?;
            let payload = self.prepare_payload(&auth, &request, &opts, &suffix.base_model, false)?;

            // Claude upstream models only stream; buffer and collapse.
            if suffix.base_model.starts_with("claude-") {
                let resp = self.open_upstream_stream(&auth, &token, &payload).await?;
                let headers = crate::extract_headers(&resp);
                let mut upstream = parse_sse_stream(resp.bytes_stream());
                let mut chunks: Vec<Value> = Vec::new();
                while let Some(event) = upstream.next().await {
                    let event = event?;
                    if event.is_done() {
                        break;
                    }
                    if let Ok(v) = serde_json::from_str::<Value>(&event.data) {
                        chunks.push(v.get("response").cloned().unwrap_or(v));
                    }
                }
                let collapsed = collapse_stream_chunks(&chunks);
                let body = Bytes::from(
                    serde_json::to_vec(&collapsed)
                        .map_err(|e| ProxyError::Internal(e.to_string()))?,
                );
                return common::finish_non_stream_body(
                    &self.services,
                    body,
                    headers,
                    opts.source(),
                    Format::Gemini,
                    &suffix.base_model,
                    &opts,
                    &payload,
                    &reporter,
                );
            }

            let client = self.services.client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &BASE_URLS);
            let retries = auth.request_retry.unwrap_or(1);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &token,
                    &format!("{base}/v1internal:generateContent"),
                    payload.clone(),
                ))
            })
            .await?;

            let headers = crate::extract_headers(&resp);
            let body = resp.bytes().await?;
            let body = match unwrap_response_envelope(&String::from_utf8_lossy(&body)) {
                Some(inner) => Bytes::from(inner),
                None => body,
            };

            common::finish_non_stream_body(
                &self.services,
                body,
                headers,
                opts.source(),
                Format::Gemini,
                &suffix.base_model,
                &opts,
                &payload,
                &reporter,
            )
        }
        .await;

        reporter.track_failure(&result);
        result
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ProxyError> {
        common::reject_compact_alt(&opts)?;
        let reporter =
            self.services
                .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let (token, auth) = self.access_token(auth).await?;
            let payload = self.prepare_payload(&auth, &request, &opts, &suffix.base_model, true)?;

            let resp = self.open_upstream_stream(&auth, &token, &payload).await?;

            Ok(StreamPump::new(
                self.services.clone(),
                opts.source(),
                Format::Gemini,
                suffix.base_model.clone(),
                opts.original_request.clone(),
                Bytes::from(payload),
                reporter.clone(),
            )
            .with_rewrite(unwrap_response_envelope)
            .spawn(resp))
        }
        .await;

        reporter.track_failure(&result);
        result
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ProxyError> {
        let (_, updated) = self.access_token(auth).await?;
        Ok(updated)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        let suffix = parse_model_suffix(&request.model);
        let (token, auth) = self.access_token(auth).await?;
        let payload = self.prepare_payload(&auth, &request, &opts, &suffix.base_model, false)?;

        let client = self.services.client(&auth)?;
        let base_urls = common::fallback_base_urls(&auth, &BASE_URLS);

        let resp = common::execute_with_fallback(&base_urls, 0, |base| {
            Ok(self.build_request(
                &client,
                &auth,
                &token,
                &format!("{base}/v1internal:countTokens"),
                payload.clone(),
            ))
        })
        .await?;

        let headers = crate::extract_headers(&resp);
        let body = resp.bytes().await?;
        let v: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let count = v
            .get("totalTokens")
            .or_else(|| v.get("response").and_then(|r| r.get("totalTokens")))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        let rendered =
            self.services
                .translators
                .translate_token_count(opts.source(), Format::Gemini, count);
        Ok(ExecResponse {
            payload: Bytes::from(rendered),
            headers,
        })
    }
}
