use crate::common::{self, ExecServices, StreamPump};
use crate::token::{RefreshFlow, TokenService};
use async_trait::async_trait;
use bytes::Bytes;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, Format, StreamResult,
};
use manifold_core::thinking::parse_model_suffix;
use serde_json::Value;
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BETA: &str = "output-128k-2025-02-19";
const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Server-side tools the upstream resolves by well-known name; these are
/// never prefixed outbound nor stripped inbound.
const BUILTIN_TOOLS: &[&str] = &[
    "web_search_20250305",
    "bash_20250124",
    "text_editor_20250124",
    "text_editor_20250429",
    "computer_20250124",
    "code_execution_20250522",
];

fn is_builtin_tool(name: &str) -> bool {
    BUILTIN_TOOLS.contains(&name)
}

/// Prefix caller tool names in an outgoing Claude request, leaving
/// built-in tools and already-prefixed names alone.
pub fn apply_tool_prefix(payload: &mut Value, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    if let Some(tools) = payload.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools {
            if let Some(name) = tool.get("name").and_then(|n| n.as_str()) {
                if is_builtin_tool(name) || name.starts_with(prefix) {
                    continue;
                }
                let prefixed = format!("{prefix}{name}");
                tool["name"] = Value::String(prefixed);
            }
        }
    }
    if let Some(tc) = payload.get_mut("tool_choice")
        && let Some(name) = tc.get("name").and_then(|n| n.as_str())
        && !is_builtin_tool(name)
        && !name.starts_with(prefix)
    {
        tc["name"] = Value::String(format!("{prefix}{name}"));
    }
    // History replays the prefixed names the upstream saw earlier.
    if let Some(messages) = payload.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in messages {
            if let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                        && let Some(name) = block.get("name").and_then(|n| n.as_str())
                        && !is_builtin_tool(name)
                        && !name.starts_with(prefix)
                    {
                        block["name"] = Value::String(format!("{prefix}{name}"));
                    }
                }
            }
        }
    }
}

/// Strip the prefix from tool_use names in an upstream Claude response.
pub fn strip_tool_prefix(payload: &mut Value, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    let blocks = match payload.get_mut("content").and_then(|c| c.as_array_mut()) {
        Some(blocks) => blocks,
        None => return,
    };
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
            && let Some(name) = block.get("name").and_then(|n| n.as_str())
            && !is_builtin_tool(name)
            && let Some(stripped) = name.strip_prefix(prefix)
        {
            block["name"] = Value::String(stripped.to_string());
        }
    }
}

/// Strip the prefix from a streamed `content_block_start` tool_use event.
fn strip_stream_tool_prefix(data: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() || !data.contains("tool_use") {
        return None;
    }
    let mut event: Value = serde_json::from_str(data).ok()?;
    let block = event.get_mut("content_block")?;
    let name = block.get("name")?.as_str()?;
    if is_builtin_tool(name) {
        return None;
    }
    let stripped = name.strip_prefix(prefix)?.to_string();
    block["name"] = Value::String(stripped);
    Some(event.to_string())
}

/// Executor for the Anthropic Messages API. Also serves as the delegate
/// target for Kimi's Claude-schema traffic.
pub struct ClaudeExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
}

impl ClaudeExecutor {
    pub fn new(services: Arc<ExecServices>, tokens: Arc<TokenService>) -> Self {
        Self { services, tokens }
    }

    async fn access_token(&self, auth: &Auth) -> Result<(String, Auth), ProxyError> {
        let flow = auth.meta_str("refresh_token").map(|_| RefreshFlow::OAuth {
            token_url: OAUTH_TOKEN_URL,
            client_id: OAUTH_CLIENT_ID,
            client_secret: None,
        });
        self.tokens.ensure_access_token(auth, flow).await
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        token: &str,
        url: &str,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let mut req = client
            .post(url)
            .header("content-type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", ANTHROPIC_BETA);

        // anthropic.com takes x-api-key; gateways take a Bearer token.
        let base_url = auth.base_url_or_default(DEFAULT_BASE_URL);
        if base_url.contains("anthropic.com") && auth.attribute("api_key").is_some() {
            req = req.header("x-api-key", token);
        } else {
            req = req.header("authorization", format!("Bearer {token}"));
        }

        common::apply_auth_headers(req, auth).body(payload)
    }

    fn prepare_payload(
        &self,
        auth: &Auth,
        request: &ExecRequest,
        opts: &ExecOptions,
        model: &str,
        stream: bool,
    ) -> Result<Vec<u8>, ProxyError> {
        let payload = common::prepare_upstream_payload(
            &self.services,
            opts.source(),
            Format::Claude,
            self.identifier(),
            model,
            request,
            opts,
            stream,
            None,
        )?;
        let mut value: Value = serde_json::from_slice(&payload)?;
        common::strip_request_fields(&mut value, &["session_id"]);
        if let Some(prefix) = auth.attribute("tool_prefix") {
            apply_tool_prefix(&mut value, prefix);
        }
        serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))
    }

    async fn execute_inner(
        &self,
        auth: &Auth,
        request: &ExecRequest,
        opts: &ExecOptions,
        reporter: &Arc<manifold_core::usage::UsageReporter>,
    ) -> Result<ExecResponse, ProxyError> {
        let suffix = parse_model_suffix(&request.model);
        let (token, auth) = self.access_token(auth).await?;
        let payload = self.prepare_payload(&auth, request, opts, &suffix.base_model, false)?;

        let client = self.services.client(&auth)?;
        let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
        let retries = auth.request_retry.unwrap_or(0);

        let resp = common::execute_with_fallback(&base_urls, retries, |base| {
            Ok(self.build_request(
                &client,
                &auth,
                &token,
                &format!("{base}/v1/messages"),
                payload.clone(),
            ))
        })
        .await?;

        let headers = crate::extract_headers(&resp);
        let mut body = resp.bytes().await?;
        if let Some(prefix) = auth.attribute("tool_prefix")
            && let Ok(mut v) = serde_json::from_slice::<Value>(&body)
        {
            strip_tool_prefix(&mut v, prefix);
            body = Bytes::from(serde_json::to_vec(&v).map_err(|e| {
                ProxyError::Internal(e.to_string())
            })?);
        }

        common::finish_non_stream_body(
            &self.services,
            body,
            headers,
            opts.source(),
            Format::Claude,
            &suffix.base_model,
            opts,
            &payload,
            reporter,
        )
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        "claude"
    }

    fn prepare_request(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        common::apply_auth_headers(
            req.header("anthropic-version", ANTHROPIC_VERSION),
            auth,
        )
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
        let result = self.execute_inner(auth, &request, &opts, &reporter).await;
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

            let client = self.services.streaming_client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &token,
                    &format!("{base}/v1/messages"),
                    payload.clone(),
                ))
            })
            .await?;

            let mut pump = StreamPump::new(
                self.services.clone(),
                opts.source(),
                Format::Claude,
                suffix.base_model.clone(),
                opts.original_request.clone(),
                Bytes::from(payload),
                reporter.clone(),
            );
            if let Some(prefix) = auth.attribute("tool_prefix") {
                let prefix = prefix.to_string();
                pump = pump.with_rewrite(move |data| strip_stream_tool_prefix(data, &prefix));
            }
            Ok(pump.spawn(resp))
        }
        .await;

        reporter.track_failure(&result);
        result
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ProxyError> {
        if auth.meta_str("refresh_token").is_none() {
            return Ok(auth.clone());
        }
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
        let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);

        let resp = common::execute_with_fallback(&base_urls, 0, |base| {
            Ok(self.build_request(
                &client,
                &auth,
                &token,
                &format!("{base}/v1/messages/count_tokens"),
                payload.clone(),
            ))
        })
        .await?;

        let headers = crate::extract_headers(&resp);
        let body = resp.bytes().await?;
        if opts.source() == Format::Claude {
            return Ok(ExecResponse {
                payload: body,
                headers,
            });
        }
        let count = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("input_tokens").and_then(|t| t.as_u64()))
            .unwrap_or(0);
        let rendered =
            self.services
                .translators
                .translate_token_count(opts.source(), Format::Claude, count);
        Ok(ExecResponse {
            payload: Bytes::from(rendered),
            headers,
        })
    }
}
