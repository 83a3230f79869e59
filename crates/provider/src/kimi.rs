use crate::claude::ClaudeExecutor;
use crate::common::{self, ExecServices, StreamPump};
use crate::token::TokenService;
use async_trait::async_trait;
use bytes::Bytes;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, Format, StreamResult,
};
use manifold_core::thinking::parse_model_suffix;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://api.moonshot.ai";
const DEVICE_ID_FILE_ENV: &str = "KIMI_DEVICE_ID_FILE";

/// Executor for the Kimi OpenAI-compatible API. Claude-schema traffic is
/// delegated to the Claude executor against Kimi's Anthropic-compatible
/// endpoint.
pub struct KimiExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
    claude: Arc<ClaudeExecutor>,
}

impl KimiExecutor {
    pub fn new(
        services: Arc<ExecServices>,
        tokens: Arc<TokenService>,
        claude: Arc<ClaudeExecutor>,
    ) -> Self {
        Self {
            services,
            tokens,
            claude,
        }
    }

    /// Clone the credential with `base_url` pointed at the Anthropic
    /// surface for Claude delegation.
    fn claude_auth(&self, auth: &Auth) -> Auth {
        let mut delegated = auth.clone();
        let base = auth.base_url_or_default(DEFAULT_BASE_URL);
        delegated
            .attributes
            .insert("base_url".into(), format!("{base}/anthropic"));
        delegated
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        api_key: &str,
        url: &str,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let mut req = client
            .post(url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .header("x-msh-platform", std::env::consts::OS);
        if let Some(device_id) = device_id() {
            req = req.header("x-msh-device-id", device_id);
        }
        common::apply_auth_headers(req, auth).body(payload)
    }

    fn prepare_payload(
        &self,
        request: &ExecRequest,
        opts: &ExecOptions,
        model: &str,
        stream: bool,
    ) -> Result<Vec<u8>, ProxyError> {
        let payload = common::prepare_upstream_payload(
            &self.services,
            opts.source(),
            Format::OpenAI,
            self.identifier(),
            model,
            request,
            opts,
            stream,
            None,
        )?;
        let mut value: Value = serde_json::from_slice(&payload)?;
        common::strip_request_fields(&mut value, &["session_id"]);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("model".into(), Value::String(model.to_string()));
        }
        normalize_tool_message_links(&mut value);
        serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))
    }
}

/// The `kimi-` prefix is a routing alias; the upstream model name drops it.
fn upstream_model(base_model: &str) -> &str {
    base_model.strip_prefix("kimi-").unwrap_or(base_model)
}

/// Repair the assistant→tool linkage Kimi requires:
/// - `role:tool` messages without `tool_call_id` fall back to `call_id`,
///   then to the single pending call; ambiguity is logged and left unset.
/// - assistant messages with `tool_calls` but no `reasoning_content`
///   inherit the most recent non-empty one, else synthesize from their
///   text, else a fixed placeholder.
pub fn normalize_tool_message_links(payload: &mut Value) {
    let Some(messages) = payload.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };

    let mut pending_call_ids: Vec<String> = Vec::new();
    let mut last_reasoning = String::new();

    for msg in messages.iter_mut() {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");

        if role == "assistant" {
            if let Some(reasoning) = msg.get("reasoning_content").and_then(|r| r.as_str())
                && !reasoning.is_empty()
            {
                last_reasoning = reasoning.to_string();
            }

            let tool_calls: Vec<String> = msg
                .get("tool_calls")
                .and_then(|tc| tc.as_array())
                .map(|calls| {
                    calls
                        .iter()
                        .filter_map(|c| c.get("id").and_then(|i| i.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            if !tool_calls.is_empty() {
                pending_call_ids = tool_calls;

                let has_reasoning = msg
                    .get("reasoning_content")
                    .and_then(|r| r.as_str())
                    .is_some_and(|r| !r.is_empty());
                if !has_reasoning {
                    let synthesized = if !last_reasoning.is_empty() {
                        last_reasoning.clone()
                    } else if let Some(text) = msg
                        .get("content")
                        .and_then(|c| c.as_str())
                        .filter(|t| !t.is_empty())
                    {
                        text.to_string()
                    } else {
                        "[reasoning unavailable]".to_string()
                    };
                    msg["reasoning_content"] = Value::String(synthesized);
                }
            }
            continue;
        }

        if role != "tool" {
            continue;
        }

        let has_id = msg
            .get("tool_call_id")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if has_id {
            let id = msg["tool_call_id"].as_str().unwrap_or("").to_string();
            pending_call_ids.retain(|p| p != &id);
            continue;
        }

        if let Some(call_id) = msg
            .get("call_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
        {
            pending_call_ids.retain(|p| p != &call_id);
            msg["tool_call_id"] = Value::String(call_id);
            continue;
        }

        match pending_call_ids.len() {
            1 => {
                let id = pending_call_ids.remove(0);
                msg["tool_call_id"] = Value::String(id);
            }
            0 => {
                tracing::warn!("tool message has no tool_call_id and no pending call to infer");
            }
            n => {
                tracing::warn!(
                    pending = n,
                    "tool message has no tool_call_id and the pending call is ambiguous"
                );
            }
        }
    }
}

/// Stable per-user device identity, persisted next to the user's config.
fn device_id() -> Option<String> {
    let path = device_id_path()?;
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&path, &id) {
        tracing::debug!("failed to persist device id: {e}");
    }
    Some(id)
}

fn device_id_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(DEVICE_ID_FILE_ENV) {
        return Some(PathBuf::from(path));
    }
    let base = if cfg!(windows) {
        PathBuf::from(std::env::var_os("APPDATA")?)
    } else if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        PathBuf::from(std::env::var_os("HOME")?).join(".config")
    };
    Some(base.join("kimi-cli").join("device_id"))
}

#[async_trait]
impl Executor for KimiExecutor {
    fn identifier(&self) -> &'static str {
        "kimi"
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
        if opts.source() == Format::Claude {
            return self.claude.execute(&self.claude_auth(auth), request, opts).await;
        }
        let reporter =
            self.services
                .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let model = upstream_model(&suffix.base_model);
            let (api_key, auth) = self.tokens.ensure_access_token(auth, None).await?;
            let payload = self.prepare_payload(&request, &opts, model, false)?;

            let client = self.services.client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &api_key,
                    &format!("{base}/v1/chat/completions"),
                    payload.clone(),
                ))
            })
            .await?;

            common::finish_non_stream(
                &self.services,
                resp,
                opts.source(),
                Format::OpenAI,
                model,
                &opts,
                &payload,
                &reporter,
            )
            .await
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
        if opts.source() == Format::Claude {
            return self
                .claude
                .execute_stream(&self.claude_auth(auth), request, opts)
                .await;
        }
        let reporter =
            self.services
                .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let model = upstream_model(&suffix.base_model).to_string();
            let (api_key, auth) = self.tokens.ensure_access_token(auth, None).await?;
            let mut value: Value =
                serde_json::from_slice(&self.prepare_payload(&request, &opts, &model, true)?)?;
            value["stream_options"] = serde_json::json!({"include_usage": true});
            let payload =
                serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))?;

            let client = self.services.streaming_client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &api_key,
                    &format!("{base}/v1/chat/completions"),
                    payload.clone(),
                ))
            })
            .await?;

            Ok(StreamPump::new(
                self.services.clone(),
                opts.source(),
                Format::OpenAI,
                model,
                opts.original_request.clone(),
                Bytes::from(payload),
                reporter.clone(),
            )
            .spawn(resp))
        }
        .await;

        reporter.track_failure(&result);
        result
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        let _ = auth;
        let count = common::estimate_tokens(&request.payload);
        let rendered =
            self.services
                .translators
                .translate_token_count(opts.source(), Format::OpenAI, count);
        Ok(ExecResponse {
            payload: Bytes::from(rendered),
            headers: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_id_inferred_from_single_pending() {
        let mut payload = json!({"messages": [
            {"role": "assistant", "tool_calls": [
                {"id": "call_123", "function": {"name": "read_file", "arguments": "{}"}}
            ]},
            {"role": "tool", "content": "file-content"}
        ]});
        normalize_tool_message_links(&mut payload);
        assert_eq!(payload["messages"][1]["tool_call_id"], "call_123");
    }

    #[test]
    fn test_ambiguous_pending_ids_left_unset() {
        let mut payload = json!({"messages": [
            {"role": "assistant", "tool_calls": [
                {"id": "call_a", "function": {"name": "f", "arguments": "{}"}},
                {"id": "call_b", "function": {"name": "g", "arguments": "{}"}}
            ]},
            {"role": "tool", "content": "which call?"}
        ]});
        normalize_tool_message_links(&mut payload);
        assert!(payload["messages"][1].get("tool_call_id").is_none());
    }

    #[test]
    fn test_call_id_fallback() {
        let mut payload = json!({"messages": [
            {"role": "assistant", "tool_calls": [
                {"id": "call_x", "function": {"name": "f", "arguments": "{}"}}
            ]},
            {"role": "tool", "call_id": "call_x", "content": "r"}
        ]});
        normalize_tool_message_links(&mut payload);
        assert_eq!(payload["messages"][1]["tool_call_id"], "call_x");
    }

    #[test]
    fn test_reasoning_content_inherited_then_synthesized() {
        let mut payload = json!({"messages": [
            {"role": "assistant", "reasoning_content": "first thought", "content": "a"},
            {"role": "assistant", "tool_calls": [
                {"id": "c1", "function": {"name": "f", "arguments": "{}"}}
            ]},
            {"role": "tool", "tool_call_id": "c1", "content": "r"},
            {"role": "assistant", "content": "from my text", "tool_calls": [
                {"id": "c2", "function": {"name": "g", "arguments": "{}"}}
            ]}
        ]});
        normalize_tool_message_links(&mut payload);
        // Second assistant message inherits the most recent reasoning.
        assert_eq!(payload["messages"][1]["reasoning_content"], "first thought");
        // Later one inherits too (the earlier reasoning is still the most
        // recent non-empty one).
        assert_eq!(payload["messages"][3]["reasoning_content"], "first thought");
    }

    #[test]
    fn test_reasoning_placeholder_when_nothing_available() {
        let mut payload = json!({"messages": [
            {"role": "assistant", "tool_calls": [
                {"id": "c1", "function": {"name": "f", "arguments": "{}"}}
            ]}
        ]});
        normalize_tool_message_links(&mut payload);
        assert_eq!(
            payload["messages"][0]["reasoning_content"],
            "[reasoning unavailable]"
        );
    }

    #[test]
    fn test_upstream_model_prefix_strip() {
        assert_eq!(upstream_model("kimi-k2-turbo"), "k2-turbo");
        assert_eq!(upstream_model("k2"), "k2");
    }

    #[test]
    fn test_device_id_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_id");
        // SAFETY: test-local env mutation.
        unsafe { std::env::set_var(DEVICE_ID_FILE_ENV, &path) };
        let first = device_id().unwrap();
        let second = device_id().unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), first);
        unsafe { std::env::remove_var(DEVICE_ID_FILE_ENV) };
    }
}
