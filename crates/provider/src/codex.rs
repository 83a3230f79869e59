use crate::codex_cache::CodexPromptCache;
use crate::common::{self, ExecServices, StreamPump};
use crate::token::{RefreshFlow, TokenService};
use async_trait::async_trait;
use bytes::Bytes;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ALT_RESPONSES_COMPACT, ExecOptions, ExecRequest, ExecResponse, Executor, Format, StreamResult,
};
use manifold_core::thinking::parse_model_suffix;
use serde_json::Value;
use std::sync::Arc;

pub(crate) const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
pub(crate) const OAUTH_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub(crate) const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// HTTP executor for the Codex Responses backend.
pub struct CodexExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
    cache: Arc<CodexPromptCache>,
}

impl CodexExecutor {
    pub fn new(
        services: Arc<ExecServices>,
        tokens: Arc<TokenService>,
        cache: Arc<CodexPromptCache>,
    ) -> Self {
        Self {
            services,
            tokens,
            cache,
        }
    }

    pub(crate) fn services(&self) -> &Arc<ExecServices> {
        &self.services
    }

    pub(crate) async fn access_token(&self, auth: &Auth) -> Result<(String, Auth), ProxyError> {
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
        cache_id: Option<&str>,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let mut req = client
            .post(url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .header("authorization", format!("Bearer {token}"))
            .header("openai-beta", "responses=experimental")
            .header("originator", "codex_cli_rs");
        if let Some(account_id) = auth.meta_str("account_id") {
            req = req.header("chatgpt-account-id", account_id);
        }
        if let Some(cache_id) = cache_id {
            req = req
                .header("Conversation_id", cache_id)
                .header("Session_id", cache_id);
        }
        common::apply_auth_headers(req, auth).body(payload)
    }

    /// Resolve the caller identity the prompt cache is keyed on.
    fn cache_user_id(request: &ExecRequest, opts: &ExecOptions) -> Option<String> {
        if let Some(user) = request.metadata.get("user_id").filter(|u| !u.is_empty()) {
            return Some(user.clone());
        }
        let original: Value = serde_json::from_slice(&opts.original_request).ok()?;
        original
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(|u| u.as_str())
            .map(str::to_string)
    }

    pub(crate) fn prepare_payload(
        &self,
        request: &ExecRequest,
        opts: &ExecOptions,
        model: &str,
        stream: bool,
    ) -> Result<(Vec<u8>, Option<String>), ProxyError> {
        let payload = common::prepare_upstream_payload(
            &self.services,
            opts.source(),
            Format::Codex,
            self.identifier(),
            model,
            request,
            opts,
            stream,
            None,
        )?;
        let mut value: Value = serde_json::from_slice(&payload)?;
        common::strip_request_fields(&mut value, &["session_id", "metadata", "user"]);

        let cache_id = Self::cache_user_id(request, opts)
            .map(|user| self.cache.get_or_mint(model, &user));
        if let Some(ref id) = cache_id {
            value["prompt_cache_key"] = Value::String(id.clone());
        }

        let payload =
            serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))?;
        Ok((payload, cache_id))
    }
}

#[async_trait]
impl Executor for CodexExecutor {
    fn identifier(&self) -> &'static str {
        "codex"
    }

    fn prepare_request(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        let req = req.header("openai-beta", "responses=experimental");
        common::apply_auth_headers(req, auth)
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        let reporter =
            self.services
                .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let (token, auth) = self.access_token(auth).await?;
            let (payload, cache_id) =
                self.prepare_payload(&request, &opts, &suffix.base_model, false)?;

            let path = if opts.alt == ALT_RESPONSES_COMPACT {
                "/responses/compact"
            } else {
                "/responses"
            };
            let client = self.services.client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &token,
                    &format!("{base}{path}"),
                    cache_id.as_deref(),
                    payload.clone(),
                ))
            })
            .await?;

            common::finish_non_stream(
                &self.services,
                resp,
                opts.source(),
                Format::Codex,
                &suffix.base_model,
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
        let reporter =
            self.services
                .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let (token, auth) = self.access_token(auth).await?;
            let (payload, cache_id) =
                self.prepare_payload(&request, &opts, &suffix.base_model, true)?;

            let client = self.services.streaming_client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &token,
                    &format!("{base}/responses"),
                    cache_id.as_deref(),
                    payload.clone(),
                ))
            })
            .await?;

            Ok(StreamPump::new(
                self.services.clone(),
                opts.source(),
                Format::Codex,
                suffix.base_model.clone(),
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
        let _ = auth;
        let count = common::estimate_tokens(&request.payload);
        let rendered =
            self.services
                .translators
                .translate_token_count(opts.source(), Format::Codex, count);
        Ok(ExecResponse {
            payload: Bytes::from(rendered),
            headers: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::payload::PayloadConfig;
    use manifold_core::thinking::ThinkingRegistry;
    use manifold_core::usage::UsageQueue;

    fn services() -> Arc<ExecServices> {
        Arc::new(ExecServices {
            translators: Arc::new(manifold_translator::build_registry()),
            payload_rules: Arc::new(PayloadConfig::default()),
            thinking: Arc::new(ThinkingRegistry::with_defaults()),
            usage: UsageQueue::new(16),
            global_proxy: None,
        })
    }

    #[tokio::test]
    async fn test_prompt_cache_key_stable_per_user() {
        let executor = CodexExecutor::new(
            services(),
            Arc::new(TokenService::new(None)),
            CodexPromptCache::new(),
        );

        let request = ExecRequest {
            model: "gpt-5-codex".into(),
            payload: Bytes::from_static(b"{\"messages\":[{\"role\":\"user\",\"content\":\"hi\"}]}"),
            metadata: [("user_id".to_string(), "user-1".to_string())]
                .into_iter()
                .collect(),
        };
        let opts = ExecOptions {
            source_format: Some(Format::OpenAI),
            original_request: request.payload.clone(),
            ..Default::default()
        };

        let (payload_a, cache_a) = executor
            .prepare_payload(&request, &opts, "gpt-5-codex", false)
            .unwrap();
        let (_, cache_b) = executor
            .prepare_payload(&request, &opts, "gpt-5-codex", false)
            .unwrap();
        assert_eq!(cache_a, cache_b);
        assert!(cache_a.is_some());

        let v: Value = serde_json::from_slice(&payload_a).unwrap();
        assert_eq!(
            v["prompt_cache_key"].as_str(),
            cache_a.as_deref()
        );
    }

    #[tokio::test]
    async fn test_no_user_id_no_cache_key() {
        let executor = CodexExecutor::new(
            services(),
            Arc::new(TokenService::new(None)),
            CodexPromptCache::new(),
        );
        let request = ExecRequest {
            model: "gpt-5-codex".into(),
            payload: Bytes::from_static(b"{\"messages\":[]}"),
            ..Default::default()
        };
        let opts = ExecOptions {
            source_format: Some(Format::OpenAI),
            original_request: request.payload.clone(),
            ..Default::default()
        };
        let (payload, cache_id) = executor
            .prepare_payload(&request, &opts, "gpt-5-codex", false)
            .unwrap();
        assert!(cache_id.is_none());
        let v: Value = serde_json::from_slice(&payload).unwrap();
        assert!(v.get("prompt_cache_key").is_none());
    }
}
