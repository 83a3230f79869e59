use crate::common::{self, ExecServices, StreamPump};
use crate::token::{RefreshFlow, TokenService};
use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, Format, StreamResult,
};
use manifold_core::glob::glob_match;
use manifold_core::thinking::parse_model_suffix;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";
const DEFAULT_USER_AGENT: &str = "iflow-cli/1.0";
const OAUTH_TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const OAUTH_CLIENT_ID: &str = "iflow-cli";
const COOKIE_APIKEY_ENDPOINT: &str = "https://iflow.cn/api/user/apikey";

type HmacSha256 = Hmac<Sha256>;

/// Executor for the iFlow OpenAI-compatible gateway, which signs every
/// request with an HMAC over the caller identity.
pub struct IflowExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
}

impl IflowExecutor {
    pub fn new(services: Arc<ExecServices>, tokens: Arc<TokenService>) -> Self {
        Self { services, tokens }
    }

    async fn api_key(&self, auth: &Auth) -> Result<(String, Auth), ProxyError> {
        let flow = if auth.meta_str("cookie").is_some() {
            Some(RefreshFlow::Cookie {
                endpoint: COOKIE_APIKEY_ENDPOINT,
            })
        } else if auth.meta_str("refresh_token").is_some() {
            Some(RefreshFlow::OAuth {
                token_url: OAUTH_TOKEN_URL,
                client_id: OAUTH_CLIENT_ID,
                client_secret: None,
            })
        } else {
            None
        };
        self.tokens.ensure_access_token(auth, flow).await
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        api_key: &str,
        url: &str,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let user_agent = auth.attribute("user_agent").unwrap_or(DEFAULT_USER_AGENT);
        let session_id = uuid::Uuid::new_v4().to_string();
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let signature = sign_request(user_agent, &session_id, timestamp_ms, api_key);

        let req = client
            .post(url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .header("user-agent", user_agent)
            .header("session-id", session_id)
            .header("x-iflow-timestamp", timestamp_ms.to_string())
            .header("x-iflow-signature", signature);
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
        preserve_reasoning_content_in_messages(&value, model);
        serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))
    }
}

/// `x-iflow-signature`: HMAC-SHA256 over `userAgent:sessionId:timestampMs`
/// keyed with the API key, hex-encoded.
fn sign_request(user_agent: &str, session_id: &str, timestamp_ms: i64, api_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{user_agent}:{session_id}:{timestamp_ms}").as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Diagnostic pass: report assistant messages that still carry
/// `reasoning_content` for model families where the upstream echoes it
/// back. Observes only; the payload is forwarded unchanged.
fn preserve_reasoning_content_in_messages(payload: &Value, model: &str) {
    if !glob_match("glm-4*", model) && !glob_match("minimax-m2*", model) {
        return;
    }
    let Some(messages) = payload.get("messages").and_then(|m| m.as_array()) else {
        return;
    };
    for (idx, msg) in messages.iter().enumerate() {
        if msg.get("role").and_then(|r| r.as_str()) == Some("assistant")
            && msg
                .get("reasoning_content")
                .and_then(|r| r.as_str())
                .is_some_and(|r| !r.is_empty())
        {
            tracing::debug!(
                model,
                message_index = idx,
                "assistant message retains reasoning_content"
            );
        }
    }
}

#[async_trait]
impl Executor for IflowExecutor {
    fn identifier(&self) -> &'static str {
        "iflow"
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
            let (api_key, auth) = self.api_key(auth).await?;
            let payload = self.prepare_payload(&request, &opts, &suffix.base_model, false)?;

            let client = self.services.client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &api_key,
                    &format!("{base}/chat/completions"),
                    payload.clone(),
                ))
            })
            .await?;

            common::finish_non_stream(
                &self.services,
                resp,
                opts.source(),
                Format::OpenAI,
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
            let (api_key, auth) = self.api_key(auth).await?;
            let mut value: Value =
                serde_json::from_slice(&self.prepare_payload(&request, &opts, &suffix.base_model, true)?)?;
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
                    &format!("{base}/chat/completions"),
                    payload.clone(),
                ))
            })
            .await?;

            Ok(StreamPump::new(
                self.services.clone(),
                opts.source(),
                Format::OpenAI,
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
        if auth.meta_str("cookie").is_none() && auth.meta_str("refresh_token").is_none() {
            return Ok(auth.clone());
        }
        let (_, updated) = self.api_key(auth).await?;
        Ok(updated)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        let count = common::estimate_tokens(&request.payload);
        let rendered =
            self.services
                .translators
                .translate_token_count(opts.source(), Format::OpenAI, count);
        let _ = auth;
        Ok(ExecResponse {
            payload: Bytes::from(rendered),
            headers: Default::default(),
        })
    }
}
