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
use serde_json::{Value, json};
use std::sync::Arc;

const API_KEY_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Executor for Vertex AI, in API-key mode (generative language publisher
/// endpoint) or service-account mode (regional aiplatform endpoint).
pub struct VertexExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
}

enum VertexMode {
    ApiKey(String),
    ServiceAccount {
        token: String,
        project: String,
        location: String,
    },
}

impl VertexExecutor {
    pub fn new(services: Arc<ExecServices>, tokens: Arc<TokenService>) -> Self {
        Self { services, tokens }
    }

    async fn mode(&self, auth: &Auth) -> Result<(VertexMode, Auth), ProxyError> {
        if let Some(key) = auth.attribute("api_key") {
            return Ok((VertexMode::ApiKey(key.to_string()), auth.clone()));
        }
        let (token, updated) = self
            .tokens
            .ensure_access_token(
                auth,
                Some(RefreshFlow::ServiceAccount {
                    scope: CLOUD_PLATFORM_SCOPE,
                }),
            )
            .await?;
        let project = updated
            .meta_str("project_id")
            .or_else(|| updated.meta_str("project"))
            .or_else(|| {
                updated
                    .metadata
                    .get("service_account")
                    .and_then(|sa| sa.get("project_id"))
                    .and_then(|v| v.as_str())
            })
            .ok_or_else(|| ProxyError::Auth("vertex credential has no project".into()))?
            .to_string();
        let location = updated
            .meta_str("location")
            .unwrap_or("global")
            .to_string();
        Ok((
            VertexMode::ServiceAccount {
                token,
                project,
                location,
            },
            updated,
        ))
    }

    fn action_url(mode: &VertexMode, auth: &Auth, model: &str, action: &str) -> String {
        match mode {
            VertexMode::ApiKey(_) => {
                let base = auth.base_url_or_default(API_KEY_BASE_URL);
                format!("{base}/v1/publishers/google/models/{model}:{action}")
            }
            VertexMode::ServiceAccount {
                project, location, ..
            } => {
                let host = if location == "global" {
                    "https://aiplatform.googleapis.com".to_string()
                } else {
                    format!("https://{location}-aiplatform.googleapis.com")
                };
                let base = auth.base_url_or_default(&host);
                format!(
                    "{base}/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:{action}"
                )
            }
        }
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        mode: &VertexMode,
        url: &str,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).header("content-type", "application/json");
        req = match mode {
            VertexMode::ApiKey(key) => req.header("x-goog-api-key", key),
            VertexMode::ServiceAccount { token, .. } => {
                req.header("authorization", format!("Bearer {token}"))
            }
        };
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
            Format::Gemini,
            self.identifier(),
            model,
            request,
            opts,
            stream,
            None,
        )?;
        let mut value: Value = serde_json::from_slice(&payload)?;
        common::strip_request_fields(&mut value, &["session_id", "model"]);
        if is_imagen_model(model) {
            value = gemini_to_imagen_request(&value);
        }
        serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))
    }
}

fn is_imagen_model(model: &str) -> bool {
    model.starts_with("imagen")
}

/// Convert a Gemini-style request into the Imagen `:predict` shape: the
/// last user text becomes the prompt, image options become parameters.
fn gemini_to_imagen_request(gemini: &Value) -> Value {
    let prompt = gemini
        .get("contents")
        .and_then(|c| c.as_array())
        .and_then(|contents| {
            contents
                .iter()
                .rev()
                .find(|c| c.get("role").and_then(|r| r.as_str()) != Some("model"))
        })
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let mut parameters = json!({"sampleCount": 1});
    if let Some(image_config) = gemini
        .get("generationConfig")
        .and_then(|gc| gc.get("imageConfig"))
    {
        if let Some(ratio) = image_config.get("aspectRatio") {
            parameters["aspectRatio"] = ratio.clone();
        }
        if let Some(count) = image_config.get("numberOfImages") {
            parameters["sampleCount"] = count.clone();
        }
    }

    json!({
        "instances": [{"prompt": prompt}],
        "parameters": parameters,
    })
}

/// Convert an Imagen `:predict` response back into a Gemini response so
/// the standard translators apply.
fn imagen_to_gemini_response(imagen: &Value) -> Value {
    let parts: Vec<Value> = imagen
        .get("predictions")
        .and_then(|p| p.as_array())
        .map(|predictions| {
            predictions
                .iter()
                .filter_map(|pred| {
                    let data = pred.get("bytesBase64Encoded").and_then(|b| b.as_str())?;
                    Some(json!({
                        "inlineData": {
                            "mimeType": pred
                                .get("mimeType")
                                .and_then(|m| m.as_str())
                                .unwrap_or("image/png"),
                            "data": data,
                        }
                    }))
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": "STOP",
        }]
    })
}

#[async_trait]
impl Executor for VertexExecutor {
    fn identifier(&self) -> &'static str {
        "vertex"
    }

    fn prepare_request(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        let req = match auth.attribute("api_key") {
            Some(key) => req.header("x-goog-api-key", key),
            None => req,
        };
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
            let (mode, auth) = self.mode(auth).await?;
            let payload = self.prepare_payload(&request, &opts, &suffix.base_model, false)?;
            let imagen = is_imagen_model(&suffix.base_model);
            let action = if imagen { "predict" } else { "generateContent" };

            let client = self.services.client(&auth)?;
            let url = Self::action_url(&mode, &auth, &suffix.base_model, action);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(
                &[url.clone()],
                retries,
                |_| Ok(self.build_request(&client, &auth, &mode, &url, payload.clone())),
            )
            .await?;

            let headers = crate::extract_headers(&resp);
            let mut body = resp.bytes().await?;
            if imagen
                && let Ok(v) = serde_json::from_slice::<Value>(&body)
            {
                body = Bytes::from(
                    serde_json::to_vec(&imagen_to_gemini_response(&v))
                        .map_err(|e| ProxyError::Internal(e.to_string()))?,
                );
            }

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
            if is_imagen_model(&suffix.base_model) {
                return Err(ProxyError::BadRequest(
                    "imagen models do not support streaming".into(),
                ));
            }
            let (mode, auth) = self.mode(auth).await?;
            let payload = self.prepare_payload(&request, &opts, &suffix.base_model, true)?;

            let client = self.services.streaming_client(&auth)?;
            let alt = if opts.alt.is_empty() {
                "sse"
            } else {
                opts.alt.as_str()
            };
            let url = format!(
                "{}?alt={alt}",
                Self::action_url(&mode, &auth, &suffix.base_model, "streamGenerateContent")
            );
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(
                &[url.clone()],
                retries,
                |_| Ok(self.build_request(&client, &auth, &mode, &url, payload.clone())),
            )
            .await?;

            Ok(StreamPump::new(
                self.services.clone(),
                opts.source(),
                Format::Gemini,
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
        if auth.attribute("api_key").is_some() {
            return Ok(auth.clone());
        }
        let (_mode, updated) = self.mode(auth).await?;
        Ok(updated)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        let suffix = parse_model_suffix(&request.model);
        let (mode, auth) = self.mode(auth).await?;
        let payload = self.prepare_payload(&request, &opts, &suffix.base_model, false)?;

        let client = self.services.client(&auth)?;
        let url = Self::action_url(&mode, &auth, &suffix.base_model, "countTokens");

        let resp = common::execute_with_fallback(&[url.clone()], 0, |_| {
            Ok(self.build_request(&client, &auth, &mode, &url, payload.clone()))
        })
        .await?;

        let headers = crate::extract_headers(&resp);
        let body = resp.bytes().await?;
        if matches!(opts.source(), Format::Gemini | Format::GeminiCli) {
            return Ok(ExecResponse {
                payload: body,
                headers,
            });
        }
        let count = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("totalTokens").and_then(|t| t.as_u64()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imagen_request_conversion() {
        let gemini = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "a lighthouse"}, {"text": "at dusk"}]}
            ],
            "generationConfig": {"imageConfig": {"aspectRatio": "16:9", "numberOfImages": 2}}
        });
        let imagen = gemini_to_imagen_request(&gemini);
        assert_eq!(imagen["instances"][0]["prompt"], "a lighthouse\nat dusk");
        assert_eq!(imagen["parameters"]["aspectRatio"], "16:9");
        assert_eq!(imagen["parameters"]["sampleCount"], 2);
    }

    #[test]
    fn test_imagen_response_conversion() {
        let imagen = json!({
            "predictions": [
                {"bytesBase64Encoded": "QUJD", "mimeType": "image/png"},
                {"bytesBase64Encoded": "REVG"}
            ]
        });
        let gemini = imagen_to_gemini_response(&imagen);
        let parts = gemini["candidates"][0]["content"]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["inlineData"]["data"], "QUJD");
        assert_eq!(gemini["candidates"][0]["finishReason"], "STOP");
    }

    #[test]
    fn test_action_url_modes() {
        let auth = Auth::default();
        let key_mode = VertexMode::ApiKey("k".into());
        assert_eq!(
            VertexExecutor::action_url(&key_mode, &auth, "gemini-2.5-pro", "generateContent"),
            "https://generativelanguage.googleapis.com/v1/publishers/google/models/gemini-2.5-pro:generateContent"
        );

        let sa_mode = VertexMode::ServiceAccount {
            token: "t".into(),
            project: "proj".into(),
            location: "us-central1".into(),
        };
        assert_eq!(
            VertexExecutor::action_url(&sa_mode, &auth, "gemini-2.5-pro", "generateContent"),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/proj/locations/us-central1/publishers/google/models/gemini-2.5-pro:generateContent"
        );

        let global_mode = VertexMode::ServiceAccount {
            token: "t".into(),
            project: "proj".into(),
            location: "global".into(),
        };
        assert!(
            VertexExecutor::action_url(&global_mode, &auth, "m", "countTokens")
                .starts_with("https://aiplatform.googleapis.com/v1/projects/proj/locations/global/")
        );
    }
}
