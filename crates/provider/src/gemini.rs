use crate::common::{self, ExecServices, StreamPump};
use crate::token::{RefreshFlow, TokenService};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, Format, StreamResult,
};
use manifold_core::thinking::parse_model_suffix;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";

/// Executor for the Gemini API on generativelanguage.googleapis.com,
/// authenticating with an API key or an OAuth Bearer token.
pub struct GeminiExecutor {
    services: Arc<ExecServices>,
    tokens: Arc<TokenService>,
}

impl GeminiExecutor {
    pub fn new(services: Arc<ExecServices>, tokens: Arc<TokenService>) -> Self {
        Self { services, tokens }
    }

    /// Returns (credential, is_api_key, updated auth).
    async fn credential(&self, auth: &Auth) -> Result<(String, bool, Auth), ProxyError> {
        if let Some(key) = auth.attribute("api_key") {
            return Ok((key.to_string(), true, auth.clone()));
        }
        let flow = auth.meta_str("refresh_token").map(|_| RefreshFlow::OAuth {
            token_url: OAUTH_TOKEN_URL,
            client_id: OAUTH_CLIENT_ID,
            client_secret: Some(OAUTH_CLIENT_SECRET),
        });
        let (token, updated) = self.tokens.ensure_access_token(auth, flow).await?;
        Ok((token, false, updated))
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        credential: &str,
        is_api_key: bool,
        url: &str,
        payload: Vec<u8>,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).header("content-type", "application/json");
        if is_api_key {
            req = req.header("x-goog-api-key", credential);
        } else {
            req = req.header("authorization", format!("Bearer {credential}"));
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
        if model.contains("-image") {
            apply_aspect_ratio_canvas(&mut value);
        }
        serde_json::to_vec(&value).map_err(|e| ProxyError::Internal(e.to_string()))
    }

    fn action_url(base: &str, model: &str, action: &str, alt: Option<&str>) -> String {
        let mut url = format!("{base}/v1beta/models/{model}:{action}");
        if let Some(alt) = alt {
            url.push_str(&format!("?alt={alt}"));
        }
        url
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        "gemini"
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
            let (credential, is_api_key, auth) = self.credential(auth).await?;
            let payload = self.prepare_payload(&request, &opts, &suffix.base_model, false)?;

            let client = self.services.client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &credential,
                    is_api_key,
                    &Self::action_url(base, &suffix.base_model, "generateContent", None),
                    payload.clone(),
                ))
            })
            .await?;

            common::finish_non_stream(
                &self.services,
                resp,
                opts.source(),
                Format::Gemini,
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
            let (credential, is_api_key, auth) = self.credential(auth).await?;
            let payload = self.prepare_payload(&request, &opts, &suffix.base_model, true)?;

            let client = self.services.streaming_client(&auth)?;
            let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);
            let retries = auth.request_retry.unwrap_or(0);
            let alt = if opts.alt.is_empty() {
                "sse"
            } else {
                opts.alt.as_str()
            };

            let resp = common::execute_with_fallback(&base_urls, retries, |base| {
                Ok(self.build_request(
                    &client,
                    &auth,
                    &credential,
                    is_api_key,
                    &Self::action_url(
                        base,
                        &suffix.base_model,
                        "streamGenerateContent",
                        Some(alt),
                    ),
                    payload.clone(),
                ))
            })
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
        if auth.attribute("api_key").is_some() || auth.meta_str("refresh_token").is_none() {
            return Ok(auth.clone());
        }
        let (_, _, updated) = self.credential(auth).await?;
        Ok(updated)
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        let suffix = parse_model_suffix(&request.model);
        let (credential, is_api_key, auth) = self.credential(auth).await?;
        let payload = self.prepare_payload(&request, &opts, &suffix.base_model, false)?;

        let client = self.services.client(&auth)?;
        let base_urls = common::fallback_base_urls(&auth, &[DEFAULT_BASE_URL]);

        let resp = common::execute_with_fallback(&base_urls, 0, |base| {
            Ok(self.build_request(
                &client,
                &auth,
                &credential,
                is_api_key,
                &Self::action_url(base, &suffix.base_model, "countTokens", None),
                payload.clone(),
            ))
        })
        .await?;

        let headers = crate::extract_headers(&resp);
        let body = resp.bytes().await?;
        if matches!(opts.source(), Format::Gemini) {
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

// ─── Aspect-ratio canvas ───────────────────────────────────────────────────

const CANVAS_SCALE: u32 = 8;
const CANVAS_INSTRUCTION: &str = "Use the attached blank canvas as the output frame: \
generate the image to exactly fill its aspect ratio.";

/// When the caller pinned an aspect ratio but attached no reference image,
/// prepend a blank canvas of that ratio plus an instruction, so the model
/// composes within the requested frame.
fn apply_aspect_ratio_canvas(payload: &mut Value) {
    let Some(ratio) = payload
        .get("generationConfig")
        .and_then(|gc| gc.get("imageConfig"))
        .and_then(|ic| ic.get("aspectRatio"))
        .and_then(|r| r.as_str())
    else {
        return;
    };
    let Some((w, h)) = parse_ratio(ratio) else {
        return;
    };
    if has_inline_image(payload) {
        return;
    }

    let png = canvas_png(w * CANVAS_SCALE, h * CANVAS_SCALE);
    let canvas = json!({
        "role": "user",
        "parts": [
            {"text": CANVAS_INSTRUCTION},
            {"inlineData": {
                "mimeType": "image/png",
                "data": base64::engine::general_purpose::STANDARD.encode(png),
            }},
        ],
    });

    if let Some(contents) = payload.get_mut("contents").and_then(|c| c.as_array_mut()) {
        contents.insert(0, canvas);
    }
}

fn parse_ratio(ratio: &str) -> Option<(u32, u32)> {
    let (w, h) = ratio.split_once(':')?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    if w == 0 || h == 0 || w > 64 || h > 64 {
        return None;
    }
    Some((w, h))
}

fn has_inline_image(payload: &Value) -> bool {
    payload
        .get("contents")
        .and_then(|c| c.as_array())
        .is_some_and(|contents| {
            contents.iter().any(|content| {
                content
                    .get("parts")
                    .and_then(|p| p.as_array())
                    .is_some_and(|parts| parts.iter().any(|part| part.get("inlineData").is_some()))
            })
        })
}

/// Encode a white grayscale PNG of the given dimensions using stored
/// (uncompressed) deflate blocks, so no image dependency is needed for a
/// canvas a few hundred bytes large.
fn canvas_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 0, 0, 0, 0]); // 8-bit grayscale
    write_chunk(&mut out, b"IHDR", &ihdr);

    // Raw image data: one filter byte then `width` white pixels per row.
    let mut raw = Vec::with_capacity((height * (width + 1)) as usize);
    for _ in 0..height {
        raw.push(0);
        raw.extend(std::iter::repeat_n(0xFF, width as usize));
    }

    // zlib wrapper with stored deflate blocks.
    let mut idat = vec![0x78, 0x01];
    let mut offset = 0;
    while offset < raw.len() {
        let len = (raw.len() - offset).min(0xFFFF);
        let last = offset + len == raw.len();
        idat.push(if last { 1 } else { 0 });
        idat.extend_from_slice(&(len as u16).to_le_bytes());
        idat.extend_from_slice(&(!(len as u16)).to_le_bytes());
        idat.extend_from_slice(&raw[offset..offset + len]);
        offset += len;
    }
    idat.extend_from_slice(&adler32(&raw).to_be_bytes());
    write_chunk(&mut out, b"IDAT", &idat);

    write_chunk(&mut out, b"IEND", &[]);
    out
}

fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut crc_input = Vec::with_capacity(4 + data.len());
    crc_input.extend_from_slice(kind);
    crc_input.extend_from_slice(data);
    out.extend_from_slice(&crc32(&crc_input).to_be_bytes());
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn adler32(data: &[u8]) -> u32 {
    let mut a = 1u32;
    let mut b = 0u32;
    for &byte in data {
        a = (a + byte as u32) % 65521;
        b = (b + a) % 65521;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canvas_png_structure() {
        let png = canvas_png(16, 9);
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        assert_eq!(&png[12..16], b"IHDR");
        assert_eq!(&png[16..20], 16u32.to_be_bytes());
        assert_eq!(&png[20..24], 9u32.to_be_bytes());
        assert_eq!(&png[png.len() - 8..png.len() - 4], b"IEND");
    }

    #[test]
    fn test_crc32_known_value() {
        // CRC-32 of "IEND" with empty data, as in every PNG trailer.
        assert_eq!(crc32(b"IEND"), 0xAE42_6082);
    }

    #[test]
    fn test_aspect_ratio_canvas_prepended() {
        let mut payload = json!({
            "contents": [{"role": "user", "parts": [{"text": "a red fox"}]}],
            "generationConfig": {"imageConfig": {"aspectRatio": "16:9"}}
        });
        apply_aspect_ratio_canvas(&mut payload);
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert!(contents[0]["parts"][1]["inlineData"]["data"].is_string());
        assert_eq!(contents[0]["parts"][1]["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn test_aspect_ratio_canvas_skipped_with_existing_image() {
        let mut payload = json!({
            "contents": [{"role": "user", "parts": [
                {"inlineData": {"mimeType": "image/png", "data": "AA=="}}
            ]}],
            "generationConfig": {"imageConfig": {"aspectRatio": "16:9"}}
        });
        let before = payload.clone();
        apply_aspect_ratio_canvas(&mut payload);
        assert_eq!(payload, before);
    }

    #[test]
    fn test_parse_ratio() {
        assert_eq!(parse_ratio("16:9"), Some((16, 9)));
        assert_eq!(parse_ratio("1:1"), Some((1, 1)));
        assert_eq!(parse_ratio("wide"), None);
        assert_eq!(parse_ratio("0:9"), None);
    }
}
