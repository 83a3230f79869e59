use chrono::Utc;
use dashmap::DashMap;
use manifold_core::auth::{Auth, TokenUpdate};
use manifold_core::error::ProxyError;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a provider mints a fresh access token.
pub enum RefreshFlow<'a> {
    /// Standard OAuth2 refresh-token grant.
    OAuth {
        token_url: &'a str,
        client_id: &'a str,
        client_secret: Option<&'a str>,
    },
    /// Google service-account JWT assertion exchange.
    ServiceAccount { scope: &'a str },
    /// Cookie-authenticated endpoint that mints an API key.
    Cookie { endpoint: &'a str },
}

/// A recent refresh result is reused instead of re-hitting the endpoint
/// when concurrent callers pile up behind the per-auth lock.
const REFRESH_REUSE_WINDOW: Duration = Duration::from_secs(30);

/// Refreshes OAuth tokens, service-account JWTs and cookie-derived API
/// keys. Refresh is idempotent under concurrent callers: one lock per
/// auth id, and callers that queued behind a refresh reuse its result.
pub struct TokenService {
    global_proxy: Option<String>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    recent: DashMap<String, (Instant, Auth)>,
}

impl TokenService {
    pub fn new(global_proxy: Option<String>) -> Self {
        Self {
            global_proxy,
            locks: DashMap::new(),
            recent: DashMap::new(),
        }
    }

    /// Return a usable access token and the possibly-updated auth record.
    /// `flow == None` means the provider has nothing to refresh; the
    /// stored key/token is used as-is.
    pub async fn ensure_access_token(
        &self,
        auth: &Auth,
        flow: Option<RefreshFlow<'_>>,
    ) -> Result<(String, Auth), ProxyError> {
        if !auth.needs_refresh()
            && let Some(token) = auth.access_token()
        {
            return Ok((token.to_string(), auth.clone()));
        }

        let Some(flow) = flow else {
            // Nothing to refresh: fall back to a configured API key.
            if let Some(key) = auth.api_key() {
                return Ok((key.to_string(), auth.clone()));
            }
            return Err(ProxyError::Auth(format!(
                "credential {} has no access token or API key",
                auth.id
            )));
        };

        let lock = self
            .locks
            .entry(auth.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A refresh that just completed on this id serves queued callers.
        if let Some(entry) = self.recent.get(&auth.id)
            && entry.0.elapsed() < REFRESH_REUSE_WINDOW
            && let Some(token) = entry.1.access_token()
        {
            return Ok((token.to_string(), entry.1.clone()));
        }

        let updated = match flow {
            RefreshFlow::OAuth {
                token_url,
                client_id,
                client_secret,
            } => {
                self.refresh_oauth(auth, token_url, client_id, client_secret)
                    .await?
            }
            RefreshFlow::ServiceAccount { scope } => {
                self.refresh_service_account(auth, scope).await?
            }
            RefreshFlow::Cookie { endpoint } => self.refresh_cookie(auth, endpoint).await?,
        };

        let token = updated
            .access_token()
            .or_else(|| updated.api_key())
            .ok_or_else(|| ProxyError::Auth("refresh produced no token".into()))?
            .to_string();
        self.recent
            .insert(auth.id.clone(), (Instant::now(), updated.clone()));
        Ok((token, updated))
    }

    fn client(&self, auth: &Auth) -> Result<reqwest::Client, ProxyError> {
        manifold_core::proxy::build_http_client_with_timeout(
            auth.proxy_url.as_deref(),
            self.global_proxy.as_deref(),
            15,
            60,
        )
        .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))
    }

    async fn refresh_oauth(
        &self,
        auth: &Auth,
        token_url: &str,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<Auth, ProxyError> {
        let refresh_token = auth
            .meta_str("refresh_token")
            .ok_or_else(|| ProxyError::Auth(format!("credential {} has no refresh token", auth.id)))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", client_id.to_string()),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret.to_string()));
        }

        let resp = self
            .client(auth)?
            .post(token_url)
            .form(&form)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        if status >= 400 {
            tracing::warn!(auth_id = %auth.id, status, "OAuth token refresh failed");
            return Err(ProxyError::Auth(format!(
                "token refresh failed with status {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let token: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::Auth(format!("malformed token response: {e}")))?;
        let access_token = token
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::Auth("token response missing access_token".into()))?;

        let mut updated = auth.clone();
        updated.record_refreshed_token(&TokenUpdate {
            access_token: access_token.to_string(),
            refresh_token: token
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            expires_in: token.get("expires_in").and_then(|v| v.as_i64()),
            token_type: Some("oauth".into()),
            mirror_api_key: false,
        });
        tracing::debug!(auth_id = %auth.id, "OAuth token refreshed");
        Ok(updated)
    }

    async fn refresh_service_account(
        &self,
        auth: &Auth,
        scope: &str,
    ) -> Result<Auth, ProxyError> {
        let sa = auth
            .metadata
            .get("service_account")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                ProxyError::Auth(format!("credential {} has no service_account", auth.id))
            })?;
        let client_email = sa
            .get("client_email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::Auth("service_account missing client_email".into()))?;
        let private_key = sa
            .get("private_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::Auth("service_account missing private_key".into()))?;
        let token_uri = sa
            .get("token_uri")
            .and_then(|v| v.as_str())
            .unwrap_or("https://oauth2.googleapis.com/token");

        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": client_email,
            "scope": scope,
            "aud": token_uri,
            "iat": now,
            "exp": now + 3600,
        });
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| ProxyError::Auth(format!("invalid service-account key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| ProxyError::Auth(format!("failed to sign JWT assertion: {e}")))?;

        let resp = self
            .client(auth)?
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        if status >= 400 {
            return Err(ProxyError::Auth(format!(
                "service-account token exchange failed with status {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let token: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::Auth(format!("malformed token response: {e}")))?;
        let access_token = token
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::Auth("token response missing access_token".into()))?;

        let mut updated = auth.clone();
        updated.record_refreshed_token(&TokenUpdate {
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_in: token.get("expires_in").and_then(|v| v.as_i64()),
            token_type: Some("service_account".into()),
            mirror_api_key: false,
        });
        Ok(updated)
    }

    async fn refresh_cookie(&self, auth: &Auth, endpoint: &str) -> Result<Auth, ProxyError> {
        let cookie = auth
            .meta_str("cookie")
            .ok_or_else(|| ProxyError::Auth(format!("credential {} has no cookie", auth.id)))?;

        let mut req = self.client(auth)?.get(endpoint).header("cookie", cookie);
        if let Some(email) = auth.meta_str("email") {
            req = req.query(&[("email", email)]);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        if status >= 400 {
            return Err(ProxyError::Auth(format!(
                "cookie API-key mint failed with status {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let v: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::Auth(format!("malformed API-key response: {e}")))?;
        let api_key = v
            .get("apiKey")
            .or_else(|| v.get("api_key"))
            .or_else(|| v.get("data").and_then(|d| d.get("apiKey")))
            .and_then(|k| k.as_str())
            .ok_or_else(|| ProxyError::Auth("API-key response missing key".into()))?;

        let mut updated = auth.clone();
        updated.record_refreshed_token(&TokenUpdate {
            access_token: api_key.to_string(),
            refresh_token: None,
            // Minted keys carry no expiry; refresh again on the skew window.
            expires_in: Some(3600),
            token_type: Some("cookie".into()),
            mirror_api_key: true,
        });
        Ok(updated)
    }
}
