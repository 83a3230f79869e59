use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Refresh a token when it expires within this window.
pub const REFRESH_SKEW: Duration = Duration::minutes(50);

/// A credential borrowed by executors. The record is created by an external
/// auth loader; only a provider's `refresh` may replace token fields, and
/// `id` stays stable across refreshes.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    /// String-valued settings (`api_key`, `base_url`, `user_agent`,
    /// `websockets`, custom header overrides).
    pub attributes: HashMap<String, String>,
    /// Token material and provider bookkeeping (`access_token`,
    /// `refresh_token`, `expired`, `project_id`, ...).
    pub metadata: Map<String, Value>,
    /// Per-credential proxy. `Some("")` forces a direct connection.
    pub proxy_url: Option<String>,
    /// Overrides the default retry count for requests using this credential.
    pub request_retry: Option<u32>,
    /// Position of this credential in the loader's list, for usage records.
    pub index: i32,
}

/// Fields written back after a successful token refresh.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    /// Mirror the token into `attributes.api_key` as well.
    pub mirror_api_key: bool,
}

impl Auth {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        let v = self.metadata.get(key)?;
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        match self.metadata.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }

    /// The configured API key, if any. Attributes take precedence over
    /// metadata (refresh mirrors minted keys into attributes).
    pub fn api_key(&self) -> Option<&str> {
        self.attribute("api_key").or_else(|| self.meta_str("api_key"))
    }

    /// The current access token, looking through the nested `token` object
    /// some providers store.
    pub fn access_token(&self) -> Option<&str> {
        if let Some(tok) = self.meta_str("access_token") {
            return Some(tok);
        }
        self.metadata
            .get("token")
            .and_then(|t| t.get("access_token"))
            .and_then(|v| v.as_str())
    }

    /// When the stored token expires: `metadata.expired` (RFC3339) wins,
    /// falling back to `timestamp + expires_in`.
    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        if let Some(expired) = self.meta_str("expired")
            && let Ok(ts) = DateTime::parse_from_rfc3339(expired)
        {
            return Some(ts.with_timezone(&Utc));
        }
        let timestamp = self.meta_i64("timestamp")?;
        let expires_in = self.meta_i64("expires_in")?;
        DateTime::<Utc>::from_timestamp(timestamp + expires_in, 0)
    }

    /// Whether the access token must be refreshed before use. A token with
    /// no recorded expiry is treated as stale when a refresh path exists.
    pub fn needs_refresh(&self) -> bool {
        if self.access_token().is_none() {
            return true;
        }
        match self.token_expiry() {
            Some(expiry) => expiry <= Utc::now() + REFRESH_SKEW,
            None => false,
        }
    }

    /// Write back the results of a token refresh. Keeps `id` untouched.
    pub fn record_refreshed_token(&mut self, update: &TokenUpdate) {
        let now = Utc::now();
        self.metadata.insert(
            "access_token".into(),
            Value::String(update.access_token.clone()),
        );
        if let Some(ref rt) = update.refresh_token {
            self.metadata
                .insert("refresh_token".into(), Value::String(rt.clone()));
        }
        if let Some(expires_in) = update.expires_in {
            self.metadata
                .insert("expires_in".into(), Value::from(expires_in));
            self.metadata
                .insert("timestamp".into(), Value::from(now.timestamp()));
            self.metadata.insert(
                "expired".into(),
                Value::String((now + Duration::seconds(expires_in)).to_rfc3339()),
            );
        }
        if let Some(ref ty) = update.token_type {
            self.metadata.insert("type".into(), Value::String(ty.clone()));
        }
        self.metadata
            .insert("last_refresh".into(), Value::String(now.to_rfc3339()));
        if update.mirror_api_key {
            self.attributes
                .insert("api_key".into(), update.access_token.clone());
            self.metadata.insert(
                "api_key".into(),
                Value::String(update.access_token.clone()),
            );
        }
    }

    /// Return the base URL override or the provider's default, without a
    /// trailing slash.
    pub fn base_url_or_default(&self, default: &str) -> String {
        self.attribute("base_url")
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    /// Header overrides configured on the credential (`header.<name>` keys).
    pub fn custom_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(k, v)| {
            k.strip_prefix("header.").map(|name| (name, v.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth_with_meta(meta: Value) -> Auth {
        Auth {
            id: "auth-1".into(),
            provider: "gemini".into(),
            metadata: meta.as_object().unwrap().clone(),
            ..Default::default()
        }
    }

    #[test]
    fn test_expiry_from_rfc3339() {
        let future = (Utc::now() + Duration::hours(2)).to_rfc3339();
        let auth = auth_with_meta(json!({"access_token": "t", "expired": future}));
        assert!(!auth.needs_refresh());
    }

    #[test]
    fn test_expiry_within_skew_needs_refresh() {
        let soon = (Utc::now() + Duration::minutes(10)).to_rfc3339();
        let auth = auth_with_meta(json!({"access_token": "t", "expired": soon}));
        assert!(auth.needs_refresh());
    }

    #[test]
    fn test_expiry_from_timestamp_pair() {
        let auth = auth_with_meta(json!({
            "access_token": "t",
            "timestamp": Utc::now().timestamp(),
            "expires_in": 7200,
        }));
        assert!(!auth.needs_refresh());

        let stale = auth_with_meta(json!({
            "access_token": "t",
            "timestamp": Utc::now().timestamp() - 7200,
            "expires_in": 7200,
        }));
        assert!(stale.needs_refresh());
    }

    #[test]
    fn test_missing_token_needs_refresh() {
        let auth = auth_with_meta(json!({}));
        assert!(auth.needs_refresh());
    }

    #[test]
    fn test_record_refreshed_token_writes_back() {
        let mut auth = auth_with_meta(json!({}));
        auth.record_refreshed_token(&TokenUpdate {
            access_token: "new-token".into(),
            refresh_token: Some("new-refresh".into()),
            expires_in: Some(3600),
            token_type: Some("oauth".into()),
            mirror_api_key: true,
        });
        assert_eq!(auth.access_token(), Some("new-token"));
        assert_eq!(auth.meta_str("refresh_token"), Some("new-refresh"));
        assert_eq!(auth.attribute("api_key"), Some("new-token"));
        assert!(auth.meta_str("expired").is_some());
        assert!(!auth.needs_refresh());
    }

    #[test]
    fn test_nested_token_object() {
        let auth = auth_with_meta(json!({"token": {"access_token": "nested"}}));
        assert_eq!(auth.access_token(), Some("nested"));
    }

    #[test]
    fn test_custom_headers() {
        let mut auth = Auth::default();
        auth.attributes
            .insert("header.x-custom".into(), "value".into());
        auth.attributes.insert("api_key".into(), "k".into());
        let headers: Vec<_> = auth.custom_headers().collect();
        assert_eq!(headers, vec![("x-custom", "value")]);
    }
}
