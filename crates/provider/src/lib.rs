pub mod antigravity;
pub mod claude;
pub mod codex;
pub mod codex_auto;
pub mod codex_cache;
pub mod codex_ws;
pub mod common;
pub mod gemini;
pub mod iflow;
pub mod kimi;
pub mod sse;
pub mod token;
pub mod vertex;

use common::ExecServices;
use manifold_core::executor::Executor;
use manifold_core::payload::PayloadConfig;
use manifold_core::thinking::ThinkingRegistry;
use manifold_core::usage::UsageQueue;
use std::collections::HashMap;
use std::sync::Arc;

/// Extract response headers from a reqwest Response into a map with
/// lowercase names.
pub fn extract_headers(resp: &reqwest::Response) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in resp.headers().iter() {
        if let Ok(v) = value.to_str() {
            headers.insert(key.as_str().to_string(), v.to_string());
        }
    }
    headers
}

/// Parse a `Retry-After` header as delta-seconds or an HTTP-date.
pub fn parse_retry_after(headers: &HashMap<String, String>) -> Option<u64> {
    let value = headers.get("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_seconds().max(0) as u64)
}

/// All executors for one process, keyed by provider identifier.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &Arc<dyn Executor>)> {
        self.executors.iter()
    }
}

/// Build the shared services plus one executor per provider. The usage
/// queue, thinking registry and Codex prompt cache are constructed here
/// and injected; their background tasks start immediately.
pub fn build_executors(
    translators: Arc<manifold_translator::TranslatorRegistry>,
    payload_rules: Arc<PayloadConfig>,
    usage: Arc<UsageQueue>,
    global_proxy: Option<String>,
) -> (Arc<ExecServices>, ExecutorRegistry) {
    let services = Arc::new(ExecServices {
        translators,
        payload_rules,
        thinking: Arc::new(ThinkingRegistry::with_defaults()),
        usage,
        global_proxy: global_proxy.clone(),
    });
    let tokens = Arc::new(token::TokenService::new(global_proxy));

    let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();

    let gemini = Arc::new(gemini::GeminiExecutor::new(services.clone(), tokens.clone()));
    executors.insert("gemini".into(), gemini);

    let vertex = Arc::new(vertex::VertexExecutor::new(services.clone(), tokens.clone()));
    executors.insert("vertex".into(), vertex);

    let antigravity = Arc::new(antigravity::AntigravityExecutor::new(
        services.clone(),
        tokens.clone(),
    ));
    executors.insert("antigravity".into(), antigravity);

    let claude = Arc::new(claude::ClaudeExecutor::new(services.clone(), tokens.clone()));
    executors.insert("claude".into(), claude.clone());

    let iflow = Arc::new(iflow::IflowExecutor::new(services.clone(), tokens.clone()));
    executors.insert("iflow".into(), iflow);

    let kimi = Arc::new(kimi::KimiExecutor::new(
        services.clone(),
        tokens.clone(),
        claude,
    ));
    executors.insert("kimi".into(), kimi);

    let cache = codex_cache::CodexPromptCache::new();
    let codex_http = Arc::new(codex::CodexExecutor::new(
        services.clone(),
        tokens.clone(),
        cache,
    ));
    let codex_ws = Arc::new(codex_ws::CodexWsExecutor::new(codex_http.clone()));
    let codex_auto = Arc::new(codex_auto::CodexAutoExecutor::new(codex_http, codex_ws));
    executors.insert("codex".into(), codex_auto);

    (services, ExecutorRegistry { executors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::executor::{ALT_RESPONSES_COMPACT, ExecOptions, ExecRequest, Format};

    #[test]
    fn test_parse_retry_after_seconds_and_date() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "30".to_string());
        assert_eq!(parse_retry_after(&headers), Some(30));

        let future = (chrono::Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        headers.insert("retry-after".to_string(), future);
        let parsed = parse_retry_after(&headers).unwrap();
        assert!((85..=90).contains(&parsed), "parsed={parsed}");

        let past = (chrono::Utc::now() - chrono::Duration::seconds(90)).to_rfc2822();
        headers.insert("retry-after".to_string(), past);
        assert_eq!(parse_retry_after(&headers), Some(0));

        headers.insert("retry-after".to_string(), "soon".to_string());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_registry_covers_all_providers() {
        let (_, registry) = build_executors(
            Arc::new(manifold_translator::build_registry()),
            Arc::new(PayloadConfig::default()),
            UsageQueue::new(16),
            None,
        );
        for provider in ["gemini", "vertex", "antigravity", "claude", "iflow", "kimi", "codex"] {
            assert!(registry.get(provider).is_some(), "missing {provider}");
        }
        assert!(registry.get("unknown").is_none());
    }

    /// Executors without the compaction sub-route reject it with 501
    /// before touching the network.
    #[tokio::test]
    async fn test_compact_alt_rejected_with_501() {
        let (_, registry) = build_executors(
            Arc::new(manifold_translator::build_registry()),
            Arc::new(PayloadConfig::default()),
            UsageQueue::new(16),
            None,
        );
        let request = ExecRequest {
            model: "some-model".into(),
            payload: bytes::Bytes::from_static(b"{\"messages\":[]}"),
            ..Default::default()
        };
        let opts = ExecOptions {
            source_format: Some(Format::OpenAI),
            alt: ALT_RESPONSES_COMPACT.into(),
            original_request: request.payload.clone(),
            ..Default::default()
        };
        for provider in ["gemini", "vertex", "antigravity", "claude", "iflow", "kimi"] {
            let executor = registry.get(provider).unwrap();
            let err = executor
                .execute(&Default::default(), request.clone(), opts.clone())
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), 501, "{provider} should reject compact");
        }
    }
}
