use crate::auth::Auth;
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tokio_stream::Stream;

/// Supported client/provider schema identifiers. Registry lookups are
/// case-exact on the enum, not on the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    OpenAI,
    OpenAIResponses,
    Claude,
    Gemini,
    GeminiCli,
    Codex,
    Antigravity,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::OpenAIResponses => "openai-responses",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::GeminiCli => "gemini-cli",
            Self::Codex => "codex",
            Self::Antigravity => "antigravity",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAI),
            "openai-responses" | "openai_responses" => Ok(Self::OpenAIResponses),
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "gemini-cli" | "gemini_cli" => Ok(Self::GeminiCli),
            "codex" => Ok(Self::Codex),
            "antigravity" => Ok(Self::Antigravity),
            _ => Err(format!("unknown format: {s}")),
        }
    }
}

/// `alt` value for SSE streaming requests.
pub const ALT_SSE: &str = "sse";
/// `alt` value for the restricted Codex compaction sub-route.
pub const ALT_RESPONSES_COMPACT: &str = "responses/compact";

/// `ExecOptions.metadata` key carrying the client-visible model name,
/// including any reasoning suffix.
pub const META_REQUESTED_MODEL: &str = "requestedModel";
/// `ExecOptions.metadata` key binding a request to a Codex WebSocket
/// execution session.
pub const META_EXECUTION_SESSION: &str = "executionSession";
/// `ExecOptions.metadata` key set when the downstream client connected over
/// a WebSocket transport.
pub const META_DOWNSTREAM_WEBSOCKET: &str = "downstreamWebsocket";

/// A request to be executed against an upstream provider.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub model: String,
    /// Valid JSON in the caller's schema.
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub source_format: Option<Format>,
    /// `""`, `"sse"`, or `"responses/compact"`.
    pub alt: String,
    pub stream: bool,
    /// The request as the client sent it, before any normalization.
    pub original_request: Bytes,
    pub metadata: HashMap<String, String>,
}

impl ExecOptions {
    pub fn source(&self) -> Format {
        self.source_format.unwrap_or(Format::OpenAI)
    }

    /// The client-visible model name including any reasoning suffix.
    pub fn requested_model<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.metadata
            .get(META_REQUESTED_MODEL)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
    }
}

/// A non-streaming response, already translated into the caller's schema.
#[derive(Debug, Clone, Default)]
pub struct ExecResponse {
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// A single chunk in a streaming response: one or more already-translated
/// SSE lines in the caller's schema.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub payload: String,
}

/// The result of a streaming execution. The producing task owns the channel
/// until close; the consumer must drain it. The final error, if any, arrives
/// as a terminal `Err` item.
pub struct StreamResult {
    pub headers: HashMap<String, String>,
    pub chunks: Pin<Box<dyn Stream<Item = Result<StreamChunk, ProxyError>> + Send>>,
}

/// Provider executor contract. One implementation per upstream provider,
/// owning credential refresh, retry/fallback, upstream I/O and streaming
/// fan-out.
#[async_trait]
pub trait Executor: Send + Sync {
    fn identifier(&self) -> &'static str;

    /// Inject provider headers into an outgoing request. Headers only.
    fn prepare_request(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        let _ = auth;
        req
    }

    /// Prepare and send a raw upstream request.
    async fn http_request(
        &self,
        auth: &Auth,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ProxyError> {
        Ok(self.prepare_request(req, auth).send().await?)
    }

    /// Execute a non-streaming request.
    async fn execute(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError>;

    /// Execute a streaming request.
    async fn execute_stream(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ProxyError>;

    /// Refresh the credential's token material. No-op by default.
    async fn refresh(&self, auth: &Auth) -> Result<Auth, ProxyError> {
        Ok(auth.clone())
    }

    /// Count tokens for a request, remotely or with a local estimate.
    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_format_round_trip() {
        for f in [
            Format::OpenAI,
            Format::OpenAIResponses,
            Format::Claude,
            Format::Gemini,
            Format::GeminiCli,
            Format::Codex,
            Format::Antigravity,
        ] {
            assert_eq!(Format::from_str(f.as_str()), Ok(f));
        }
        assert!(Format::from_str("grpc").is_err());
    }

    #[test]
    fn test_requested_model_fallback() {
        let mut opts = ExecOptions::default();
        assert_eq!(opts.requested_model("gemini-2.5-pro"), "gemini-2.5-pro");
        opts.metadata
            .insert(META_REQUESTED_MODEL.into(), "gemini-2.5-pro(high)".into());
        assert_eq!(opts.requested_model("gemini-2.5-pro"), "gemini-2.5-pro(high)");
    }
}
