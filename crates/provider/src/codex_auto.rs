use crate::codex::CodexExecutor;
use crate::codex_ws::CodexWsExecutor;
use async_trait::async_trait;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ALT_RESPONSES_COMPACT, ExecOptions, ExecRequest, ExecResponse, Executor,
    META_DOWNSTREAM_WEBSOCKET, StreamResult,
};
use std::sync::Arc;

/// Dispatch wrapper over the two Codex executors: the WebSocket path is
/// taken only when the downstream client itself arrived over a WebSocket
/// and the credential opted in; a 426 from the socket falls back to HTTP.
pub struct CodexAutoExecutor {
    http: Arc<CodexExecutor>,
    ws: Arc<CodexWsExecutor>,
}

impl CodexAutoExecutor {
    pub fn new(http: Arc<CodexExecutor>, ws: Arc<CodexWsExecutor>) -> Self {
        Self { http, ws }
    }

    pub fn websocket(&self) -> &Arc<CodexWsExecutor> {
        &self.ws
    }

    fn use_websocket(auth: &Auth, opts: &ExecOptions) -> bool {
        if opts.alt == ALT_RESPONSES_COMPACT {
            return false;
        }
        let downstream_ws = opts
            .metadata
            .get(META_DOWNSTREAM_WEBSOCKET)
            .is_some_and(|v| v == "true");
        let opted_in =
            auth.attribute("websockets") == Some("true") || auth.meta_bool("websockets");
        downstream_ws && opted_in
    }

    fn is_upgrade_required(err: &ProxyError) -> bool {
        err.is_status(426)
    }
}

#[async_trait]
impl Executor for CodexAutoExecutor {
    fn identifier(&self) -> &'static str {
        "codex"
    }

    fn prepare_request(
        &self,
        req: reqwest::RequestBuilder,
        auth: &Auth,
    ) -> reqwest::RequestBuilder {
        self.http.prepare_request(req, auth)
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        if Self::use_websocket(auth, &opts) {
            match self.ws.execute(auth, request.clone(), opts.clone()).await {
                Err(e) if Self::is_upgrade_required(&e) => {
                    tracing::info!("websocket upgrade rejected (426), falling back to HTTP");
                }
                other => return other,
            }
        }
        self.http.execute(auth, request, opts).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ProxyError> {
        if Self::use_websocket(auth, &opts) {
            match self.ws.execute_stream(auth, request.clone(), opts.clone()).await {
                Err(e) if Self::is_upgrade_required(&e) => {
                    tracing::info!("websocket upgrade rejected (426), falling back to HTTP");
                }
                other => return other,
            }
        }
        self.http.execute_stream(auth, request, opts).await
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ProxyError> {
        self.http.refresh(auth).await
    }

    async fn count_tokens(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        self.http.count_tokens(auth, request, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_selection() {
        let mut auth = Auth::default();
        let mut opts = ExecOptions::default();

        // Neither side asked for a socket.
        assert!(!CodexAutoExecutor::use_websocket(&auth, &opts));

        // Downstream WS alone is not enough; the auth must opt in.
        opts.metadata
            .insert(META_DOWNSTREAM_WEBSOCKET.into(), "true".into());
        assert!(!CodexAutoExecutor::use_websocket(&auth, &opts));

        auth.attributes.insert("websockets".into(), "true".into());
        assert!(CodexAutoExecutor::use_websocket(&auth, &opts));

        // The compaction sub-route is HTTP-only.
        opts.alt = ALT_RESPONSES_COMPACT.into();
        assert!(!CodexAutoExecutor::use_websocket(&auth, &opts));
    }

    #[test]
    fn test_426_detection() {
        assert!(CodexAutoExecutor::is_upgrade_required(
            &ProxyError::upstream(426, "Upgrade Required")
        ));
        assert!(!CodexAutoExecutor::is_upgrade_required(
            &ProxyError::upstream(429, "slow down")
        ));
        assert!(!CodexAutoExecutor::is_upgrade_required(&ProxyError::Network(
            "dial failed".into()
        )));
    }
}
