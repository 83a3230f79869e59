use crate::codex::CodexExecutor;
use crate::common::{self, ExecServices};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use manifold_core::auth::Auth;
use manifold_core::error::ProxyError;
use manifold_core::executor::{
    ExecOptions, ExecRequest, ExecResponse, Executor, Format, META_EXECUTION_SESSION, StreamChunk,
    StreamResult,
};
use manifold_core::thinking::parse_model_suffix;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const WS_BETA_HEADER: &str = "responses_websockets=2026-02-04";
const READ_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Passing this id to [`CodexWsExecutor::close_execution_session`] closes
/// every live session.
pub const CLOSE_ALL_SESSIONS: &str = "*";

// ─── Connection ────────────────────────────────────────────────────────────

enum WsCommand {
    Send {
        message: Message,
        tx_result: oneshot::Sender<Result<(), WsError>>,
    },
    Close,
}

/// One upstream WebSocket connection, owned by a pump task. The command
/// channel is the single write path; the pump is the single reader and
/// answers pings inline.
struct WsConn {
    tx_command: mpsc::Sender<WsCommand>,
    rx_message: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Message, WsError>>>,
}

impl WsConn {
    fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Arc<Self> {
        let (tx_command, mut rx_command) = mpsc::channel::<WsCommand>(8);
        let (tx_message, rx_message) = mpsc::unbounded_channel::<Result<Message, WsError>>();

        tokio::spawn(async move {
            use futures::{SinkExt, StreamExt};
            let mut inner = inner;
            loop {
                tokio::select! {
                    command = rx_command.recv() => {
                        match command {
                            Some(WsCommand::Send { message, tx_result }) => {
                                let result = inner.send(message).await;
                                let failed = result.is_err();
                                let _ = tx_result.send(result);
                                if failed {
                                    break;
                                }
                            }
                            Some(WsCommand::Close) | None => {
                                let _ = inner.close(None).await;
                                break;
                            }
                        }
                    }
                    message = inner.next() => {
                        let Some(message) = message else { break };
                        match message {
                            Ok(Message::Ping(payload)) => {
                                if inner.send(Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Message::Pong(_)) => {}
                            Ok(message) => {
                                let is_close = matches!(message, Message::Close(_));
                                if tx_message.send(Ok(message)).is_err() || is_close {
                                    break;
                                }
                            }
                            Err(err) => {
                                let _ = tx_message.send(Err(err));
                                break;
                            }
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            tx_command,
            rx_message: tokio::sync::Mutex::new(rx_message),
        })
    }

    async fn send_text(&self, text: String) -> Result<(), ProxyError> {
        let (tx_result, rx_result) = oneshot::channel();
        if self
            .tx_command
            .send(WsCommand::Send {
                message: Message::Text(text.into()),
                tx_result,
            })
            .await
            .is_err()
        {
            return Err(ProxyError::Network("websocket connection closed".into()));
        }
        rx_result
            .await
            .unwrap_or(Err(WsError::ConnectionClosed))
            .map_err(|e| ProxyError::Network(format!("websocket send failed: {e}")))
    }

    async fn close(&self) {
        let _ = self.tx_command.send(WsCommand::Close).await;
    }
}

// ─── Session state ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    conn: Option<Arc<WsConn>>,
    conn_create_sent: bool,
}

/// Per-execution-session connection reuse. Request lifecycles within a
/// session are serialized by `req_mu`; the connection's pump task is the
/// single writer and reader.
struct WsSession {
    req_mu: Arc<tokio::sync::Mutex<()>>,
    state: std::sync::Mutex<SessionState>,
}

impl WsSession {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            req_mu: Arc::new(tokio::sync::Mutex::new(())),
            state: std::sync::Mutex::new(SessionState::default()),
        })
    }

    fn current_conn(&self) -> (Option<Arc<WsConn>>, bool) {
        let state = self.state.lock().unwrap();
        (state.conn.clone(), state.conn_create_sent)
    }

    fn install_conn(&self, conn: Arc<WsConn>) {
        let mut state = self.state.lock().unwrap();
        state.conn = Some(conn);
        state.conn_create_sent = false;
    }

    fn mark_create_sent(&self) {
        self.state.lock().unwrap().conn_create_sent = true;
    }

    /// Drop the connection and reset the first-frame rule.
    fn invalidate(&self) -> Option<Arc<WsConn>> {
        let mut state = self.state.lock().unwrap();
        state.conn_create_sent = false;
        state.conn.take()
    }
}

/// The first frame on any connection is `response.create`; appends are
/// only legal once a create was sent on this connection and the payload
/// names the response it continues.
fn build_ws_frame(payload: &Value, allow_append: bool) -> Value {
    let mut frame = payload.clone();
    let use_append = allow_append && payload.get("previous_response_id").is_some();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert(
            "type".into(),
            Value::String(
                if use_append {
                    "response.append"
                } else {
                    "response.create"
                }
                .to_string(),
            ),
        );
    }
    frame
}

/// Parse a `type:"error"` envelope into the status error, preserving the
/// upstream `error` sub-object and any attached headers.
fn parse_error_envelope(text: &str) -> Option<ProxyError> {
    let v: Value = serde_json::from_str(text).ok()?;
    if v.get("type").and_then(|t| t.as_str()) != Some("error") {
        return None;
    }
    let status = v
        .get("status")
        .or_else(|| v.get("status_code"))
        .and_then(|s| s.as_u64())
        .unwrap_or(500) as u16;
    let error = v
        .get("error")
        .cloned()
        .unwrap_or_else(|| json!({"type": "server_error", "message": "upstream error"}));

    let headers: Option<HashMap<String, String>> =
        v.get("headers").and_then(|h| h.as_object()).map(|obj| {
            obj.iter()
                .filter_map(|(k, val)| {
                    let s = match val {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.to_ascii_lowercase(), s))
                })
                .collect()
        });
    let retry_after_secs = headers
        .as_ref()
        .and_then(|h| crate::parse_retry_after(h));

    Some(ProxyError::Upstream {
        status,
        body: json!({"error": error}).to_string(),
        retry_after_secs,
        headers,
    })
}

/// `response.done` is the legacy name for the terminal event; normalize it
/// before translation.
fn normalize_completion_event(v: &mut Value) {
    if v.get("type").and_then(|t| t.as_str()) == Some("response.done") {
        v["type"] = Value::String("response.completed".into());
    }
}

// ─── Executor ──────────────────────────────────────────────────────────────

/// WebSocket executor for the Codex Responses backend, multiplexing
/// logical requests over one connection per execution session.
pub struct CodexWsExecutor {
    http: Arc<CodexExecutor>,
    sessions: DashMap<String, Arc<WsSession>>,
}

impl CodexWsExecutor {
    pub fn new(http: Arc<CodexExecutor>) -> Self {
        Self {
            http,
            sessions: DashMap::new(),
        }
    }

    fn services(&self) -> &Arc<ExecServices> {
        self.http.services()
    }

    fn session(&self, opts: &ExecOptions) -> Arc<WsSession> {
        let key = opts
            .metadata
            .get(META_EXECUTION_SESSION)
            .cloned()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.sessions
            .entry(key)
            .or_insert_with(WsSession::new)
            .clone()
    }

    /// Close one execution session, or all of them with
    /// [`CLOSE_ALL_SESSIONS`].
    pub async fn close_execution_session(&self, session_id: &str) {
        let closing: Vec<Arc<WsSession>> = if session_id == CLOSE_ALL_SESSIONS {
            let all: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
            self.sessions.clear();
            all
        } else {
            self.sessions
                .remove(session_id)
                .map(|(_, s)| vec![s])
                .unwrap_or_default()
        };
        for session in closing {
            if let Some(conn) = session.invalidate() {
                conn.close().await;
            }
        }
    }

    fn ws_url(auth: &Auth) -> String {
        let base = auth.base_url_or_default(crate::codex::DEFAULT_BASE_URL);
        let base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/responses")
    }

    async fn dial(&self, auth: &Auth, token: &str) -> Result<Arc<WsConn>, ProxyError> {
        let url = Self::ws_url(auth);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProxyError::Internal(format!("invalid websocket URL: {e}")))?;
        {
            let headers = request.headers_mut();
            headers.insert(
                "authorization",
                format!("Bearer {token}")
                    .parse()
                    .map_err(|_| ProxyError::Auth("token is not header-safe".into()))?,
            );
            headers.insert("openai-beta", WS_BETA_HEADER.parse().unwrap());
            headers.insert("originator", "codex_cli_rs".parse().unwrap());
            if let Some(account_id) = auth.meta_str("account_id")
                && let Ok(value) = account_id.parse()
            {
                headers.insert("chatgpt-account-id", value);
            }
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _resp)) => Ok(WsConn::new(stream)),
            Err(WsError::Http(resp)) => {
                let status = resp.status().as_u16();
                let headers: HashMap<String, String> = resp
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|s| (k.as_str().to_string(), s.to_string()))
                    })
                    .collect();
                let body = resp
                    .into_body()
                    .map(|b| String::from_utf8_lossy(&b).to_string())
                    .unwrap_or_default();
                Err(ProxyError::Upstream {
                    status,
                    body,
                    retry_after_secs: crate::parse_retry_after(&headers),
                    headers: Some(headers),
                })
            }
            Err(e) => Err(ProxyError::Network(format!("websocket dial failed: {e}"))),
        }
    }

    /// Send the request frame on the session's connection, dialing on
    /// demand and re-dialing once after a send failure.
    async fn send_frame(
        &self,
        session: &Arc<WsSession>,
        auth: &Auth,
        token: &str,
        payload: &Value,
    ) -> Result<Arc<WsConn>, ProxyError> {
        let (conn, create_sent) = session.current_conn();
        let conn = match conn {
            Some(conn) => conn,
            None => {
                let conn = self.dial(auth, token).await?;
                session.install_conn(conn.clone());
                conn
            }
        };

        let frame = build_ws_frame(payload, create_sent);
        match conn.send_text(frame.to_string()).await {
            Ok(()) => {
                session.mark_create_sent();
                Ok(conn)
            }
            Err(first_err) => {
                tracing::warn!("websocket send failed, re-dialing once: {first_err}");
                if let Some(old) = session.invalidate() {
                    old.close().await;
                }
                let conn = self.dial(auth, token).await?;
                session.install_conn(conn.clone());
                // Fresh connection: the first-frame rule forces a create.
                let frame = build_ws_frame(payload, false);
                conn.send_text(frame.to_string()).await.inspect_err(|_| {
                    if let Some(conn) = session.invalidate() {
                        let conn = conn.clone();
                        tokio::spawn(async move { conn.close().await });
                    }
                })?;
                session.mark_create_sent();
                Ok(conn)
            }
        }
    }
}

/// Outcome of reading one frame in the per-request read loop.
enum ReadStep {
    Lines(Vec<String>),
    Completed(Vec<String>),
    Fatal(ProxyError),
}

struct RequestReader {
    services: Arc<ExecServices>,
    from: Format,
    model: String,
    original_request: Bytes,
    translated_request: Bytes,
    reporter: Arc<manifold_core::usage::UsageReporter>,
}

impl RequestReader {
    fn handle_text(
        &self,
        text: &str,
        state: &mut manifold_translator::StreamState,
    ) -> ReadStep {
        if let Some(err) = parse_error_envelope(text) {
            return ReadStep::Fatal(err);
        }
        let mut event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("unparsable websocket event: {e}");
                return ReadStep::Lines(Vec::new());
            }
        };
        normalize_completion_event(&mut event);
        let completed =
            event.get("type").and_then(|t| t.as_str()) == Some("response.completed");

        if let Some(detail) = common::extract_usage_detail(&event) {
            self.reporter.publish_success(detail);
        }

        let data = event.to_string();
        let ctx = manifold_translator::TranslateContext {
            model: &self.model,
            original_request: &self.original_request,
            translated_request: &self.translated_request,
        };
        let lines = match self.services.translators.translate_stream(
            self.from,
            Format::Codex,
            &ctx,
            None,
            data.as_bytes(),
            state,
        ) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("stream translation failed: {e}");
                Vec::new()
            }
        };

        if completed {
            ReadStep::Completed(lines)
        } else {
            ReadStep::Lines(lines)
        }
    }
}

#[async_trait]
impl Executor for CodexWsExecutor {
    fn identifier(&self) -> &'static str {
        "codex-ws"
    }

    async fn execute(
        &self,
        auth: &Auth,
        request: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ProxyError> {
        common::reject_compact_alt(&opts)?;
        let reporter = self
            .services()
            .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let (token, auth) = self.http.access_token(auth).await?;
            let (payload_bytes, _cache_id) =
                self.http
                    .prepare_payload(&request, &opts, &suffix.base_model, false)?;
            let mut payload: Value = serde_json::from_slice(&payload_bytes)?;
            if let Some(obj) = payload.as_object_mut() {
                obj.remove("stream");
            }

            let session = self.session(&opts);
            let _req_guard = session.req_mu.clone().lock_owned().await;
            let conn = self.send_frame(&session, &auth, &token, &payload).await?;
            let mut rx_message = conn.rx_message.lock().await;

            let fail = |err: ProxyError, session: &Arc<WsSession>| {
                if let Some(conn) = session.invalidate() {
                    tokio::spawn(async move { conn.close().await });
                }
                err
            };

            loop {
                let message =
                    match tokio::time::timeout(READ_DEADLINE, rx_message.recv()).await {
                        Err(_) => {
                            return Err(fail(
                                ProxyError::Network("websocket read deadline exceeded".into()),
                                &session,
                            ));
                        }
                        Ok(None) => {
                            return Err(fail(
                                ProxyError::Network("websocket closed before completion".into()),
                                &session,
                            ));
                        }
                        Ok(Some(Err(e))) => {
                            return Err(fail(
                                ProxyError::Network(format!("websocket read failed: {e}")),
                                &session,
                            ));
                        }
                        Ok(Some(Ok(message))) => message,
                    };

                match message {
                    Message::Text(text) => {
                        if let Some(err) = parse_error_envelope(&text) {
                            return Err(fail(err, &session));
                        }
                        let Ok(mut event) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        normalize_completion_event(&mut event);
                        if let Some(detail) = common::extract_usage_detail(&event) {
                            reporter.publish_success(detail);
                        }
                        if event.get("type").and_then(|t| t.as_str())
                            == Some("response.completed")
                        {
                            let ctx = manifold_translator::TranslateContext {
                                model: &suffix.base_model,
                                original_request: &opts.original_request,
                                translated_request: &payload_bytes,
                            };
                            let body = event.to_string();
                            let translated = self.services().translators.translate_non_stream(
                                opts.source(),
                                Format::Codex,
                                &ctx,
                                body.as_bytes(),
                            )?;
                            reporter.ensure_published();
                            return Ok(ExecResponse {
                                payload: Bytes::from(translated),
                                headers: HashMap::from([(
                                    "content-type".to_string(),
                                    "application/json".to_string(),
                                )]),
                            });
                        }
                    }
                    Message::Close(_) => {
                        return Err(fail(
                            ProxyError::Network("websocket closed by upstream".into()),
                            &session,
                        ));
                    }
                    Message::Binary(_) => {
                        return Err(fail(
                            ProxyError::Internal("unexpected binary websocket frame".into()),
                            &session,
                        ));
                    }
                    _ => continue,
                }
            }
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
        let reporter = self
            .services()
            .reporter(self.identifier(), &request.model, &opts, auth);

        let result = async {
            let suffix = parse_model_suffix(&request.model);
            let (token, auth) = self.http.access_token(auth).await?;
            let (payload_bytes, _cache_id) =
                self.http
                    .prepare_payload(&request, &opts, &suffix.base_model, true)?;
            let mut payload: Value = serde_json::from_slice(&payload_bytes)?;
            // The stream flag is transport-implicit on the socket.
            if let Some(obj) = payload.as_object_mut() {
                obj.remove("stream");
            }

            let session = self.session(&opts);
            // Serialize the whole request lifecycle within the session.
            let req_guard = session.req_mu.clone().lock_owned().await;
            let conn = self.send_frame(&session, &auth, &token, &payload).await?;

            let reader = RequestReader {
                services: self.services().clone(),
                from: opts.source(),
                model: suffix.base_model.clone(),
                original_request: opts.original_request.clone(),
                translated_request: Bytes::from(payload_bytes),
                reporter: reporter.clone(),
            };

            let (tx, rx) = mpsc::channel::<Result<StreamChunk, ProxyError>>(64);
            let session_for_task = session.clone();
            tokio::spawn(async move {
                let _req_guard = req_guard;
                let mut state = manifold_translator::StreamState::default();
                let mut rx_message = conn.rx_message.lock().await;

                let failure = loop {
                    let next = tokio::time::timeout(READ_DEADLINE, rx_message.recv()).await;
                    let message = match next {
                        Err(_) => break Some(ProxyError::Network(
                            "websocket read deadline exceeded".into(),
                        )),
                        Ok(None) => break Some(ProxyError::Network(
                            "websocket closed before completion".into(),
                        )),
                        Ok(Some(Err(e))) => {
                            break Some(ProxyError::Network(format!("websocket read failed: {e}")));
                        }
                        Ok(Some(Ok(message))) => message,
                    };

                    match message {
                        Message::Text(text) => {
                            match reader.handle_text(&text, &mut state) {
                                ReadStep::Lines(lines) => {
                                    for line in lines {
                                        if tx
                                            .send(Ok(StreamChunk { payload: line }))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                                ReadStep::Completed(lines) => {
                                    for line in lines {
                                        let _ = tx.send(Ok(StreamChunk { payload: line })).await;
                                    }
                                    reader.reporter.ensure_published();
                                    return; // success; connection stays live
                                }
                                ReadStep::Fatal(err) => break Some(err),
                            }
                        }
                        Message::Close(_) => {
                            break Some(ProxyError::Network(
                                "websocket closed by upstream".into(),
                            ));
                        }
                        Message::Binary(_) => {
                            break Some(ProxyError::Internal(
                                "unexpected binary websocket frame".into(),
                            ));
                        }
                        _ => continue,
                    }
                };

                drop(rx_message);
                if let Some(err) = failure {
                    if let Some(conn) = session_for_task.invalidate() {
                        conn.close().await;
                    }
                    reader.reporter.publish_failure();
                    let _ = tx.send(Err(err)).await;
                }
            });

            Ok(StreamResult {
                headers: common::sse_headers(),
                chunks: Box::pin(ReceiverStream::new(rx)),
            })
        }
        .await;

        reporter.track_failure(&result);
        result
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
    fn test_first_frame_is_create() {
        let payload = json!({"model": "gpt-5-codex", "input": []});
        let frame = build_ws_frame(&payload, false);
        assert_eq!(frame["type"], "response.create");

        // Even with a previous_response_id, a fresh connection creates.
        let with_prev = json!({"input": [], "previous_response_id": "resp_1"});
        assert_eq!(build_ws_frame(&with_prev, false)["type"], "response.create");
    }

    #[test]
    fn test_append_needs_create_and_previous_id() {
        let with_prev = json!({"input": [], "previous_response_id": "resp_1"});
        let frame = build_ws_frame(&with_prev, true);
        assert_eq!(frame["type"], "response.append");
        assert_eq!(frame["previous_response_id"], "resp_1");

        // No previous_response_id: always a create.
        let without = json!({"input": []});
        assert_eq!(build_ws_frame(&without, true)["type"], "response.create");
    }

    #[test]
    fn test_session_first_frame_rule_across_reconnect() {
        let session = WsSession::new();
        let (_, create_sent) = session.current_conn();
        assert!(!create_sent);

        session.mark_create_sent();
        let (_, create_sent) = session.current_conn();
        assert!(create_sent);

        // Disconnect in between: the next frame is a create again.
        session.invalidate();
        let (conn, create_sent) = session.current_conn();
        assert!(conn.is_none());
        assert!(!create_sent);
    }

    #[test]
    fn test_error_envelope_preserves_status_and_headers() {
        let payload = json!({
            "type": "error",
            "status": 429,
            "error": {"type": "usage_limit_reached", "message": "limit"},
            "headers": {"retry-after": "30", "x-window-minutes": 15}
        })
        .to_string();
        let err = parse_error_envelope(&payload).unwrap();
        let ProxyError::Upstream {
            status,
            body,
            retry_after_secs,
            headers,
        } = err
        else {
            panic!("expected upstream error");
        };
        assert_eq!(status, 429);
        assert!(body.contains("usage_limit_reached"));
        assert_eq!(retry_after_secs, Some(30));
        assert_eq!(headers.unwrap()["x-window-minutes"], "15");
    }

    #[test]
    fn test_error_envelope_synthesizes_server_error() {
        let payload = json!({"type": "error", "status": 500}).to_string();
        let err = parse_error_envelope(&payload).unwrap();
        assert!(err.to_json_body().contains("server_error"));
    }

    #[test]
    fn test_non_error_events_pass() {
        let payload = json!({"type": "response.created", "response": {"id": "r"}}).to_string();
        assert!(parse_error_envelope(&payload).is_none());
    }

    #[test]
    fn test_response_done_normalized() {
        let mut v = json!({"type": "response.done", "response": {"id": "r"}});
        normalize_completion_event(&mut v);
        assert_eq!(v["type"], "response.completed");

        let mut other = json!({"type": "response.output_text.delta"});
        normalize_completion_event(&mut other);
        assert_eq!(other["type"], "response.output_text.delta");
    }

    #[test]
    fn test_ws_url_from_base() {
        let auth = Auth::default();
        assert_eq!(
            CodexWsExecutor::ws_url(&auth),
            "wss://chatgpt.com/backend-api/codex/responses"
        );

        let mut custom = Auth::default();
        custom
            .attributes
            .insert("base_url".into(), "http://localhost:8123/codex".into());
        assert_eq!(
            CodexWsExecutor::ws_url(&custom),
            "ws://localhost:8123/codex/responses"
        );
    }
}
