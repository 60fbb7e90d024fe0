use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::body::{Body, BodyDataStream, Bytes, HttpBody};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::BoardEvent;
use crate::identity::{resolve_active_key, ConversationKey, HostState};
use crate::inject::{should_intercept, RequestSender};
use crate::prefs::Preferences;
use crate::runtime::BoardRuntime;
use crate::transcript::{CodeBlock, TranscriptMessage, TranscriptSource};
use crate::watcher::{BoardState, WatchSignal};

pub const CONTROL_PREFIX: &str = "/infoboard/v1";

/// Largest generation request body buffered for inspection.
const MAX_INSPECTED_BODY_BYTES: usize = 32 * 1024 * 1024;

const PROXY_STREAM_CHUNKS: usize = 16;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<BoardRuntime>,
    pub auth: BackendAuthConfig,
    pub upstream: reqwest::Url,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ReplaceTranscriptRequest {
    messages: Vec<TranscriptMessage>,
}

#[derive(Debug, Serialize)]
struct TranscriptResponse {
    blocks: Vec<CodeBlock>,
}

#[derive(Debug, Serialize)]
struct HostResponse {
    key: ConversationKey,
}

pub async fn serve_backend(
    runtime: BoardRuntime,
    event_rx: flume::Receiver<BoardEvent>,
) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind_addr (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    spawn_event_bridge(event_rx, ws_events.clone());
    runtime.spawn_watch_loop();

    let state = build_state(Arc::new(runtime), auth, ws_events)?;
    tracing::info!("Forwarding agent traffic to {}", state.upstream);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind info board server to {}", bind_addr))?;
    tracing::info!(
        "Info board listening on http://{} (control API under {})",
        bind_addr,
        CONTROL_PREFIX
    );
    axum::serve(listener, app)
        .await
        .context("Info board server failed")?;
    Ok(())
}

pub fn build_state(
    runtime: Arc<BoardRuntime>,
    auth: BackendAuthConfig,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) -> Result<Arc<ServerState>> {
    let upstream = reqwest::Url::parse(&runtime.config.upstream_url)
        .with_context(|| format!("Invalid upstream_url '{}'", runtime.config.upstream_url))?;
    Ok(Arc::new(ServerState {
        runtime,
        auth,
        upstream,
        ws_events,
    }))
}

/// Control API under [`CONTROL_PREFIX`]; everything else is forwarded to the
/// upstream agent backend.
pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/board", get(get_board))
        .route("/refresh", post(refresh_board))
        .route("/visibility", post(signal_visibility))
        .route("/prefs", get(get_prefs).put(update_prefs))
        .route("/transcript", get(get_transcript).put(replace_transcript))
        .route("/host", put(update_host))
        .route("/ws/events", get(ws_events_route))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest(CONTROL_PREFIX, protected)
        .fallback(proxy_upstream)
        .with_state(state)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<BoardEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_board_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_board_event(event: BoardEvent) -> ApiEventEnvelope {
    match event {
        BoardEvent::BoardUpdated(board) => envelope(
            "board_updated",
            serde_json::to_value(board).unwrap_or_else(|_| serde_json::json!({})),
        ),
        BoardEvent::PrefsChanged(prefs) => envelope(
            "prefs_changed",
            serde_json::to_value(prefs).unwrap_or_else(|_| serde_json::json!({})),
        ),
        BoardEvent::PromptInjected { url, shape } => envelope(
            "prompt_injected",
            serde_json::json!({ "url": url, "shape": shape }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let token = std::env::var("INFOBOARD_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let mode = parse_auth_mode(
        std::env::var("INFOBOARD_AUTH_MODE").ok(),
        token.is_some(),
    )?;

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "INFOBOARD_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Control API auth is disabled; set INFOBOARD_TOKEN to require a bearer token");
    }

    Ok(BackendAuthConfig { mode, token })
}

/// Without an explicit mode, auth is required exactly when a token is set.
fn parse_auth_mode(raw: Option<String>, has_token: bool) -> Result<AuthMode> {
    let normalized = raw.unwrap_or_default().trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" if has_token => Ok(AuthMode::Required),
        "" => Ok(AuthMode::Disabled),
        "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid INFOBOARD_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_board(State(state): State<Arc<ServerState>>) -> Json<BoardState> {
    Json(state.runtime.watcher.board())
}

/// The refresh writes to the store, so it runs off the async workers.
async fn refresh_board(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<BoardState>, (StatusCode, String)> {
    let watcher = state.runtime.watcher.clone();
    tokio::task::spawn_blocking(move || watcher.refresh())
        .await
        .map(Json)
        .map_err(|e| internal_error(anyhow!(e)))
}

async fn signal_visibility(
    State(state): State<Arc<ServerState>>,
) -> (StatusCode, Json<AcceptedResponse>) {
    state.runtime.signal(WatchSignal::VisibilityRegained);
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse { status: "accepted" }),
    )
}

async fn get_prefs(State(state): State<Arc<ServerState>>) -> Json<Preferences> {
    Json(state.runtime.prefs.snapshot())
}

async fn update_prefs(
    State(state): State<Arc<ServerState>>,
    Json(prefs): Json<Preferences>,
) -> Json<Preferences> {
    Json(state.runtime.update_prefs(prefs))
}

async fn get_transcript(State(state): State<Arc<ServerState>>) -> Json<TranscriptResponse> {
    Json(TranscriptResponse {
        blocks: state.runtime.feed.source().code_blocks(),
    })
}

async fn replace_transcript(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ReplaceTranscriptRequest>,
) -> Result<Json<TranscriptResponse>, (StatusCode, String)> {
    let live = state.runtime.feed.live().ok_or_else(read_only_feed)?;
    live.replace_messages(request.messages);
    Ok(Json(TranscriptResponse {
        blocks: live.code_blocks(),
    }))
}

async fn update_host(
    State(state): State<Arc<ServerState>>,
    Json(host): Json<HostState>,
) -> Result<Json<HostResponse>, (StatusCode, String)> {
    let live = state.runtime.feed.live().ok_or_else(read_only_feed)?;
    live.set_host_state(host);
    Ok(Json(HostResponse {
        key: resolve_active_key(&**live),
    }))
}

fn read_only_feed() -> (StatusCode, String) {
    (
        StatusCode::CONFLICT,
        "transcript is read from a chat log and cannot be pushed".to_string(),
    )
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn proxy_upstream(
    State(state): State<Arc<ServerState>>,
    request: axum::extract::Request,
) -> Response {
    match forward_upstream(&state, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn forward_upstream(
    state: &ServerState,
    request: axum::extract::Request,
) -> Result<Response, (StatusCode, String)> {
    let (parts, body) = request.into_parts();
    let target = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let inspect = should_intercept(parts.method.as_str(), target)
        && state.runtime.prefs.snapshot().auto_inject_prompt;
    let body = read_inbound_body(body, inspect).await?;

    let outbound = build_upstream_request(
        &state.upstream,
        &parts.method,
        &parts.uri,
        &parts.headers,
        body,
    )
    .map_err(bad_request)?;

    let response = state
        .runtime
        .outbound
        .send(outbound)
        .await
        .map_err(|e| bad_gateway(anyhow!(e)))?;

    relay_response(response).map_err(internal_error)
}

/// Buffer the body only when the injector will look at it. Anything else,
/// including inspected bodies past the buffer limit, streams through as is.
async fn read_inbound_body(
    body: Body,
    inspect: bool,
) -> Result<Option<reqwest::Body>, (StatusCode, String)> {
    if body.is_end_stream() {
        return Ok(None);
    }
    let mut stream = body.into_data_stream();
    if !inspect {
        return Ok(Some(stream_body(Vec::new(), stream)));
    }

    let mut buffered = Vec::new();
    let mut size = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| bad_request(anyhow!(e)))?;
        size += chunk.len();
        buffered.push(chunk);
        if size > MAX_INSPECTED_BODY_BYTES {
            tracing::debug!("Request body over {} bytes, forwarding uninspected", size);
            return Ok(Some(stream_body(buffered, stream)));
        }
    }

    if size == 0 {
        return Ok(None);
    }
    let mut bytes = Vec::with_capacity(size);
    for chunk in buffered {
        bytes.extend_from_slice(&chunk);
    }
    Ok(Some(reqwest::Body::from(bytes)))
}

/// The inbound body type is not `Sync`, which the client requires, so chunks
/// are pumped through a bounded channel.
fn stream_body(prefix: Vec<Bytes>, rest: BodyDataStream) -> reqwest::Body {
    let (tx, rx) = flume::bounded::<Result<Bytes, std::io::Error>>(PROXY_STREAM_CHUNKS);
    tokio::spawn(async move {
        let chunks = futures_util::stream::iter(prefix.into_iter().map(Ok)).chain(rest);
        futures_util::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(std::io::Error::other);
            let failed = chunk.is_err();
            if tx.send_async(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(rx.into_stream())
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn upstream_url(upstream: &reqwest::Url, uri: &Uri) -> Result<reqwest::Url> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let joined = format!(
        "{}{}",
        upstream.as_str().trim_end_matches('/'),
        path_and_query
    );
    reqwest::Url::parse(&joined).with_context(|| format!("Invalid upstream URL '{}'", joined))
}

/// Translate an inbound request into the client's request type. Hop-by-hop
/// headers, `host` and `content-length` are left for the client to set.
pub fn build_upstream_request(
    upstream: &reqwest::Url,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Option<reqwest::Body>,
) -> Result<reqwest::Request> {
    let url = upstream_url(upstream, uri)?;
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .with_context(|| format!("Unsupported method '{}'", method))?;

    let mut request = reqwest::Request::new(method, url);
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("Invalid header name '{}'", name))?;
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .with_context(|| format!("Invalid value for header '{}'", name))?;
        request.headers_mut().append(name, value);
    }

    *request.body_mut() = body;
    Ok(request)
}

/// Stream an upstream response back unchanged apart from hop-by-hop headers.
fn relay_response(response: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .context("Upstream returned an invalid status")?;

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .context("Failed to build relayed response")
}

fn bad_request(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, error.to_string())
}

fn bad_gateway(error: anyhow::Error) -> (StatusCode, String) {
    tracing::warn!("Upstream request failed: {}", error);
    (StatusCode::BAD_GATEWAY, error.to_string())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
