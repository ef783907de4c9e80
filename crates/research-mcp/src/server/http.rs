//! HTTP+SSE transport.
//!
//! `POST /mcp` accepts a JSON-RPC message or batch and answers as JSON or as
//! an SSE stream when negotiated. `GET /mcp` opens the live SSE stream for a
//! session, replaying from `Last-Event-ID` first. `DELETE /mcp` tears the
//! session down. Every outbound response frame is written through the event
//! store before it reaches the socket, which is what makes replay possible.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, limits};
use crate::error::ErrorKind;
use crate::events::EventStore;
use crate::protocol::{self, BodyError, IncomingBody, JsonRpcRequest, JsonRpcResponse};
use crate::security::{AuthContext, AuthFailure, OAuthValidator, RateDecision, RequestRateLimiter};
use crate::tools::{Caller, Dispatcher};

use super::admin;
use super::session::{SessionManager, SseFrame};

/// Session header name (also exposed through CORS).
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Shared state for HTTP handlers.
pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<EventStore>,
    pub oauth: Option<Arc<OAuthValidator>>,
    pub rate_limiter: Arc<RequestRateLimiter>,
    pub config: Arc<Config>,
    pub started_at: std::time::Instant,
}

/// Build the MCP router with the admin surface on the same listener.
pub fn create_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/version", get(admin::version))
        .route("/mcp/cache-stats", get(admin::cache_stats))
        .route("/mcp/event-store-stats", get(admin::event_store_stats))
        .route("/mcp/oauth-config", get(admin::oauth_config))
        .route("/mcp/oauth-scopes", get(admin::oauth_scopes))
        .route("/mcp/oauth-token-info", get(admin::oauth_token_info))
        .route("/mcp/cache-invalidate", post(admin::cache_invalidate))
        .route("/mcp/cache-persist", post(admin::cache_persist))
        .route(
            "/mcp",
            post(handle_mcp_post)
                .get(handle_mcp_get)
                .delete(handle_mcp_delete)
                .options(handle_mcp_options),
        )
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(limits::MAX_BODY_BYTES))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let expose = [HeaderName::from_static(SESSION_HEADER)];

    if config.allowed_origins.is_empty() || config.allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive().expose_headers(expose);
    }

    let origins: Vec<HeaderValue> =
        config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static("last-event-id"),
        ])
        .expose_headers(expose)
}

/// Authenticate a request. `Ok(None)` means auth is disabled; a token, if
/// present, is ignored in that case.
async fn authenticate(
    state: &HttpState,
    headers: &HeaderMap,
) -> Result<Option<AuthContext>, Response> {
    let Some(oauth) = &state.oauth else {
        return Ok(None);
    };

    if oauth.enforce_https() {
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        if proto != "https" {
            return Err(auth_error_response(&AuthFailure::HttpsRequired));
        }
    }

    let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    oauth
        .authorize_header(authorization)
        .await
        .map(Some)
        .map_err(|failure| auth_error_response(&failure))
}

/// RFC 6750 error response with a JSON-RPC shaped body.
fn auth_error_response(failure: &AuthFailure) -> Response {
    let kind = match failure {
        AuthFailure::MissingToken => ErrorKind::AuthMissing,
        AuthFailure::ExpiredToken => ErrorKind::AuthExpired,
        AuthFailure::InsufficientScope { .. } => ErrorKind::InsufficientScope,
        AuthFailure::InvalidToken(_) | AuthFailure::HttpsRequired => ErrorKind::AuthInvalid,
    };
    let body = JsonRpcResponse::error_kind(
        None,
        kind,
        failure.to_string(),
        Some(serde_json::json!({"error": failure.error_code()})),
    );

    (
        StatusCode::from_u16(failure.status()).unwrap_or(StatusCode::UNAUTHORIZED),
        [(header::WWW_AUTHENTICATE, failure.www_authenticate())],
        Json(body),
    )
        .into_response()
}

/// Rate-limit key: subject when authenticated, else forwarded/peer address.
fn rate_key(auth: Option<&AuthContext>, headers: &HeaderMap) -> String {
    if let Some(auth) = auth {
        return format!("sub:{}", auth.subject);
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| format!("ip:{}", ip.trim()))
        .unwrap_or_else(|| "ip:unknown".to_owned())
}

fn apply_rate_headers(response: &mut Response, decision: RateDecision) {
    let headers = response.headers_mut();
    headers.insert("RateLimit-Limit", header_value(decision.limit.to_string()));
    headers.insert("RateLimit-Remaining", header_value(decision.remaining.to_string()));
    headers.insert("RateLimit-Reset", header_value(decision.reset_secs.to_string()));
}

fn header_value(s: String) -> HeaderValue {
    HeaderValue::from_str(&s).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn rate_limited_response(decision: RateDecision) -> Response {
    let body = JsonRpcResponse::error_kind(
        None,
        ErrorKind::RateLimited,
        "Rate limit exceeded",
        Some(serde_json::json!({"retryAfterSecs": decision.reset_secs})),
    );
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_rate_headers(&mut response, decision);
    response
}

fn session_error_response() -> Response {
    let body = JsonRpcResponse::error(None, -32000, "No valid session ID provided");
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn session_header(id: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(SESSION_HEADER),
        HeaderValue::from_str(id).unwrap_or_else(|_| HeaderValue::from_static("invalid")),
    )
}

/// POST /mcp: accept a message or batch, dispatch, respond as JSON or SSE.
async fn handle_mcp_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let decision = state.rate_limiter.check(&rate_key(auth.as_ref(), &headers));
    if !decision.allowed {
        return rate_limited_response(decision);
    }

    let parsed = std::str::from_utf8(&body)
        .map_err(|_| BodyError::Parse)
        .and_then(protocol::parse_text);
    let incoming = match parsed {
        Ok(incoming) => incoming,
        Err(e) => {
            let mut response = (StatusCode::BAD_REQUEST, Json(e.to_response())).into_response();
            apply_rate_headers(&mut response, decision);
            return response;
        }
    };

    // Session: echo an existing id, or mint one on initialize.
    let header_id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let session = match header_id {
        Some(id) => match state.sessions.get(id).await {
            Some(session) => session,
            None => return session_error_response(),
        },
        None => {
            if contains_initialize(&incoming) {
                state.sessions.create(auth.as_ref().map(|a| a.subject.clone())).await
            } else {
                return session_error_response();
            }
        }
    };

    let caller = Caller {
        session_id: Some(session.id.clone()),
        subject: auth.as_ref().map(|a| a.subject.clone()),
        scopes: auth.as_ref().map(|a| a.scopes.clone()),
    };

    // Transport-level scope refusal for a single tools/call (batches report
    // per-message JSON-RPC errors instead).
    if let (Some(auth), IncomingBody::Single(req)) = (&auth, &incoming) {
        if req.method == "tools/call" {
            if let Some(missing) = missing_scope(&state.dispatcher, req, auth) {
                return auth_error_response(&AuthFailure::InsufficientScope {
                    missing: vec![missing],
                });
            }
        }
    }

    let responses: Vec<JsonRpcResponse> = match &incoming {
        IncomingBody::Single(req) => {
            super::handle_request(&state.dispatcher, req, &caller).await.into_iter().collect()
        }
        IncomingBody::Batch(requests) => {
            let futures =
                requests.iter().map(|req| super::handle_request(&state.dispatcher, req, &caller));
            futures::future::join_all(futures).await.into_iter().flatten().collect()
        }
    };

    // Only notifications: acknowledge without a body.
    if responses.is_empty() {
        let mut response = StatusCode::ACCEPTED.into_response();
        let (name, value) = session_header(&session.id);
        response.headers_mut().insert(name, value);
        apply_rate_headers(&mut response, decision);
        return response;
    }

    // Write-through: every response frame lands in the event store first so
    // a reconnecting client can replay it.
    let mut frames = Vec::with_capacity(responses.len());
    for response in &responses {
        let value = serde_json::to_value(response).unwrap_or_default();
        let event_id =
            state.events.store_event(&session.id, &value, caller.subject.as_deref()).await;
        frames.push((event_id, value));
    }

    let wants_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    let mut response = if wants_sse {
        let events = frames.into_iter().map(|(event_id, value)| {
            Ok::<_, Infallible>(
                Event::default().id(event_id).event("message").data(value.to_string()),
            )
        });
        Sse::new(stream::iter(events)).into_response()
    } else if matches!(incoming, IncomingBody::Single(_)) {
        Json(serde_json::to_value(&responses[0]).unwrap_or_default()).into_response()
    } else {
        Json(serde_json::to_value(&responses).unwrap_or_default()).into_response()
    };

    let (name, value) = session_header(&session.id);
    response.headers_mut().insert(name, value);
    apply_rate_headers(&mut response, decision);
    response
}

fn contains_initialize(incoming: &IncomingBody) -> bool {
    match incoming {
        IncomingBody::Single(req) => req.method == "initialize",
        IncomingBody::Batch(requests) => requests.iter().any(|r| r.method == "initialize"),
    }
}

fn missing_scope(
    dispatcher: &Dispatcher,
    req: &JsonRpcRequest,
    auth: &AuthContext,
) -> Option<String> {
    let tool_name = req.params.get("name").and_then(|v| v.as_str())?;
    let required = dispatcher.required_scope(tool_name)?;
    if crate::security::scopes_cover(&auth.scopes, &required) {
        None
    } else {
        Some(required)
    }
}

/// GET /mcp: open the SSE stream; replay after `Last-Event-ID` first.
async fn handle_mcp_get(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authenticate(&state, &headers).await {
        return response;
    }

    let Some(session) = lookup_session(&state, &headers).await else {
        return session_error_response();
    };

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    tracing::info!(
        session_id = %session.id,
        last_event_id = ?last_event_id,
        "SSE stream connection"
    );

    let stream = build_sse_stream(Arc::clone(&state), Arc::clone(&session), last_event_id).await;

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response();
    response
        .headers_mut()
        .insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    let (name, value) = session_header(&session.id);
    response.headers_mut().insert(name, value);
    response
}

async fn lookup_session(
    state: &HttpState,
    headers: &HeaderMap,
) -> Option<Arc<super::session::Session>> {
    let id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())?;
    state.sessions.get(id).await
}

/// Replay-then-live: stored events strictly after the last seen id are
/// delivered before anything newly produced.
async fn build_sse_stream(
    state: Arc<HttpState>,
    session: Arc<super::session::Session>,
    last_event_id: Option<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let replayed: Vec<SseFrame> = match last_event_id {
        Some(last) => {
            let collected = Arc::new(tokio::sync::Mutex::new(Vec::new()));
            let sink = Arc::clone(&collected);
            let stream_id = state
                .events
                .replay_events_after(
                    &last,
                    move |event_id, message| {
                        let sink = Arc::clone(&sink);
                        async move {
                            sink.lock().await.push(SseFrame { event_id, data: message.to_string() });
                        }
                    },
                    session.subject.as_deref(),
                )
                .await;
            if stream_id.is_empty() {
                tracing::debug!(last_event_id = %last, "Replay id not found, starting live only");
            }
            std::mem::take(&mut *collected.lock().await)
        }
        None => Vec::new(),
    };

    let replay_stream = stream::iter(replayed.into_iter().map(|frame| {
        tracing::debug!(event_id = %frame.event_id, "Replaying event");
        Ok::<_, Infallible>(Event::default().id(frame.event_id).event("message").data(frame.data))
    }));

    let receiver = session.subscribe();
    let live_stream = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(frame) => Some(Ok(Event::default()
                .id(frame.event_id)
                .event("message")
                .data(frame.data))),
            Err(e) => {
                tracing::debug!(error = %e, "Broadcast lag, client will catch up via replay");
                None
            }
        }
    });

    replay_stream.chain(live_stream)
}

/// DELETE /mcp: immediate session teardown.
async fn handle_mcp_delete(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authenticate(&state, &headers).await {
        return response;
    }

    let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return session_error_response();
    };

    if state.sessions.remove(id).await {
        state.dispatcher.context().research.clear(id).await;
        StatusCode::NO_CONTENT.into_response()
    } else {
        session_error_response()
    }
}

/// OPTIONS /mcp: non-preflight probes get an empty 204 (preflight is handled
/// by the CORS layer).
async fn handle_mcp_options() -> StatusCode {
    StatusCode::NO_CONTENT
}
