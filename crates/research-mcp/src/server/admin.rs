//! Admin and ops surface, bound on the same listener as the MCP endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

use super::http::HttpState;
use crate::security::scopes_cover;

/// GET /health
pub async fn health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /version
pub async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "research-mcp",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    }))
}

/// GET /mcp/cache-stats
pub async fn cache_stats(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let cache = state.dispatcher.context().cache.stats().await;
    let breakers = state.dispatcher.context().breakers.snapshots();

    Json(serde_json::json!({
        "cache": cache,
        "circuitBreakers": breakers,
        "server": {
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": state.started_at.elapsed().as_secs(),
            "sessions": state.sessions.count().await,
            "tools": state.dispatcher.tools().len(),
        }
    }))
}

/// GET /mcp/event-store-stats
pub async fn event_store_stats(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({"eventStore": state.events.stats().await}))
}

/// GET /mcp/oauth-config
pub async fn oauth_config(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let oauth = state.oauth.as_ref().map(|v| {
        let (issuer, audience) = v.describe();
        serde_json::json!({"enabled": true, "issuer": issuer, "audience": audience})
    });

    Json(serde_json::json!({
        "oauth": oauth.unwrap_or_else(|| serde_json::json!({"enabled": false}))
    }))
}

/// GET /mcp/oauth-scopes — human-readable scope documentation.
pub async fn oauth_scopes(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let mut doc = String::from(
        "# OAuth Scopes\n\n\
         ## Composite scopes\n\n\
         - `mcp:tool` — execute any tool\n\
         - `mcp:admin` — any admin action\n\n\
         ## Tool scopes\n\n",
    );
    for tool in state.dispatcher.tools() {
        doc.push_str(&format!("- `{}` — {}\n", tool.required_scope(), tool.title()));
    }
    doc.push_str(
        "\n## Admin scopes\n\n\
         - `mcp:admin:cache:invalidate`\n\
         - `mcp:admin:cache:persist`\n",
    );

    ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], doc)
}

/// GET /mcp/oauth-token-info — details of the presenter's token.
pub async fn oauth_token_info(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "oauth is not configured"})),
        )
            .into_response();
    };

    let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    match oauth.authorize_header(authorization).await {
        Ok(ctx) => Json(serde_json::json!({
            "subject": ctx.subject,
            "scopes": ctx.scopes,
        }))
        .into_response(),
        Err(failure) => (
            StatusCode::from_u16(failure.status()).unwrap_or(StatusCode::UNAUTHORIZED),
            [(header::WWW_AUTHENTICATE, failure.www_authenticate())],
            Json(serde_json::json!({"error": failure.error_code()})),
        )
            .into_response(),
    }
}

#[derive(serde::Deserialize)]
pub struct InvalidateRequest {
    namespace: String,
    #[serde(default)]
    args: Option<serde_json::Value>,
}

/// POST /mcp/cache-invalidate
pub async fn cache_invalidate(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Option<Json<InvalidateRequest>>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers, "mcp:admin:cache:invalidate").await {
        return response;
    }

    let Some(Json(request)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "body with 'namespace' required"})),
        )
            .into_response();
    };

    let removed = state
        .dispatcher
        .context()
        .cache
        .invalidate(&request.namespace, request.args.as_ref())
        .await;
    Json(serde_json::json!({"invalidated": removed})).into_response()
}

/// POST /mcp/cache-persist
pub async fn cache_persist(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers, "mcp:admin:cache:persist").await {
        return response;
    }

    let written = state.dispatcher.context().cache.persist_now().await;
    Json(serde_json::json!({"persisted": written})).into_response()
}

/// Admin gate: disabled entirely without an admin key; otherwise admit the
/// key header or a bearer token carrying the admin scope.
async fn require_admin(
    state: &HttpState,
    headers: &HeaderMap,
    required_scope: &str,
) -> Result<(), Response> {
    let Some(admin_key) = &state.config.cache_admin_key else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "admin endpoints are disabled"})),
        )
            .into_response());
    };

    if let Some(presented) = headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        if presented == admin_key {
            return Ok(());
        }
    }

    if let Some(oauth) = &state.oauth {
        let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        if let Ok(ctx) = oauth.authorize_header(authorization).await {
            if scopes_cover(&ctx.scopes, required_scope) {
                return Ok(());
            }
        }
    }

    Err((
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({"error": "admin credentials required"})),
    )
        .into_response())
}
