//! MCP server assembly.
//!
//! Wires the cache, event store, breakers, security layers, and tools into
//! the two transports (stdio and HTTP+SSE) and owns graceful shutdown.

pub mod admin;
pub mod http;
pub mod session;
pub mod stdio;

use std::sync::Arc;

use crate::cache::{CacheConfig, PersistentCache};
use crate::clients::{GoogleSearchClient, HttpScraper};
use crate::config::{Config, limits};
use crate::error::ErrorKind;
use crate::events::crypto::EventCipher;
use crate::events::{EventStore, EventStoreConfig};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::resilience::CircuitBreakerRegistry;
use crate::security::{OAuthValidator, RequestRateLimiter, UrlPolicy};
use crate::tools::research::SESSION_RESOURCE_URI;
use crate::tools::{self, Caller, Dispatcher, ResearchTracker, ToolContext};

/// MCP protocol version this server speaks by default.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Build the shared tool context from configuration.
pub async fn build_tool_context(config: &Config) -> anyhow::Result<Arc<ToolContext>> {
    let cache = PersistentCache::open(CacheConfig {
        storage_path: config.cache_storage_path.clone(),
        default_ttl: config.cache_default_ttl,
        max_entries: config.cache_max_entries,
        max_bytes: limits::CACHE_MAX_BYTES,
        namespace_quota: Some(config.cache_max_entries / 2),
    })
    .await;

    let search = match (&config.google_api_key, &config.google_search_id) {
        (Some(key), Some(id)) => {
            Some(Arc::new(GoogleSearchClient::new(key.clone(), id.clone())?))
        }
        _ => None,
    };

    let http = reqwest::Client::builder()
        .timeout(crate::config::timeouts::DOCUMENT)
        .connect_timeout(crate::config::timeouts::CONNECT)
        .user_agent(concat!("research-mcp/", env!("CARGO_PKG_VERSION")))
        .build()?;

    Ok(Arc::new(ToolContext {
        search,
        scraper: Arc::new(HttpScraper::new()?),
        documents: None,
        transcripts: None,
        url_policy: Arc::new(UrlPolicy::new(config.allow_private_ips, Vec::new())),
        cache,
        breakers: Arc::new(CircuitBreakerRegistry::default()),
        research: Arc::new(ResearchTracker::new()),
        http,
    }))
}

/// The assembled MCP server.
pub struct McpServer {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventStore>,
    oauth: Option<Arc<OAuthValidator>>,
}

impl McpServer {
    /// Construct the server: open stores, build clients, register tools.
    ///
    /// # Errors
    ///
    /// Returns error when a client or store cannot be initialized.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let ctx = build_tool_context(&config).await?;
        let tools = tools::register_all_tools(&config);
        tracing::info!(count = tools.len(), "Registered tools");

        let cipher = match &config.event_encryption_key {
            Some(hex) => Some(EventCipher::from_hex(hex)?),
            None => None,
        };
        let mut event_config = EventStoreConfig::new(config.event_storage_path.clone());
        event_config.critical_streams = config.critical_streams.iter().cloned().collect();
        event_config.cipher = cipher;
        let events = EventStore::open(event_config).await;

        let oauth = config.oauth.clone().map(|oauth_config| {
            Arc::new(OAuthValidator::new(oauth_config, reqwest::Client::new()))
        });

        Ok(Self {
            config: Arc::new(config),
            dispatcher: Arc::new(Dispatcher::new(tools, ctx)),
            events,
            oauth,
        })
    }

    /// Shared dispatcher (tests and embedding).
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run on stdio (one implicit session for the process lifetime).
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure.
    pub async fn run_stdio(self) -> anyhow::Result<()> {
        tracing::info!("Starting MCP server in stdio mode");
        let result = stdio::run_stdio(Arc::clone(&self.dispatcher)).await;
        self.flush_stores().await;
        result
    }

    /// Run the HTTP transport until a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns error on bind or serve failure.
    pub async fn run_http(self, port: u16) -> anyhow::Result<()> {
        let sessions = Arc::new(session::SessionManager::new());
        sessions.start_cleanup_task();
        self.dispatcher.context().cache.start_flush_task();
        self.events.start_maintenance_tasks();

        let state = Arc::new(http::HttpState {
            dispatcher: Arc::clone(&self.dispatcher),
            sessions: Arc::clone(&sessions),
            events: Arc::clone(&self.events),
            oauth: self.oauth.clone(),
            rate_limiter: Arc::new(RequestRateLimiter::new(limits::RATE_LIMIT_PER_MINUTE)),
            config: Arc::clone(&self.config),
            started_at: std::time::Instant::now(),
        });

        let router = http::create_router(state);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP server listening on http://{addr}");

        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

        let drained = sessions.drain().await;
        tracing::info!(sessions = drained, "Drained sessions");
        self.flush_stores().await;
        tracing::info!("HTTP server shut down");
        Ok(())
    }

    /// Flush dirty state with a bounded async budget, then one last
    /// synchronous-best-effort pass.
    async fn flush_stores(&self) {
        let cache = Arc::clone(&self.dispatcher.context().cache);
        let events = Arc::clone(&self.events);

        let flush = async {
            let persisted = cache.persist_now().await;
            let flushed = events.flush().await;
            tracing::info!(persisted, flushed, "Shutdown flush completed");
        };

        if tokio::time::timeout(limits::SHUTDOWN_FLUSH_BUDGET, flush).await.is_err() {
            tracing::warn!("Shutdown flush exceeded budget; attempting last-chance write");
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(500),
                async {
                    cache.persist_now().await;
                    events.flush().await;
                },
            )
            .await;
        }
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer").finish()
    }
}

/// Wait for SIGINT, SIGTERM, or SIGHUP.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("install CTRL+C handler");
    }
    tracing::info!("Received shutdown signal");
}

/// Handle one JSON-RPC request. Returns `None` for notifications, which
/// must not receive a response.
pub async fn handle_request(
    dispatcher: &Dispatcher,
    req: &JsonRpcRequest,
    caller: &Caller,
) -> Option<JsonRpcResponse> {
    if req.is_notification() {
        tracing::debug!(method = %req.method, "Notification received");
        return None;
    }
    let id = req.id.clone();

    let response = match req.method.as_str() {
        "initialize" => handle_initialize(id, &req.params),
        "initialized" | "notifications/initialized" => {
            JsonRpcResponse::success(id, serde_json::json!({}))
        }
        "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
        "tools/list" => JsonRpcResponse::success(id, dispatcher.tool_list()),
        "tools/call" => dispatcher.call_tool(id, &req.params, caller).await,
        "resources/list" => JsonRpcResponse::success(id, resources_list()),
        "resources/read" => handle_resources_read(dispatcher, id, &req.params, caller).await,
        "prompts/list" => {
            JsonRpcResponse::success(id, serde_json::json!({"prompts": []}))
        }
        other => JsonRpcResponse::error_kind(
            id,
            ErrorKind::MethodNotFound,
            format!("Method not found: {other}"),
            None,
        ),
    };

    Some(response)
}

fn handle_initialize(id: Option<serde_json::Value>, params: &serde_json::Value) -> JsonRpcResponse {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(PROTOCOL_VERSION);

    tracing::info!(protocol_version, "MCP initialize");

    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": {"listChanged": false},
                "resources": {},
                "prompts": {}
            },
            "serverInfo": {
                "name": "research-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

fn resources_list() -> serde_json::Value {
    serde_json::json!({
        "resources": [{
            "uri": SESSION_RESOURCE_URI,
            "name": "Current research session",
            "description": "Accumulated sequential_search state for this session",
            "mimeType": "application/json"
        }]
    })
}

async fn handle_resources_read(
    dispatcher: &Dispatcher,
    id: Option<serde_json::Value>,
    params: &serde_json::Value,
    caller: &Caller,
) -> JsonRpcResponse {
    let Some(uri) = params.get("uri").and_then(|v| v.as_str()) else {
        return JsonRpcResponse::error_kind(
            id,
            ErrorKind::InvalidParams,
            "Missing 'uri' parameter",
            None,
        );
    };

    if uri != SESSION_RESOURCE_URI {
        return JsonRpcResponse::error_kind(
            id,
            ErrorKind::InvalidParams,
            format!("Unknown resource: {uri}"),
            None,
        );
    }

    let session_id = caller.session_id.as_deref().unwrap_or("stdio");
    let state = dispatcher.context().research.get(session_id).await.unwrap_or_default();
    let text = serde_json::to_string_pretty(&state).unwrap_or_else(|_| "{}".to_owned());

    JsonRpcResponse::success(
        id,
        serde_json::json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text
            }]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_dispatcher() -> Arc<Dispatcher> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path());
        let ctx = build_tool_context(&config).await.unwrap();
        std::mem::forget(dir);
        Arc::new(Dispatcher::new(tools::register_all_tools(&config), ctx))
    }

    fn request(method: &str, id: Option<i64>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_owned(),
            method: method.to_owned(),
            params: serde_json::Value::Null,
            id: id.map(|n| serde_json::json!(n)),
        }
    }

    #[tokio::test]
    async fn test_initialize_reports_capabilities() {
        let dispatcher = test_dispatcher().await;
        let response = handle_request(&dispatcher, &request("initialize", Some(1)), &Caller::default())
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "research-mcp");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let dispatcher = test_dispatcher().await;
        let response = handle_request(
            &dispatcher,
            &request("notifications/initialized", None),
            &Caller::default(),
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dispatcher = test_dispatcher().await;
        let response = handle_request(&dispatcher, &request("bogus/method", Some(3)), &Caller::default())
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_tools_list_without_credentials() {
        // No search credentials in the test config: search tools absent,
        // scraping and research tools present.
        let dispatcher = test_dispatcher().await;
        let response = handle_request(&dispatcher, &request("tools/list", Some(4)), &Caller::default())
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"scrape_page"));
        assert!(names.contains(&"sequential_search"));
        assert!(!names.contains(&"google_search"));
    }

    #[tokio::test]
    async fn test_session_resource_roundtrip() {
        let dispatcher = test_dispatcher().await;
        let caller = Caller { session_id: Some("abc".to_owned()), ..Default::default() };

        let call = JsonRpcRequest {
            jsonrpc: "2.0".to_owned(),
            method: "tools/call".to_owned(),
            params: serde_json::json!({
                "name": "sequential_search",
                "arguments": {
                    "stepNumber": 1,
                    "totalStepsEstimate": 3,
                    "searchStep": "establish background",
                    "nextStepNeeded": true
                }
            }),
            id: Some(serde_json::json!(1)),
        };
        let response = handle_request(&dispatcher, &call, &caller).await.unwrap();
        assert!(response.error.is_none(), "{:?}", response.error);

        let read = JsonRpcRequest {
            jsonrpc: "2.0".to_owned(),
            method: "resources/read".to_owned(),
            params: serde_json::json!({"uri": SESSION_RESOURCE_URI}),
            id: Some(serde_json::json!(2)),
        };
        let response = handle_request(&dispatcher, &read, &caller).await.unwrap();
        let text = response.result.unwrap()["contents"][0]["text"].as_str().unwrap().to_owned();
        assert!(text.contains("establish background"));
    }
}
