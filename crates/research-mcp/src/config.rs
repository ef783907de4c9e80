//! Configuration for the research MCP server.

use std::path::PathBuf;
use std::time::Duration;

/// Server limits and defaults.
pub mod limits {
    use std::time::Duration;

    /// Default HTTP listen port.
    pub const DEFAULT_PORT: u16 = 3000;

    /// Maximum accepted request body size (10 MB).
    pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

    /// Maximum accepted URL length for outbound fetches.
    pub const MAX_URL_LENGTH: usize = 2048;

    /// Allowed outbound ports.
    pub const ALLOWED_PORTS: &[u16] = &[80, 443, 8080, 8443];

    /// Per-stream event cap.
    pub const MAX_EVENTS_PER_STREAM: usize = 1000;

    /// Global event cap.
    pub const MAX_EVENTS_TOTAL: usize = 10_000;

    /// Event TTL (24 hours).
    pub const EVENT_TTL: Duration = Duration::from_secs(24 * 3600);

    /// Default in-memory cache entry cap.
    pub const CACHE_MAX_ENTRIES: usize = 5000;

    /// Default in-memory cache byte cap (256 MB).
    pub const CACHE_MAX_BYTES: u64 = 256 * 1024 * 1024;

    /// Requests per minute allowed per subject or IP.
    pub const RATE_LIMIT_PER_MINUTE: u32 = 120;

    /// Session idle timeout.
    pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Session sweep interval.
    pub const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

    /// Circuit breaker consecutive-failure threshold.
    pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

    /// Circuit breaker open-state cooldown.
    pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

    /// Bounded parallelism for composite scraping.
    pub const SCRAPE_CONCURRENCY: usize = 5;

    /// Budget for the async flush during shutdown.
    pub const SHUTDOWN_FLUSH_BUDGET: Duration = Duration::from_secs(5);
}

/// Per-concern TTL defaults.
pub mod ttl {
    use std::time::Duration;

    /// Default cache TTL (30 minutes).
    pub const CACHE_DEFAULT: Duration = Duration::from_secs(1800);

    /// Search results.
    pub const SEARCH: Duration = Duration::from_secs(1800);

    /// Scraped pages.
    pub const SCRAPE: Duration = Duration::from_secs(3600);

    /// Video transcripts.
    pub const TRANSCRIPT: Duration = Duration::from_secs(6 * 3600);

    /// Parsed documents.
    pub const DOCUMENT: Duration = Duration::from_secs(3600);

    /// JWKS key sets.
    pub const JWKS: Duration = Duration::from_secs(3600);

    /// Grace window in which stale cache entries remain servable under SWR.
    pub const STALE_GRACE: Duration = Duration::from_secs(300);
}

/// Per-tool execution deadlines.
pub mod timeouts {
    use std::time::Duration;

    /// Search API calls.
    pub const SEARCH: Duration = Duration::from_secs(15);

    /// Single page scrape.
    pub const SCRAPE: Duration = Duration::from_secs(30);

    /// Document download and parse.
    pub const DOCUMENT: Duration = Duration::from_secs(45);

    /// Composite search-then-scrape, end to end.
    pub const COMPOSITE: Duration = Duration::from_secs(90);

    /// Per-source deadline inside the composite tool.
    pub const PER_SOURCE: Duration = Duration::from_secs(20);

    /// Outbound connect timeout.
    pub const CONNECT: Duration = Duration::from_secs(10);
}

/// OAuth validation settings. Present only when `OAUTH_ISSUER_URL` is set.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Token issuer URL; JWKS fetched from `{issuer}/.well-known/jwks.json`.
    pub issuer_url: String,

    /// Required `aud` claim value.
    pub audience: String,

    /// JWKS endpoint override.
    pub jwks_url: String,

    /// JWKS cache TTL.
    pub jwks_ttl: Duration,

    /// Require TLS termination in front of the server.
    pub enforce_https: bool,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Google Custom Search API key (required when the search tool is enabled).
    pub google_api_key: Option<String>,

    /// Google Custom Search engine id.
    pub google_search_id: Option<String>,

    /// HTTP listen port.
    pub port: u16,

    /// Allowed CORS origins; empty means same-origin only.
    pub allowed_origins: Vec<String>,

    /// OAuth settings, `None` disables auth entirely.
    pub oauth: Option<OAuthConfig>,

    /// Cache persistence root.
    pub cache_storage_path: PathBuf,

    /// Event store persistence root.
    pub event_storage_path: PathBuf,

    /// Default cache TTL.
    pub cache_default_ttl: Duration,

    /// Max in-memory cache entries.
    pub cache_max_entries: usize,

    /// Admin key gating cache control endpoints; `None` disables them.
    pub cache_admin_key: Option<String>,

    /// Permit outbound fetches to private/loopback addresses (dev only).
    pub allow_private_ips: bool,

    /// Hex-encoded 32-byte key enabling event store encryption.
    pub event_encryption_key: Option<String>,

    /// Stream ids persisted synchronously on every store.
    pub critical_streams: Vec<String>,
}

impl Config {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a recognized variable holds an unparseable value.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(v) => v.parse().map_err(|e| anyhow::anyhow!("invalid PORT '{v}': {e}"))?,
            Err(_) => limits::DEFAULT_PORT,
        };

        let oauth = match std::env::var("OAUTH_ISSUER_URL") {
            Ok(issuer_url) => {
                let audience = std::env::var("OAUTH_AUDIENCE")
                    .map_err(|_| anyhow::anyhow!("OAUTH_AUDIENCE required when OAUTH_ISSUER_URL is set"))?;
                let jwks_url = std::env::var("OAUTH_JWKS_URL").unwrap_or_else(|_| {
                    format!("{}/.well-known/jwks.json", issuer_url.trim_end_matches('/'))
                });
                Some(OAuthConfig {
                    issuer_url,
                    audience,
                    jwks_url,
                    jwks_ttl: ttl::JWKS,
                    enforce_https: env_flag("ENFORCE_HTTPS"),
                })
            }
            Err(_) => None,
        };

        let cache_default_ttl = match std::env::var("CACHE_DEFAULT_TTL") {
            Ok(v) => Duration::from_millis(
                v.parse().map_err(|e| anyhow::anyhow!("invalid CACHE_DEFAULT_TTL '{v}': {e}"))?,
            ),
            Err(_) => ttl::CACHE_DEFAULT,
        };

        let cache_max_entries = match std::env::var("CACHE_MAX_SIZE") {
            Ok(v) => v.parse().map_err(|e| anyhow::anyhow!("invalid CACHE_MAX_SIZE '{v}': {e}"))?,
            Err(_) => limits::CACHE_MAX_ENTRIES,
        };

        Ok(Self {
            google_api_key: std::env::var("GOOGLE_CUSTOM_SEARCH_API_KEY").ok(),
            google_search_id: std::env::var("GOOGLE_CUSTOM_SEARCH_ID").ok(),
            port,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            oauth,
            cache_storage_path: std::env::var("CACHE_STORAGE_PATH")
                .map_or_else(|_| std::env::temp_dir().join("research-mcp").join("cache"), PathBuf::from),
            event_storage_path: std::env::var("EVENT_STORE_STORAGE_PATH")
                .map_or_else(|_| std::env::temp_dir().join("research-mcp").join("events"), PathBuf::from),
            cache_default_ttl,
            cache_max_entries,
            cache_admin_key: std::env::var("CACHE_ADMIN_KEY").ok(),
            allow_private_ips: env_flag("ALLOW_PRIVATE_IPS"),
            event_encryption_key: std::env::var("EVENT_STORE_ENCRYPTION_KEY").ok(),
            critical_streams: std::env::var("EVENT_STORE_CRITICAL_STREAMS")
                .map(|v| v.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        })
    }

    /// Create a test configuration rooted in the given directory.
    #[must_use]
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            google_api_key: None,
            google_search_id: None,
            port: 0,
            allowed_origins: vec!["*".to_owned()],
            oauth: None,
            cache_storage_path: root.join("cache"),
            event_storage_path: root.join("events"),
            cache_default_ttl: Duration::from_secs(60),
            cache_max_entries: 100,
            cache_admin_key: None,
            allow_private_ips: true,
            event_encryption_key: None,
            critical_streams: Vec::new(),
        }
    }

    /// Check whether the Google search tool can be enabled.
    #[must_use]
    pub const fn has_search_credentials(&self) -> bool {
        self.google_api_key.is_some() && self.google_search_id.is_some()
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| matches!(v.as_str(), "1" | "true" | "yes")).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_config() {
        let dir = std::env::temp_dir();
        let config = Config::for_testing(&dir);
        assert!(!config.has_search_credentials());
        assert!(config.allow_private_ips);
        assert!(config.oauth.is_none());
    }

    #[test]
    fn test_limits() {
        assert_eq!(limits::MAX_URL_LENGTH, 2048);
        assert!(limits::ALLOWED_PORTS.contains(&443));
        assert_eq!(limits::MAX_EVENTS_PER_STREAM, 1000);
    }
}
