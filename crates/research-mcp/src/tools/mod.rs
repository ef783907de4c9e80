//! MCP tool implementations.
//!
//! Each tool module provides a type that:
//! 1. Parses and validates input parameters
//! 2. Calls the outbound clients through the SSRF policy
//! 3. Returns human-readable content plus typed structured content

pub mod composite;
pub mod dispatch;
pub mod documents;
pub mod research;
pub mod schema;
pub mod scrape;
pub mod search;

pub use dispatch::Dispatcher;
pub use research::ResearchTracker;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::PersistentCache;
use crate::clients::{DocumentParser, GoogleSearchClient, PageScraper, TranscriptFetcher};
use crate::error::ToolResult;
use crate::resilience::CircuitBreakerRegistry;
use crate::security::UrlPolicy;

/// Shared services injected into every tool.
pub struct ToolContext {
    /// Google Custom Search client, absent without credentials.
    pub search: Option<Arc<GoogleSearchClient>>,

    /// Page scraper (static HTTP by default).
    pub scraper: Arc<dyn PageScraper>,

    /// Document parser, absent unless wired in by the host.
    pub documents: Option<Arc<dyn DocumentParser>>,

    /// Transcript fetcher, absent unless wired in by the host.
    pub transcripts: Option<Arc<dyn TranscriptFetcher>>,

    /// Outbound URL policy.
    pub url_policy: Arc<UrlPolicy>,

    /// Persistent result cache.
    pub cache: Arc<PersistentCache>,

    /// Per-dependency circuit breakers.
    pub breakers: Arc<CircuitBreakerRegistry>,

    /// Sequential research state.
    pub research: Arc<ResearchTracker>,

    /// Plain HTTP client for raw downloads (document bytes).
    pub http: reqwest::Client,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext").field("has_search", &self.search.is_some()).finish()
    }
}

/// Identity of the caller for one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// Session the call arrived on (`stdio` for the stdio transport).
    pub session_id: Option<String>,

    /// OAuth subject, when authenticated.
    pub subject: Option<String>,

    /// Granted scopes; `None` means auth is disabled and nothing is enforced.
    pub scopes: Option<Vec<String>>,
}

/// A tool result: renderable content blocks plus typed structured content.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: Vec<serde_json::Value>,
    pub structured: serde_json::Value,
}

impl ToolOutput {
    /// Single text block plus structured content.
    #[must_use]
    pub fn text(text: impl Into<String>, structured: serde_json::Value) -> Self {
        Self {
            content: vec![serde_json::json!({"type": "text", "text": text.into()})],
            structured,
        }
    }

    /// Append a resource link block.
    #[must_use]
    pub fn with_resource(mut self, uri: &str, name: &str) -> Self {
        self.content.push(serde_json::json!({
            "type": "resource_link",
            "uri": uri,
            "name": name,
        }));
        self
    }
}

/// Trait for MCP tools.
#[async_trait::async_trait]
pub trait ResearchTool: Send + Sync {
    /// Tool name (e.g., "google_search").
    fn name(&self) -> &'static str;

    /// Short human title.
    fn title(&self) -> &'static str;

    /// Tool description for the LLM.
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// JSON Schema for structured output, when declared.
    fn output_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Scope required on the HTTP transport.
    fn required_scope(&self) -> String {
        format!("mcp:tool:{}:execute", self.name())
    }

    /// Result cache TTL; `None` disables caching (stateful tools).
    fn cache_ttl(&self) -> Option<Duration> {
        Some(crate::config::ttl::CACHE_DEFAULT)
    }

    /// Per-call execution deadline.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Circuit-breaker dependency name.
    fn dependency(&self) -> &'static str {
        self.name()
    }

    /// Execute the tool with given input.
    async fn execute(
        &self,
        ctx: &ToolContext,
        caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput>;
}

/// Register all tools available under the given configuration.
#[must_use]
pub fn register_all_tools(config: &crate::config::Config) -> Vec<Arc<dyn ResearchTool>> {
    let mut tools: Vec<Arc<dyn ResearchTool>> = Vec::new();

    if config.has_search_credentials() {
        tools.push(Arc::new(search::GoogleSearchTool));
        tools.push(Arc::new(search::AcademicSearchTool));
        tools.push(Arc::new(search::PatentSearchTool));
        tools.push(Arc::new(composite::SearchAndScrapeTool));
    }

    tools.push(Arc::new(scrape::ScrapePageTool));
    tools.push(Arc::new(documents::ParseDocumentTool));
    tools.push(Arc::new(research::SequentialSearchTool));

    tools
}
