//! Search tools: google_search, academic_search, patent_search.

use serde::Deserialize;
use serde_json::json;

use super::{Caller, ResearchTool, ToolContext, ToolOutput};
use crate::clients::{GoogleSearchClient, SearchHit};
use crate::config::{timeouts, ttl};
use crate::error::{ToolError, ToolResult};

/// Shared input for the search family.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SearchInput {
    /// Search query.
    pub query: String,

    /// Results to return (1-10).
    #[serde(default = "default_num_results")]
    pub num_results: u8,

    /// Restrict to a site (e.g. "example.com").
    #[serde(default)]
    pub site: Option<String>,

    /// Google dateRestrict expression (e.g. "m6" for six months).
    #[serde(default)]
    pub date_restrict: Option<String>,
}

fn default_num_results() -> u8 {
    5
}

impl SearchInput {
    fn validate(&self) -> ToolResult<()> {
        if self.query.trim().is_empty() {
            return Err(ToolError::validation("query", "cannot be empty"));
        }
        if !(1..=10).contains(&self.num_results) {
            return Err(ToolError::validation("num_results", "must be between 1 and 10"));
        }
        Ok(())
    }
}

fn search_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": description
            },
            "num_results": {
                "type": "integer",
                "minimum": 1,
                "maximum": 10,
                "default": 5,
                "description": "Number of results to return"
            },
            "site": {
                "type": "string",
                "description": "Restrict results to a single site"
            },
            "date_restrict": {
                "type": "string",
                "description": "Recency filter, e.g. 'd7' (7 days), 'm6' (6 months)"
            }
        },
        "required": ["query"]
    })
}

fn client(ctx: &ToolContext) -> ToolResult<&GoogleSearchClient> {
    ctx.search
        .as_deref()
        .ok_or_else(|| ToolError::internal("search credentials are not configured"))
}

/// Zero hits is a valid, empty result.
fn render_hits(query: &str, hits: &[SearchHit]) -> ToolOutput {
    let mut text = format!("# Search results for \"{query}\"\n\n");
    if hits.is_empty() {
        text.push_str("No results found.\n");
    }
    for (i, hit) in hits.iter().enumerate() {
        text.push_str(&format!("{}. [{}]({})\n   {}\n", i + 1, hit.title, hit.url, hit.snippet));
    }

    ToolOutput::text(
        text,
        json!({
            "query": query,
            "count": hits.len(),
            "results": hits,
        }),
    )
}

/// Plain web search.
pub struct GoogleSearchTool;

#[async_trait::async_trait]
impl ResearchTool for GoogleSearchTool {
    fn name(&self) -> &'static str {
        "google_search"
    }

    fn title(&self) -> &'static str {
        "Google Search"
    }

    fn description(&self) -> &'static str {
        "Search the web via Google Custom Search. Returns titles, URLs, and \
         snippets for the top matching pages."
    }

    fn input_schema(&self) -> serde_json::Value {
        search_schema("Search query (e.g. 'rust async runtime comparison')")
    }

    fn output_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "required": ["query", "count", "results"]
        }))
    }

    fn cache_ttl(&self) -> Option<std::time::Duration> {
        Some(ttl::SEARCH)
    }

    fn timeout(&self) -> std::time::Duration {
        timeouts::SEARCH
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let params: SearchInput = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;
        params.validate()?;

        let hits = client(ctx)?
            .search(
                &params.query,
                params.num_results,
                params.site.as_deref(),
                params.date_restrict.as_deref(),
            )
            .await?;

        Ok(render_hits(&params.query, &hits))
    }
}

/// Search restricted to scholarly sources.
pub struct AcademicSearchTool;

#[async_trait::async_trait]
impl ResearchTool for AcademicSearchTool {
    fn name(&self) -> &'static str {
        "academic_search"
    }

    fn title(&self) -> &'static str {
        "Academic Search"
    }

    fn description(&self) -> &'static str {
        "Search scholarly literature (papers, preprints, proceedings). \
         Biases results toward academic publishers and repositories."
    }

    fn input_schema(&self) -> serde_json::Value {
        search_schema("Topic or paper to look up (e.g. 'attention is all you need')")
    }

    fn cache_ttl(&self) -> Option<std::time::Duration> {
        Some(ttl::SEARCH)
    }

    fn timeout(&self) -> std::time::Duration {
        timeouts::SEARCH
    }

    fn dependency(&self) -> &'static str {
        "google_search"
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let params: SearchInput = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;
        params.validate()?;

        // Bias toward scholarly hosts unless the caller picked a site.
        let site = params.site.as_deref().or(Some("scholar.google.com"));
        let hits = client(ctx)?
            .search(&params.query, params.num_results, site, params.date_restrict.as_deref())
            .await?;

        Ok(render_hits(&params.query, &hits))
    }
}

/// Patent lookup via Google Patents.
pub struct PatentSearchTool;

#[async_trait::async_trait]
impl ResearchTool for PatentSearchTool {
    fn name(&self) -> &'static str {
        "patent_search"
    }

    fn title(&self) -> &'static str {
        "Patent Search"
    }

    fn description(&self) -> &'static str {
        "Search patent filings and grants on Google Patents."
    }

    fn input_schema(&self) -> serde_json::Value {
        search_schema("Invention, assignee, or patent number")
    }

    fn cache_ttl(&self) -> Option<std::time::Duration> {
        Some(ttl::SEARCH)
    }

    fn timeout(&self) -> std::time::Duration {
        timeouts::SEARCH
    }

    fn dependency(&self) -> &'static str {
        "google_search"
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let params: SearchInput = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;
        params.validate()?;

        let hits = client(ctx)?
            .search(
                &params.query,
                params.num_results,
                Some("patents.google.com"),
                params.date_restrict.as_deref(),
            )
            .await?;

        Ok(render_hits(&params.query, &hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_defaults() {
        let input: SearchInput = serde_json::from_value(json!({"query": "acme"})).unwrap();
        assert_eq!(input.num_results, 5);
        assert!(input.site.is_none());
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_empty_query_rejected() {
        let input: SearchInput = serde_json::from_value(json!({"query": "  "})).unwrap();
        assert!(matches!(input.validate(), Err(ToolError::Validation { field, .. }) if field == "query"));
    }

    #[test]
    fn test_num_results_bounds() {
        let input: SearchInput =
            serde_json::from_value(json!({"query": "x", "num_results": 11})).unwrap();
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_render_empty_hits() {
        let output = render_hits("acme", &[]);
        assert_eq!(output.structured["count"], 0);
        assert!(output.content[0]["text"].as_str().unwrap().contains("No results"));
    }
}
