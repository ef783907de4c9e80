//! Composite search-then-scrape tool.
//!
//! Searches, scrapes the top hits concurrently under bounded parallelism,
//! deduplicates content across sources, scores source quality, and shapes
//! the combined output to length budgets. Individual source failures degrade
//! the result instead of failing the call.

use std::collections::HashSet;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use super::scrape::breaker_name_for;
use super::{Caller, ResearchTool, ToolContext, ToolOutput};
use crate::clients::{Citation, SearchHit};
use crate::config::{limits, timeouts, ttl};
use crate::error::{ToolError, ToolResult};
use crate::text::{dedupe_paragraphs, estimate_tokens, truncate_at_paragraph};

/// Quality weights: relevance, freshness, authority, content quality.
const W_RELEVANCE: f64 = 0.35;
const W_FRESHNESS: f64 = 0.20;
const W_AUTHORITY: f64 = 0.25;
const W_CONTENT: f64 = 0.20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SearchAndScrapeInput {
    /// Search query.
    pub query: String,

    /// Sources to fetch (1-10).
    #[serde(default = "default_num_results")]
    pub num_results: u8,

    /// Include the per-source breakdown in the result.
    #[serde(default = "default_true")]
    pub include_sources: bool,

    /// Drop duplicate paragraphs across sources.
    #[serde(default = "default_true")]
    pub deduplicate: bool,

    /// Character budget per source.
    #[serde(default = "default_per_source")]
    pub max_length_per_source: usize,

    /// Character budget for the combined output.
    #[serde(default = "default_total")]
    pub total_max_length: usize,

    /// Drop sources whose content shares no terms with the query.
    #[serde(default)]
    pub filter_by_query: bool,
}

fn default_num_results() -> u8 {
    3
}
fn default_true() -> bool {
    true
}
fn default_per_source() -> usize {
    50_000
}
fn default_total() -> usize {
    300_000
}

/// One fetched (or failed) source.
#[derive(Debug, Clone, serde::Serialize)]
struct Source {
    url: String,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    quality: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    citation: Option<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    published: Option<String>,
}

/// Search then scrape with graceful degradation.
pub struct SearchAndScrapeTool;

#[async_trait::async_trait]
impl ResearchTool for SearchAndScrapeTool {
    fn name(&self) -> &'static str {
        "search_and_scrape"
    }

    fn title(&self) -> &'static str {
        "Search and Scrape"
    }

    fn description(&self) -> &'static str {
        "Search the web and scrape the top results into one combined, \
         deduplicated, quality-ranked research payload. Sources that fail \
         are reported individually without failing the call."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "num_results": {"type": "integer", "minimum": 1, "maximum": 10, "default": 3},
                "include_sources": {"type": "boolean", "default": true},
                "deduplicate": {"type": "boolean", "default": true},
                "max_length_per_source": {"type": "integer", "default": 50000},
                "total_max_length": {"type": "integer", "default": 300000},
                "filter_by_query": {"type": "boolean", "default": false}
            },
            "required": ["query"]
        })
    }

    fn output_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "required": ["combined", "stats"]
        }))
    }

    fn cache_ttl(&self) -> Option<std::time::Duration> {
        Some(ttl::SEARCH)
    }

    fn timeout(&self) -> std::time::Duration {
        timeouts::COMPOSITE
    }

    fn dependency(&self) -> &'static str {
        "search_and_scrape"
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let params: SearchAndScrapeInput = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;
        if params.query.trim().is_empty() {
            return Err(ToolError::validation("query", "cannot be empty"));
        }
        if !(1..=10).contains(&params.num_results) {
            return Err(ToolError::validation("num_results", "must be between 1 and 10"));
        }

        let search = ctx
            .search
            .as_deref()
            .ok_or_else(|| ToolError::internal("search credentials are not configured"))?;

        // The search leg fails the whole call; scraping degrades per source.
        let search_breaker = ctx.breakers.get("google_search");
        if let Err(retry_after) = search_breaker.try_acquire() {
            return Err(ToolError::CircuitOpen {
                dependency: "google_search".to_owned(),
                retry_after,
            });
        }
        let hits = match search.search(&params.query, params.num_results, None, None).await {
            Ok(hits) => {
                search_breaker.record_success();
                hits
            }
            Err(e) => {
                search_breaker.record_failure();
                return Err(e.into());
            }
        };

        let requested = hits.len();
        if hits.is_empty() {
            return Ok(assemble(&params, Vec::new(), requested));
        }

        // Bounded, order-preserving concurrent scraping.
        let mut sources: Vec<Source> = futures::stream::iter(hits)
            .map(|hit| scrape_source(ctx, hit, params.max_length_per_source))
            .buffered(limits::SCRAPE_CONCURRENCY)
            .collect()
            .await;

        if params.filter_by_query {
            filter_by_query(&mut sources, &params.query);
        }

        if params.deduplicate {
            let mut seen = HashSet::new();
            for source in &mut sources {
                if let Some(content) = &source.content {
                    let deduped = dedupe_paragraphs(content, &mut seen);
                    if deduped.is_empty() {
                        source.error = Some("duplicate of earlier source".to_owned());
                        source.content = None;
                    } else {
                        source.content = Some(deduped);
                    }
                }
            }
        }

        for source in &mut sources {
            source.quality = quality_score(&params.query, source);
        }
        sources.sort_by(|a, b| {
            b.quality.partial_cmp(&a.quality).unwrap_or(std::cmp::Ordering::Equal)
        });

        if !sources.iter().any(|s| s.content.is_some()) {
            return Err(ToolError::CompositeFailed(format!(
                "all {requested} sources failed for query '{}'",
                params.query
            )));
        }

        Ok(assemble(&params, sources, requested))
    }
}

/// Scrape one hit into a source record; failures become error records.
async fn scrape_source(ctx: &ToolContext, hit: SearchHit, max_length: usize) -> Source {
    let failed = |error: String| Source {
        url: hit.url.clone(),
        title: hit.title.clone(),
        content: None,
        quality: 0.0,
        citation: None,
        error: Some(error),
        published: None,
    };

    let url = match ctx.url_policy.validate(&hit.url).await {
        Ok(url) => url,
        Err(rejection) => return failed(format!("url rejected: {}", rejection.rule)),
    };

    let breaker = ctx.breakers.get(&breaker_name_for(&url));
    if let Err(retry_after) = breaker.try_acquire() {
        return failed(format!("circuit open, retry in {retry_after:?}"));
    }

    match tokio::time::timeout(timeouts::PER_SOURCE, ctx.scraper.scrape(&url, max_length, false))
        .await
    {
        Err(_elapsed) => {
            breaker.record_failure();
            failed(format!("timed out after {:?}", timeouts::PER_SOURCE))
        }
        Ok(Err(e)) => {
            breaker.record_failure();
            failed(e.to_string())
        }
        Ok(Ok(page)) => {
            breaker.record_success();
            let citation = Citation::from_page(&page);
            Source {
                url: page.url.clone(),
                title: page.metadata.title.clone().unwrap_or_else(|| hit.title.clone()),
                content: Some(page.content),
                quality: 0.0,
                citation: Some(citation),
                error: None,
                published: page.metadata.published.clone(),
            }
        }
    }
}

/// Drop content from sources sharing no terms with the query.
fn filter_by_query(sources: &mut [Source], query: &str) {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect();
    if terms.is_empty() {
        return;
    }

    for source in sources.iter_mut() {
        if let Some(content) = &source.content {
            let haystack = format!("{} {}", source.title, content).to_lowercase();
            if !terms.iter().any(|t| haystack.contains(t)) {
                source.content = None;
                source.error = Some("filtered: content did not match query".to_owned());
            }
        }
    }
}

fn assemble(params: &SearchAndScrapeInput, sources: Vec<Source>, requested: usize) -> ToolOutput {
    let succeeded = sources.iter().filter(|s| s.content.is_some()).count();
    let failed = sources.len() - succeeded;

    let mut combined = String::new();
    let mut truncated = false;
    for source in sources.iter().filter(|s| s.content.is_some()) {
        let content = source.content.as_deref().unwrap_or_default();
        let section = format!("## {}\n{}\n\n{}\n\n", source.title, source.url, content);

        if combined.len() + section.len() > params.total_max_length {
            let remaining = params.total_max_length.saturating_sub(combined.len());
            let (cut, _) = truncate_at_paragraph(&section, remaining);
            combined.push_str(&cut);
            truncated = true;
            break;
        }
        combined.push_str(&section);
    }
    let combined = combined.trim_end().to_owned();

    let stats = json!({
        "requested": requested,
        "succeeded": succeeded,
        "failed": failed,
        "estimatedTokens": estimate_tokens(&combined),
        "truncated": truncated,
    });

    let mut structured = json!({
        "combined": combined,
        "stats": stats,
        "degraded": failed > 0,
    });
    if params.include_sources {
        structured["sources"] = serde_json::to_value(&sources).unwrap_or_default();
    }

    let summary = format!(
        "# Research: {}\n\n{} of {} sources succeeded.\n\n{}",
        params.query, succeeded, requested, structured["combined"].as_str().unwrap_or_default()
    );

    ToolOutput::text(summary, structured)
}

/// Weighted source quality in [0, 1].
fn quality_score(query: &str, source: &Source) -> f64 {
    let Some(content) = &source.content else {
        return 0.0;
    };

    let relevance = score_relevance(query, &source.title, content);
    let freshness = score_freshness(source.published.as_deref());
    let authority = score_authority(&source.url);
    let content_quality = score_content_quality(content);

    (W_RELEVANCE * relevance
        + W_FRESHNESS * freshness
        + W_AUTHORITY * authority
        + W_CONTENT * content_quality)
        .clamp(0.0, 1.0)
}

/// Fraction of query terms present; title matches count double.
fn score_relevance(query: &str, title: &str, content: &str) -> f64 {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect();
    if terms.is_empty() {
        return 0.5;
    }

    let title = title.to_lowercase();
    let content = content.to_lowercase();

    let mut score = 0.0;
    for term in &terms {
        if title.contains(term.as_str()) {
            score += 1.0;
        } else if content.contains(term.as_str()) {
            score += 0.5;
        }
    }
    (score / terms.len() as f64).clamp(0.0, 1.0)
}

/// Recency of the published date; unknown dates score neutral.
fn score_freshness(published: Option<&str>) -> f64 {
    let Some(raw) = published else {
        return 0.5;
    };

    let parsed = chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
        });

    let Ok(date) = parsed else {
        return 0.5;
    };

    let days = (chrono::Utc::now() - date).num_days();
    match days {
        ..=30 => 1.0,
        31..=180 => 0.8,
        181..=365 => 0.6,
        366..=1095 => 0.4,
        _ => 0.2,
    }
}

/// Host-based authority heuristic.
fn score_authority(url: &str) -> f64 {
    let Ok(parsed) = url::Url::parse(url) else {
        return 0.3;
    };
    let host = parsed.host_str().unwrap_or_default().to_lowercase();

    let base: f64 = if host.ends_with(".gov") || host.ends_with(".edu") {
        0.9
    } else if host.contains("wikipedia.org") {
        0.85
    } else if host.ends_with(".org") {
        0.65
    } else {
        0.5
    };

    let tls_bonus = if parsed.scheme() == "https" { 0.1 } else { 0.0 };
    (base + tls_bonus).clamp(0.0, 1.0)
}

/// Length and structure of the extracted text.
fn score_content_quality(content: &str) -> f64 {
    let length_score = match content.len() {
        0..=200 => 0.2,
        201..=1000 => 0.5,
        1001..=10_000 => 0.8,
        _ => 1.0,
    };
    let paragraphs = content.split("\n\n").filter(|p| p.trim().len() > 40).count();
    let structure_score = (paragraphs as f64 / 5.0).clamp(0.0, 1.0);

    (0.7 * length_score + 0.3 * structure_score).clamp(0.0, 1.0)
}
