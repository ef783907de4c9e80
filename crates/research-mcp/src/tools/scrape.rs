//! Page scraping tool, including YouTube transcript handling.

use serde::Deserialize;
use serde_json::json;

use super::{Caller, ResearchTool, ToolContext, ToolOutput};
use crate::clients::{Citation, youtube_video_id};
use crate::config::{timeouts, ttl};
use crate::error::{ToolError, ToolResult, TranscriptErrorKind};
use crate::text::truncate_at_sentence;

/// Scrape mode.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    #[default]
    Full,
    Preview,
}

/// Input for scrape_page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScrapePageInput {
    /// Page URL to fetch.
    pub url: String,

    /// Maximum characters of content to return.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Full content or a short preview.
    #[serde(default)]
    pub mode: ScrapeMode,
}

fn default_max_length() -> usize {
    50_000
}

/// Fetch a page and return readable text.
pub struct ScrapePageTool;

#[async_trait::async_trait]
impl ResearchTool for ScrapePageTool {
    fn name(&self) -> &'static str {
        "scrape_page"
    }

    fn title(&self) -> &'static str {
        "Scrape Page"
    }

    fn description(&self) -> &'static str {
        "Fetch a URL and return its readable text content with metadata and a \
         citation. YouTube URLs return the video transcript instead."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Page URL (http or https)"
                },
                "max_length": {
                    "type": "integer",
                    "minimum": 100,
                    "default": 50000,
                    "description": "Maximum characters of content to return"
                },
                "mode": {
                    "type": "string",
                    "enum": ["full", "preview"],
                    "default": "full"
                }
            },
            "required": ["url"]
        })
    }

    fn output_schema(&self) -> Option<serde_json::Value> {
        Some(json!({
            "type": "object",
            "required": ["url", "contentType", "truncated"]
        }))
    }

    fn cache_ttl(&self) -> Option<std::time::Duration> {
        Some(ttl::SCRAPE)
    }

    fn timeout(&self) -> std::time::Duration {
        timeouts::SCRAPE
    }

    fn dependency(&self) -> &'static str {
        "scrape"
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _caller: &Caller,
        input: serde_json::Value,
    ) -> ToolResult<ToolOutput> {
        let params: ScrapePageInput = serde_json::from_value(input)
            .map_err(|e| ToolError::validation("arguments", e.to_string()))?;
        if params.max_length < 100 {
            return Err(ToolError::validation("max_length", "must be at least 100"));
        }

        let url = ctx
            .url_policy
            .validate(&params.url)
            .await
            .map_err(|rejection| ToolError::url_rejected(&params.url, rejection.rule))?;

        if let Some(video_id) = youtube_video_id(&url) {
            return transcript_output(ctx, &params, &video_id).await;
        }

        let page = ctx
            .scraper
            .scrape(&url, params.max_length, params.mode == ScrapeMode::Preview)
            .await?;

        let citation = Citation::from_page(&page);
        let title = page.metadata.title.clone().unwrap_or_else(|| page.url.clone());
        let text = format!("# {}\n\n{}", title, page.content);

        Ok(ToolOutput::text(
            text,
            json!({
                "url": page.url,
                "contentType": page.content_type,
                "content": page.content,
                "metadata": page.metadata,
                "citation": citation,
                "truncated": page.truncated,
                "originalLength": page.original_length,
            }),
        ))
    }
}

async fn transcript_output(
    ctx: &ToolContext,
    params: &ScrapePageInput,
    video_id: &str,
) -> ToolResult<ToolOutput> {
    let Some(fetcher) = &ctx.transcripts else {
        return Err(ToolError::Transcript {
            kind: TranscriptErrorKind::Unknown,
            message: "transcript extraction is not configured".to_owned(),
        });
    };

    let transcript = fetcher.fetch(video_id).await?;
    let (content, truncated) = truncate_at_sentence(&transcript.text, params.max_length);
    let original_length = transcript.text.len();

    Ok(ToolOutput::text(
        format!("# Transcript for video {video_id}\n\n{content}"),
        json!({
            "url": params.url,
            "contentType": "text/vtt",
            "content": content,
            "metadata": {
                "videoId": video_id,
                "language": transcript.language,
            },
            "truncated": truncated,
            "originalLength": original_length,
        }),
    ))
}

/// Breaker name for a scrape target, isolating failures per host.
pub(crate) fn breaker_name_for(url: &url::Url) -> String {
    format!("scrape:{}", url.host_str().unwrap_or("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        let input: ScrapePageInput =
            serde_json::from_value(json!({"url": "https://example.com", "mode": "preview"}))
                .unwrap();
        assert_eq!(input.mode, ScrapeMode::Preview);

        let input: ScrapePageInput =
            serde_json::from_value(json!({"url": "https://example.com"})).unwrap();
        assert_eq!(input.mode, ScrapeMode::Full);
        assert_eq!(input.max_length, 50_000);
    }

    #[test]
    fn test_breaker_name_per_host() {
        let url = url::Url::parse("https://example.com/a/b").unwrap();
        assert_eq!(breaker_name_for(&url), "scrape:example.com");
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result: Result<ScrapePageInput, _> =
            serde_json::from_value(json!({"url": "https://example.com", "mode": "turbo"}));
        assert!(result.is_err());
    }
}
