//! Outbound collaborators: the search API client and the contracts for
//! scraping, document parsing, and transcript extraction.
//!
//! The concrete headless-browser scraper, the PDF/DOCX/PPTX parsers, and the
//! YouTube transcript fetcher live outside this crate; tools depend only on
//! the traits here. A static HTTP scraper is provided as the default
//! [`PageScraper`].

pub mod google;
pub mod scraper;

pub use google::GoogleSearchClient;
pub use scraper::HttpScraper;

use crate::error::{FetchResult, ToolResult};

/// One web search result.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_link: Option<String>,
}

/// Metadata extracted from a fetched page.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

/// A scraped page, already shaped to the requested length.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub content_type: String,
    pub content: String,
    pub metadata: PageMetadata,
    pub truncated: bool,
    pub original_length: usize,
}

/// Citation data attached to scraped sources.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    pub retrieved_at: String,
}

impl Citation {
    /// Build from a scraped page.
    #[must_use]
    pub fn from_page(page: &ScrapedPage) -> Self {
        Self {
            title: page.metadata.title.clone().unwrap_or_else(|| page.url.clone()),
            url: page.url.clone(),
            site_name: page.metadata.site_name.clone(),
            retrieved_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Extracted document text.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DocumentText {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub format: String,
}

/// A fetched video transcript.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Transcript {
    pub video_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Fetches and extracts readable text from a web page.
#[async_trait::async_trait]
pub trait PageScraper: Send + Sync {
    /// Fetch `url` and return shaped text. `preview` asks for a short
    /// extract instead of the full body.
    async fn scrape(&self, url: &url::Url, max_length: usize, preview: bool)
    -> FetchResult<ScrapedPage>;
}

/// Extracts text from binary document formats (PDF, DOCX, PPTX).
#[async_trait::async_trait]
pub trait DocumentParser: Send + Sync {
    /// Parse raw bytes with the advertised content type.
    async fn parse(&self, content_type: &str, bytes: &[u8]) -> FetchResult<DocumentText>;

    /// Content types this parser accepts.
    fn supported_types(&self) -> &[&'static str];
}

/// Fetches YouTube transcripts. Failures use the typed transcript kinds.
#[async_trait::async_trait]
pub trait TranscriptFetcher: Send + Sync {
    async fn fetch(&self, video_id: &str) -> ToolResult<Transcript>;
}

/// Extract a YouTube video id from a URL, if it is one.
#[must_use]
pub fn youtube_video_id(url: &url::Url) -> Option<String> {
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    match host {
        "youtube.com" => {
            if url.path() == "/watch" {
                url.query_pairs().find(|(k, _)| k == "v").map(|(_, v)| v.into_owned())
            } else if let Some(rest) = url.path().strip_prefix("/embed/") {
                Some(rest.trim_matches('/').to_owned()).filter(|s| !s.is_empty())
            } else {
                None
            }
        }
        "youtu.be" => {
            let id = url.path().trim_matches('/');
            if id.is_empty() { None } else { Some(id.to_owned()) }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> url::Url {
        url::Url::parse(s).unwrap()
    }

    #[test]
    fn test_youtube_watch_url() {
        assert_eq!(
            youtube_video_id(&parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ")),
            Some("dQw4w9WgXcQ".to_owned())
        );
    }

    #[test]
    fn test_youtube_short_and_embed_urls() {
        assert_eq!(
            youtube_video_id(&parse("https://youtu.be/dQw4w9WgXcQ")),
            Some("dQw4w9WgXcQ".to_owned())
        );
        assert_eq!(
            youtube_video_id(&parse("https://www.youtube.com/embed/dQw4w9WgXcQ")),
            Some("dQw4w9WgXcQ".to_owned())
        );
    }

    #[test]
    fn test_non_youtube_url() {
        assert_eq!(youtube_video_id(&parse("https://example.com/watch?v=abc")), None);
        assert_eq!(youtube_video_id(&parse("https://youtube.com/playlist?list=x")), None);
    }

    #[test]
    fn test_citation_from_page() {
        let page = ScrapedPage {
            url: "https://example.com/a".to_owned(),
            content_type: "text/html".to_owned(),
            content: "body".to_owned(),
            metadata: PageMetadata { title: Some("A Title".to_owned()), ..Default::default() },
            truncated: false,
            original_length: 4,
        };
        let citation = Citation::from_page(&page);
        assert_eq!(citation.title, "A Title");
        assert_eq!(citation.url, "https://example.com/a");
    }
}
