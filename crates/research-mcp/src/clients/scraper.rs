//! Static HTTP scraper.
//!
//! Fetches a page over plain HTTP and reduces HTML to readable text. This is
//! the default [`PageScraper`](super::PageScraper); a headless-browser
//! fallback can be injected behind the same trait.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::Client;

use super::{PageMetadata, PageScraper, ScrapedPage};
use crate::config::timeouts;
use crate::error::{FetchError, FetchResult};
use crate::text::truncate_at_sentence;

/// Preview mode returns at most this many characters.
const PREVIEW_LENGTH: usize = 1500;

/// Hard cap on downloaded bytes regardless of requested length.
const MAX_DOWNLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Static scraper over reqwest.
#[derive(Clone)]
pub struct HttpScraper {
    client: Client,
}

impl HttpScraper {
    /// Create a new scraper.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeouts::SCRAPE)
            .connect_timeout(timeouts::CONNECT)
            .user_agent(concat!("research-mcp/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl PageScraper for HttpScraper {
    async fn scrape(
        &self,
        url: &url::Url,
        max_length: usize,
        preview: bool,
    ) -> FetchResult<ScrapedPage> {
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return if status.as_u16() == 429 {
                Err(FetchError::rate_limited(60))
            } else if status.is_server_error() {
                Err(FetchError::server(status.as_u16(), message))
            } else {
                Err(FetchError::UnexpectedStatus { status: status.as_u16(), message })
            };
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .split(';')
            .next()
            .unwrap_or("text/html")
            .to_owned();

        let body = response.text().await?;
        let body = if body.len() > MAX_DOWNLOAD_BYTES {
            let mut end = MAX_DOWNLOAD_BYTES;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body[..end].to_owned()
        } else {
            body
        };

        let (text, metadata) = if content_type.contains("html") {
            extract_text(&body, url)
        } else {
            (body, PageMetadata::default())
        };

        let original_length = text.len();
        let limit = if preview { PREVIEW_LENGTH.min(max_length) } else { max_length };
        let (content, truncated) = truncate_at_sentence(&text, limit);

        Ok(ScrapedPage {
            url: url.to_string(),
            content_type,
            content,
            metadata,
            truncated,
            original_length,
        })
    }
}

impl std::fmt::Debug for HttpScraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpScraper").finish()
    }
}

struct HtmlRegexes {
    strip_blocks: Regex,
    block_breaks: Regex,
    strip_tags: Regex,
    title: Regex,
    whitespace: Regex,
    paragraph_marks: Regex,
}

fn regexes() -> &'static HtmlRegexes {
    static RE: OnceLock<HtmlRegexes> = OnceLock::new();
    RE.get_or_init(|| HtmlRegexes {
        strip_blocks: Regex::new(
            r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>|<svg\b.*?</svg>",
        )
        .expect("valid regex"),
        block_breaks: Regex::new(
            r"(?is)</(p|div|h[1-6]|li|tr|blockquote|section|article)>|<br\s*/?>",
        )
        .expect("valid regex"),
        strip_tags: Regex::new(r"(?is)<[^>]+>").expect("valid regex"),
        title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"),
        whitespace: Regex::new(r"\s+").expect("valid regex"),
        paragraph_marks: Regex::new(r"\s*(?:\x01\s*)+").expect("valid regex"),
    })
}

/// Strip an HTML document down to readable text plus metadata. Block-level
/// boundaries survive as blank lines so downstream paragraph dedup and
/// truncation have something to work with.
fn extract_text(html: &str, url: &url::Url) -> (String, PageMetadata) {
    let re = regexes();

    let title = re
        .title
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().trim()));
    let description = meta_content(html, "description");
    let site_name = meta_content(html, "og:site_name")
        .or_else(|| url.host_str().map(str::to_owned));
    let published = meta_content(html, "article:published_time");

    let without_blocks = re.strip_blocks.replace_all(html, " ");
    // Mark block boundaries before tags disappear.
    let with_marks = re.block_breaks.replace_all(&without_blocks, "\u{1}");
    let without_tags = re.strip_tags.replace_all(&with_marks, " ");
    let flattened = re.whitespace.replace_all(&without_tags, " ");
    let text = re
        .paragraph_marks
        .replace_all(&flattened, "\n\n")
        .trim_matches(|c: char| c.is_whitespace())
        .to_owned();
    let text = decode_entities(&text);

    (text, PageMetadata { title, site_name, description, published })
}

/// Pull `content` off a `<meta>` tag by name or property.
fn meta_content(html: &str, key: &str) -> Option<String> {
    static CACHE: OnceLock<std::sync::Mutex<std::collections::HashMap<String, Regex>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(|| std::sync::Mutex::new(std::collections::HashMap::new()));

    let re = {
        let mut cache = cache.lock().expect("meta regex lock poisoned");
        cache
            .entry(key.to_owned())
            .or_insert_with(|| {
                let escaped = regex::escape(key);
                Regex::new(&format!(
                    r#"(?is)<meta\s[^>]*(?:name|property)\s*=\s*["']{escaped}["'][^>]*content\s*=\s*["']([^"']*)["']"#
                ))
                .expect("valid regex")
            })
            .clone()
    };

    re.captures(html).and_then(|c| c.get(1)).map(|m| decode_entities(m.as_str().trim()))
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_strips_markup() {
        let html = r"<html><head><title>Test Page</title>
            <script>var x = 1;</script><style>body {}</style></head>
            <body><h1>Heading</h1><p>First paragraph.</p></body></html>";
        let url = url::Url::parse("https://example.com/a").unwrap();
        let (text, metadata) = extract_text(html, &url);

        assert!(text.contains("Heading"));
        assert!(text.contains("First paragraph."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("body {}"));
        assert_eq!(metadata.title.as_deref(), Some("Test Page"));
        assert_eq!(metadata.site_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_meta_extraction() {
        let html = r#"<head>
            <meta name="description" content="A useful page">
            <meta property="og:site_name" content="Example Site">
        </head>"#;
        assert_eq!(meta_content(html, "description").as_deref(), Some("A useful page"));
        assert_eq!(meta_content(html, "og:site_name").as_deref(), Some("Example Site"));
        assert_eq!(meta_content(html, "article:published_time"), None);
    }

    #[test]
    fn test_entity_decoding() {
        assert_eq!(decode_entities("Fish &amp; Chips &lt;3"), "Fish & Chips <3");
    }
}
