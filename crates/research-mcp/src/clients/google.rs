//! Google Custom Search API client.
//!
//! Async HTTP client with retry middleware, connection pooling, and a short
//! moka response cache in front of the persistent tool cache.

use std::time::Duration;

use moka::future::Cache;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use sha2::{Digest, Sha256};

use super::SearchHit;
use crate::config::timeouts;
use crate::error::{FetchError, FetchResult};

const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// Response cache TTL; the persistent cache in the dispatcher holds results
/// far longer, this only smooths bursts.
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(300);
const RESPONSE_CACHE_SIZE: u64 = 500;

/// Google Custom Search client.
#[derive(Clone)]
pub struct GoogleSearchClient {
    client: ClientWithMiddleware,
    cache: Cache<String, serde_json::Value>,
    api_key: String,
    search_id: String,
    endpoint: String,
}

#[derive(serde::Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(serde::Deserialize)]
struct SearchItem {
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(rename = "displayLink")]
    display_link: Option<String>,
}

impl GoogleSearchClient {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(api_key: String, search_id: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeouts::SEARCH)
            .connect_timeout(timeouts::CONNECT)
            .gzip(true)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(10))
            .build_with_max_retries(2);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let cache = Cache::builder()
            .max_capacity(RESPONSE_CACHE_SIZE)
            .time_to_live(RESPONSE_CACHE_TTL)
            .build();

        Ok(Self { client, cache, api_key, search_id, endpoint: DEFAULT_ENDPOINT.to_owned() })
    }

    /// Point the client at a mock endpoint (tests only).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Run a search. Zero results is a successful empty list, not an error.
    ///
    /// # Errors
    ///
    /// Returns error on API failure.
    pub async fn search(
        &self,
        query: &str,
        num_results: u8,
        site: Option<&str>,
        date_restrict: Option<&str>,
    ) -> FetchResult<Vec<SearchHit>> {
        let full_query = site.map_or_else(|| query.to_owned(), |s| format!("site:{s} {query}"));

        let mut params = vec![
            ("key".to_owned(), self.api_key.clone()),
            ("cx".to_owned(), self.search_id.clone()),
            ("q".to_owned(), full_query),
            ("num".to_owned(), num_results.clamp(1, 10).to_string()),
        ];
        if let Some(dr) = date_restrict {
            params.push(("dateRestrict".to_owned(), dr.to_owned()));
        }

        let cache_key = self.cache_key(&params);
        let value = match self.cache.get(&cache_key).await {
            Some(cached) => cached,
            None => {
                let response = self.client.get(&self.endpoint).query(&params).send().await?;
                let response = handle_response(response).await?;
                let value: serde_json::Value = response.json().await?;
                self.cache.insert(cache_key, value.clone()).await;
                value
            }
        };

        let parsed: SearchResponse = serde_json::from_value(value)?;
        Ok(parsed
            .items
            .into_iter()
            .map(|item| SearchHit {
                url: item.link,
                title: item.title,
                snippet: item.snippet,
                display_link: item.display_link,
            })
            .collect())
    }

    fn cache_key(&self, params: &[(String, String)]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.endpoint.as_bytes());
        for (k, v) in params {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"&");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Map API status codes to typed errors.
async fn handle_response(response: reqwest::Response) -> FetchResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        429 => {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            Err(FetchError::rate_limited(retry_after))
        }
        500..=599 => {
            let text = response.text().await.unwrap_or_default();
            Err(FetchError::server(status.as_u16(), text))
        }
        _ => {
            let text = response.text().await.unwrap_or_default();
            Err(FetchError::UnexpectedStatus { status: status.as_u16(), message: text })
        }
    }
}

impl std::fmt::Debug for GoogleSearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleSearchClient").field("endpoint", &self.endpoint).finish()
    }
}
