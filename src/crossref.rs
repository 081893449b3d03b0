//! Crossref bibliographic lookup.
//!
//! Citation snippets that carry no literal DOI go through Crossref's
//! `query.bibliographic` search; the top-ranked work's DOI is taken as
//! the resolution.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::doi::Doi;
use crate::error::{Result, SerpZotError};

/// Crossref API base URL
const CROSSREF_API_URL: &str = "https://api.crossref.org/works";

/// Polite pool email for Crossref API
const MAILTO: &str = "serpzot@example.com";

/// Crossref API client with rate limiting and concurrency control
pub struct CrossrefClient {
    client: reqwest::Client,
    base_url: String,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl CrossrefClient {
    /// Create a new CrossrefClient
    ///
    /// # Arguments
    ///
    /// * `max_workers` - Maximum concurrent requests (default: 3)
    pub fn new(max_workers: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("serpzot/0.1 (mailto:{})", MAILTO))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: CROSSREF_API_URL.to_string(),
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_retries: 3,
        })
    }

    /// Create a client against a different endpoint (tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let mut c = Self::new(3)?;
        c.base_url = base_url.into();
        Ok(c)
    }

    /// Resolve a bibliographic fragment (a styled citation string) to a DOI.
    ///
    /// Uses exponential backoff for rate limiting. Returns `None` when
    /// Crossref has no candidate or retries are exhausted.
    pub async fn lookup_doi(&self, fragment: &str) -> Option<Doi> {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return None;
        }

        let _permit = self.semaphore.acquire().await.ok()?;

        let preview: String = fragment.chars().take(40).collect();
        let mut backoff = Duration::from_millis(500);

        for attempt in 0..self.max_retries {
            match self.do_lookup(fragment).await {
                Ok(Some(doi)) => return Some(doi),
                Ok(None) => return None,
                Err(SerpZotError::RateLimited(secs)) => {
                    let wait = Duration::from_secs(secs).max(backoff);
                    warn!(
                        fragment = %preview,
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs(),
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                }
                Err(e) => {
                    debug!(
                        fragment = %preview,
                        attempt = attempt + 1,
                        error = %e,
                        "Lookup failed"
                    );
                    if attempt < self.max_retries - 1 {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        None
    }

    /// Internal lookup implementation
    async fn do_lookup(&self, fragment: &str) -> Result<Option<Doi>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("query.bibliographic", fragment),
                ("rows", "1"),
                ("select", "DOI"),
                ("mailto", MAILTO),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SerpZotError::RateLimited(5));
        }

        if !response.status().is_success() {
            return Err(SerpZotError::Api {
                code: response.status().as_u16() as i32,
                message: format!("Crossref API error: {}", response.status()),
            });
        }

        let data: CrossrefResponse = response.json().await?;

        let Some(item) = data.message.items.into_iter().next() else {
            return Ok(None);
        };

        match Doi::parse(&item.doi) {
            Ok(doi) => Ok(Some(doi)),
            Err(e) => {
                debug!(raw = %item.doi, error = %e, "Crossref returned an unparseable DOI");
                Ok(None)
            }
        }
    }

    /// Resolve multiple fragments concurrently.
    ///
    /// Returns a vector with the same length as input, with None for failed lookups.
    pub async fn lookup_batch(&self, fragments: &[String]) -> Vec<Option<Doi>> {
        info!(count = fragments.len(), "Starting batch Crossref lookup");

        let futures: Vec<_> = fragments.iter().map(|f| self.lookup_doi(f)).collect();
        let results = join_all(futures).await;

        let matched = results.iter().filter(|r| r.is_some()).count();
        info!(total = fragments.len(), matched, "Batch lookup complete");

        results
    }
}

// === Crossref API Response Types ===

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: CrossrefMessage,
}

#[derive(Debug, Deserialize)]
struct CrossrefMessage {
    #[serde(default)]
    items: Vec<CrossrefItem>,
}

#[derive(Debug, Deserialize)]
struct CrossrefItem {
    #[serde(rename = "DOI", default)]
    doi: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_works_response() {
        let json = r#"{
            "message": {
                "items": [
                    {"DOI": "10.1152/physiolgenomics.00029.2020"},
                    {"DOI": "10.1000/other"}
                ]
            }
        }"#;
        let parsed: CrossrefResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.message.items[0].doi, "10.1152/physiolgenomics.00029.2020");
    }

    #[test]
    fn test_parse_empty_items() {
        let json = r#"{"message": {"items": []}}"#;
        let parsed: CrossrefResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.message.items.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message": {"items": [{"DOI": "10.1234/ABC"}]}}"#)
            .create_async()
            .await;

        let client = CrossrefClient::with_base_url(server.url()).unwrap();
        let doi = client.lookup_doi("Joe, B. (2020). Some paper. Physiol Genomics.").await;
        assert_eq!(doi.map(|d| d.as_str().to_string()).as_deref(), Some("10.1234/abc"));
    }

    #[tokio::test]
    async fn test_lookup_empty_fragment_short_circuits() {
        let client = CrossrefClient::new(1).unwrap();
        assert!(client.lookup_doi("   ").await.is_none());
    }
}
