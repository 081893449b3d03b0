//! SerpAPI Google Scholar client.
//!
//! Two engines from the same endpoint: `google_scholar` for organic
//! search results and `google_scholar_cite` for the styled citation
//! strings belonging to one result id. The citation snippet is what
//! later stages mine for a DOI.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{Result, SerpZotError};

/// SerpAPI endpoint
const SERPAPI_URL: &str = "https://serpapi.com/search.json";

/// Default number of organic results per search
pub const DEFAULT_RESULT_LIMIT: usize = 20;

/// One organic Google Scholar result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScholarResult {
    /// Result title
    pub title: String,
    /// SerpAPI result id, used for the citation lookup
    pub result_id: String,
    /// Link to the article page
    pub link: String,
    /// Search snippet (becomes the abstract of the uploaded record)
    pub snippet: String,
    /// Publication summary line (authors, venue, year)
    pub summary: String,
    /// "Cited by" count when present
    pub cited_by: Option<u64>,
}

/// SerpAPI client with concurrency control and retries.
pub struct ScholarClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl ScholarClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - SerpAPI key
    /// * `max_workers` - Maximum concurrent requests (default: 3)
    pub fn new(api_key: impl Into<String>, max_workers: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: SERPAPI_URL.to_string(),
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_retries: 3,
        })
    }

    /// Create a client against a different endpoint (tests).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let mut c = Self::new(api_key, 3)?;
        c.base_url = base_url.into();
        Ok(c)
    }

    /// Search Google Scholar for `term`.
    ///
    /// An empty `organic_results` array (no hits, or an API-side error
    /// body) yields an empty vec, not an error.
    pub async fn search(
        &self,
        term: &str,
        min_year: Option<i32>,
        limit: usize,
    ) -> Result<Vec<ScholarResult>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| SerpZotError::Config(format!("Semaphore closed: {}", e)))?;

        info!(query = term, min_year, limit, "Searching Google Scholar via SerpAPI");

        let mut backoff = Duration::from_millis(500);
        let mut last_err = SerpZotError::Parse("no attempts made".to_string());

        for attempt in 0..self.max_retries {
            match self.do_search(term, min_year, limit).await {
                Ok(results) => return Ok(results),
                Err(SerpZotError::RateLimited(secs)) => {
                    let wait = Duration::from_secs(secs).max(backoff);
                    warn!(attempt = attempt + 1, wait_secs = wait.as_secs(), "Rate limited, waiting");
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                    last_err = SerpZotError::RateLimited(secs);
                }
                Err(e) => {
                    debug!(attempt = attempt + 1, error = %e, "Search attempt failed");
                    last_err = e;
                    if attempt < self.max_retries - 1 {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_err)
    }

    async fn do_search(
        &self,
        term: &str,
        min_year: Option<i32>,
        limit: usize,
    ) -> Result<Vec<ScholarResult>> {
        let num = limit.to_string();
        let mut params = vec![
            ("api_key", self.api_key.as_str()),
            ("device", "desktop"),
            ("engine", "google_scholar"),
            ("q", term),
            ("hl", "en"),
            ("num", num.as_str()),
        ];
        let ylo;
        if let Some(year) = min_year {
            ylo = year.to_string();
            params.push(("as_ylo", ylo.as_str()));
        }

        let response = self.client.get(&self.base_url).query(&params).send().await?;
        let data: SerpSearchResponse = check_serpapi_response(response).await?;

        if let Some(msg) = data.error {
            // SerpAPI reports "no results" through this field too
            warn!(message = %msg, "SerpAPI returned an error body");
            return Ok(Vec::new());
        }

        let results = data
            .organic_results
            .into_iter()
            .map(|r| ScholarResult {
                title: r.title,
                result_id: r.result_id,
                link: r.link.unwrap_or_default(),
                snippet: r.snippet.unwrap_or_default(),
                summary: r.publication_info.and_then(|p| p.summary).unwrap_or_default(),
                cited_by: r.inline_links.and_then(|l| l.cited_by).and_then(|c| c.total),
            })
            .collect();

        Ok(results)
    }

    /// Fetch the citation snippet for one result id.
    ///
    /// SerpAPI returns several styled citation strings; index 1 is the
    /// APA form in the current ordering, with index 0 as fallback for
    /// older orderings. Errors are logged and collapse to `None` so one
    /// bad lookup never stops the run.
    pub async fn cite_fragment(&self, result_id: &str) -> Option<String> {
        if result_id.is_empty() {
            warn!("Result without a result_id, skipping citation lookup");
            return None;
        }

        let _permit = self.semaphore.acquire().await.ok()?;

        let mut backoff = Duration::from_millis(500);

        for attempt in 0..self.max_retries {
            match self.do_cite(result_id).await {
                Ok(fragment) => return fragment,
                Err(SerpZotError::RateLimited(secs)) => {
                    let wait = Duration::from_secs(secs).max(backoff);
                    warn!(
                        result_id,
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs(),
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                }
                Err(e) => {
                    debug!(result_id, attempt = attempt + 1, error = %e, "Citation lookup failed");
                    if attempt < self.max_retries - 1 {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        None
    }

    async fn do_cite(&self, result_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("device", "desktop"),
                ("engine", "google_scholar_cite"),
                ("q", result_id),
            ])
            .send()
            .await?;

        let data: SerpCiteResponse = check_serpapi_response(response).await?;

        if let Some(msg) = data.error {
            return Err(SerpZotError::Api {
                code: 200,
                message: msg,
            });
        }

        Ok(pick_citation_snippet(&data.citations))
    }

    /// Fetch citation snippets for many results concurrently.
    ///
    /// The output has the same length and order as the input.
    pub async fn cite_batch(&self, results: &[ScholarResult]) -> Vec<Option<String>> {
        info!(count = results.len(), "Retrieving citation snippets");

        let futures: Vec<_> = results.iter().map(|r| self.cite_fragment(&r.result_id)).collect();
        let fragments = join_all(futures).await;

        let found = fragments.iter().filter(|f| f.is_some()).count();
        info!(total = results.len(), found, "Citation retrieval complete");

        fragments
    }
}

/// Map a SerpAPI HTTP response to a deserialized body or a typed error.
async fn check_serpapi_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T> {
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(SerpZotError::RateLimited(5));
    }

    if !response.status().is_success() {
        let code = response.status().as_u16() as i32;
        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| serde_json::from_str::<SerpErrorBody>(&body).ok())
            .map(|e| e.error)
            .unwrap_or_else(|| "SerpAPI request failed".to_string());
        return Err(SerpZotError::Api { code, message });
    }

    Ok(response.json().await?)
}

/// Index 1 (APA) preferred, index 0 as fallback.
fn pick_citation_snippet(citations: &[Citation]) -> Option<String> {
    citations
        .get(1)
        .or_else(|| citations.first())
        .map(|c| c.snippet.clone())
        .filter(|s| !s.is_empty())
}

// === SerpAPI Response Types ===

#[derive(Debug, Deserialize)]
struct SerpSearchResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    result_id: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    publication_info: Option<PublicationInfo>,
    #[serde(default)]
    inline_links: Option<InlineLinks>,
}

#[derive(Debug, Deserialize)]
struct PublicationInfo {
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InlineLinks {
    #[serde(default)]
    cited_by: Option<CitedBy>,
}

#[derive(Debug, Deserialize)]
struct CitedBy {
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SerpCiteResponse {
    #[serde(default)]
    citations: Vec<Citation>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Citation {
    #[serde(default)]
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct SerpErrorBody {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let json = r#"{
            "organic_results": [{
                "title": "Hypertension and the gut microbiome",
                "result_id": "AbCdEfGhIjK",
                "link": "https://example.org/paper",
                "snippet": "We review evidence that...",
                "publication_info": {
                    "summary": "B Joe, X Cheng - Physiological Genomics, 2020"
                },
                "inline_links": {"cited_by": {"total": 42}}
            }]
        }"#;

        let parsed: SerpSearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.organic_results.len(), 1);
        let r = &parsed.organic_results[0];
        assert_eq!(r.result_id, "AbCdEfGhIjK");
        assert_eq!(
            r.inline_links.as_ref().and_then(|l| l.cited_by.as_ref()).and_then(|c| c.total),
            Some(42)
        );
    }

    #[test]
    fn test_parse_error_body() {
        let json = r#"{"error": "Google Scholar hasn't returned any results for this query."}"#;
        let parsed: SerpSearchResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.organic_results.is_empty());
        assert!(parsed.error.is_some());
    }

    #[test]
    fn test_pick_citation_prefers_index_one() {
        let citations = vec![
            Citation {
                snippet: "Joe, Bina. \"Paper.\" (2020).".to_string(),
            },
            Citation {
                snippet: "Joe, B. (2020). Paper. https://doi.org/10.1/x".to_string(),
            },
        ];
        assert_eq!(
            pick_citation_snippet(&citations).as_deref(),
            Some("Joe, B. (2020). Paper. https://doi.org/10.1/x")
        );
    }

    #[test]
    fn test_pick_citation_falls_back_to_first() {
        let citations = vec![Citation {
            snippet: "only style".to_string(),
        }];
        assert_eq!(pick_citation_snippet(&citations).as_deref(), Some("only style"));
        assert_eq!(pick_citation_snippet(&[]), None);
    }

    #[tokio::test]
    async fn test_search_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"organic_results": [{"title": "T", "result_id": "R1", "snippet": "s"}]}"#,
            )
            .create_async()
            .await;

        let client = ScholarClient::with_base_url("test-key", server.url()).unwrap();
        let results = client.search("gut microbiome", Some(2019), 20).await.unwrap();

        mock.assert_async().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_id, "R1");
    }
}
