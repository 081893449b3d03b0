//! arXiv export API client.
//!
//! Used two ways: harvesting DOIs from a subject search, and finding a
//! PDF for an already-known title. The export API speaks Atom, parsed
//! here with quick-xml.

use std::sync::Arc;
use std::time::Duration;

use quick_xml::de::from_str;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::doi::Doi;
use crate::error::{Result, SerpZotError};
use crate::similarity::titles_match;

/// arXiv export API base URL
const ARXIV_API_URL: &str = "http://export.arxiv.org";

/// Results per harvest query
const HARVEST_LIMIT: usize = 50;

/// Results per title lookup
const TITLE_SEARCH_LIMIT: usize = 10;

/// One paper from an export API response.
#[derive(Debug, Clone)]
pub struct ArxivPaper {
    pub title: String,
    pub summary: String,
    pub published: Option<String>,
    pub doi: Option<Doi>,
    pub pdf_url: Option<String>,
    pub authors: Vec<String>,
}

/// Client for the arXiv export API.
pub struct ArxivClient {
    client: reqwest::Client,
    base_url: String,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl ArxivClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: ARXIV_API_URL.to_string(),
            semaphore: Arc::new(Semaphore::new(2)),
            max_retries: 3,
        })
    }

    /// Create a client against a different endpoint (tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let mut c = Self::new()?;
        c.base_url = base_url.into();
        Ok(c)
    }

    /// Run a subject search across all fields.
    pub async fn search_all(&self, query: &str, max_results: usize) -> Result<Vec<ArxivPaper>> {
        let search_query = format!("all:{}", query);
        self.query_feed(&[
            ("search_query", search_query.as_str()),
            ("start", "0"),
            ("max_results", &max_results.to_string()),
        ])
        .await
    }

    /// Search by exact title, most relevant first.
    pub async fn search_titles(&self, title: &str) -> Result<Vec<ArxivPaper>> {
        // Embedded quotes would close the phrase early.
        let phrase = title.replace('"', " ");
        let search_query = format!("ti:\"{}\"", phrase.trim());
        self.query_feed(&[
            ("search_query", search_query.as_str()),
            ("start", "0"),
            ("max_results", &TITLE_SEARCH_LIMIT.to_string()),
            ("sortBy", "relevance"),
        ])
        .await
    }

    /// Harvest DOIs for a subject query.
    ///
    /// Only entries that carry a DOI element contribute; most preprints
    /// gain one after journal publication.
    pub async fn harvest_dois(&self, query: &str) -> Result<Vec<Doi>> {
        let papers = self.search_all(query, HARVEST_LIMIT).await?;
        let dois: Vec<Doi> = papers.into_iter().filter_map(|p| p.doi).collect();
        debug!(count = dois.len(), query, "arXiv DOI harvest");
        Ok(dois)
    }

    /// Find the PDF link for a known title, if any search hit matches
    /// it closely enough.
    pub async fn find_pdf_by_title(&self, title: &str) -> Result<Option<String>> {
        let papers = self.search_titles(title).await?;
        for paper in papers {
            if titles_match(title, &paper.title) {
                debug!(candidate = %paper.title, "Title matched on arXiv");
                return Ok(paper.pdf_url);
            }
        }
        Ok(None)
    }

    async fn query_feed(&self, params: &[(&str, &str)]) -> Result<Vec<ArxivPaper>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| SerpZotError::Config(format!("Semaphore error: {}", e)))?;

        let mut attempt = 0;
        let mut backoff = Duration::from_millis(500);

        loop {
            attempt += 1;
            match self.do_query(params).await {
                Ok(papers) => return Ok(papers),
                Err(e) if attempt <= self.max_retries => {
                    let wait = match &e {
                        SerpZotError::RateLimited(secs) => Duration::from_secs(*secs),
                        _ => backoff,
                    };
                    warn!(attempt, error = %e, "arXiv query failed, retrying in {:?}", wait);
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn do_query(&self, params: &[(&str, &str)]) -> Result<Vec<ArxivPaper>> {
        let url = format!("{}/api/query", self.base_url);
        let response = self.client.get(&url).query(params).send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SerpZotError::RateLimited(5));
        }
        if !response.status().is_success() {
            return Err(SerpZotError::Api {
                code: response.status().as_u16() as i32,
                message: "arXiv export API error".to_string(),
            });
        }

        let xml = response.text().await?;
        parse_feed(&xml)
    }
}

/// Parse an Atom feed into papers.
fn parse_feed(xml: &str) -> Result<Vec<ArxivPaper>> {
    let feed: AtomFeed = from_str(xml)?;
    Ok(feed.entries.into_iter().map(into_paper).collect())
}

fn into_paper(entry: AtomEntry) -> ArxivPaper {
    let pdf_url = entry
        .links
        .iter()
        .find(|l| l.title.as_deref() == Some("pdf"))
        .or_else(|| {
            entry
                .links
                .iter()
                .find(|l| l.link_type.as_deref() == Some("application/pdf"))
        })
        .and_then(|l| l.href.clone())
        .map(upgrade_scheme);

    ArxivPaper {
        title: clean_text(&entry.title),
        summary: clean_text(&entry.summary),
        published: entry.published.map(|p| p.trim().to_string()),
        doi: entry.doi.and_then(|d| Doi::parse(&d).ok()),
        pdf_url,
        authors: entry
            .authors
            .into_iter()
            .map(|a| clean_text(&a.name))
            .collect(),
    }
}

/// Collapse the feed's hard-wrapped text to single-space words.
fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The feed hands out `http://` links; the files live behind https.
fn upgrade_scheme(href: String) -> String {
    match href.strip_prefix("http://") {
        Some(rest) => format!("https://{}", rest),
        None => href,
    }
}

// === Atom Feed Types ===

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: String,
    #[serde(default)]
    summary: String,
    published: Option<String>,
    #[serde(rename = "author", default)]
    authors: Vec<AtomAuthor>,
    #[serde(rename = "arxiv:doi", alias = "doi")]
    doi: Option<String>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@title")]
    title: Option<String>,
    #[serde(rename = "@type")]
    link_type: Option<String>,
}
