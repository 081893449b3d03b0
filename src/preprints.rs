//! medRxiv and bioRxiv preprint servers.
//!
//! Neither server exposes a search API, so DOI harvesting scrapes the
//! public search page and pulls every `doi.org` reference out of the
//! markup. PDF locations are predictable from the DOI, so candidate
//! URLs are built directly.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::doi::Doi;
use crate::error::{Result, SerpZotError};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Which preprint server to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprintServer {
    Medrxiv,
    Biorxiv,
}

impl PreprintServer {
    pub fn name(self) -> &'static str {
        match self {
            PreprintServer::Medrxiv => "medrxiv",
            PreprintServer::Biorxiv => "biorxiv",
        }
    }

    fn base_url(self) -> String {
        format!("https://www.{}.org", self.name())
    }
}

/// Candidate PDF URLs for a preprint DOI, most likely first.
///
/// medRxiv has shuffled its content paths over time, so three layouts
/// are tried. bioRxiv has kept one.
pub fn pdf_candidates(server: PreprintServer, doi: &Doi) -> Vec<String> {
    let base = server.base_url();
    match server {
        PreprintServer::Medrxiv => vec![
            format!("{}/content/{}v1.full.pdf", base, doi),
            format!("{}/content/{}full.pdf", base, doi),
            format!("{}/content/medrxiv/early/{}v1.full.pdf", base, doi),
        ],
        PreprintServer::Biorxiv => vec![format!("{}/content/{}v1.full.pdf", base, doi)],
    }
}

/// Client for the preprint server search pages.
pub struct PreprintClient {
    client: reqwest::Client,
    base_url: Option<String>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl PreprintClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: None,
            semaphore: Arc::new(Semaphore::new(2)),
            max_retries: 3,
        })
    }

    /// Create a client that hits one endpoint for every server (tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let mut c = Self::new()?;
        c.base_url = Some(base_url.into());
        Ok(c)
    }

    /// Harvest DOIs from a server's search page.
    pub async fn harvest_dois(&self, server: PreprintServer, query: &str) -> Result<Vec<Doi>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| SerpZotError::Config(format!("Semaphore error: {}", e)))?;

        let mut attempt = 0;
        let mut backoff = Duration::from_millis(500);

        loop {
            attempt += 1;
            match self.do_harvest(server, query).await {
                Ok(dois) => {
                    debug!(server = server.name(), count = dois.len(), "Preprint DOI harvest");
                    return Ok(dois);
                }
                Err(e) if attempt <= self.max_retries => {
                    warn!(
                        server = server.name(),
                        attempt,
                        error = %e,
                        "Preprint search failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn do_harvest(&self, server: PreprintServer, query: &str) -> Result<Vec<Doi>> {
        let base = self
            .base_url
            .clone()
            .unwrap_or_else(|| server.base_url());
        // Terms land in the path, so each one is encoded individually.
        let terms = query
            .split_whitespace()
            .map(|t| urlencoding::encode(t).into_owned())
            .collect::<Vec<_>>()
            .join("+");
        let url = format!("{}/search/{}", base, terms);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SerpZotError::Api {
                code: response.status().as_u16() as i32,
                message: format!("{} search page error", server.name()),
            });
        }

        let html = response.text().await?;
        Ok(extract_dois(&html))
    }
}

/// Pull every distinct DOI out of a search results page.
pub fn extract_dois(html: &str) -> Vec<Doi> {
    let pattern = match Regex::new(r"//doi\.org/(\S+)") {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut dois = Vec::new();

    for capture in pattern.captures_iter(html) {
        let raw = &capture[1];
        // The \S+ run spills into surrounding markup.
        let cut = raw
            .find(['"', '\'', '<', '>', '&'])
            .unwrap_or(raw.len());
        let candidate = raw[..cut].trim_end_matches(['.', ',', ';', ':', ')']);

        if let Ok(doi) = Doi::parse(candidate) {
            if seen.insert(doi.as_str().to_string()) {
                dois.push(doi);
            }
        }
    }

    dois
}
