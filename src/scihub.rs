//! Sci-Hub PDF retrieval.
//!
//! Mirrors answer either with the PDF bytes directly or with a viewer
//! page that embeds the real file in an iframe/embed tag. Both shapes
//! are handled, with a regex sweep as a last resort for pages the
//! selector pass misses.

use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::doi::Doi;
use crate::error::{Result, SerpZotError};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Mirrors tried in order.
const MIRRORS: &[&str] = &["https://sci-hub.se", "https://sci-hub.ru"];

/// Client that resolves a DOI to PDF bytes through Sci-Hub mirrors.
pub struct SciHubClient {
    client: reqwest::Client,
    mirrors: Vec<String>,
}

impl SciHubClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            mirrors: MIRRORS.iter().map(|m| (*m).to_string()).collect(),
        })
    }

    /// Create a client with a custom mirror list (tests).
    pub fn with_mirrors(mirrors: Vec<String>) -> Result<Self> {
        let mut c = Self::new()?;
        if !mirrors.is_empty() {
            c.mirrors = mirrors;
        }
        Ok(c)
    }

    /// Try every mirror for a DOI; `None` when no mirror serves a PDF.
    pub async fn fetch_pdf(&self, doi: &Doi) -> Result<Option<Vec<u8>>> {
        for mirror in &self.mirrors {
            let url = format!("{}/{}", mirror.trim_end_matches('/'), doi);
            match self.try_mirror(mirror, &url).await {
                Ok(Some(bytes)) => {
                    debug!(mirror, %doi, size = bytes.len(), "PDF fetched from Sci-Hub");
                    return Ok(Some(bytes));
                }
                Ok(None) => {
                    debug!(mirror, %doi, "Mirror has no PDF for this DOI");
                }
                Err(e) => {
                    warn!(mirror, %doi, error = %e, "Sci-Hub mirror failed");
                }
            }
        }
        Ok(None)
    }

    async fn try_mirror(&self, mirror: &str, url: &str) -> Result<Option<Vec<u8>>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SerpZotError::Api {
                code: response.status().as_u16() as i32,
                message: "mirror rejected the request".to_string(),
            });
        }

        if is_pdf_response(&response) {
            return Ok(Some(response.bytes().await?.to_vec()));
        }

        let html = response.text().await?;
        let src = match extract_pdf_src(&html)? {
            Some(src) => src,
            None => return Ok(None),
        };
        let pdf_url = normalize_src(&src, mirror);

        let pdf_response = self.client.get(&pdf_url).send().await?;
        if pdf_response.status().is_success() && is_pdf_response(&pdf_response) {
            Ok(Some(pdf_response.bytes().await?.to_vec()))
        } else {
            Ok(None)
        }
    }
}

fn is_pdf_response(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/pdf"))
        .unwrap_or(false)
}

/// Find the embedded PDF location in a viewer page.
pub fn extract_pdf_src(html: &str) -> Result<Option<String>> {
    let iframe = parse_selector("iframe#pdf, iframe[src*='.pdf']")?;
    let embed = parse_selector("embed[type='application/pdf'], embed[src*='.pdf']")?;

    let document = Html::parse_document(html);
    let src = document
        .select(&iframe)
        .next()
        .and_then(|el| el.value().attr("src"))
        .or_else(|| {
            document
                .select(&embed)
                .next()
                .and_then(|el| el.value().attr("src"))
        })
        .map(|s| s.to_string());

    if src.is_some() {
        return Ok(src);
    }

    // Some mirror skins build the viewer in script; scan the raw text.
    let fallback = Regex::new(r#"src\s*=\s*"([^"]*\.pdf[^"]*)""#)
        .map_err(|e| SerpZotError::Parse(e.to_string()))?;
    Ok(fallback
        .captures(html)
        .map(|c| c[1].to_string()))
}

/// Resolve a viewer `src` attribute to a fetchable URL.
pub fn normalize_src(src: &str, mirror: &str) -> String {
    let src = src.split('#').next().unwrap_or(src);
    if let Some(rest) = src.strip_prefix("//") {
        return format!("https://{}", rest);
    }
    if src.starts_with("http://") || src.starts_with("https://") {
        return src.to_string();
    }
    match Url::parse(mirror).and_then(|base| base.join(src)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => format!("{}/{}", mirror.trim_end_matches('/'), src.trim_start_matches('/')),
    }
}

fn parse_selector(input: &str) -> Result<Selector> {
    Selector::parse(input).map_err(|e| SerpZotError::Parse(format!("bad selector {}: {}", input, e)))
}
