//! Full-text PDF retrieval.
//!
//! Works through the sources in fixed order: an arXiv title match,
//! then Sci-Hub, then the medRxiv and bioRxiv content URLs. The first
//! source that yields a real PDF wins. Servers frequently answer PDF
//! URLs with HTML error pages at status 200, so every download is
//! checked before it is kept.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::arxiv::ArxivClient;
use crate::doi::Doi;
use crate::error::{Result, SerpZotError};
use crate::preprints::{pdf_candidates, PreprintServer};
use crate::scihub::SciHubClient;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Where a PDF came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfSource {
    Existing,
    Arxiv,
    SciHub,
    Medrxiv,
    Biorxiv,
}

impl PdfSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PdfSource::Existing => "existing",
            PdfSource::Arxiv => "arxiv",
            PdfSource::SciHub => "sci-hub",
            PdfSource::Medrxiv => "medrxiv",
            PdfSource::Biorxiv => "biorxiv",
        }
    }
}

/// A saved PDF and the source that provided it.
#[derive(Debug, Clone)]
pub struct FetchedPdf {
    pub path: PathBuf,
    pub source: PdfSource,
}

/// Fetches PDFs for DOIs into a download directory.
pub struct PdfFetcher {
    client: reqwest::Client,
    arxiv: ArxivClient,
    scihub: SciHubClient,
    out_dir: PathBuf,
}

impl PdfFetcher {
    pub fn new(out_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SerpZotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            arxiv: ArxivClient::new()?,
            scihub: SciHubClient::new()?,
            out_dir: out_dir.into(),
        })
    }

    /// Create a fetcher with injected source clients (tests).
    pub fn with_clients(
        out_dir: impl Into<PathBuf>,
        arxiv: ArxivClient,
        scihub: SciHubClient,
    ) -> Result<Self> {
        let mut f = Self::new(out_dir)?;
        f.arxiv = arxiv;
        f.scihub = scihub;
        Ok(f)
    }

    /// The path a DOI's PDF is saved under.
    pub fn pdf_path(&self, doi: &Doi) -> PathBuf {
        self.out_dir.join(format!("{}.pdf", doi.file_stem()))
    }

    /// Work through the source chain for one DOI.
    ///
    /// `title` enables the arXiv step; without it the chain starts at
    /// Sci-Hub. Returns `None` when no source delivered a PDF.
    pub async fn fetch(&self, doi: &Doi, title: Option<&str>) -> Result<Option<FetchedPdf>> {
        let dest = self.pdf_path(doi);
        if dest.exists() {
            debug!(%doi, path = %dest.display(), "PDF already on disk");
            return Ok(Some(FetchedPdf {
                path: dest,
                source: PdfSource::Existing,
            }));
        }
        tokio::fs::create_dir_all(&self.out_dir).await?;

        if let Some(title) = title {
            match self.arxiv.find_pdf_by_title(title).await {
                Ok(Some(url)) => {
                    if self.download_candidate(&url, &dest).await? {
                        info!(%doi, "PDF fetched from arXiv");
                        return Ok(Some(FetchedPdf {
                            path: dest,
                            source: PdfSource::Arxiv,
                        }));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%doi, error = %e, "arXiv title lookup failed"),
            }
        }

        jitter_pause().await;
        match self.scihub.fetch_pdf(doi).await {
            Ok(Some(bytes)) => {
                tokio::fs::write(&dest, &bytes).await?;
                info!(%doi, "PDF fetched from Sci-Hub");
                return Ok(Some(FetchedPdf {
                    path: dest,
                    source: PdfSource::SciHub,
                }));
            }
            Ok(None) => {}
            Err(e) => warn!(%doi, error = %e, "Sci-Hub lookup failed"),
        }

        for (server, source) in [
            (PreprintServer::Medrxiv, PdfSource::Medrxiv),
            (PreprintServer::Biorxiv, PdfSource::Biorxiv),
        ] {
            jitter_pause().await;
            for url in pdf_candidates(server, doi) {
                match self.download_candidate(&url, &dest).await {
                    Ok(true) => {
                        info!(%doi, server = server.name(), "PDF fetched from preprint server");
                        return Ok(Some(FetchedPdf {
                            path: dest,
                            source,
                        }));
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%doi, url, error = %e, "Preprint download failed"),
                }
            }
        }

        debug!(%doi, "No source had a PDF");
        Ok(None)
    }

    /// Download one URL if it really is a PDF. Returns whether it was
    /// saved.
    async fn download_candidate(&self, url: &str, dest: &Path) -> Result<bool> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response.bytes().await?;

        if !looks_like_pdf(&content_type, &bytes) {
            debug!(url, content_type, "Response is not a PDF");
            return Ok(false);
        }

        tokio::fs::write(dest, &bytes).await?;
        Ok(true)
    }
}

/// Accept a payload only when the headers or magic bytes say PDF.
fn looks_like_pdf(content_type: &str, body: &[u8]) -> bool {
    if content_type.contains("application/pdf") {
        return true;
    }
    if content_type.contains("text/html") {
        return false;
    }
    body.starts_with(b"%PDF")
}

/// Short random pause so download bursts do not hammer one host.
async fn jitter_pause() {
    let millis = 500 + rand::random::<u64>() % 1500;
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_pdf() {
        assert!(looks_like_pdf("application/pdf", b"%PDF-1.4"));
        assert!(looks_like_pdf("application/pdf; charset=binary", b"junk"));
        assert!(looks_like_pdf("application/octet-stream", b"%PDF-1.7 x"));
        assert!(!looks_like_pdf("text/html", b"%PDF-1.4"));
        assert!(!looks_like_pdf("application/octet-stream", b"<html>nope</html>"));
    }

    #[test]
    fn test_pdf_path_uses_doi_stem() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = PdfFetcher::new(dir.path()).unwrap();
        let doi = Doi::parse("10.1152/physiolgenomics.00029.2020").unwrap();
        assert_eq!(
            fetcher.pdf_path(&doi),
            dir.path().join("10.1152_physiolgenomics.00029.2020.pdf")
        );
    }

    #[tokio::test]
    async fn test_fetch_skips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = PdfFetcher::new(dir.path()).unwrap();
        let doi = Doi::parse("10.1000/cached.1").unwrap();
        std::fs::write(fetcher.pdf_path(&doi), b"%PDF-1.4 cached").unwrap();

        let fetched = fetcher.fetch(&doi, None).await.unwrap().unwrap();
        assert_eq!(fetched.source, PdfSource::Existing);
        assert_eq!(fetched.path, fetcher.pdf_path(&doi));
    }

    #[tokio::test]
    async fn test_download_candidate_rejects_html() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/content/error-page.pdf")
            .with_status(200)
            .with_header("Content-Type", "text/html")
            .with_body("<html><body>Not found</body></html>")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = PdfFetcher::new(dir.path()).unwrap();
        let dest = dir.path().join("out.pdf");
        let url = format!("{}/content/error-page.pdf", server.url());

        assert!(!fetcher.download_candidate(&url, &dest).await.unwrap());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_download_candidate_saves_pdf() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/content/real.pdf")
            .with_status(200)
            .with_header("Content-Type", "application/pdf")
            .with_body("%PDF-1.4 real")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = PdfFetcher::new(dir.path()).unwrap();
        let dest = dir.path().join("real.pdf");
        let url = format!("{}/content/real.pdf", server.url());

        assert!(fetcher.download_candidate(&url, &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-1.4 real");
    }
}
