//! Pipeline orchestration.
//!
//! Harvest collects DOI references from every enabled source. The
//! upload stage resolves each new DOI to a BibTeX record, pushes the
//! item into the library, and hands the created key to a PDF worker
//! over a bounded channel, so metadata uploads and file downloads
//! overlap without sharing state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::arxiv::ArxivClient;
use crate::bibtex::{self, BibEntry};
use crate::crossref::CrossrefClient;
use crate::dedupe::DedupeLedger;
use crate::doi::{extract_doi, Doi};
use crate::error::{Result, SerpZotError};
use crate::pdf::{PdfFetcher, PdfSource};
use crate::preprints::{PreprintClient, PreprintServer};
use crate::record::CitationRecord;
use crate::scholar::ScholarClient;
use crate::zotero::{ZoteroClient, ZoteroItem};

/// Jobs buffered between the upload loop and the PDF worker.
const PDF_QUEUE_DEPTH: usize = 16;

/// Which harvest sources run.
#[derive(Debug, Clone, Copy)]
pub struct SourceToggles {
    pub serp: bool,
    pub arxiv: bool,
    pub medrxiv: bool,
    pub biorxiv: bool,
}

impl Default for SourceToggles {
    fn default() -> Self {
        Self {
            serp: true,
            arxiv: true,
            medrxiv: true,
            biorxiv: true,
        }
    }
}

impl SourceToggles {
    /// Parse the CLI form: `all`, or a comma list like `serp,arxiv`.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::default());
        }

        let mut toggles = Self {
            serp: false,
            arxiv: false,
            medrxiv: false,
            biorxiv: false,
        };
        for name in spec.split(',') {
            match name.trim().to_lowercase().as_str() {
                "serp" | "scholar" => toggles.serp = true,
                "arxiv" => toggles.arxiv = true,
                "medrxiv" => toggles.medrxiv = true,
                "biorxiv" => toggles.biorxiv = true,
                "" => {}
                other => {
                    return Err(SerpZotError::Config(format!(
                        "unknown source '{}' (expected serp, arxiv, medrxiv, biorxiv or all)",
                        other
                    )))
                }
            }
        }
        Ok(toggles)
    }
}

/// One DOI reference out of the harvest stage.
///
/// The snippet is the one belonging to this result, carried along so
/// it can become the uploaded item's abstract.
#[derive(Debug, Clone)]
pub struct HarvestedRef {
    pub doi: Doi,
    pub snippet: Option<String>,
}

/// One line of the run report CSV.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub doi: String,
    pub title: String,
    pub status: String,
    pub item_key: String,
    pub pdf: String,
}

/// What the upload stage produced.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub rows: Vec<ReportRow>,
    /// BibTeX entries of the uploaded records, for the .bib outputs
    pub entries: Vec<BibEntry>,
    pub uploaded: usize,
    pub pdfs_attached: usize,
}

/// Collect DOI references from every enabled source.
///
/// A failing source logs a warning and the run continues with the
/// rest. Duplicates across sources collapse to the first occurrence,
/// which keeps the Scholar snippet when one exists.
#[allow(clippy::too_many_arguments)]
pub async fn harvest(
    scholar: Option<&ScholarClient>,
    crossref: &CrossrefClient,
    arxiv: &ArxivClient,
    preprints: &PreprintClient,
    query: &str,
    min_year: Option<i32>,
    limit: usize,
    sources: &SourceToggles,
) -> Vec<HarvestedRef> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut refs: Vec<HarvestedRef> = Vec::new();

    let mut push = |doi: Doi, snippet: Option<String>, refs: &mut Vec<HarvestedRef>| {
        if seen.insert(doi.as_str().to_string()) {
            refs.push(HarvestedRef { doi, snippet });
        }
    };

    if sources.serp {
        match scholar {
            Some(scholar) => match scholar.search(query, min_year, limit).await {
                Ok(results) => {
                    let fragments = scholar.cite_batch(&results).await;

                    // Literal DOIs come straight out of the fragment; the
                    // rest go to Crossref as one concurrent batch.
                    let mut resolved: Vec<Option<Doi>> = Vec::with_capacity(results.len());
                    let mut pending: Vec<(usize, String)> = Vec::new();
                    for (idx, fragment) in fragments.iter().enumerate() {
                        let Some(f) = fragment else {
                            resolved.push(None);
                            continue;
                        };
                        match extract_doi(f) {
                            Some(doi) => resolved.push(Some(doi)),
                            None => {
                                pending.push((idx, f.clone()));
                                resolved.push(None);
                            }
                        }
                    }
                    if !pending.is_empty() {
                        let texts: Vec<String> =
                            pending.iter().map(|(_, f)| f.clone()).collect();
                        let looked_up = crossref.lookup_batch(&texts).await;
                        for ((idx, _), doi) in pending.into_iter().zip(looked_up) {
                            resolved[idx] = doi;
                        }
                    }

                    for (result, doi) in results.iter().zip(resolved) {
                        match doi {
                            Some(doi) => {
                                let snippet =
                                    Some(result.snippet.clone()).filter(|s| !s.is_empty());
                                push(doi, snippet, &mut refs);
                            }
                            None => debug!(title = %result.title, "No DOI resolved for result"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Scholar search failed, continuing without it"),
            },
            None => warn!("Scholar source enabled but no API key configured"),
        }
    }

    if sources.arxiv {
        match arxiv.harvest_dois(query).await {
            Ok(dois) => {
                for doi in dois {
                    push(doi, None, &mut refs);
                }
            }
            Err(e) => warn!(error = %e, "arXiv harvest failed, continuing without it"),
        }
    }

    for (enabled, server) in [
        (sources.medrxiv, PreprintServer::Medrxiv),
        (sources.biorxiv, PreprintServer::Biorxiv),
    ] {
        if !enabled {
            continue;
        }
        match preprints.harvest_dois(server, query).await {
            Ok(dois) => {
                for doi in dois {
                    push(doi, None, &mut refs);
                }
            }
            Err(e) => {
                warn!(server = server.name(), error = %e, "Preprint harvest failed, continuing")
            }
        }
    }

    info!(count = refs.len(), "Harvest complete");
    refs
}

struct PdfJob {
    doi: Doi,
    title: Option<String>,
    item_key: String,
}

enum PdfOutcome {
    Attached(PdfSource),
    Missing,
    AttachFailed,
    FetchFailed,
}

impl PdfOutcome {
    fn label(&self) -> String {
        match self {
            PdfOutcome::Attached(source) => source.as_str().to_string(),
            PdfOutcome::Missing => "missing".to_string(),
            PdfOutcome::AttachFailed => "attach failed".to_string(),
            PdfOutcome::FetchFailed => "fetch failed".to_string(),
        }
    }

    fn attached(&self) -> bool {
        matches!(self, PdfOutcome::Attached(_))
    }
}

/// Resolve harvested DOIs, upload the new ones, and attach PDFs.
///
/// Pass `fetcher: None` to skip the PDF stage entirely.
pub async fn resolve_and_upload(
    zotero: Arc<ZoteroClient>,
    fetcher: Option<PdfFetcher>,
    http: &reqwest::Client,
    refs: Vec<HarvestedRef>,
    ledger: &mut DedupeLedger,
) -> Result<UploadReport> {
    let template = zotero.item_template("journalArticle").await?;

    let mut tx = None;
    let mut worker = None;
    if let Some(fetcher) = fetcher {
        let (t, r) = mpsc::channel::<PdfJob>(PDF_QUEUE_DEPTH);
        worker = Some(tokio::spawn(pdf_worker_loop(r, fetcher, Arc::clone(&zotero))));
        tx = Some(t);
    }

    let mut report = UploadReport::default();

    for reference in refs {
        let doi = &reference.doi;

        if ledger.contains(doi) {
            debug!(%doi, "Already in the library");
            report.rows.push(row(doi, "", "duplicate", "", ""));
            continue;
        }

        let bibtex_text = match bibtex::fetch_bibtex(http, doi).await {
            Ok(text) => text,
            Err(e) => {
                warn!(%doi, error = %e, "BibTeX negotiation failed");
                report.rows.push(row(doi, "", &format!("failed: {}", e), "", ""));
                continue;
            }
        };

        let record =
            match CitationRecord::build(doi.clone(), &bibtex_text, reference.snippet.clone()) {
                Some(record) => record,
                None => {
                    warn!(%doi, "Resolver answered with unparseable BibTeX");
                    report.rows.push(row(doi, "", "failed: unparseable bibtex", "", ""));
                    continue;
                }
            };
        let title = record.title().unwrap_or("").to_string();

        if let Some(reason) = record.missing_requirement() {
            debug!(%doi, reason, "Record not uploadable");
            report
                .rows
                .push(row(doi, &title, &format!("skipped: {}", reason), "", ""));
            continue;
        }

        let item = record.to_zotero_item(&template);
        let item_key = match zotero.create_items(&[item]).await {
            Ok(keys) => match keys.into_iter().next() {
                Some(key) => key,
                None => {
                    report.rows.push(row(doi, &title, "failed: rejected by library", "", ""));
                    continue;
                }
            },
            Err(e) => {
                warn!(%doi, error = %e, "Item upload failed");
                report.rows.push(row(doi, &title, &format!("failed: {}", e), "", ""));
                continue;
            }
        };

        ledger.insert(doi);
        report.entries.push(record.entry.clone());
        report.uploaded += 1;
        report.rows.push(row(doi, &title, "uploaded", &item_key, ""));

        if let Some(tx) = &tx {
            let job = PdfJob {
                doi: doi.clone(),
                title: record.title().map(String::from),
                item_key,
            };
            if tx.send(job).await.is_err() {
                warn!("PDF worker stopped early");
            }
        }
    }

    // Closing the channel lets the worker drain and exit.
    drop(tx);

    if let Some(worker) = worker {
        let outcomes = worker
            .await
            .map_err(|e| SerpZotError::Config(format!("PDF worker failed: {}", e)))?;
        let by_doi: HashMap<String, PdfOutcome> = outcomes.into_iter().collect();
        for report_row in &mut report.rows {
            if report_row.status != "uploaded" {
                continue;
            }
            if let Some(outcome) = by_doi.get(&report_row.doi) {
                report_row.pdf = outcome.label();
                if outcome.attached() {
                    report.pdfs_attached += 1;
                }
            }
        }
    }

    info!(
        uploaded = report.uploaded,
        pdfs = report.pdfs_attached,
        "Upload stage complete"
    );
    Ok(report)
}

/// Drains PDF jobs until the sender side closes.
async fn pdf_worker_loop(
    mut rx: mpsc::Receiver<PdfJob>,
    fetcher: PdfFetcher,
    zotero: Arc<ZoteroClient>,
) -> Vec<(String, PdfOutcome)> {
    let mut outcomes = Vec::new();

    while let Some(job) = rx.recv().await {
        let outcome = match fetcher.fetch(&job.doi, job.title.as_deref()).await {
            Ok(Some(fetched)) => match zotero.attach_pdf(&job.item_key, &fetched.path).await {
                Ok(_) => PdfOutcome::Attached(fetched.source),
                Err(e) => {
                    warn!(doi = %job.doi, error = %e, "Attachment upload failed");
                    PdfOutcome::AttachFailed
                }
            },
            Ok(None) => PdfOutcome::Missing,
            Err(e) => {
                warn!(doi = %job.doi, error = %e, "PDF retrieval failed");
                PdfOutcome::FetchFailed
            }
        };
        outcomes.push((job.doi.as_str().to_string(), outcome));
    }

    outcomes
}

/// Fetch PDFs for library items that never got one.
///
/// Scans every `journalArticle` without an attachment, resolves its
/// DOI, and runs the same source chain the live pipeline uses.
pub async fn backfill(zotero: &ZoteroClient, fetcher: &PdfFetcher) -> Result<Vec<ReportRow>> {
    let items = zotero.all_items(None).await?;
    let mut rows = Vec::new();

    for item in &items {
        if item.item_type() != Some("journalArticle") || item.has_attachment() {
            continue;
        }
        let title = item.title().unwrap_or("").to_string();

        let Some(doi) = item_doi(item) else {
            debug!(key = %item.key, "Item has no usable identifier");
            rows.push(ReportRow {
                doi: String::new(),
                title,
                status: "skipped: no DOI or URL".to_string(),
                item_key: item.key.clone(),
                pdf: String::new(),
            });
            continue;
        };

        match fetcher.fetch(&doi, item.title()).await {
            Ok(Some(fetched)) => match zotero.attach_pdf(&item.key, &fetched.path).await {
                Ok(_) => rows.push(row(&doi, &title, "attached", &item.key, fetched.source.as_str())),
                Err(e) => {
                    warn!(%doi, error = %e, "Attachment upload failed");
                    rows.push(row(&doi, &title, "failed: attach", &item.key, fetched.source.as_str()));
                }
            },
            Ok(None) => rows.push(row(&doi, &title, "no pdf found", &item.key, "missing")),
            Err(e) => {
                warn!(%doi, error = %e, "PDF retrieval failed");
                rows.push(row(&doi, &title, &format!("failed: {}", e), &item.key, ""));
            }
        }
    }

    info!(candidates = rows.len(), "Backfill pass complete");
    Ok(rows)
}

/// The identifier an item resolves through, DOI field first, then the
/// URL (many older items keep the resolver link there instead).
pub fn item_doi(item: &ZoteroItem) -> Option<Doi> {
    if let Some(raw) = item.doi_field() {
        if let Ok(doi) = Doi::parse(raw) {
            return Some(doi);
        }
    }
    item.url_field()
        .and_then(|u| Doi::parse(u).ok().or_else(|| extract_doi(u)))
}

fn row(doi: &Doi, title: &str, status: &str, item_key: &str, pdf: &str) -> ReportRow {
    ReportRow {
        doi: doi.as_str().to_string(),
        title: title.to_string(),
        status: status.to_string(),
        item_key: item_key.to_string(),
        pdf: pdf.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_toggles_parse_all() {
        let t = SourceToggles::parse("all").unwrap();
        assert!(t.serp && t.arxiv && t.medrxiv && t.biorxiv);
    }

    #[test]
    fn test_source_toggles_parse_subset() {
        let t = SourceToggles::parse("serp,biorxiv").unwrap();
        assert!(t.serp);
        assert!(!t.arxiv);
        assert!(!t.medrxiv);
        assert!(t.biorxiv);
    }

    #[test]
    fn test_source_toggles_rejects_unknown() {
        assert!(SourceToggles::parse("serp,gopher").is_err());
    }

    fn item(data: serde_json::Value) -> ZoteroItem {
        serde_json::from_value(json!({"key": "K1", "version": 1, "data": data})).unwrap()
    }

    #[test]
    fn test_item_doi_prefers_doi_field() {
        let i = item(json!({
            "DOI": "10.1152/physiolgenomics.00029.2020",
            "url": "https://doi.org/10.9999/other"
        }));
        assert_eq!(
            item_doi(&i).unwrap().as_str(),
            "10.1152/physiolgenomics.00029.2020"
        );
    }

    #[test]
    fn test_item_doi_falls_back_to_url() {
        let i = item(json!({"url": "http://dx.doi.org/10.1000/from.url"}));
        assert_eq!(item_doi(&i).unwrap().as_str(), "10.1000/from.url");

        let embedded = item(json!({"url": "https://journals.org/article/10.1000/embedded.1/full"}));
        assert_eq!(item_doi(&embedded).unwrap().as_str(), "10.1000/embedded.1/full");

        let none = item(json!({"url": "https://example.org/no-doi-here"}));
        assert!(item_doi(&none).is_none());
    }

    #[tokio::test]
    async fn test_harvest_merges_sources_and_keeps_snippets() {
        let mut serp_server = mockito::Server::new_async().await;
        let mut feeds_server = mockito::Server::new_async().await;

        let _search = serp_server
            .mock("GET", "/search.json")
            .match_query(mockito::Matcher::UrlEncoded(
                "engine".into(),
                "google_scholar".into(),
            ))
            .with_status(200)
            .with_body(
                r#"{"organic_results": [{
                    "title": "Hypertension and the gut microbiome",
                    "result_id": "RID1",
                    "snippet": "We review evidence that gut flora shape blood pressure."
                }, {
                    "title": "Beta diversity of gut flora",
                    "result_id": "RID2",
                    "snippet": "Second result snippet."
                }]}"#,
            )
            .create_async()
            .await;
        let _cite_one = serp_server
            .mock("GET", "/search.json")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("engine".into(), "google_scholar_cite".into()),
                mockito::Matcher::UrlEncoded("q".into(), "RID1".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"citations": [
                    {"snippet": "Joe, Bina. \"Paper.\" (2020)."},
                    {"snippet": "Joe, B. (2020). Paper. https://doi.org/10.1152/physiolgenomics.00029.2020"}
                ]}"#,
            )
            .create_async()
            .await;
        // No literal DOI in this fragment, so it goes through Crossref.
        let _cite_two = serp_server
            .mock("GET", "/search.json")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("engine".into(), "google_scholar_cite".into()),
                mockito::Matcher::UrlEncoded("q".into(), "RID2".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"citations": [{"snippet": "Smith, J. (2021). Beta diversity of gut flora."}]}"#)
            .create_async()
            .await;
        let _crossref = serp_server
            .mock("GET", "/works")
            .match_query(mockito::Matcher::UrlEncoded("rows".into(), "1".into()))
            .with_status(200)
            .with_body(r#"{"message": {"items": [{"DOI": "10.5555/crossref.hit"}]}}"#)
            .create_async()
            .await;

        let feed = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <entry>
    <id>http://arxiv.org/abs/2001.00001v1</id>
    <title>Microbiome modelling</title>
    <summary>s</summary>
    <arxiv:doi>10.1000/arxiv.paper</arxiv:doi>
  </entry>
</feed>"#;
        let _arxiv = feeds_server
            .mock("GET", "/api/query")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(feed)
            .create_async()
            .await;
        let _preprints = feeds_server
            .mock("GET", mockito::Matcher::Regex("^/search/.*".to_string()))
            .with_status(200)
            .with_body(r#"<a href="https://doi.org/10.1101/2020.05.08.20095687">hit</a>"#)
            .create_async()
            .await;

        let scholar =
            ScholarClient::with_base_url("test-key", format!("{}/search.json", serp_server.url()))
                .unwrap();
        let crossref =
            CrossrefClient::with_base_url(format!("{}/works", serp_server.url())).unwrap();
        let arxiv = ArxivClient::with_base_url(feeds_server.url()).unwrap();
        let preprints = PreprintClient::with_base_url(feeds_server.url()).unwrap();

        let refs = harvest(
            Some(&scholar),
            &crossref,
            &arxiv,
            &preprints,
            "gut microbiome hypertension",
            None,
            20,
            &SourceToggles::default(),
        )
        .await;

        let dois: Vec<&str> = refs.iter().map(|r| r.doi.as_str()).collect();
        assert!(dois.contains(&"10.1152/physiolgenomics.00029.2020"));
        assert!(dois.contains(&"10.5555/crossref.hit"));
        assert!(dois.contains(&"10.1000/arxiv.paper"));
        assert!(dois.contains(&"10.1101/2020.05.08.20095687"));
        // medrxiv and biorxiv served the same page; the DOI appears once
        assert_eq!(dois.len(), 4);

        // Each resolved DOI keeps its own result's snippet, including
        // the one that went through the Crossref fallback.
        let direct = refs
            .iter()
            .find(|r| r.doi.as_str() == "10.1152/physiolgenomics.00029.2020")
            .unwrap();
        assert!(direct.snippet.as_deref().unwrap().contains("gut flora"));
        let via_crossref = refs
            .iter()
            .find(|r| r.doi.as_str() == "10.5555/crossref.hit")
            .unwrap();
        assert_eq!(via_crossref.snippet.as_deref(), Some("Second result snippet."));
        assert!(refs
            .iter()
            .filter(|r| !r.doi.as_str().starts_with("10.1152") && !r.doi.as_str().starts_with("10.5555"))
            .all(|r| r.snippet.is_none()));
    }

    #[tokio::test]
    async fn test_harvest_continues_past_failing_source() {
        let mut server = mockito::Server::new_async().await;
        let _arxiv = server
            .mock("GET", "/api/query")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <entry><id>x</id><title>t</title><summary>s</summary>
    <arxiv:doi>10.1000/only.one</arxiv:doi></entry>
</feed>"#,
            )
            .create_async()
            .await;
        let crossref = CrossrefClient::with_base_url(server.url()).unwrap();
        let arxiv = ArxivClient::with_base_url(server.url()).unwrap();
        let preprints = PreprintClient::with_base_url(server.url()).unwrap();

        // Scholar enabled but unconfigured: it warns and the rest run.
        let toggles = SourceToggles::parse("serp,arxiv").unwrap();
        let refs = harvest(
            None,
            &crossref,
            &arxiv,
            &preprints,
            "anything",
            None,
            20,
            &toggles,
        )
        .await;

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].doi.as_str(), "10.1000/only.one");
    }
}
