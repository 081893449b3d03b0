//! serpzot - Scholar-to-Zotero Literature Pipeline
//!
//! Harvests DOIs for a set of search terms (Google Scholar via SerpAPI,
//! arXiv, medRxiv, bioRxiv), resolves them to BibTeX through doi.org
//! content negotiation, uploads the records that are new to a Zotero
//! library, and attaches full-text PDFs where a source has one.
//!
//! ## Usage
//!
//! ### CLI Mode
//! ```bash
//! serpzot run "gut microbiome hypertension" --limit 20
//! ```
//!
//! ### HTTP Server Mode
//! ```bash
//! serpzot serve --port 3000
//! ```

use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serpzot::{
    arxiv::ArxivClient,
    bibtex, cleanup,
    crossref::CrossrefClient,
    dedupe::DedupeLedger,
    pdf::PdfFetcher,
    pipeline::{self, SourceToggles},
    preprints::PreprintClient,
    scholar::{ScholarClient, DEFAULT_RESULT_LIMIT},
    zotero::{LibraryType, ZoteroClient},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Scholar-to-Zotero Literature Pipeline
#[derive(Parser)]
#[command(name = "serpzot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest, upload, and attach PDFs for a search query
    Run {
        /// Search terms
        query: String,

        /// Year filter (results from this year onwards)
        #[arg(long)]
        min_year: Option<i32>,

        /// Scholar results to request
        #[arg(long, default_value_t = DEFAULT_RESULT_LIMIT)]
        limit: usize,

        /// Harvest sources: "all" or a comma list (serp,arxiv,medrxiv,biorxiv)
        #[arg(long, default_value = "all")]
        sources: String,

        /// Skip PDF retrieval and attachment
        #[arg(long)]
        no_pdfs: bool,

        /// Keep a timestamped copy of the .bib output
        #[arg(long)]
        save_bib: bool,

        /// Output directory for reports and .bib files
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Directory PDFs are downloaded into
        #[arg(long, default_value = "./pdfs")]
        download_dest: PathBuf,

        /// SerpAPI key (falls back to SERP_API_KEY)
        #[arg(long)]
        serpapi_key: Option<String>,

        /// Zotero library id (falls back to ZOTERO_USER_ID)
        #[arg(long)]
        zotero_id: Option<String>,

        /// Zotero API key (falls back to ZOTERO_API_KEY)
        #[arg(long)]
        zotero_key: Option<String>,

        /// Zotero library kind
        #[arg(long, default_value = "user", value_parser = ["user", "group"])]
        library_type: String,
    },

    /// Fetch PDFs for library items that have none attached
    Backfill {
        /// Directory PDFs are downloaded into
        #[arg(long, default_value = "./pdfs")]
        download_dest: PathBuf,

        /// Output directory for the report
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Zotero library id (falls back to ZOTERO_USER_ID)
        #[arg(long)]
        zotero_id: Option<String>,

        /// Zotero API key (falls back to ZOTERO_API_KEY)
        #[arg(long)]
        zotero_key: Option<String>,

        /// Zotero library kind
        #[arg(long, default_value = "user", value_parser = ["user", "group"])]
        library_type: String,
    },

    /// Strip LaTeX escapes from a text field across the library
    Clean {
        /// Item data field to rewrite
        #[arg(long, default_value = "title")]
        field: String,

        /// Only touch items matching this library search
        #[arg(long)]
        query: Option<String>,

        /// Zotero library id (falls back to ZOTERO_USER_ID)
        #[arg(long)]
        zotero_id: Option<String>,

        /// Zotero API key (falls back to ZOTERO_API_KEY)
        #[arg(long)]
        zotero_key: Option<String>,

        /// Zotero library kind
        #[arg(long, default_value = "user", value_parser = ["user", "group"])]
        library_type: String,
    },

    /// Run as HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Run {
            query,
            min_year,
            limit,
            sources,
            no_pdfs,
            save_bib,
            output,
            download_dest,
            serpapi_key,
            zotero_id,
            zotero_key,
            library_type,
        } => {
            run_pipeline(
                query,
                min_year,
                limit,
                sources,
                no_pdfs,
                save_bib,
                output,
                download_dest,
                serpapi_key,
                zotero_id,
                zotero_key,
                library_type,
            )
            .await
        }
        Commands::Backfill {
            download_dest,
            output,
            zotero_id,
            zotero_key,
            library_type,
        } => run_backfill(download_dest, output, zotero_id, zotero_key, library_type).await,
        Commands::Clean {
            field,
            query,
            zotero_id,
            zotero_key,
            library_type,
        } => run_clean(field, query, zotero_id, zotero_key, library_type).await,
        Commands::Serve { port, host } => run_server(host, port).await,
    }
}

// ============================================================================
// Run Pipeline
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    query: String,
    min_year: Option<i32>,
    limit: usize,
    sources: String,
    no_pdfs: bool,
    save_bib: bool,
    output_dir: PathBuf,
    download_dest: PathBuf,
    serpapi_key: Option<String>,
    zotero_id: Option<String>,
    zotero_key: Option<String>,
    library_type: String,
) -> Result<()> {
    let toggles = SourceToggles::parse(&sources)?;
    let (library_id, api_key) = zotero_credentials(zotero_id, zotero_key)?;
    let library_type = LibraryType::from_flag(&library_type)?;

    let serpapi_key = serpapi_key.or_else(|| std::env::var("SERP_API_KEY").ok());
    let scholar = match &serpapi_key {
        Some(key) => Some(ScholarClient::new(key.clone(), 3)?),
        None => None,
    };

    // Create output folder
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let safe_query: String = query
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect::<String>()
        .trim()
        .replace(' ', "_");
    let output_folder = output_dir.join(format!("{}_{}", timestamp, safe_query));
    std::fs::create_dir_all(&output_folder).context("Failed to create output directory")?;

    println!("Output folder: {}", output_folder.display());

    let zotero = Arc::new(ZoteroClient::new(library_id, api_key, library_type)?);
    let crossref = CrossrefClient::new(3)?;
    let arxiv = ArxivClient::new()?;
    let preprints = PreprintClient::new()?;

    // ===========================================
    // STAGE 1: Library Scan
    // ===========================================
    println!("\n--- Stage 1: Library Scan ---");

    let items = zotero.all_items(None).await?;
    let mut ledger = DedupeLedger::from_items(&items);
    println!(
        "Library holds {} items ({} identifiers for dedupe).",
        items.len(),
        ledger.len()
    );

    // ===========================================
    // STAGE 2: DOI Harvest
    // ===========================================
    println!("\n--- Stage 2: DOI Harvest ---");

    let refs = pipeline::harvest(
        scholar.as_ref(),
        &crossref,
        &arxiv,
        &preprints,
        &query,
        min_year,
        limit,
        &toggles,
    )
    .await;

    if refs.is_empty() {
        println!("No references found for this query.");
        return Ok(());
    }
    println!("Found {} candidate references.", refs.len());

    // ===========================================
    // STAGE 3: Resolve & Upload (PDFs in parallel)
    // ===========================================
    println!("\n--- Stage 3: Resolve & Upload ---");

    let fetcher = if no_pdfs {
        println!("PDF retrieval disabled (--no-pdfs).");
        None
    } else {
        println!("PDF downloads go to: {}", download_dest.display());
        Some(PdfFetcher::new(&download_dest)?)
    };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let report =
        pipeline::resolve_and_upload(Arc::clone(&zotero), fetcher, &http, refs, &mut ledger)
            .await?;

    println!("Uploaded {} new records.", report.uploaded);
    if !no_pdfs {
        println!("Attached {} PDFs.", report.pdfs_attached);
    }

    // ===========================================
    // STAGE 4: Reports & BibTeX Outputs
    // ===========================================
    println!("\n--- Stage 4: Reports ---");

    let report_path = output_folder.join("report.csv");
    save_csv(&report_path, &report.rows)?;

    if !report.entries.is_empty() {
        bibtex::save_bib_outputs(&output_folder, &report.entries, save_bib)?;
        println!(
            "Saved: {:?}",
            output_folder.join("auto_cite.bib")
        );
    }

    println!("\n✓ Pipeline complete. Results in: {}", output_folder.display());
    Ok(())
}

// ============================================================================
// Backfill & Cleanup
// ============================================================================

async fn run_backfill(
    download_dest: PathBuf,
    output_dir: PathBuf,
    zotero_id: Option<String>,
    zotero_key: Option<String>,
    library_type: String,
) -> Result<()> {
    let (library_id, api_key) = zotero_credentials(zotero_id, zotero_key)?;
    let library_type = LibraryType::from_flag(&library_type)?;
    let zotero = ZoteroClient::new(library_id, api_key, library_type)?;
    let fetcher = PdfFetcher::new(&download_dest)?;

    println!("\n--- Backfill: Library PDF Sweep ---");
    println!("PDF downloads go to: {}", download_dest.display());

    let rows = pipeline::backfill(&zotero, &fetcher).await?;
    let attached = rows.iter().filter(|r| r.status == "attached").count();
    println!("Attached {} PDFs across {} candidates.", attached, rows.len());

    std::fs::create_dir_all(&output_dir).context("Failed to create output directory")?;
    let report_path = output_dir.join(format!(
        "backfill_{}.csv",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    save_csv(&report_path, &rows)?;

    println!("\n✓ Backfill complete.");
    Ok(())
}

async fn run_clean(
    field: String,
    query: Option<String>,
    zotero_id: Option<String>,
    zotero_key: Option<String>,
    library_type: String,
) -> Result<()> {
    let (library_id, api_key) = zotero_credentials(zotero_id, zotero_key)?;
    let library_type = LibraryType::from_flag(&library_type)?;
    let zotero = ZoteroClient::new(library_id, api_key, library_type)?;

    println!("\n--- Library Cleanup: '{}' field ---", field);

    let changed = cleanup::clean_library(&zotero, &field, query.as_deref()).await?;
    println!("Rewrote {} items.", changed);

    println!("\n✓ Cleanup complete.");
    Ok(())
}

/// Resolve Zotero credentials from flags or the environment.
fn zotero_credentials(id: Option<String>, key: Option<String>) -> Result<(String, String)> {
    let id = id
        .or_else(|| std::env::var("ZOTERO_USER_ID").ok())
        .context("Zotero library id missing (use --zotero-id or set ZOTERO_USER_ID)")?;
    let key = key
        .or_else(|| std::env::var("ZOTERO_API_KEY").ok())
        .context("Zotero API key missing (use --zotero-key or set ZOTERO_API_KEY)")?;
    Ok((id, key))
}

/// Save data to CSV file
fn save_csv<T: Serialize>(path: &std::path::Path, data: &[T]) -> Result<()> {
    if data.is_empty() {
        println!("No data to save to {:?}", path);
        return Ok(());
    }

    let mut wtr = csv::WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .context("Failed to create CSV writer")?;

    for item in data {
        wtr.serialize(item).context("Failed to write CSV record")?;
    }

    wtr.flush().context("Failed to flush CSV")?;
    println!("Saved: {:?}", path);
    Ok(())
}

// ============================================================================
// HTTP Server
// ============================================================================

async fn run_server(host: String, port: u16) -> Result<()> {
    info!(host = %host, port = port, "Starting HTTP server");
    println!("Starting server at http://{}:{}", host, port);

    let scholar = match std::env::var("SERP_API_KEY") {
        Ok(key) => Some(ScholarClient::new(key, 3)?),
        Err(_) => {
            println!("SERP_API_KEY not set; /search will skip the Scholar source.");
            None
        }
    };

    let app_state = Arc::new(AppState {
        scholar,
        crossref: CrossrefClient::new(3)?,
        arxiv: ArxivClient::new()?,
        preprints: PreprintClient::new()?,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/search", post(search_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid host:port")?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

struct AppState {
    scholar: Option<ScholarClient>,
    crossref: CrossrefClient,
    arxiv: ArxivClient,
    preprints: PreprintClient,
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Search request body
#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    min_year: Option<i32>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_sources")]
    sources: String,
}

fn default_limit() -> usize {
    DEFAULT_RESULT_LIMIT
}

fn default_sources() -> String {
    "all".to_string()
}

/// One resolved reference
#[derive(Debug, Serialize)]
struct SearchHit {
    doi: String,
    snippet: Option<String>,
}

/// Search response
#[derive(Debug, Serialize)]
struct SearchResponse {
    status: String,
    count: usize,
    results: Vec<SearchHit>,
}

/// Harvest endpoint handler: resolves DOIs but does not touch Zotero.
async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Json<SearchResponse> {
    info!(query = %req.query, sources = %req.sources, "Search request");

    let toggles = match SourceToggles::parse(&req.sources) {
        Ok(t) => t,
        Err(e) => {
            return Json(SearchResponse {
                status: format!("error: {}", e),
                count: 0,
                results: vec![],
            })
        }
    };

    let refs = pipeline::harvest(
        state.scholar.as_ref(),
        &state.crossref,
        &state.arxiv,
        &state.preprints,
        &req.query,
        req.min_year,
        req.limit,
        &toggles,
    )
    .await;

    let results: Vec<SearchHit> = refs
        .into_iter()
        .map(|r| SearchHit {
            doi: r.doi.as_str().to_string(),
            snippet: r.snippet,
        })
        .collect();

    Json(SearchResponse {
        status: "success".to_string(),
        count: results.len(),
        results,
    })
}
