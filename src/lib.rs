//! # serpzot
//!
//! Scholar-to-Zotero Literature Pipeline
//!
//! ## Modules
//!
//! - [`scholar`] - Google Scholar search via SerpAPI
//! - [`crossref`] - Crossref citation-to-DOI resolution
//! - [`bibtex`] - doi.org content negotiation and BibTeX parsing
//! - [`zotero`] - Zotero Web API client (items, templates, file uploads)
//! - [`arxiv`], [`preprints`], [`scihub`], [`pdf`] - full-text retrieval
//! - [`pipeline`] - harvest/upload orchestration
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use serpzot::doi::Doi;
//! use serpzot::bibtex;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let http = reqwest::Client::new();
//!     let doi = Doi::parse("10.1152/physiolgenomics.00029.2020")?;
//!     let entry = bibtex::fetch_bibtex(&http, &doi).await?;
//!     println!("{}", entry);
//!     Ok(())
//! }
//! ```

pub mod arxiv;
pub mod bibtex;
pub mod cleanup;
pub mod crossref;
pub mod dedupe;
pub mod doi;
pub mod error;
pub mod pdf;
pub mod pipeline;
pub mod preprints;
pub mod record;
pub mod scholar;
pub mod scihub;
pub mod similarity;
pub mod zotero;

pub use error::{Result, SerpZotError};
