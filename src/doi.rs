//! DOI normalization and free-text extraction.
//!
//! Every identifier that enters the pipeline (from citation snippets,
//! Crossref, arXiv feeds, or preprint search pages) is funneled through
//! [`Doi::parse`] so that dedupe keys, download filenames, and resolver
//! URLs all agree on one canonical form.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SerpZotError};

/// A normalized DOI (lowercased, prefix-stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Doi(String);

impl Doi {
    /// Parse a DOI from user or API input.
    ///
    /// Accepts bare DOIs as well as `https://doi.org/...`,
    /// `http://dx.doi.org/...` and `doi:` prefixed forms. The remainder
    /// must start with `10.` and carry a non-empty suffix after the
    /// first `/`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();

        let stripped = input
            .strip_prefix("https://doi.org/")
            .or_else(|| input.strip_prefix("http://doi.org/"))
            .or_else(|| input.strip_prefix("https://dx.doi.org/"))
            .or_else(|| input.strip_prefix("http://dx.doi.org/"))
            .or_else(|| input.strip_prefix("doi:").map(str::trim_start))
            .or_else(|| input.strip_prefix("DOI:").map(str::trim_start))
            .unwrap_or(input);

        if !stripped.starts_with("10.") {
            return Err(SerpZotError::Validation(format!("not a DOI: {input}")));
        }
        let slash = stripped
            .find('/')
            .ok_or_else(|| SerpZotError::Validation(format!("not a DOI: {input}")))?;
        if stripped[slash + 1..].is_empty() {
            return Err(SerpZotError::Validation(format!("DOI missing suffix: {input}")));
        }

        Ok(Self(stripped.to_lowercase()))
    }

    /// The normalized DOI string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolver URL form (`https://doi.org/...`).
    pub fn url(&self) -> String {
        format!("https://doi.org/{}", self.0)
    }

    /// Filesystem-safe stem (`/` replaced with `_`), used for PDF names.
    pub fn file_stem(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl std::fmt::Display for Doi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Find the first DOI embedded in free text (citation snippets, HTML).
///
/// The trailing `\b` keeps sentence-ending punctuation out of the match,
/// so "doi.org/10.1000/xyz." yields `10.1000/xyz`.
pub fn extract_doi(text: &str) -> Option<Doi> {
    let re = RegexBuilder::new(r"\b10\.\d{4,9}/[-._;()/:a-z0-9]+\b")
        .case_insensitive(true)
        .build()
        .ok()?;
    let m = re.find(text)?;
    Doi::parse(m.as_str()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare() {
        let doi = Doi::parse("10.1000/xyz123").unwrap();
        assert_eq!(doi.as_str(), "10.1000/xyz123");
        assert_eq!(doi.url(), "https://doi.org/10.1000/xyz123");
    }

    #[test]
    fn test_parse_strips_resolver_prefixes() {
        for input in [
            "https://doi.org/10.1000/xyz123",
            "http://dx.doi.org/10.1000/xyz123",
            "doi:10.1000/xyz123",
            "DOI: 10.1000/xyz123",
        ] {
            assert_eq!(Doi::parse(input).unwrap().as_str(), "10.1000/xyz123");
        }
    }

    #[test]
    fn test_parse_lowercases() {
        let doi = Doi::parse("10.1101/2024.03.17.583882V1").unwrap();
        assert_eq!(doi.as_str(), "10.1101/2024.03.17.583882v1");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(Doi::parse("not-a-doi").is_err());
        assert!(Doi::parse("10.1000").is_err());
        assert!(Doi::parse("10.1000/").is_err());
        assert!(Doi::parse("").is_err());
    }

    #[test]
    fn test_file_stem() {
        let doi = Doi::parse("10.1152/physiolgenomics.00029.2020").unwrap();
        assert_eq!(doi.file_stem(), "10.1152_physiolgenomics.00029.2020");
    }

    #[test]
    fn test_extract_from_snippet() {
        let snippet = "Joe, B., & Cheng, X. (2020). Physiological Genomics, 52(4). \
                       https://doi.org/10.1152/physiolgenomics.00029.2020.";
        let doi = extract_doi(snippet).unwrap();
        assert_eq!(doi.as_str(), "10.1152/physiolgenomics.00029.2020");
    }

    #[test]
    fn test_extract_trims_trailing_period() {
        let doi = extract_doi("see 10.1000/xyz.").unwrap();
        assert_eq!(doi.as_str(), "10.1000/xyz");
    }

    #[test]
    fn test_extract_none_without_doi() {
        assert!(extract_doi("Smith, J. (2019). A paper without identifiers.").is_none());
    }
}
