//! Duplicate detection against the existing library.
//!
//! The ledger holds one normalized identifier per item already in the
//! library, so a harvested DOI can be checked before any network work
//! is spent on it.

use std::collections::HashSet;

use tracing::debug;

use crate::doi::Doi;
use crate::zotero::ZoteroItem;

/// Set of identifiers already present in the library.
///
/// DOIs are normalized through [`Doi::parse`] so that resolver URLs,
/// `doi:` prefixes, and case differences all collapse to the same
/// entry. Items without a DOI fall back to their URL, kept verbatim.
#[derive(Debug, Default)]
pub struct DedupeLedger {
    seen: HashSet<String>,
}

impl DedupeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the ledger from a library scan.
    pub fn from_items(items: &[ZoteroItem]) -> Self {
        let mut ledger = Self::new();
        for item in items {
            if let Some(id) = Self::identifier(item) {
                ledger.seen.insert(id);
            }
        }
        debug!(entries = ledger.seen.len(), "Dedupe ledger built");
        ledger
    }

    /// The identifier an item contributes, if any.
    fn identifier(item: &ZoteroItem) -> Option<String> {
        if let Some(raw) = item.doi_field() {
            if let Ok(doi) = Doi::parse(raw) {
                return Some(doi.as_str().to_string());
            }
        }
        item.url_field().map(|u| u.to_string())
    }

    pub fn contains(&self, doi: &Doi) -> bool {
        self.seen.contains(doi.as_str())
    }

    /// Record a DOI after its item has been uploaded.
    pub fn insert(&mut self, doi: &Doi) -> bool {
        self.seen.insert(doi.as_str().to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(data: serde_json::Value) -> ZoteroItem {
        serde_json::from_value(json!({"key": "K1", "version": 1, "data": data})).unwrap()
    }

    #[test]
    fn test_doi_normalization_collapses_variants() {
        let items = vec![item(json!({"DOI": "https://doi.org/10.1234/ABC.5"}))];
        let ledger = DedupeLedger::from_items(&items);

        let same = Doi::parse("10.1234/abc.5").unwrap();
        assert!(ledger.contains(&same));
    }

    #[test]
    fn test_url_fallback_when_doi_missing() {
        let items = vec![item(json!({"url": "https://example.org/paper"}))];
        let ledger = DedupeLedger::from_items(&items);
        assert_eq!(ledger.len(), 1);

        let unrelated = Doi::parse("10.9999/nope").unwrap();
        assert!(!ledger.contains(&unrelated));
    }

    #[test]
    fn test_insert_reports_novelty() {
        let mut ledger = DedupeLedger::new();
        let doi = Doi::parse("10.1152/physiolgenomics.00029.2020").unwrap();

        assert!(ledger.insert(&doi));
        assert!(!ledger.insert(&doi));
        assert!(ledger.contains(&doi));
    }

    #[test]
    fn test_items_without_identifiers_are_skipped() {
        let items = vec![item(json!({"itemType": "note"}))];
        let ledger = DedupeLedger::from_items(&items);
        assert!(ledger.is_empty());
    }
}
