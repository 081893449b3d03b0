//! Citation record assembly.
//!
//! Joins a resolved DOI, its negotiated BibTeX entry, and the search
//! snippet it was paired with into the item JSON the Zotero API accepts.

use serde_json::{json, Value};

use crate::bibtex::{self, Author, BibEntry};
use crate::doi::Doi;

/// A fully resolved citation, ready for upload.
#[derive(Debug, Clone)]
pub struct CitationRecord {
    pub doi: Doi,
    pub entry: BibEntry,
    /// The search snippet belonging to this result (becomes abstractNote)
    pub abstract_text: Option<String>,
    pub authors: Vec<Author>,
    /// ISO date, or bare year, when the entry carries one
    pub date: Option<String>,
    /// `@comment` blocks from the BibTeX source
    pub comments: Vec<String>,
}

impl CitationRecord {
    /// Build a record from raw BibTeX text.
    ///
    /// Returns `None` when the text holds no parseable entry.
    pub fn build(doi: Doi, bibtex_text: &str, abstract_text: Option<String>) -> Option<Self> {
        let entry = bibtex::parse_entry(bibtex_text)?;
        let authors = entry
            .field("author")
            .map(bibtex::parse_authors)
            .unwrap_or_default();
        let date = bibtex::entry_date(&entry);
        let comments = bibtex::parse_comments(bibtex_text);

        Some(Self {
            doi,
            entry,
            abstract_text,
            authors,
            date,
            comments,
        })
    }

    pub fn title(&self) -> Option<&str> {
        self.entry.field("title")
    }

    /// Which upload requirement is missing, if any.
    ///
    /// Records without a date, authors, or a title are not uploaded
    /// (duplicate checks happen against the ledger in the pipeline).
    pub fn missing_requirement(&self) -> Option<&'static str> {
        if self.date.is_none() {
            return Some("no publication date");
        }
        if self.authors.is_empty() {
            return Some("no authors");
        }
        if self.title().map(str::trim).filter(|t| !t.is_empty()).is_none() {
            return Some("no title");
        }
        None
    }

    /// Fill a `journalArticle` item template with this record's data.
    ///
    /// Fields absent from the entry leave the template's defaults alone.
    pub fn to_zotero_item(&self, template: &Value) -> Value {
        let mut item = template.clone();
        let Some(map) = item.as_object_mut() else {
            return item;
        };

        let mut set = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                map.insert(key.to_string(), Value::String(v));
            }
        };

        set("publicationTitle", self.entry.field("journal").map(String::from));
        set("title", self.title().map(String::from));
        set("DOI", Some(self.doi.as_str().to_string()));
        set("accessDate", Some(chrono::Local::now().format("%Y-%m-%d").to_string()));
        set("url", self.entry.field("url").map(String::from));
        set("volume", self.entry.field("volume").map(String::from));
        set("issue", self.entry.field("number").map(String::from));
        set("abstractNote", self.abstract_text.clone());
        set("date", self.date.clone());
        if !self.comments.is_empty() {
            set("extra", Some(self.comments.join("; ")));
        }

        let creators: Vec<Value> = self
            .authors
            .iter()
            .map(|a| {
                json!({
                    "creatorType": "author",
                    "firstName": a.first_name,
                    "lastName": a.last_name,
                })
            })
            .collect();
        map.insert("creators".to_string(), Value::Array(creators));

        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"@article{Joe_2020,
  doi = {10.1152/physiolgenomics.00029.2020},
  url = {https://doi.org/10.1152/physiolgenomics.00029.2020},
  year = 2020,
  month = apr,
  volume = {52},
  number = {4},
  author = {Bina Joe and Xi Cheng},
  title = {Hypertension and the gut microbiome},
  journal = {Physiological Genomics}
}"#;

    fn sample_record() -> CitationRecord {
        let doi = Doi::parse("10.1152/physiolgenomics.00029.2020").unwrap();
        CitationRecord::build(doi, SAMPLE, Some("We review evidence that...".to_string()))
            .unwrap()
    }

    fn journal_article_template() -> Value {
        json!({
            "itemType": "journalArticle",
            "title": "",
            "creators": [],
            "abstractNote": "",
            "publicationTitle": "",
            "volume": "",
            "issue": "",
            "date": "",
            "DOI": "",
            "url": "",
            "accessDate": "",
            "extra": ""
        })
    }

    #[test]
    fn test_build_extracts_parts() {
        let record = sample_record();
        assert_eq!(record.title(), Some("Hypertension and the gut microbiome"));
        assert_eq!(record.authors.len(), 2);
        assert_eq!(record.date.as_deref(), Some("2020-04-01"));
        assert!(record.missing_requirement().is_none());
    }

    #[test]
    fn test_build_rejects_non_bibtex() {
        let doi = Doi::parse("10.1000/xyz").unwrap();
        assert!(CitationRecord::build(doi, "<html>resolver error</html>", None).is_none());
    }

    #[test]
    fn test_missing_requirements() {
        let doi = Doi::parse("10.1000/xyz").unwrap();
        let no_date = CitationRecord::build(doi.clone(), "@article{k, title = {T}, author = {A B}}", None)
            .unwrap();
        assert_eq!(no_date.missing_requirement(), Some("no publication date"));

        let no_authors =
            CitationRecord::build(doi.clone(), "@article{k, title = {T}, year = {2020}}", None)
                .unwrap();
        assert_eq!(no_authors.missing_requirement(), Some("no authors"));

        let no_title =
            CitationRecord::build(doi, "@article{k, year = {2020}, author = {A B}}", None).unwrap();
        assert_eq!(no_title.missing_requirement(), Some("no title"));
    }

    #[test]
    fn test_to_zotero_item_mapping() {
        let record = sample_record();
        let item = record.to_zotero_item(&journal_article_template());

        assert_eq!(item["itemType"], "journalArticle");
        assert_eq!(item["title"], "Hypertension and the gut microbiome");
        assert_eq!(item["publicationTitle"], "Physiological Genomics");
        assert_eq!(item["DOI"], "10.1152/physiolgenomics.00029.2020");
        assert_eq!(item["volume"], "52");
        assert_eq!(item["issue"], "4");
        assert_eq!(item["date"], "2020-04-01");
        assert_eq!(item["abstractNote"], "We review evidence that...");

        let creators = item["creators"].as_array().unwrap();
        assert_eq!(creators.len(), 2);
        assert_eq!(creators[0]["creatorType"], "author");
        assert_eq!(creators[0]["firstName"], "Bina");
        assert_eq!(creators[0]["lastName"], "Joe");
    }

    #[test]
    fn test_template_defaults_survive_missing_fields() {
        let doi = Doi::parse("10.1000/xyz").unwrap();
        let record = CitationRecord::build(
            doi,
            "@article{k, title = {T}, year = {2020}, author = {A B}}",
            None,
        )
        .unwrap();
        let item = record.to_zotero_item(&journal_article_template());

        // no journal/volume in the entry, template defaults stay
        assert_eq!(item["publicationTitle"], "");
        assert_eq!(item["volume"], "");
        // no snippet paired, abstract untouched
        assert_eq!(item["abstractNote"], "");
    }
}
