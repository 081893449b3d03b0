//! BibTeX retrieval and parsing.
//!
//! DOIs resolve to BibTeX through content negotiation against the DOI
//! resolvers (`Accept: application/x-bibtex`). The parser here covers
//! the negotiated output: one entry, brace or quote delimited values,
//! bare tokens for months and years.

use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::doi::Doi;
use crate::error::{Result, SerpZotError};

/// Primary and fallback resolver hosts. The preprint servers register
/// their DOIs with the second.
const RESOLVER_HOSTS: &[&str] = &["https://dx.doi.org", "https://doi.org"];

/// One parsed BibTeX entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BibEntry {
    /// Entry type (`article`, `misc`, ...), lowercased
    pub entry_type: String,
    /// Cite key
    pub cite_key: String,
    /// Fields in source order, names lowercased
    pub fields: Vec<(String, String)>,
}

impl BibEntry {
    /// First value for a field name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// An author split into name parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub first_name: String,
    pub last_name: String,
}

/// Fetch BibTeX for a DOI via content negotiation.
///
/// Tries `dx.doi.org` first, then `doi.org`; a response that is not a
/// BibTeX entry (error page, empty body) falls through to the next host.
pub async fn fetch_bibtex(client: &reqwest::Client, doi: &Doi) -> Result<String> {
    for host in RESOLVER_HOSTS {
        let url = format!("{}/{}", host, doi.as_str());
        let response = match client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/x-bibtex")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(host, doi = %doi, error = %e, "Resolver request failed");
                continue;
            }
        };

        if !response.status().is_success() {
            debug!(host, doi = %doi, status = %response.status(), "Resolver returned non-success");
            continue;
        }

        match response.text().await {
            Ok(text) if text.trim_start().starts_with('@') => return Ok(text),
            Ok(_) => {
                debug!(host, doi = %doi, "Resolver body is not BibTeX");
            }
            Err(e) => {
                debug!(host, doi = %doi, error = %e, "Failed to read resolver body");
            }
        }
    }

    Err(SerpZotError::Parse(format!("no BibTeX available for {}", doi)))
}

/// Parse the first real entry out of a BibTeX document.
///
/// `@comment`, `@preamble` and `@string` blocks are skipped. Returns
/// `None` when the text holds no well-formed entry.
pub fn parse_entry(text: &str) -> Option<BibEntry> {
    let mut search_from = 0;
    loop {
        let at = text[search_from..].find('@')? + search_from;
        let rest = &text[at + 1..];
        let open = rest.find('{')?;
        let entry_type = rest[..open].trim().to_lowercase();

        let is_entry = !entry_type.is_empty()
            && entry_type.chars().all(|c| c.is_ascii_alphabetic())
            && !matches!(entry_type.as_str(), "comment" | "preamble" | "string");
        if !is_entry {
            search_from = at + 1;
            continue;
        }

        // position just after the opening brace
        return parse_entry_body(text, at + 1 + open + 1, entry_type);
    }
}

/// Cursor-based field scan. All delimiters are ASCII, so byte positions
/// always land on char boundaries even with unicode field values.
fn parse_entry_body(text: &str, mut pos: usize, entry_type: String) -> Option<BibEntry> {
    let bytes = text.as_bytes();

    let key_end = text[pos..].find(',')? + pos;
    let cite_key = text[pos..key_end].trim().to_string();
    pos = key_end + 1;

    let mut fields = Vec::new();
    loop {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b'}' {
            break;
        }

        let Some(eq_off) = text[pos..].find('=') else {
            break;
        };
        let eq = pos + eq_off;
        if text[pos..eq].contains('}') {
            // the entry closed before another field; '=' belongs elsewhere
            break;
        }
        let name = text[pos..eq].trim().to_lowercase();
        pos = eq + 1;

        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let value = match bytes[pos] {
            b'{' => {
                let mut depth = 0usize;
                let mut end = None;
                let mut j = pos;
                while j < bytes.len() {
                    match bytes[j] {
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                    j += 1;
                }
                let end = end?;
                let v = text[pos + 1..end].trim().to_string();
                pos = end + 1;
                v
            }
            b'"' => {
                let end = text[pos + 1..].find('"')? + pos + 1;
                let v = text[pos + 1..end].trim().to_string();
                pos = end + 1;
                v
            }
            _ => {
                let mut j = pos;
                while j < bytes.len() && bytes[j] != b',' && bytes[j] != b'}' && bytes[j] != b'\n'
                {
                    j += 1;
                }
                let v = text[pos..j].trim().to_string();
                pos = j;
                v
            }
        };

        if !name.is_empty() {
            fields.push((name, value));
        }
    }

    Some(BibEntry {
        entry_type,
        cite_key,
        fields,
    })
}

/// Split a BibTeX `author` field into name parts.
///
/// Handles both `Last, First` and `First Last` forms, separated by
/// ` and `. Braces around name groups are stripped.
pub fn parse_authors(field: &str) -> Vec<Author> {
    field
        .split(" and ")
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            let name = name.replace(['{', '}'], "");
            if let Some((last, first)) = name.split_once(',') {
                Author {
                    first_name: first.trim().to_string(),
                    last_name: last.trim().to_string(),
                }
            } else if let Some((first, last)) = name.rsplit_once(' ') {
                Author {
                    first_name: first.trim().to_string(),
                    last_name: last.trim().to_string(),
                }
            } else {
                Author {
                    first_name: String::new(),
                    last_name: name.trim().to_string(),
                }
            }
        })
        .collect()
}

/// Derive the record date from an entry.
///
/// `month` + `year` parse as abbreviated month name + year and render as
/// ISO `YYYY-MM-01`; a year alone is kept as-is; no year means no date.
pub fn entry_date(entry: &BibEntry) -> Option<String> {
    let year = entry.field("year")?.trim();
    if year.is_empty() {
        return None;
    }

    if let Some(month) = entry.field("month") {
        let composed = format!("1 {} {}", month.trim(), year);
        if let Ok(date) = NaiveDate::parse_from_str(&composed, "%d %b %Y") {
            return Some(date.format("%Y-%m-%d").to_string());
        }
        debug!(month, year, "Unparseable month, falling back to year");
    }

    Some(year.to_string())
}

/// Serialize an entry back to BibTeX text.
pub fn format_entry(entry: &BibEntry) -> String {
    let mut out = format!("@{}{{{},\n", entry.entry_type, entry.cite_key);
    for (name, value) in &entry.fields {
        out.push_str(&format!("  {} = {{{}}},\n", name, value));
    }
    out.push_str("}\n");
    out
}

/// Write collected entries to a `.bib` file.
pub fn write_bib_file(path: &Path, entries: &[BibEntry]) -> Result<()> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format_entry(entry));
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Write the running `auto_cite.bib` plus, when requested, a timestamped
/// copy that later runs will not overwrite.
pub fn save_bib_outputs(dir: &Path, entries: &[BibEntry], keep_copy: bool) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    write_bib_file(&dir.join("auto_cite.bib"), entries)?;
    if keep_copy {
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let name = format!("my_bib_{}.bib", ts);
        write_bib_file(&dir.join(name), entries)?;
    }
    Ok(())
}

/// Collect `@comment` blocks, which map onto the record's `extra` field.
pub fn parse_comments(text: &str) -> Vec<String> {
    let mut comments = Vec::new();
    let mut rest = text;
    loop {
        let Some(at) = rest.find('@') else { break };
        let after_at = &rest[at + 1..];
        if !after_at.to_lowercase().starts_with("comment") {
            rest = after_at;
            continue;
        }
        let after = &after_at["comment".len()..];
        let Some(open) = after.find('{') else {
            rest = after;
            continue;
        };
        let bytes = after.as_bytes();
        let mut depth = 0usize;
        let mut end = None;
        let mut j = open;
        while j < bytes.len() {
            match bytes[j] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(j);
                        break;
                    }
                }
                _ => {}
            }
            j += 1;
        }
        let Some(end) = end else {
            warn!("Unterminated @comment block in BibTeX input");
            break;
        };
        comments.push(after[open + 1..end].trim().to_string());
        rest = &after[end..];
    }
    comments
}
