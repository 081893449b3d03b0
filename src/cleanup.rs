//! LaTeX artifact cleanup for library fields.
//!
//! Crossref-sourced BibTeX drags `\textbackslash`, stray math-mode
//! delimiters, and brace-wrapped accent macros into Zotero titles and
//! abstracts. [`clean_text`] applies a fixed replacement table;
//! [`clean_library`] rewrites one field across the whole library.

use tracing::{debug, info};

use crate::error::Result;
use crate::zotero::ZoteroClient;

/// Ordered replacement table. Specific macros run before the generic
/// brace strip at the end, and `\textdollar` is restored only after the
/// `$` delimiters are gone.
const REPLACEMENTS: &[(&str, &str)] = &[
    (r"$\less", ""),
    (r"$\greater", ""),
    ("$scp", ""),
    ("/scp", ""),
    (r"$\sim$", "~"),
    ("$$", ""),
    ("$", ""),
    (r"\textdollar", "$"),
    (r"\textbackslashsqrt", ""),
    (r"\textbackslash", ""),
    (r"\upkappa", "k"),
    (r"\upalpha", "α"),
    (r"\mathplus", "+"),
    (r"\mathsemicolon", ";"),
    (r"\mathcolon", ":"),
    (r"\textquotedblleft", "\""),
    (r"\textquotedblright", "\""),
    (r"{\textquotesingle}", "'"),
    (r"\textquotesingle", "'"),
    (r"\textendash", "-"),
    (r"\textemdash", "-"),
    (r"\textregistered", "®"),
    (r"\lbraces", ""),
    (r"\lbrace=", ""),
    (r"\rbrace=", ""),
    (r"\rbrace", ""),
    (r"\&amp", "&"),
    (r"\#", ":"),
    ("#1I/`", "'"),
    ("1I/", "'"),
    (r"{\'{a}}", "a"),
    (r"{\'{e}}", "e"),
    (r"{\'{i}}", "i"),
    (r"{\'{o}}", "o"),
    ("{\\\u{2019}{a}}", "a"),
    ("{\\\u{2019}{e}}", "e"),
    ("{\\\u{2019}{i}}", "i"),
    ("{\\\u{2019}{o}}", "o"),
    ("{", ""),
    ("}", ""),
];

/// Apply the replacement table to one field value.
pub fn clean_text(text: &str) -> String {
    let mut out = text.to_string();
    for (from, to) in REPLACEMENTS {
        if out.contains(from) {
            out = out.replace(from, to);
        }
    }
    out
}

/// Rewrite `field` across the library, pushing back only items that
/// actually changed. Returns the number of items updated.
pub async fn clean_library(zot: &ZoteroClient, field: &str, query: Option<&str>) -> Result<usize> {
    let mut items = zot.all_items(query).await?;
    info!(count = items.len(), field, "scanning library fields for LaTeX artifacts");

    let mut changed = Vec::new();
    for item in items.iter_mut() {
        let Some(value) = item.data.get(field).and_then(|v| v.as_str()) else {
            continue;
        };
        let cleaned = clean_text(value);
        if cleaned != value {
            debug!(key = %item.key, "field cleaned");
            item.data[field] = serde_json::Value::String(cleaned);
            changed.push(item.clone());
        }
    }

    if !changed.is_empty() {
        zot.update_items(&changed).await?;
    }
    Ok(changed.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_braces() {
        assert_eq!(clean_text("{Deep} {Learning}"), "Deep Learning");
    }

    #[test]
    fn test_restores_textdollar_after_math_strip() {
        assert_eq!(clean_text(r"costs \textdollar 5"), "costs $ 5");
        assert_eq!(clean_text("inline $x$ math"), "inline x math");
    }

    #[test]
    fn test_quote_macros() {
        assert_eq!(
            clean_text(r"{\textquotesingle}tis \textquotedblleft fine\textquotedblright"),
            "'tis \"fine\""
        );
    }

    #[test]
    fn test_accent_groups_unwrapped() {
        assert_eq!(clean_text(r"Garc{\'{i}}a"), "Garcia");
    }

    #[test]
    fn test_dashes_and_symbols() {
        assert_eq!(clean_text(r"pre\textendash print \mathplus more"), "pre-print + more");
        assert_eq!(clean_text(r"\upalpha-synuclein"), "α-synuclein");
    }

    #[test]
    fn test_clean_text_idempotent_on_plain_input() {
        let plain = "A perfectly ordinary title";
        assert_eq!(clean_text(plain), plain);
    }
}
