//! Bag-of-words title similarity.
//!
//! Used to decide whether an arXiv search hit is actually the paper we
//! are looking for before downloading its PDF. Tokens are `\w+` runs,
//! lowercased, with English stopwords removed; each side then collapses
//! to its unique token set, so the cosine reduces to
//! `|intersection| / (sqrt(|a|) * sqrt(|b|))`.

use std::collections::HashSet;

use regex::Regex;

/// A candidate title matches when its cosine is strictly greater than this.
pub const TITLE_MATCH_THRESHOLD: f64 = 0.85;

/// English stopwords excluded from the token sets.
const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "cannot", "com", "could", "did", "do", "does", "doing", "down", "during", "each",
    "else", "ever", "few", "for", "from", "further", "get", "had", "has", "have", "having", "he",
    "hence", "her", "here", "hers", "herself", "him", "himself", "his", "how", "however", "http",
    "i", "if", "in", "into", "is", "it", "its", "itself", "just", "let", "like", "me", "more",
    "most", "my", "myself", "no", "nor", "not", "of", "off", "on", "once", "only", "or", "other",
    "otherwise", "ought", "our", "ours", "ourselves", "out", "over", "own", "same", "shall", "she",
    "should", "since", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "therefore", "these", "they", "this", "those", "through", "to",
    "too", "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "with", "would", "www", "you", "your", "yours", "yourself",
    "yourselves",
];

/// Unique, lowercased, stopword-filtered tokens of a title.
fn token_set(text: &str) -> HashSet<String> {
    let Ok(word) = Regex::new(r"\w+") else {
        return HashSet::new();
    };
    word.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Cosine similarity between two titles over their unique token sets.
///
/// Returns 0.0 when either side has no tokens left after filtering.
pub fn title_cosine(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count() as f64;
    intersection / ((set_a.len() as f64).sqrt() * (set_b.len() as f64).sqrt())
}

/// Convenience: does `candidate` match `wanted` above the threshold?
pub fn titles_match(wanted: &str, candidate: &str) -> bool {
    title_cosine(wanted, candidate) > TITLE_MATCH_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_titles() {
        let t = "Attention Is All You Need";
        assert!((title_cosine(t, t) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_case_and_stopwords_ignored() {
        let a = "The Structure of Scientific Revolutions";
        let b = "structure of scientific revolutions";
        assert!((title_cosine(a, b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_disjoint_titles() {
        assert_eq!(title_cosine("graph neural networks", "protein folding dynamics"), 0.0);
    }

    #[test]
    fn test_partial_overlap_below_threshold() {
        let a = "deep learning for image segmentation";
        let b = "deep learning for speech recognition";
        let cos = title_cosine(a, b);
        assert!(cos > 0.0 && cos < TITLE_MATCH_THRESHOLD);
        assert!(!titles_match(a, b));
    }

    #[test]
    fn test_empty_side_is_zero() {
        assert_eq!(title_cosine("", "anything"), 0.0);
        assert_eq!(title_cosine("the of and", "anything"), 0.0);
    }

    #[test]
    fn test_match_survives_subtitle_noise() {
        let a = "Generative adversarial networks";
        let b = "Generative Adversarial Networks";
        assert!(titles_match(a, b));
    }
}
