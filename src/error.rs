//! Custom error types for serpzot.
//!
//! This module defines all error types used throughout the application.
//! All functions return `Result<T, SerpZotError>` instead of using `unwrap()`.

use thiserror::Error;

/// Main error type for serpzot operations.
///
/// Uses `thiserror` for ergonomic error handling and automatic `Display` implementation.
#[derive(Debug, Error)]
pub enum SerpZotError {
    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response parsing error (JSON shape, HTML page, BibTeX text)
    #[error("Parse error: {0}")]
    Parse(String),

    /// XML deserialization error (arXiv Atom feed)
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// Rate limited by external API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// External API returned an error
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code from API
        code: i32,
        /// Error message from API
        message: String,
    },

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias using `SerpZotError`
pub type Result<T> = std::result::Result<T, SerpZotError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a parse error message
    fn ok_or_parse(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_parse(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| SerpZotError::Parse(msg.to_string()))
    }
}
