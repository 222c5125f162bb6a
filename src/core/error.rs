//! Error types for the texture fetcher

use thiserror::Error;

/// Main error type for the fetcher
///
/// Individual fetch requests never fail through this type; their outcome is
/// reported through the finished/discard-level contract of the dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Fetch error: {0}")]
    Fetch(String),
}
