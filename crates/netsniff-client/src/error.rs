//! Error types

use thiserror::Error;

/// Error returned by a [`Transport`](crate::Transport).
///
/// Transport failures are handed back to the caller untouched; the sniffer
/// only records their `Display` text.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Log store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "db")]
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Header encoding error: {0}")]
    Headers(#[from] serde_json::Error),

    #[error("Log store is closed")]
    Closed,
}

/// Errors surfaced by the sniffing client and its configuration
#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("Body error: {0}")]
    Body(#[from] std::io::Error),

    #[error("Response body is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Failed to decode JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// Raised by caller-supplied decoders
    #[error("Failed to decode body: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SnifferError {
    /// Wrap an error raised while decoding a custom-format body
    pub fn decode(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SnifferError::Decode(error.into())
    }
}
