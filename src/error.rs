//! Error types. Only constructors surface these; tracking entry points log and contain them.

use thiserror::Error;

/// Failure of a persistent or browsing-context-scoped key/value store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to hand a batch to the collector. The batch is requeued by the tracker.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error {0}")]
    Status(u16),

    #[error("serializing batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Invalid tracker or transport configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tracking endpoint is required")]
    MissingEndpoint,

    #[error("invalid tracking endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Selector outside the supported subset (`tag`, `#id`, `.class`, `[attr]`, `[attr="v"]`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unsupported selector {selector:?} at {found:?}")]
    Unsupported { selector: String, found: char },

    #[error("unclosed attribute selector in {0:?}")]
    UnclosedAttribute(String),
}
