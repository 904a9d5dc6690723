use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("navigation failed for {sku}: {reason}")]
    Navigation { sku: String, reason: String },

    #[error("thumbnail {index} did not settle within {timeout_ms}ms")]
    ExtractionTimeout { index: usize, timeout_ms: u64 },

    #[error("no gallery images beyond the hero for {sku}")]
    EmptyGallery { sku: String },

    #[error("catalogue persistence failed at {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    #[error("webdriver error: {0}")]
    WebDriver(#[from] WebDriverError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown SKU in catalogue: {0}")]
    UnknownSku(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl HarvestError {
    pub fn persistence(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        HarvestError::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors the runner answers with another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarvestError::Navigation { .. } | HarvestError::EmptyGallery { .. }
        )
    }
}

/// Failures reported by the WebDriver endpoint or the HTTP layer beneath it.
#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("{op} request failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} HTTP {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("{op} {error}: {message}")]
    Protocol {
        op: &'static str,
        error: String,
        message: String,
    },

    #[error("{op} returned an unexpected payload: {body}")]
    Payload { op: &'static str, body: String },

    #[error("endpoint {0} is unreachable")]
    Unreachable(String),
}

pub type Result<T> = std::result::Result<T, HarvestError>;
