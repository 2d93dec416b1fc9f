//! HTTP collector error types

use cloudledger::LedgerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpCollectorError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API returned {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Undecodable page from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Item without '{field}' in page from {url}")]
    MissingId { field: String, url: String },

    #[error("Pagination did not advance at {url}")]
    Pagination { url: String },

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HttpCollectorError {
    /// Network trouble, timeouts, throttling and server errors
    pub fn is_transient(&self) -> bool {
        match self {
            HttpCollectorError::Request(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            HttpCollectorError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<HttpCollectorError> for LedgerError {
    fn from(e: HttpCollectorError) -> Self {
        if e.is_transient() {
            LedgerError::Transient(e.to_string())
        } else {
            LedgerError::Permanent(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpCollectorError>;
