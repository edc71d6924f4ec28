use std::time::Duration;

use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Failure of a single transport delivery.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("building request: {0}")]
    Request(#[from] http::Error),

    #[error("encoding payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("endpoint answered {0}")]
    Status(u16),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}
