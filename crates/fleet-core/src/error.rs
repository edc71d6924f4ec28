//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating `fleet.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a URL cannot be used as a plain HTTP target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("not a valid URI")]
    Malformed,

    #[error("missing scheme")]
    MissingScheme,

    #[error("only http:// endpoints are supported")]
    UnsupportedScheme,

    #[error("missing host")]
    MissingHost,
}
