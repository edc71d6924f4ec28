//! Plain `http://host[:port]/path` targets shared by health probes and
//! webhook transports.

use crate::error::UrlError;

/// A parsed HTTP URL split into the socket address to dial and the
/// request target to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub url: String,
    /// `host:port`, port 80 when the URL names none.
    pub address: String,
    /// Path and query, `/` when empty.
    pub path: String,
}

impl HttpTarget {
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let uri: http::Uri = url.parse().map_err(|_| UrlError::Malformed)?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(_) => return Err(UrlError::UnsupportedScheme),
            None => return Err(UrlError::MissingScheme),
        }
        let authority = uri.authority().ok_or(UrlError::MissingHost)?;
        let port = authority.port_u16().unwrap_or(80);
        Ok(Self {
            url: url.to_string(),
            address: format!("{}:{port}", authority.host()),
            path: uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        })
    }
}
