//! Error types for the DICOMweb client.

use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

/// Failures raised by an [`HttpClient`](crate::HttpClient) before a response was received.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request did not complete within the transport's timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established or broke mid-flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Failures raised while acquiring a bearer token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The key file could not be read.
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        /// The key file that was read.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The key file was readable but held no usable token.
    #[error("key file {0} does not contain an access token")]
    MissingToken(PathBuf),

    /// No credential source was configured.
    #[error("no credential configured")]
    NoCredential,
}

/// Errors returned by [`DicomWebClient`](crate::DicomWebClient) operations.
///
/// The first five variants are the classification every caller cares about. Only
/// [`Transient`](Self::Transient) is retried.
#[derive(Debug, Error)]
pub enum DicomWebError {
    /// The store rejected the credential (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The credential is valid but lacks permission (HTTP 403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource does not exist (HTTP 404 or 410).
    #[error("not found: {0}")]
    NotFound(String),

    /// A failure worth retrying: timeouts, broken connections, 408, 429 and 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Anything else the store answered with.
    #[error("unexpected response: {0}")]
    Unknown(String),

    /// The token provider failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The store answered 2xx with a body that is not valid DICOM JSON.
    #[error("malformed DICOM JSON response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DicomWebError {
    /// Classify a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let detail = summarize_body(status, body);
        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized(detail),
            StatusCode::FORBIDDEN => Self::Forbidden(detail),
            StatusCode::NOT_FOUND | StatusCode::GONE => Self::NotFound(detail),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Self::Transient(detail),
            s if s.is_server_error() => Self::Transient(detail),
            _ => Self::Unknown(detail),
        }
    }

    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<HttpClientError> for DicomWebError {
    fn from(err: HttpClientError) -> Self {
        match err {
            HttpClientError::Timeout => Self::Transient("request timed out".to_owned()),
            HttpClientError::Connection(msg) => Self::Transient(msg),
            HttpClientError::Other(e) => Self::Unknown(e.to_string()),
        }
    }
}

/// Keep error messages short: the store sometimes answers with whole HTML pages.
fn summarize_body(status: StatusCode, body: &[u8]) -> String {
    const MAX_DETAIL: usize = 256;

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return status.to_string();
    }
    let mut end = text.len().min(MAX_DETAIL);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{status}: {}", &text[..end])
}
