//! Transport seam between the DICOMweb client and an HTTP implementation.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::future::Future;

use crate::error::HttpClientError;

/// A fully built request, ready to hand to a transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: Method,
    /// Absolute URL including the encoded query string.
    pub url: String,
    /// Request headers, including authorization.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<Bytes>,
}

/// A response whose body has been read to completion.
#[derive(Debug)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body bytes.
    pub body: Bytes,
}

/// A pluggable HTTP transport.
///
/// Implementations only move bytes. Status interpretation, retries and authorization all live in
/// [`DicomWebClient`](crate::DicomWebClient), so a test transport can be a simple script.
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request and read the full response.
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, HttpClientError>> + Send;
}
