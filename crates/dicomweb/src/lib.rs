//! Async client for DICOMweb stores.
//!
//! Covers the subset of the standard a filesystem bridge needs: QIDO-RS search at the study,
//! series and instance levels, WADO-RS retrieval of whole instances, STOW-RS storage and resource
//! deletion. Transport is pluggable through [`HttpClient`]; credentials come from a
//! [`TokenProvider`].

pub mod auth;
mod backends;
mod client;
pub mod error;
mod http_client;
pub mod models;
mod pagination;
pub mod retry;

pub use auth::{Credentials, KeyFileTokenProvider, StaticTokenProvider, TokenProvider};
#[cfg(feature = "reqwest-client")]
pub use backends::ReqwestClient;
pub use client::{ClientConfig, DicomWebClient};
pub use error::{AuthError, DicomWebError, HttpClientError};
pub use http_client::{HttpClient, HttpRequest, HttpResponse};
pub use models::{DicomObject, InstanceUid};
pub use pagination::QidoPager;
pub use retry::RetrySettings;
