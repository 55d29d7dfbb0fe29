//! The seam between the filesystem core and the remote store.
//!
//! The core only ever talks to a [`RemoteStore`]. [`DicomWebStore`] is the production
//! implementation; tests substitute scripted stores.

mod dicomweb_store;

pub use dicomweb_store::DicomWebStore;

use std::future::Future;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

use crate::path::{InstanceId, VirtualPath};

/// Whether a remote resource is exposed as a directory or a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A study or series.
    Directory,
    /// An instance.
    File,
}

/// What the remote store knows about one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAttributes {
    /// Directory or file.
    pub kind: EntryKind,
    /// Object size, when the store reports one.
    pub size: Option<u64>,
    /// Last modification, when the store reports one.
    pub modified: Option<SystemTime>,
}

impl RemoteAttributes {
    /// Attributes of a resource the store only confirmed the existence of.
    #[must_use]
    pub fn bare(kind: EntryKind) -> Self {
        Self {
            kind,
            size: None,
            modified: None,
        }
    }
}

/// Failures of a remote call. Only [`Transient`](Self::Transient) is retried, and that happens
/// inside the store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The credential was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The credential lacks permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource or its parent does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure or server error, after retries ran out.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Anything else.
    #[error("remote error: {0}")]
    Unknown(String),
}

impl RemoteError {
    /// The errno the kernel should see for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Unauthorized(_) | Self::Forbidden(_) => libc::EACCES,
            Self::NotFound(_) => libc::ENOENT,
            Self::Transient(_) | Self::Unknown(_) => libc::EIO,
        }
    }
}

impl From<RemoteError> for std::io::Error {
    fn from(err: RemoteError) -> Self {
        Self::from_raw_os_error(err.errno())
    }
}

/// Typed operations against the remote hierarchy.
pub trait RemoteStore: Send + Sync + 'static {
    /// Names of the entries directly inside a directory, in the store's order. Instances are
    /// named `{uid}.dcm`.
    fn list_children(
        &self,
        path: &VirtualPath,
    ) -> impl Future<Output = Result<Vec<String>, RemoteError>> + Send;

    /// Attributes of one resource.
    fn get_attributes(
        &self,
        path: &VirtualPath,
    ) -> impl Future<Output = Result<RemoteAttributes, RemoteError>> + Send;

    /// The full contents of an instance.
    fn fetch_instance(
        &self,
        id: &InstanceId,
    ) -> impl Future<Output = Result<Bytes, RemoteError>> + Send;

    /// Store an instance written under `parent` and return where the store placed it.
    fn store_instance(
        &self,
        parent: &VirtualPath,
        data: Bytes,
    ) -> impl Future<Output = Result<InstanceId, RemoteError>> + Send;

    /// Delete a study, series or instance.
    fn delete_resource(
        &self,
        path: &VirtualPath,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// One cheap authorized call that proves the store is reachable.
    fn probe(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
