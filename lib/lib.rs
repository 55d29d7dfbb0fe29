//! dicom-fuse core: a DICOMweb store exposed as a `study/series/instance.dcm` tree.

/// Mount-time pre-flight check.
pub mod access;
/// Metadata and content caches.
pub mod cache;
/// The operation dispatcher and its FUSE adapter.
pub mod fs;
pub mod io;
pub mod path;
pub mod remote;
