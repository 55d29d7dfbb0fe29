//! The two cache tiers and the primitives they share.

/// Time sources for TTL bookkeeping.
pub mod clock;
/// Disk-backed cache of instance contents and the write staging area.
pub mod content;
/// Cache eviction policies.
pub mod eviction;
/// Per-path invalidation stamps.
pub mod invalidation;
/// Time-bounded cache of listings and attributes.
pub mod meta;
/// Request coalescing.
pub mod single_flight;

pub use clock::{Clock, ManualClock, SystemClock};
pub use content::{
    CachedObject, ContentCache, ContentCacheConfig, ContentCacheError, EntryState,
    InvalidRootPathError, PendingUpload,
};
pub use meta::{Cached, Listing, MetaCache, MetaTtls};
