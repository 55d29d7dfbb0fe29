//! Time-bounded cache of directory listings and per-path attributes.
//!
//! Freshness is `now - captured < ttl`, with separate TTLs for attributes and listings. When a
//! refresh fails and an expired entry is still around, the expired entry is served and flagged
//! stale. A remote `NotFound` always wins over a cached entry.
//!
//! Refreshes are coalesced per path. Invalidating a path stamps it (see [`InvalidationStamps`]).
//! The stamp covering a path is part of the coalescing key, and it is checked again while the
//! entry is held for the store, so a refresh that started before an invalidation of its path can
//! neither be joined by later callers nor overwrite the invalidation. Refreshes of unrelated paths
//! are unaffected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::invalidation::InvalidationStamps;
use super::single_flight::SingleFlight;
use crate::path::VirtualPath;
use crate::remote::{EntryKind, RemoteAttributes, RemoteError, RemoteStore};

/// A shared, immutable directory listing.
pub type Listing = Arc<Vec<String>>;

/// The two independent TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaTtls {
    /// How long attributes stay fresh.
    pub attributes: Duration,
    /// How long directory listings stay fresh.
    pub listings: Duration,
}

impl Default for MetaTtls {
    fn default() -> Self {
        Self {
            attributes: Duration::from_secs(60),
            listings: Duration::from_secs(300),
        }
    }
}

/// A value served by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    /// The value.
    pub value: T,
    /// Set when the value expired and the refresh failed.
    pub stale: bool,
}

impl<T> Cached<T> {
    fn fresh(value: T) -> Self {
        Self {
            value,
            stale: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    captured: Instant,
}

type Flight<T> = (u64, Result<T, RemoteError>);

fn is_fresh(captured: Instant, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(captured) < ttl
}

/// The metadata/listing cache.
pub struct MetaCache<R, C = SystemClock> {
    remote: Arc<R>,
    clock: C,
    ttls: MetaTtls,
    attrs: scc::HashMap<VirtualPath, Stamped<RemoteAttributes>>,
    listings: scc::HashMap<VirtualPath, Stamped<Listing>>,
    attr_flights: SingleFlight<(VirtualPath, u64), Flight<RemoteAttributes>>,
    list_flights: SingleFlight<(VirtualPath, u64), Flight<Listing>>,
    stamps: InvalidationStamps,
}

impl<R: RemoteStore> MetaCache<R> {
    /// A cache on the system clock.
    #[must_use]
    pub fn new(remote: Arc<R>, ttls: MetaTtls) -> Self {
        Self::with_clock(remote, ttls, SystemClock)
    }
}

impl<R: RemoteStore, C: Clock> MetaCache<R, C> {
    /// A cache on a caller supplied clock.
    #[must_use]
    pub fn with_clock(remote: Arc<R>, ttls: MetaTtls, clock: C) -> Self {
        Self {
            remote,
            clock,
            ttls,
            attrs: scc::HashMap::new(),
            listings: scc::HashMap::new(),
            attr_flights: SingleFlight::default(),
            list_flights: SingleFlight::default(),
            stamps: InvalidationStamps::default(),
        }
    }

    /// The configured TTLs.
    #[must_use]
    pub fn ttls(&self) -> MetaTtls {
        self.ttls
    }

    /// Attributes of `path`.
    ///
    /// Served from a fresh attribute entry, or derived from a parent listing younger than the
    /// attribute TTL, or fetched.
    ///
    /// # Errors
    ///
    /// `NotFound` when the path does not exist. Other remote failures only surface when there is
    /// no earlier entry to fall back on.
    pub async fn get_attributes(
        &self,
        path: &VirtualPath,
    ) -> Result<Cached<RemoteAttributes>, RemoteError> {
        if *path == VirtualPath::Root {
            return Ok(Cached::fresh(RemoteAttributes::bare(EntryKind::Directory)));
        }

        let now = self.clock.now();
        let cached = self
            .attrs
            .read_async(path, |_, s| s.clone())
            .await;
        if let Some(s) = &cached
            && is_fresh(s.captured, self.ttls.attributes, now)
        {
            debug!(%path, "attribute cache hit");
            return Ok(Cached::fresh(s.value));
        }

        if let Some(derived) = self.derive_from_parent(path, now).await {
            return derived.map(Cached::fresh);
        }

        let start = self.stamps.now();
        let key = (path.clone(), self.stamps.covering(path));
        let remote = Arc::clone(&self.remote);
        let target = path.clone();
        let flight = self
            .attr_flights
            .run(key, move || async move { (start, remote.get_attributes(&target).await) })
            .await
            .unwrap_or_else(|| {
                (
                    start,
                    Err(RemoteError::Unknown("attribute refresh panicked".to_owned())),
                )
            });

        match flight {
            (start, Ok(value)) => {
                self.store(&self.attrs, path, value, start).await;
                Ok(Cached::fresh(value))
            }
            (_, Err(RemoteError::NotFound(detail))) => {
                drop(self.attrs.remove_async(path).await);
                Err(RemoteError::NotFound(detail))
            }
            (_, Err(e)) => match cached {
                Some(s) => {
                    warn!(%path, error = %e, "serving stale attributes");
                    Ok(Cached {
                        value: s.value,
                        stale: true,
                    })
                }
                None => Err(e),
            },
        }
    }

    /// A parent listing captured within the attribute TTL answers existence for its children.
    async fn derive_from_parent(
        &self,
        path: &VirtualPath,
        now: Instant,
    ) -> Option<Result<RemoteAttributes, RemoteError>> {
        let parent = path.parent()?;
        let name = path.file_name()?;
        let found = self
            .listings
            .read_async(&parent, |_, s| {
                is_fresh(s.captured, self.ttls.attributes, now)
                    .then(|| s.value.iter().any(|n| *n == name))
            })
            .await
            .flatten()?;

        debug!(%path, found, "attributes derived from parent listing");
        let kind = if path.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Some(if found {
            Ok(RemoteAttributes::bare(kind))
        } else {
            Err(RemoteError::NotFound(path.to_string()))
        })
    }

    /// The children of directory `path`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the directory does not exist. Other remote failures only surface when
    /// there is no earlier listing to fall back on.
    pub async fn get_listing(&self, path: &VirtualPath) -> Result<Cached<Listing>, RemoteError> {
        let now = self.clock.now();
        let cached = self
            .listings
            .read_async(path, |_, s| s.clone())
            .await;
        if let Some(s) = &cached
            && is_fresh(s.captured, self.ttls.listings, now)
        {
            debug!(%path, "listing cache hit");
            return Ok(Cached::fresh(Arc::clone(&s.value)));
        }

        let start = self.stamps.now();
        let key = (path.clone(), self.stamps.covering(path));
        let remote = Arc::clone(&self.remote);
        let target = path.clone();
        let flight = self
            .list_flights
            .run(key, move || async move { (start, remote.list_children(&target).await.map(Arc::new)) })
            .await
            .unwrap_or_else(|| {
                (
                    start,
                    Err(RemoteError::Unknown("listing refresh panicked".to_owned())),
                )
            });

        match flight {
            (start, Ok(value)) => {
                debug!(%path, entries = value.len(), "listing refreshed");
                self.store(&self.listings, path, Arc::clone(&value), start)
                    .await;
                Ok(Cached::fresh(value))
            }
            (_, Err(RemoteError::NotFound(detail))) => {
                drop(self.listings.remove_async(path).await);
                Err(RemoteError::NotFound(detail))
            }
            (_, Err(e)) => match cached {
                Some(s) => {
                    warn!(%path, error = %e, "serving stale listing");
                    Ok(Cached {
                        value: s.value,
                        stale: true,
                    })
                }
                None => Err(e),
            },
        }
    }

    async fn store<T: Send + Sync + 'static>(
        &self,
        map: &scc::HashMap<VirtualPath, Stamped<T>>,
        path: &VirtualPath,
        value: T,
        start: u64,
    ) {
        let stamped = Stamped {
            value,
            captured: self.clock.now(),
        };
        // `invalidate` stamps before it retains, and retaining waits for this entry, so checking
        // while the entry is held orders the two.
        let entry = map.entry_async(path.clone()).await;
        if self.stamps.invalidated_since(path, start) {
            debug!(%path, "discarding result that raced an invalidation");
            return;
        }
        match entry {
            scc::hash_map::Entry::Occupied(mut occ) => *occ.get_mut() = stamped,
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(stamped);
            }
        }
    }

    /// Drop everything cached for `path` and the paths below it.
    pub fn invalidate(&self, path: &VirtualPath) {
        self.stamps.invalidate(path);
        self.attrs.retain_sync(|k, _| !path.contains(k));
        self.listings.retain_sync(|k, _| !path.contains(k));
        debug!(%path, "invalidated");
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.stamps.invalidate(&VirtualPath::Root);
        self.attrs.clear_sync();
        self.listings.clear_sync();
    }
}
