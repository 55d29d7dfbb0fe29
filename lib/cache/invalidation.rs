//! Per-path invalidation stamps.
//!
//! Work that reads remote state notes [`InvalidationStamps::now`] before it starts. Before it
//! publishes its result, it asks [`InvalidationStamps::invalidated_since`] whether the target path
//! or one of its ancestors was invalidated in between. Invalidating one path never disturbs work
//! on unrelated paths.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::path::VirtualPath;

/// The last invalidation of each path, as a value of one monotonic counter.
#[derive(Debug, Default)]
pub struct InvalidationStamps {
    counter: AtomicU64,
    stamps: scc::HashMap<VirtualPath, u64>,
}

impl InvalidationStamps {
    /// The counter value to compare later results against.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// The newest stamp covering `path`: its own or that of an ancestor. `0` if none.
    #[must_use]
    pub fn covering(&self, path: &VirtualPath) -> u64 {
        std::iter::once(path.clone())
            .chain(path.ancestors())
            .filter_map(|p| self.stamps.read_sync(&p, |_, s| *s))
            .max()
            .unwrap_or(0)
    }

    /// Whether `path` or an ancestor was invalidated after `start` was taken.
    #[must_use]
    pub fn invalidated_since(&self, path: &VirtualPath, start: u64) -> bool {
        self.covering(path) > start
    }

    /// Mark `path` and everything below it as invalidated.
    pub fn invalidate(&self, path: &VirtualPath) -> u64 {
        let stamp = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.stamps.upsert_sync(path.clone(), stamp);
        if *path == VirtualPath::Root {
            // The root stamp now covers every older one.
            self.stamps.retain_sync(|_, s| *s >= stamp);
        }
        stamp
    }

    /// Number of paths holding a stamp.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Returns `true` if no path was ever invalidated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn path(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[test]
    fn invalidation_covers_descendants_only() {
        let stamps = InvalidationStamps::default();
        let start = stamps.now();

        stamps.invalidate(&path("/1/2"));
        assert!(stamps.invalidated_since(&path("/1/2"), start));
        assert!(stamps.invalidated_since(&path("/1/2/3.dcm"), start));
        assert!(!stamps.invalidated_since(&path("/1"), start));
        assert!(!stamps.invalidated_since(&path("/1/9"), start));
        assert!(!stamps.invalidated_since(&path("/1/2/3.dcm"), stamps.now()));
    }

    #[test]
    fn root_invalidation_collapses_older_stamps() {
        let stamps = InvalidationStamps::default();
        stamps.invalidate(&path("/1"));
        stamps.invalidate(&path("/2/3"));
        let start = stamps.now();

        stamps.invalidate(&VirtualPath::Root);
        assert_eq!(stamps.len(), 1);
        assert!(stamps.invalidated_since(&path("/7/8/9.dcm"), start));
    }
}
