//! Bidirectional inode mapping.
//!
//! [`InodeBridge`] maps kernel inode numbers to [`VirtualPath`]s and back using two
//! [`scc::HashMap`]s guarded by a coordination lock for cross-map atomicity. Inodes are
//! allocated on first sight of a path and retired when the kernel forgets its last lookup, or,
//! for inodes the kernel never looked up, when a later listing of their directory drops them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashSet;

use super::{InodeAddr, ROOT_INO};
use crate::path::VirtualPath;

#[derive(Debug, Clone)]
struct Slot {
    path: VirtualPath,
    /// Lookups the kernel has not yet forgotten.
    lookups: u64,
}

/// Inode numbers for paths, with kernel lookup counting.
///
/// Reads are lock-free. Mutations that touch both maps are serialized by a `Mutex<()>` so a
/// concurrent retirement can never leave one direction orphaned.
pub struct InodeBridge {
    by_ino: scc::HashMap<InodeAddr, Slot>,
    by_path: scc::HashMap<VirtualPath, InodeAddr>,
    next: AtomicU64,
    mu: Mutex<()>,
}

impl InodeBridge {
    /// A bridge that knows only the root.
    #[must_use]
    pub fn new() -> Self {
        let bridge = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
            mu: Mutex::new(()),
        };
        drop(bridge.by_ino.insert_sync(
            ROOT_INO,
            Slot {
                path: VirtualPath::Root,
                lookups: 1,
            },
        ));
        drop(bridge.by_path.insert_sync(VirtualPath::Root, ROOT_INO));
        bridge
    }

    /// The path behind `ino`.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<VirtualPath> {
        self.by_ino.read_sync(&ino, |_, slot| slot.path.clone())
    }

    /// The inode of `path`, allocating one if the path is new. Does not count as a lookup.
    #[must_use]
    pub fn ino_for(&self, path: &VirtualPath) -> InodeAddr {
        self.resolve(path, 0)
    }

    /// The inode of `path`, counting one kernel lookup against it.
    #[must_use]
    pub fn lookup(&self, path: &VirtualPath) -> InodeAddr {
        self.resolve(path, 1)
    }

    fn resolve(&self, path: &VirtualPath, lookups: u64) -> InodeAddr {
        if lookups == 0
            && let Some(ino) = self.by_path.read_sync(path, |_, &ino| ino)
        {
            return ino;
        }

        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        match self.by_path.entry_sync(path.clone()) {
            scc::hash_map::Entry::Occupied(occ) => {
                let ino = *occ.get();
                self.by_ino.update_sync(&ino, |_, slot| slot.lookups += lookups);
                ino
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                drop(self.by_ino.insert_sync(
                    ino,
                    Slot {
                        path: path.clone(),
                        lookups,
                    },
                ));
                ino
            }
        }
    }

    /// The kernel dropped `count` lookups of `ino`. The mapping is retired at zero. The root is
    /// never retired.
    pub fn forget(&self, ino: InodeAddr, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        let retired = self.by_ino.remove_if_sync(&ino, |slot| {
            slot.lookups = slot.lookups.saturating_sub(count);
            slot.lookups == 0
        });
        if let Some((_, slot)) = retired {
            drop(self.by_path.remove_sync(&slot.path));
        }
    }

    /// Retire the children of `dir` that hold no kernel lookups and are missing from `listed`.
    /// Returns how many were retired.
    pub fn sweep_children(&self, dir: &VirtualPath, listed: &FxHashSet<VirtualPath>) -> usize {
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retired = Vec::new();
        self.by_ino.retain_sync(|_, slot| {
            let unused = slot.lookups == 0
                && slot.path.parent().as_ref() == Some(dir)
                && !listed.contains(&slot.path);
            if unused {
                retired.push(slot.path.clone());
            }
            !unused
        });
        for path in &retired {
            drop(self.by_path.remove_sync(path));
        }
        retired.len()
    }

    /// Number of live inodes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Always `false`: the root is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

impl Default for InodeBridge {
    fn default() -> Self {
        Self::new()
    }
}
