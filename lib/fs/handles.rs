//! Open file handles.
//!
//! A read handle is bound to a downloaded [`CachedObject`] and shared: every read-open of the same
//! instance joins the existing handle and bumps its reference count. A write handle owns one
//! [`PendingUpload`]. Using a handle against its mode is `EINVAL`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::FileHandle;
use crate::cache::{CachedObject, PendingUpload};
use crate::path::InstanceId;

/// What a handle is bound to.
#[derive(Debug, Clone)]
pub enum Bound {
    /// A `Ready` object.
    Read(Arc<CachedObject>),
    /// Staged bytes awaiting commit.
    Write(Arc<PendingUpload>),
}

/// What [`HandleTable::release`] found.
#[derive(Debug)]
pub enum Released {
    /// A read reference went away; others may remain.
    Read,
    /// The write handle is gone; its upload must be committed or discarded.
    Write(Arc<PendingUpload>),
}

#[derive(Debug)]
enum Handle {
    Read {
        id: InstanceId,
        object: Arc<CachedObject>,
        refs: usize,
    },
    Write(Arc<PendingUpload>),
}

#[derive(Debug, Default)]
struct Table {
    handles: HashMap<FileHandle, Handle>,
    readers: HashMap<InstanceId, FileHandle>,
    next: FileHandle,
}

/// All open handles of the mount.
#[derive(Debug, Default)]
pub struct HandleTable {
    inner: Mutex<Table>,
}

impl HandleTable {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(table: &mut Table) -> FileHandle {
        table.next += 1;
        table.next
    }

    /// Create or join the read handle of `id`.
    pub fn open_read(&self, id: &InstanceId, object: Arc<CachedObject>) -> FileHandle {
        let mut table = self.table();
        if let Some(&fh) = table.readers.get(id)
            && let Some(Handle::Read { refs, object: bound, .. }) = table.handles.get_mut(&fh)
        {
            *refs += 1;
            // A re-download after eviction is the newer copy.
            *bound = object;
            return fh;
        }
        let fh = Self::allocate(&mut table);
        table.handles.insert(
            fh,
            Handle::Read {
                id: id.clone(),
                object,
                refs: 1,
            },
        );
        table.readers.insert(id.clone(), fh);
        fh
    }

    /// Create a write handle for `upload`.
    pub fn open_write(&self, upload: Arc<PendingUpload>) -> FileHandle {
        let mut table = self.table();
        let fh = Self::allocate(&mut table);
        table.handles.insert(fh, Handle::Write(upload));
        fh
    }

    /// What `fh` is bound to, or `None` if it is not open.
    #[must_use]
    pub fn get(&self, fh: FileHandle) -> Option<Bound> {
        self.table().handles.get(&fh).map(|h| match h {
            Handle::Read { object, .. } => Bound::Read(Arc::clone(object)),
            Handle::Write(upload) => Bound::Write(Arc::clone(upload)),
        })
    }

    /// Drop one reference to `fh`. Returns `None` if it is not open.
    pub fn release(&self, fh: FileHandle) -> Option<Released> {
        let mut table = self.table();
        match table.handles.get_mut(&fh)? {
            Handle::Read { refs, .. } if *refs > 1 => {
                *refs -= 1;
                Some(Released::Read)
            }
            Handle::Read { .. } => {
                if let Some(Handle::Read { id, .. }) = table.handles.remove(&fh) {
                    table.readers.remove(&id);
                }
                Some(Released::Read)
            }
            Handle::Write(_) => match table.handles.remove(&fh)? {
                Handle::Write(upload) => Some(Released::Write(upload)),
                Handle::Read { .. } => None,
            },
        }
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().handles.len()
    }

    /// Returns `true` if no handle is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().handles.is_empty()
    }
}
