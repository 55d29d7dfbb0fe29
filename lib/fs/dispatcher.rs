//! The operation dispatcher: kernel operations expressed against the two caches.
//!
//! Every operation here is `async` and safe to call concurrently. The `fuser` adapter blocks on
//! them; tests drive them directly.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, instrument, warn};

use super::bridge::InodeBridge;
use super::handles::{Bound, HandleTable, Released};
use super::{DirEntry, FileHandle, FsStats, InodeAddr, InodePerms, NodeAttr, OpenFlags};
use crate::cache::{Clock, ContentCache, MetaCache, PendingUpload, SystemClock};
use crate::path::{PathError, VirtualPath};
use crate::remote::{EntryKind, RemoteAttributes, RemoteStore};

fn errno(code: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(code)
}

/// Ownership and policy applied to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// Owner reported for every node.
    pub uid: u32,
    /// Group reported for every node.
    pub gid: u32,
    /// When `false`, `unlink` and `rmdir` fail with `EPERM` before any remote call.
    pub enable_deletion: bool,
}

/// The mounted tree.
///
/// Besides the remote state seen through the caches, the tree holds two kinds of local-only
/// entries: placeholder directories created by `mkdir`, and files that are being written and have
/// not been committed yet.
pub struct DicomFs<R, C = SystemClock> {
    remote: Arc<R>,
    meta: MetaCache<R, C>,
    content: ContentCache<R>,
    bridge: InodeBridge,
    handles: HandleTable,
    /// Directories created by `mkdir` that the store does not know about yet.
    placeholders: scc::HashMap<VirtualPath, SystemTime>,
    /// The newest open write per path.
    pending: scc::HashMap<VirtualPath, Arc<PendingUpload>>,
    config: FsConfig,
    mounted_at: SystemTime,
}

impl<R: RemoteStore, C: Clock> DicomFs<R, C> {
    /// Assemble the tree from its caches.
    #[must_use]
    pub fn new(
        remote: Arc<R>,
        meta: MetaCache<R, C>,
        content: ContentCache<R>,
        config: FsConfig,
    ) -> Self {
        Self {
            remote,
            meta,
            content,
            bridge: InodeBridge::new(),
            handles: HandleTable::default(),
            placeholders: scc::HashMap::new(),
            pending: scc::HashMap::new(),
            config,
            mounted_at: SystemTime::now(),
        }
    }

    /// The metadata cache.
    #[must_use]
    pub fn meta(&self) -> &MetaCache<R, C> {
        &self.meta
    }

    /// The content cache.
    #[must_use]
    pub fn content(&self) -> &ContentCache<R> {
        &self.content
    }

    /// Number of open file handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn path_of(&self, ino: InodeAddr) -> std::io::Result<VirtualPath> {
        self.bridge.path(ino).ok_or_else(|| {
            warn!(ino, "inode is not known");
            errno(libc::ENOENT)
        })
    }

    /// Resolve `name` inside `dir` for operations on existing entries. A name that cannot map to
    /// a remote resource simply does not exist.
    fn existing_child(dir: &VirtualPath, name: &OsStr) -> std::io::Result<VirtualPath> {
        dir.child(name).map_err(|e| match e {
            PathError::InvalidName(_) | PathError::TooDeep => errno(libc::ENOENT),
            PathError::NotADirectory => errno(libc::ENOTDIR),
        })
    }

    async fn is_placeholder(&self, path: &VirtualPath) -> bool {
        self.placeholders.contains_async(path).await
    }

    /// What `path` currently is. Local entries shadow the remote view.
    async fn describe(&self, path: &VirtualPath) -> std::io::Result<RemoteAttributes> {
        if let Some(len) = self.pending.read_async(path, |_, u| u.len()).await {
            return Ok(RemoteAttributes {
                kind: EntryKind::File,
                size: Some(len),
                modified: Some(SystemTime::now()),
            });
        }
        if let Some(created) = self.placeholders.read_async(path, |_, &t| t).await {
            return Ok(RemoteAttributes {
                kind: EntryKind::Directory,
                size: None,
                modified: Some(created),
            });
        }
        // The store cannot hold anything below a directory it does not know about.
        if let Some(parent) = path.parent()
            && self.is_placeholder(&parent).await
        {
            return Err(errno(libc::ENOENT));
        }

        let cached = self.meta.get_attributes(path).await?;
        if cached.stale {
            debug!(%path, "attributes are stale");
        }
        let size = path
            .instance_id()
            .and_then(|id| self.content.cached_size(id))
            .unwrap_or(0);
        Ok(RemoteAttributes {
            size: Some(size),
            ..cached.value
        })
    }

    async fn node_attr(&self, ino: InodeAddr, path: &VirtualPath) -> std::io::Result<NodeAttr> {
        Ok(self.to_node(ino, self.describe(path).await?))
    }

    fn to_node(&self, ino: InodeAddr, attrs: RemoteAttributes) -> NodeAttr {
        NodeAttr {
            ino,
            kind: attrs.kind,
            size: attrs.size.unwrap_or(0),
            modified: attrs.modified.unwrap_or(self.mounted_at),
            perms: match attrs.kind {
                EntryKind::Directory => InodePerms::DIRECTORY,
                EntryKind::File => InodePerms::FILE,
            },
            uid: self.config.uid,
            gid: self.config.gid,
        }
    }

    /// Look up `name` in directory `parent`. A successful lookup counts against the inode until
    /// [`forget`](Self::forget).
    #[instrument(name = "DicomFs::lookup", skip(self, name), fields(name = ?name))]
    pub async fn lookup(&self, parent: InodeAddr, name: &OsStr) -> std::io::Result<NodeAttr> {
        let dir = self.path_of(parent)?;
        let path = Self::existing_child(&dir, name)?;
        let attrs = self.describe(&path).await?;
        Ok(self.to_node(self.bridge.lookup(&path), attrs))
    }

    /// Attributes of `ino`. Sizes and times are best effort within the attribute TTL.
    #[instrument(name = "DicomFs::getattr", skip(self))]
    pub async fn getattr(&self, ino: InodeAddr) -> std::io::Result<NodeAttr> {
        let path = self.path_of(ino)?;
        self.node_attr(ino, &path).await
    }

    /// The children of directory `ino`: the remote listing, followed by local placeholders and
    /// files being written that the listing does not show yet.
    #[instrument(name = "DicomFs::readdir", skip(self))]
    pub async fn readdir(&self, ino: InodeAddr) -> std::io::Result<Vec<DirEntry>> {
        let dir = self.path_of(ino)?;
        if !dir.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }

        let listing = if self.is_placeholder(&dir).await {
            Arc::default()
        } else {
            self.meta.get_listing(&dir).await?.value
        };

        let mut local = Vec::new();
        self.placeholders
            .iter_async(|p, _| {
                if p.parent().as_ref() == Some(&dir) {
                    local.push(p.clone());
                }
                true
            })
            .await;
        self.pending
            .iter_async(|p, _| {
                if p.parent().as_ref() == Some(&dir) {
                    local.push(p.clone());
                }
                true
            })
            .await;

        let mut seen = FxHashSet::default();
        let mut entries = Vec::with_capacity(listing.len() + local.len());
        let remote = listing.iter().filter_map(|name| match dir.child(OsStr::new(name)) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(%dir, name, error = %e, "skipping unrepresentable entry");
                None
            }
        });
        for path in remote.chain(local) {
            let Some(name) = path.file_name() else {
                continue;
            };
            if !seen.insert(path.clone()) {
                continue;
            }
            entries.push(DirEntry {
                ino: self.bridge.ino_for(&path),
                kind: if path.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                name,
            });
        }

        let retired = self.bridge.sweep_children(&dir, &seen);
        if retired > 0 {
            debug!(%dir, retired, "retired inodes of vanished entries");
        }
        Ok(entries)
    }

    /// Register `upload` as the newest write to its target.
    async fn track(&self, upload: Arc<PendingUpload>) {
        match self.pending.entry_async(upload.target().clone()).await {
            scc::hash_map::Entry::Occupied(mut occ) => {
                debug!(target = %upload.target(), "superseding an earlier open write");
                *occ.get_mut() = upload;
            }
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(upload);
            }
        }
    }

    async fn stage(&self, path: &VirtualPath) -> std::io::Result<FileHandle> {
        let upload = Arc::new(self.content.stage_for_write(path).await?);
        self.track(Arc::clone(&upload)).await;
        Ok(self.handles.open_write(upload))
    }

    /// Open an instance.
    ///
    /// A read-open waits until the whole object is local. A write-open stages an empty
    /// replacement that is uploaded on [`release`](Self::release); read-modify-write of remote
    /// objects is not supported.
    #[instrument(name = "DicomFs::open", skip(self))]
    pub async fn open(&self, ino: InodeAddr, flags: OpenFlags) -> std::io::Result<FileHandle> {
        let path = self.path_of(ino)?;
        let Some(id) = path.instance_id() else {
            return Err(errno(libc::EISDIR));
        };

        if flags.is_write() {
            if flags.contains(OpenFlags::APPEND)
                || (flags.is_read() && !flags.contains(OpenFlags::TRUNC))
            {
                return Err(errno(libc::EINVAL));
            }
            self.describe(&path).await?;
            return self.stage(&path).await;
        }

        let object = self.content.read(id).await?;
        Ok(self.handles.open_read(id, object))
    }

    /// Create `name` in series directory `parent` and open it for writing. Without `O_EXCL` an
    /// existing instance is replaced on release.
    #[instrument(name = "DicomFs::create", skip(self, name), fields(name = ?name))]
    pub async fn create(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        flags: OpenFlags,
    ) -> std::io::Result<(NodeAttr, FileHandle)> {
        let dir = self.path_of(parent)?;
        if !matches!(dir, VirtualPath::Series { .. }) {
            return Err(errno(libc::EPERM));
        }
        let path = dir.child(name)?;
        if flags.contains(OpenFlags::EXCL) {
            match self.describe(&path).await {
                Ok(_) => return Err(errno(libc::EEXIST)),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }
        let fh = self.stage(&path).await?;
        let ino = self.bridge.lookup(&path);
        let attr = self.node_attr(ino, &path).await?;
        Ok((attr, fh))
    }

    /// Read up to `size` bytes at `offset` from a read handle. Reads past the end return nothing.
    #[instrument(name = "DicomFs::read", skip(self))]
    pub async fn read(&self, fh: FileHandle, offset: i64, size: u32) -> std::io::Result<Bytes> {
        let offset = u64::try_from(offset).map_err(|_| errno(libc::EINVAL))?;
        match self.handles.get(fh) {
            Some(Bound::Read(object)) => object.read_at(offset, size).await,
            Some(Bound::Write(_)) => Err(errno(libc::EINVAL)),
            None => Err(errno(libc::EBADF)),
        }
    }

    /// Write `data` at `offset` through a write handle. Never touches the network.
    #[instrument(name = "DicomFs::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fh: FileHandle, offset: i64, data: &[u8]) -> std::io::Result<u32> {
        let offset = u64::try_from(offset).map_err(|_| errno(libc::EINVAL))?;
        let upload = match self.handles.get(fh) {
            Some(Bound::Write(upload)) => upload,
            Some(Bound::Read(_)) => return Err(errno(libc::EINVAL)),
            None => return Err(errno(libc::EBADF)),
        };
        let written = upload.write_at(offset, data).await?;
        u32::try_from(written).map_err(|_| errno(libc::EINVAL))
    }

    /// Set the size of `ino`. Only staged writes can change size; anywhere else this returns the
    /// current attributes unchanged.
    #[instrument(name = "DicomFs::truncate", skip(self))]
    pub async fn truncate(
        &self,
        ino: InodeAddr,
        fh: Option<FileHandle>,
        size: u64,
    ) -> std::io::Result<NodeAttr> {
        let path = self.path_of(ino)?;
        let upload = match fh.and_then(|fh| self.handles.get(fh)) {
            Some(Bound::Write(upload)) => Some(upload),
            Some(Bound::Read(_)) | None => {
                self.pending.read_async(&path, |_, u| Arc::clone(u)).await
            }
        };
        if let Some(upload) = upload {
            upload.truncate(size).await?;
        }
        self.node_attr(ino, &path).await
    }

    /// Close a handle. Closing a write handle uploads what was written.
    ///
    /// # Errors
    ///
    /// `EBADF` for an unknown handle, or the upload failure. A failed upload leaves nothing
    /// behind.
    #[instrument(name = "DicomFs::release", skip(self))]
    pub async fn release(&self, fh: FileHandle) -> std::io::Result<()> {
        match self.handles.release(fh) {
            Some(Released::Read) => Ok(()),
            Some(Released::Write(upload)) => self.commit(upload).await,
            None => Err(errno(libc::EBADF)),
        }
    }

    async fn commit(&self, upload: Arc<PendingUpload>) -> std::io::Result<()> {
        let target = upload.target().clone();
        if upload.is_empty() {
            debug!(%target, "nothing was written, skipping upload");
            self.untrack(&upload);
            self.content.discard(&upload).await;
            return Ok(());
        }

        let committed = self.content.commit(&upload).await;
        match committed {
            Ok(stored) => {
                let actual = VirtualPath::from(stored);
                info!(%target, %actual, "stored instance");
                self.invalidate_created(&target);
                if actual != target {
                    for dir in actual.ancestors() {
                        self.meta.invalidate(&dir);
                    }
                }
                self.untrack(&upload);
                Ok(())
            }
            Err(e) => {
                error!(%target, error = %e, "upload failed, written data was discarded");
                self.untrack(&upload);
                for dir in target.ancestors() {
                    if self.holds_local_entries(&dir).await {
                        break;
                    }
                    drop(self.placeholders.remove_async(&dir).await);
                }
                Err(e.into())
            }
        }
    }

    /// Whether anything local still lives below `dir`: an open write, or another placeholder.
    async fn holds_local_entries(&self, dir: &VirtualPath) -> bool {
        let mut found = false;
        self.pending
            .iter_async(|p, _| {
                found = dir.contains(p);
                !found
            })
            .await;
        if !found {
            self.placeholders
                .iter_async(|p, _| {
                    found = p != dir && dir.contains(p);
                    !found
                })
                .await;
        }
        found
    }

    fn untrack(&self, upload: &Arc<PendingUpload>) {
        drop(
            self.pending
                .remove_if_sync(upload.target(), |p| Arc::ptr_eq(p, upload)),
        );
    }

    /// Make a new `path` visible: its directory is re-listed, and every placeholder it lived in
    /// is now real, so their directories are re-listed too.
    fn invalidate_created(&self, path: &VirtualPath) {
        self.meta.invalidate(path);
        let mut dir = path.parent();
        while let Some(d) = dir {
            self.meta.invalidate(&d);
            if self.placeholders.remove_sync(&d).is_none() {
                break;
            }
            dir = d.parent();
        }
    }

    /// Delete the instance `name` in `parent`.
    #[instrument(name = "DicomFs::unlink", skip(self, name), fields(name = ?name))]
    pub async fn unlink(&self, parent: InodeAddr, name: &OsStr) -> std::io::Result<()> {
        if !self.config.enable_deletion {
            return Err(errno(libc::EPERM));
        }
        let dir = self.path_of(parent)?;
        let path = Self::existing_child(&dir, name)?;
        let Some(id) = path.instance_id() else {
            return Err(errno(libc::EISDIR));
        };

        self.remote.delete_resource(&path).await?;
        self.content.remove(id);
        self.meta.invalidate(&dir);
        info!(%path, "deleted instance");
        Ok(())
    }

    /// Delete the study or series `name` in `parent`, with everything below it.
    #[instrument(name = "DicomFs::rmdir", skip(self, name), fields(name = ?name))]
    pub async fn rmdir(&self, parent: InodeAddr, name: &OsStr) -> std::io::Result<()> {
        if !self.config.enable_deletion {
            return Err(errno(libc::EPERM));
        }
        let dir = self.path_of(parent)?;
        let path = Self::existing_child(&dir, name)?;
        if !path.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }

        if self.placeholders.remove_sync(&path).is_some() {
            self.placeholders.retain_sync(|p, _| !path.contains(p));
            debug!(%path, "removed placeholder directory");
            return Ok(());
        }

        self.remote.delete_resource(&path).await?;
        self.content.remove_under(&path);
        self.meta.invalidate(&dir);
        info!(%path, "deleted directory");
        Ok(())
    }

    /// Create a study or series directory. The directory only exists locally until an instance
    /// is stored in it.
    #[instrument(name = "DicomFs::mkdir", skip(self, name), fields(name = ?name))]
    pub async fn mkdir(&self, parent: InodeAddr, name: &OsStr) -> std::io::Result<NodeAttr> {
        let dir = self.path_of(parent)?;
        let path = match dir {
            VirtualPath::Root | VirtualPath::Study { .. } => dir.child(name)?,
            VirtualPath::Series { .. } | VirtualPath::Instance(_) => {
                return Err(errno(libc::EPERM));
            }
        };

        match self.describe(&path).await {
            Ok(_) => return Err(errno(libc::EEXIST)),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) => return Err(e),
        }
        if self
            .placeholders
            .insert_async(path.clone(), SystemTime::now())
            .await
            .is_err()
        {
            return Err(errno(libc::EEXIST));
        }

        debug!(%path, "created placeholder directory");
        let ino = self.bridge.lookup(&path);
        self.node_attr(ino, &path).await
    }

    /// The kernel dropped `nlookup` references to `ino`.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        self.bridge.forget(ino, nlookup);
    }

    /// Filesystem statistics.
    #[must_use]
    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: 4096,
            total_blocks: 0,
            free_blocks: 0,
            available_blocks: 0,
            total_inodes: self.bridge.len() as u64,
            free_inodes: 0,
            max_filename_length: 255,
        }
    }
}
