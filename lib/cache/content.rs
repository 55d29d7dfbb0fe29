//! Local disk cache of instance contents, and the staging area for writes.
//!
//! Layout under the cache root:
//!
//! - `objects/`: one file per `Ready` instance. Downloads land in `{n}.part` and are renamed into
//!   place only once complete, so a partial download is never visible as `Ready`.
//! - `staging/`: one file per [`PendingUpload`].
//!
//! Nothing outside this module touches those directories.

use std::io::SeekFrom;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::eviction::lru::LruIndex;
use super::invalidation::InvalidationStamps;
use super::single_flight::SingleFlight;
use crate::io;
use crate::path::{InstanceId, VirtualPath};
use crate::remote::{RemoteError, RemoteStore};

/// The cache root cannot be used.
#[derive(Debug, Error)]
pub enum InvalidRootPathError {
    /// The root exists and is not a directory.
    #[error("cache root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The root holds files this program did not create.
    #[error("cache root contains data that was not created by dicom-fuse: {0}")]
    RootPathUnsafeCache(PathBuf),

    /// Any I/O failure while preparing the root.
    #[error("I/O error while preparing the cache root: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of content cache operations.
#[derive(Debug, Clone, Error)]
pub enum ContentCacheError {
    /// The remote call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Reading or writing the local cache failed.
    #[error("local cache I/O failed: {0}")]
    Io(Arc<std::io::Error>),

    /// The transfer was abandoned before it produced a result.
    #[error("transfer of {0} was aborted")]
    Aborted(String),
}

impl From<std::io::Error> for ContentCacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<ContentCacheError> for std::io::Error {
    fn from(err: ContentCacheError) -> Self {
        match err {
            ContentCacheError::Remote(e) => e.into(),
            ContentCacheError::Io(e) => e.raw_os_error().map_or_else(
                || Self::new(e.kind(), e.to_string()),
                Self::from_raw_os_error,
            ),
            ContentCacheError::Aborted(_) => Self::from_raw_os_error(libc::EIO),
        }
    }
}

/// Content cache settings.
#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
    /// Directory owned by the cache.
    pub root: PathBuf,
    /// Maximum number of `Ready` objects.
    pub capacity: usize,
    /// Maximum number of concurrent remote transfers.
    pub max_transfers: usize,
}

/// Observable state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// A download is in flight.
    Downloading,
    /// The whole object is on local disk.
    Ready,
}

/// A fully downloaded instance.
///
/// The backing file lives as long as the last reference: evicting an object that an open handle
/// still reads from only unlinks it once the handle lets go.
#[derive(Debug)]
pub struct CachedObject {
    path: PathBuf,
    file: Arc<std::fs::File>,
    size: u64,
}

impl CachedObject {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = std::fs::File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file: Arc::new(file),
            size,
        })
    }

    /// Object size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes at `offset`. Reads at or past the end return no bytes.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures of the backing file.
    pub async fn read_at(&self, offset: u64, len: u32) -> std::io::Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let want = u64::from(len).min(self.size - offset);
        #[expect(
            clippy::cast_possible_truncation,
            reason = "bounded by a u32 read size"
        )]
        let want = want as usize;
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> std::io::Result<Bytes> {
            let mut buf = vec![0; want];
            let mut filled = 0;
            while filled < want {
                match file.read_at(&mut buf[filled..], offset + filled as u64)? {
                    0 => break,
                    n => filled += n,
                }
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

impl Drop for CachedObject {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove cached object");
        }
    }
}

/// Bytes written to a new or replaced instance, waiting for [`ContentCache::commit`].
///
/// Dropping an upload that was never committed removes its staging file.
#[derive(Debug)]
pub struct PendingUpload {
    target: VirtualPath,
    parent: VirtualPath,
    file_id: u64,
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    len: AtomicU64,
}

impl PendingUpload {
    /// The path the bytes were written to.
    #[must_use]
    pub fn target(&self) -> &VirtualPath {
        &self.target
    }

    /// Current staged length.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `data` at `offset`, growing the staged file as needed.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures of the staging file.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        self.len
            .fetch_max(offset + data.len() as u64, Ordering::AcqRel);
        Ok(data.len())
    }

    /// Cut or extend the staged file to `size` bytes.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures of the staging file.
    pub async fn truncate(&self, size: u64) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.set_len(size).await?;
        self.len.store(size, Ordering::Release);
        Ok(())
    }

    async fn contents(&self) -> std::io::Result<Bytes> {
        self.file.lock().await.flush().await?;
        Ok(Bytes::from(tokio::fs::read(&self.path).await?))
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove staging file");
        }
    }
}

type DownloadResult = Result<Arc<CachedObject>, ContentCacheError>;

/// State shared with download tasks.
struct Store {
    objects: PathBuf,
    staging: PathBuf,
    index: Mutex<LruIndex<InstanceId, Arc<CachedObject>>>,
    /// Stamped when entries are removed, so downloads that raced a removal do not resurrect
    /// them.
    removals: InvalidationStamps,
    next_file: AtomicU64,
    transfers: Semaphore,
}

impl Store {
    fn index(&self) -> std::sync::MutexGuard<'_, LruIndex<InstanceId, Arc<CachedObject>>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self, id: &InstanceId) -> Option<Arc<CachedObject>> {
        self.index().touch(id).map(Arc::clone)
    }

    fn next_file(&self) -> u64 {
        self.next_file.fetch_add(1, Ordering::Relaxed)
    }

    async fn download<R: RemoteStore>(&self, remote: &R, id: InstanceId) -> DownloadResult {
        if let Some(obj) = self.touch(&id) {
            return Ok(obj);
        }
        let start = self.removals.now();

        let bytes = {
            let _permit = self
                .transfers
                .acquire()
                .await
                .map_err(|_| ContentCacheError::Aborted(id.file_name()))?;
            remote.fetch_instance(&id).await?
        };

        let obj = Arc::new(self.persist(&bytes).await?);
        debug!(instance = %id.instance, size = obj.size(), "download complete");
        self.insert_ready(id, Arc::clone(&obj), start);
        Ok(obj)
    }

    async fn persist(&self, bytes: &[u8]) -> std::io::Result<CachedObject> {
        let n = self.next_file();
        let part = self.objects.join(format!("{n}.part"));
        let done = self.objects.join(n.to_string());

        let written = async {
            tokio::fs::write(&part, bytes).await?;
            tokio::fs::rename(&part, &done).await
        }
        .await;
        if let Err(e) = written {
            drop(tokio::fs::remove_file(&part).await);
            return Err(e);
        }
        CachedObject::open(done)
    }

    fn insert_ready(&self, id: InstanceId, obj: Arc<CachedObject>, start: u64) {
        let evicted = {
            let mut index = self.index();
            if self
                .removals
                .invalidated_since(&VirtualPath::Instance(id.clone()), start)
            {
                debug!(instance = %id.instance, "entry was removed while in flight, not caching");
                return;
            }
            index.insert(id, obj);
            index.evict_over_capacity()
        };
        for (id, _) in &evicted {
            debug!(instance = %id.instance, "evicted least recently used object");
        }
    }
}

/// The content cache.
pub struct ContentCache<R> {
    remote: Arc<R>,
    store: Arc<Store>,
    downloads: SingleFlight<InstanceId, DownloadResult>,
}

impl<R: RemoteStore> ContentCache<R> {
    // Changing this marker makes existing cache directories look foreign.
    const MARKER_FILE: &'static str = ".dicom_fuse_cache";

    /// Open the cache at `config.root`.
    ///
    /// The root must be missing, empty, or a directory previously used by this program. Anything
    /// left over from an earlier run is removed.
    ///
    /// # Errors
    ///
    /// Fails when the root is unusable.
    pub async fn new(
        remote: Arc<R>,
        config: &ContentCacheConfig,
    ) -> Result<Self, InvalidRootPathError> {
        let root = Self::prepare_root(&config.root).await?;
        let objects = root.join("objects");
        let staging = root.join("staging");
        tokio::fs::create_dir_all(&objects).await?;
        tokio::fs::create_dir_all(&staging).await?;

        Ok(Self {
            remote,
            store: Arc::new(Store {
                objects,
                staging,
                index: Mutex::new(LruIndex::new(config.capacity)),
                removals: InvalidationStamps::default(),
                next_file: AtomicU64::new(0),
                transfers: Semaphore::new(config.max_transfers.max(1)),
            }),
            downloads: SingleFlight::default(),
        })
    }

    async fn prepare_root(root: &Path) -> Result<PathBuf, InvalidRootPathError> {
        let mut pbuf = match tokio::fs::canonicalize(root).await {
            Ok(mut p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidRootPathError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();

                p.push(Self::MARKER_FILE);
                let marker_exists = tokio::fs::try_exists(&p).await?;
                p.pop();

                if !(is_empty || marker_exists) {
                    return Err(InvalidRootPathError::RootPathUnsafeCache(p));
                }

                io::remove_dir_contents(&p).await?;
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(root).await?;
                tokio::fs::canonicalize(root).await?
            }
            Err(e) => return Err(e.into()),
        };

        pbuf.push(Self::MARKER_FILE);
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&pbuf)
            .await?;
        pbuf.pop();
        Ok(pbuf)
    }

    /// The whole object for `id`, downloading it if needed.
    ///
    /// Concurrent callers for an instance that is not yet local share one download and all see
    /// its outcome. A failed download leaves nothing behind, so the next call tries again.
    ///
    /// # Errors
    ///
    /// The download's remote or local failure.
    #[instrument(name = "ContentCache::read", skip(self, id), fields(instance = %id.instance))]
    pub async fn read(&self, id: &InstanceId) -> Result<Arc<CachedObject>, ContentCacheError> {
        if let Some(obj) = self.store.touch(id) {
            debug!("content cache hit");
            return Ok(obj);
        }

        debug!("content cache miss");
        let store = Arc::clone(&self.store);
        let remote = Arc::clone(&self.remote);
        let key = id.clone();
        self.downloads
            .run(id.clone(), move || async move { store.download(&*remote, key).await })
            .await
            .unwrap_or_else(|| Err(ContentCacheError::Aborted(id.file_name())))
    }

    /// Evict least recently used `Ready` objects until the count is within capacity.
    pub fn evict_if_over_capacity(&self) {
        let evicted = self.store.index().evict_over_capacity();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted objects over capacity");
        }
    }

    /// Evict every `Ready` object. In-flight downloads are left alone and land afterwards.
    pub fn clear(&self) {
        let drained = self.store.index().drain();
        debug!(count = drained.len(), "cleared content cache");
    }

    /// Forget `id`, e.g. after it was deleted remotely. Downloads of other instances are left
    /// alone.
    pub fn remove(&self, id: &InstanceId) {
        self.store
            .removals
            .invalidate(&VirtualPath::Instance(id.clone()));
        // Dropping the last reference unlinks the file, so let go of the lock first.
        let removed = self.store.index().remove(id);
        drop(removed);
    }

    /// Forget every instance at or below `path`.
    pub fn remove_under(&self, path: &VirtualPath) {
        self.store.removals.invalidate(path);
        let removed = self
            .store
            .index()
            .remove_where(|id| path.contains_instance(id));
        debug!(%path, count = removed.len(), "removed cached objects");
    }

    /// The state of the entry for `id`, if there is one.
    #[must_use]
    pub fn state(&self, id: &InstanceId) -> Option<EntryState> {
        if self.store.index().peek(id).is_some() {
            Some(EntryState::Ready)
        } else if self.downloads.is_in_flight(id) {
            Some(EntryState::Downloading)
        } else {
            None
        }
    }

    /// Size of the local copy of `id`, without touching its recency.
    #[must_use]
    pub fn cached_size(&self, id: &InstanceId) -> Option<u64> {
        self.store.index().peek(id).map(|o| o.size())
    }

    /// Number of `Ready` objects.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.store.index().len()
    }

    /// Create an empty staging file for bytes destined for `target`. Never contacts the store.
    ///
    /// # Errors
    ///
    /// Fails when `target` is not an instance path, or the staging file cannot be created.
    pub async fn stage_for_write(
        &self,
        target: &VirtualPath,
    ) -> Result<PendingUpload, ContentCacheError> {
        let parent = match target {
            VirtualPath::Instance(_) => target.parent(),
            VirtualPath::Root | VirtualPath::Study { .. } | VirtualPath::Series { .. } => None,
        }
        .ok_or_else(|| {
            ContentCacheError::Io(Arc::new(std::io::Error::from_raw_os_error(libc::EISDIR)))
        })?;

        let file_id = self.store.next_file();
        let path = self.store.staging.join(file_id.to_string());
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        debug!(%target, staging = %path.display(), "staged write");

        Ok(PendingUpload {
            target: target.clone(),
            parent,
            file_id,
            path,
            file: tokio::sync::Mutex::new(file),
            len: AtomicU64::new(0),
        })
    }

    /// Upload the staged bytes. On success the bytes become the `Ready` object of the stored
    /// instance; on failure the staging file is discarded.
    ///
    /// # Errors
    ///
    /// The remote failure, or a local failure reading the staged bytes.
    #[instrument(name = "ContentCache::commit", skip(self, upload), fields(target = %upload.target))]
    pub async fn commit(&self, upload: &PendingUpload) -> Result<InstanceId, ContentCacheError> {
        let result = self.upload(upload).await;
        if result.is_err() {
            self.discard(upload).await;
        }
        result
    }

    async fn upload(&self, upload: &PendingUpload) -> Result<InstanceId, ContentCacheError> {
        let data = upload.contents().await?;
        let start = self.store.removals.now();
        let stored = {
            let _permit = self
                .store
                .transfers
                .acquire()
                .await
                .map_err(|_| ContentCacheError::Aborted(upload.target.to_string()))?;
            self.remote.store_instance(&upload.parent, data).await?
        };

        let done = self.store.objects.join(upload.file_id.to_string());
        let adopted = async {
            tokio::fs::rename(&upload.path, &done).await?;
            CachedObject::open(done)
        }
        .await;
        match adopted {
            Ok(obj) => self
                .store
                .insert_ready(stored.clone(), Arc::new(obj), start),
            Err(e) => warn!(error = %e, "stored, but could not keep a local copy"),
        }
        Ok(stored)
    }

    /// Remove the staging file without uploading.
    pub async fn discard(&self, upload: &PendingUpload) {
        if let Err(e) = tokio::fs::remove_file(&upload.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %upload.path.display(), error = %e, "failed to discard staging file");
        }
    }
}
