#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dicom_fuse::cache::{
    Clock, ContentCache, ContentCacheConfig, ManualClock, MetaCache, MetaTtls,
};
use dicom_fuse::fs::{DicomFs, FsConfig, ROOT_INO};
use dicom_fuse::path::{InstanceId, VirtualPath};
use dicom_fuse::remote::{EntryKind, RemoteAttributes, RemoteError, RemoteStore};
use tokio::sync::Semaphore;

/// The remote operations the mock counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Attributes,
    Fetch,
    Store,
    Delete,
    Probe,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub list: AtomicUsize,
    pub attributes: AtomicUsize,
    pub fetch: AtomicUsize,
    pub store: AtomicUsize,
    pub delete: AtomicUsize,
    pub probe: AtomicUsize,
}

impl Calls {
    fn counter(&self, op: Op) -> &AtomicUsize {
        match op {
            Op::List => &self.list,
            Op::Attributes => &self.attributes,
            Op::Fetch => &self.fetch,
            Op::Store => &self.store,
            Op::Delete => &self.delete,
            Op::Probe => &self.probe,
        }
    }

    pub fn total(&self) -> usize {
        [
            Op::List,
            Op::Attributes,
            Op::Fetch,
            Op::Store,
            Op::Delete,
            Op::Probe,
        ]
        .into_iter()
        .map(|op| self.counter(op).load(Ordering::SeqCst))
        .sum()
    }
}

/// An in-memory store. Directories map to `None`, instances to their bytes.
#[derive(Debug)]
pub struct MockRemote {
    tree: Mutex<BTreeMap<VirtualPath, Option<Bytes>>>,
    failures: Mutex<HashMap<Op, VecDeque<RemoteError>>>,
    pub calls: Calls,
    gated: AtomicBool,
    gate: Semaphore,
    next_uid: AtomicU64,
    /// When set, stored instances land in this `(study, series)` instead of the written-to one.
    redirect: Mutex<Option<(String, String)>>,
}

pub fn instance_id(study: &str, series: &str, instance: &str) -> InstanceId {
    InstanceId {
        study: study.to_owned(),
        series: series.to_owned(),
        instance: instance.to_owned(),
    }
}

pub fn path(p: &str) -> VirtualPath {
    VirtualPath::parse(p).unwrap()
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            tree: Mutex::default(),
            failures: Mutex::default(),
            calls: Calls::default(),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            next_uid: AtomicU64::new(1),
            redirect: Mutex::default(),
        }
    }

    /// Add an instance and the directories above it.
    pub fn with_instance(self, study: &str, series: &str, instance: &str, data: &[u8]) -> Self {
        self.add_instance(&instance_id(study, series, instance), Bytes::copy_from_slice(data));
        self
    }

    pub fn add_instance(&self, id: &InstanceId, data: Bytes) {
        let leaf = VirtualPath::Instance(id.clone());
        let mut tree = self.tree.lock().unwrap();
        for dir in leaf.ancestors() {
            if dir != VirtualPath::Root {
                tree.insert(dir, None);
            }
        }
        tree.insert(leaf, Some(data));
    }

    pub fn contains(&self, path: &VirtualPath) -> bool {
        self.tree.lock().unwrap().contains_key(path)
    }

    /// Make the next call of `op` fail with `err`. Queued failures are used in order.
    pub fn fail_next(&self, op: Op, err: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Hold every fetch until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }

    pub fn redirect_stores_to(&self, study: &str, series: &str) {
        *self.redirect.lock().unwrap() = Some((study.to_owned(), series.to_owned()));
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls.counter(op).load(Ordering::SeqCst)
    }

    fn enter(&self, op: Op) -> Result<(), RemoteError> {
        self.calls.counter(op).fetch_add(1, Ordering::SeqCst);
        self.take_failure(op)
    }

    fn take_failure(&self, op: Op) -> Result<(), RemoteError> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn children(&self, dir: &VirtualPath) -> Option<Vec<String>> {
        let tree = self.tree.lock().unwrap();
        if *dir != VirtualPath::Root && !matches!(tree.get(dir), Some(None)) {
            return None;
        }
        Some(
            tree.keys()
                .filter(|p| p.parent().as_ref() == Some(dir))
                .filter_map(VirtualPath::file_name)
                .collect(),
        )
    }
}

impl RemoteStore for MockRemote {
    async fn list_children(&self, path: &VirtualPath) -> Result<Vec<String>, RemoteError> {
        self.enter(Op::List)?;
        self.children(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn get_attributes(&self, path: &VirtualPath) -> Result<RemoteAttributes, RemoteError> {
        self.enter(Op::Attributes)?;
        let tree = self.tree.lock().unwrap();
        match tree.get(path) {
            Some(None) => Ok(RemoteAttributes::bare(EntryKind::Directory)),
            Some(Some(data)) => Ok(RemoteAttributes {
                kind: EntryKind::File,
                size: Some(data.len() as u64),
                modified: None,
            }),
            None => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    async fn fetch_instance(&self, id: &InstanceId) -> Result<Bytes, RemoteError> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        self.take_failure(Op::Fetch)?;
        let key = VirtualPath::Instance(id.clone());
        match self.tree.lock().unwrap().get(&key) {
            Some(Some(data)) => Ok(data.clone()),
            Some(None) | None => Err(RemoteError::NotFound(key.to_string())),
        }
    }

    async fn store_instance(
        &self,
        parent: &VirtualPath,
        data: Bytes,
    ) -> Result<InstanceId, RemoteError> {
        self.enter(Op::Store)?;
        let VirtualPath::Series { study, series } = parent else {
            return Err(RemoteError::Unknown(format!("cannot store under {parent}")));
        };
        let (study, series) = self
            .redirect
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| (study.clone(), series.clone()));
        let uid = format!("9.9.{}", self.next_uid.fetch_add(1, Ordering::SeqCst));
        let id = instance_id(&study, &series, &uid);
        self.add_instance(&id, data);
        Ok(id)
    }

    async fn delete_resource(&self, path: &VirtualPath) -> Result<(), RemoteError> {
        self.enter(Op::Delete)?;
        let mut tree = self.tree.lock().unwrap();
        if tree.remove(path).is_none() {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        tree.retain(|p, _| !path.contains(p));
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.enter(Op::Probe)
    }
}

pub fn fs_config() -> FsConfig {
    FsConfig {
        uid: 1000,
        gid: 1000,
        enable_deletion: true,
    }
}

pub async fn content_cache(
    remote: &Arc<MockRemote>,
    root: &Path,
    capacity: usize,
) -> ContentCache<MockRemote> {
    ContentCache::new(
        Arc::clone(remote),
        &ContentCacheConfig {
            root: root.to_path_buf(),
            capacity,
            max_transfers: 4,
        },
    )
    .await
    .unwrap()
}

/// A dispatcher over `remote` on the system clock, with default TTLs.
pub async fn make_fs(
    remote: &Arc<MockRemote>,
    root: &Path,
    config: FsConfig,
) -> Arc<DicomFs<MockRemote>> {
    let meta = MetaCache::new(Arc::clone(remote), MetaTtls::default());
    let content = content_cache(remote, root, 16).await;
    Arc::new(DicomFs::new(Arc::clone(remote), meta, content, config))
}

/// A dispatcher over `remote` whose metadata cache runs on `clock`.
pub async fn make_fs_with_clock(
    remote: &Arc<MockRemote>,
    root: &Path,
    ttls: MetaTtls,
    clock: ManualClock,
) -> Arc<DicomFs<MockRemote, ManualClock>> {
    let meta = MetaCache::with_clock(Arc::clone(remote), ttls, clock);
    let content = content_cache(remote, root, 16).await;
    Arc::new(DicomFs::new(Arc::clone(remote), meta, content, fs_config()))
}

/// Resolve a slash separated path to an inode by walking lookups from the root.
pub async fn resolve<C: Clock>(fs: &DicomFs<MockRemote, C>, p: &str) -> u64 {
    let mut ino = ROOT_INO;
    for segment in p.split('/').filter(|s| !s.is_empty()) {
        ino = fs.lookup(ino, segment.as_ref()).await.unwrap().ino;
    }
    ino
}

pub async fn names<C: Clock>(fs: &DicomFs<MockRemote, C>, ino: u64) -> Vec<String> {
    let mut names: Vec<String> = fs
        .readdir(ino)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    names
}

/// Poll `cond` until it holds, or panic after a second.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not hold within 1 second");
}
