//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`DicomFs`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, instrument};

use super::dispatcher::DicomFs;
use super::{NodeAttr, OpenFlags};
use crate::cache::{Clock, SystemClock};
use crate::remote::{EntryKind, RemoteStore};

/// Convert an I/O error to the corresponding errno value for FUSE replies.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    })
}

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

// ReplyStatfs is excluded: statfs cannot fail.
impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
    fuser::ReplyEmpty,
);

/// Extension trait on `Result<T, std::io::Error>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, std::io::Error> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
            }
        }
    }
}

const BLOCK_SIZE: u32 = 4096;

fn kind_to_fuser(kind: EntryKind) -> fuser::FileType {
    match kind {
        EntryKind::Directory => fuser::FileType::Directory,
        EntryKind::File => fuser::FileType::RegularFile,
    }
}

/// Convert a [`NodeAttr`] to the fuser-specific `FileAttr`.
fn node_to_fuser_attr(attr: &NodeAttr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.modified,
        mtime: attr.modified,
        ctime: attr.modified,
        crtime: attr.modified,
        kind: kind_to_fuser(attr.kind),
        perm: attr.perms.bits(),
        nlink: match attr.kind {
            EntryKind::Directory => 2,
            EntryKind::File => 1,
        },
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Bridges [`DicomFs`] to the [`fuser::Filesystem`] trait.
///
/// `fuser` calls in on its session thread; every callback blocks on the dispatcher using the
/// runtime handle. The dispatcher itself is shared so the daemon and tests can reach it too.
pub struct FuserAdapter<R, C = SystemClock> {
    fs: Arc<DicomFs<R, C>>,
    runtime: tokio::runtime::Handle,
}

impl<R: RemoteStore, C: Clock> FuserAdapter<R, C> {
    /// Entries and attributes are never cached by the kernel; the dispatcher owns caching.
    const TTL: Duration = Duration::ZERO;

    /// How long the kernel may remember that a name does not exist.
    const NEGATIVE_TTL: Duration = Duration::from_secs(4);

    /// Create a new adapter around `fs`.
    pub fn new(fs: Arc<DicomFs<R, C>>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }

    /// An entry with inode 0, which the kernel caches as a negative lookup.
    fn negative_entry() -> fuser::FileAttr {
        node_to_fuser_attr(&NodeAttr {
            ino: 0,
            kind: EntryKind::File,
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
            perms: super::InodePerms::empty(),
            uid: 0,
            gid: 0,
        })
    }
}

impl<R: RemoteStore, C: Clock> fuser::Filesystem for FuserAdapter<R, C> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        match self.runtime.block_on(self.fs.lookup(parent, name)) {
            Ok(attr) => {
                let f_attr = node_to_fuser_attr(&attr);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::TTL, &f_attr, 0);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!("replying negative entry");
                reply.entry(&Self::NEGATIVE_TTL, &Self::negative_entry(), 0);
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
            }
        }
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.runtime
            .block_on(self.fs.getattr(ino))
            .fuse_reply(reply, |attr, reply| {
                let attr = node_to_fuser_attr(&attr);
                debug!(?attr, "replying...");
                reply.attr(&Self::TTL, &attr);
            });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(
            self, _req, _mode, _uid, _gid, _atime, _mtime, _ctime, _crtime, _chgtime, _bkuptime,
            _flags, reply
        )
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let fs = &self.fs;
        self.runtime
            .block_on(async {
                match size {
                    Some(size) => fs.truncate(ino, fh, size).await,
                    None => fs.getattr(ino).await,
                }
            })
            .fuse_reply(reply, |attr, reply| {
                reply.attr(&Self::TTL, &node_to_fuser_attr(&attr));
            });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let entries = match self.runtime.block_on(self.fs.readdir(ino)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(io_to_errno(&e));
                return;
            }
        };

        let Ok(skip) = usize::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        for (i, entry) in entries.iter().enumerate().skip(skip) {
            let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                error!("Directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };

            debug!(name = %entry.name, ino = entry.ino, "adding entry to reply...");
            if reply.add(entry.ino, next, kind_to_fuser(entry.kind), &entry.name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.runtime
            .block_on(self.fs.open(ino, flags))
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
            });
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _mode, _umask, flags, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.runtime
            .block_on(self.fs.create(parent, name, flags))
            .fuse_reply(reply, |(attr, fh), reply| {
                debug!(handle = fh, ino = attr.ino, "replying...");
                reply.created(
                    &Self::TTL,
                    &node_to_fuser_attr(&attr),
                    0,
                    fh,
                    fuser::consts::FOPEN_DIRECT_IO,
                );
            });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.runtime
            .block_on(self.fs.read(fh, offset, size))
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, fh, offset, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.runtime
            .block_on(self.fs.write(fh, offset, data))
            .fuse_reply(reply, |written, reply| {
                debug!(written, "replying...");
                reply.written(written);
            });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _fh, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, _fh, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, fh, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(self.fs.release(fh))
            .fuse_reply(reply, |(), reply| {
                debug!("replying ok");
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, _mode, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.runtime
            .block_on(self.fs.mkdir(parent, name))
            .fuse_reply(reply, |attr, reply| {
                reply.entry(&Self::TTL, &node_to_fuser_attr(&attr), 0);
            });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(self.fs.unlink(parent, name))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(self.fs.rmdir(parent, name))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.fs.statfs();
        debug!(?stats, "replying...");
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.block_size,
            stats.max_filename_length,
            0,
        );
    }
}
