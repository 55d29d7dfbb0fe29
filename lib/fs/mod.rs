//! The kernel-facing side: inode bookkeeping, open handles, the operation dispatcher and the
//! `fuser` adapter.

/// Bidirectional inode to path mapping.
pub mod bridge;
/// The operation dispatcher.
pub mod dispatcher;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`dispatcher::DicomFs`].
pub mod fuser;
/// Open file handles.
pub mod handles;

pub use dispatcher::{DicomFs, FsConfig};

use std::time::SystemTime;

use bitflags::bitflags;

use crate::remote::EntryKind;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The root directory's inode.
pub const ROOT_INO: InodeAddr = 1;

bitflags! {
    /// Unix permission bits of a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute (search for directories).
        const OTHER_EXECUTE = 0o001;
        /// Other: write.
        const OTHER_WRITE   = 0o002;
        /// Other: read.
        const OTHER_READ    = 0o004;
        /// Group: execute.
        const GROUP_EXECUTE = 0o010;
        /// Group: write.
        const GROUP_WRITE   = 0o020;
        /// Group: read.
        const GROUP_READ    = 0o040;
        /// Owner: execute.
        const OWNER_EXECUTE = 0o100;
        /// Owner: write.
        const OWNER_WRITE   = 0o200;
        /// Owner: read.
        const OWNER_READ    = 0o400;

        /// `rwxr-xr-x`, used for studies and series.
        const DIRECTORY = 0o755;
        /// `rw-r--r--`, used for instances.
        const FILE = 0o644;
    }
}

bitflags! {
    /// The `open(2)` flags the dispatcher looks at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Whether the access mode allows writing.
    #[must_use]
    pub fn is_write(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Whether the access mode allows reading.
    #[must_use]
    pub fn is_read(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }
}

/// Attributes of one node as served to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    /// Inode number.
    pub ino: InodeAddr,
    /// Directory or file.
    pub kind: EntryKind,
    /// Size in bytes. Zero for a file whose contents are not local yet.
    pub size: u64,
    /// Modification time.
    pub modified: SystemTime,
    /// Permission bits.
    pub perms: InodePerms,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number of the entry.
    pub ino: InodeAddr,
    /// Name within the directory.
    pub name: String,
    /// Directory or file.
    pub kind: EntryKind,
}

/// Filesystem statistics returned by [`DicomFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
