//! File entries held by the overlay filesystem.

use bx_digest::Digest;

/// Where an entry's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Entry reflects the local disk.
    Local,
    /// Entry was produced by a remote action; content may live only in
    /// the content store until flushed.
    Remote,
}

/// Metadata for a regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularEntry {
    /// Content digest. `size_bytes` is the file size.
    pub digest: Digest,
    /// Modification time, nanoseconds since epoch.
    pub mtime_ns: i64,
    pub executable: bool,
    /// Digest of the remote action that produced this file.
    /// Zero for source files and locally produced outputs.
    pub action_digest: Digest,
    /// Identity of the command that produced this file, for cross-run
    /// rebuild detection.
    pub cmd_hash: Vec<u8>,
    /// Set when a disk refresh observed different content than cached.
    pub is_changed: bool,
    /// Last time this entry was refreshed from disk (ns since epoch).
    /// Zero forces the next stat to re-verify disk.
    pub updated_time: i64,
}

/// Metadata for a symlink. The target is recorded verbatim; it may be
/// relative to the link's directory or absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkEntry {
    pub target: String,
    pub mtime_ns: i64,
    pub updated_time: i64,
}

/// One node in the overlay. Directories synthesize their mtime from
/// child changes, so they carry only that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    Regular(RegularEntry),
    Symlink(SymlinkEntry),
    Directory { mtime_ns: i64 },
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileEntry::Directory { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileEntry::Symlink(_))
    }

    /// Symlink target, empty for non-symlinks.
    pub fn target(&self) -> &str {
        match self {
            FileEntry::Symlink(s) => &s.target,
            _ => "",
        }
    }

    pub fn mtime_ns(&self) -> i64 {
        match self {
            FileEntry::Regular(r) => r.mtime_ns,
            FileEntry::Symlink(s) => s.mtime_ns,
            FileEntry::Directory { mtime_ns } => *mtime_ns,
        }
    }

    /// Content digest; empty for symlinks and directories.
    pub fn digest(&self) -> Digest {
        match self {
            FileEntry::Regular(r) => r.digest,
            _ => Digest::empty(),
        }
    }
}

/// A stat result: the entry plus the absolute slash-form path it was
/// found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Absolute, forward-slash path of the node.
    pub path: String,
    pub entry: FileEntry,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.entry.is_dir()
    }

    /// Symlink target, empty for non-symlinks.
    pub fn target(&self) -> &str {
        self.entry.target()
    }
}

/// A symlink-following stat result. `visited` holds every symlink node
/// traversed on the way to `info`, in traversal order.
#[derive(Debug, Clone)]
pub struct StatResult {
    pub info: FileInfo,
    pub visited: Vec<FileInfo>,
}

/// A directory listing element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub entry: FileEntry,
}
