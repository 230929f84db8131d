//! Persisted overlay state.
//!
//! The state file is a flat, length-prefixed binary dump of every overlay
//! node plus the list of paths whose content was known absent at build
//! end. All integers are little-endian.
//!
//! ```text
//! u32 magic "HFSS"
//! u32 version
//! u64 entry_count
//! entry_count x {
//!   u32 path_len, path bytes
//!   u8  kind (0 regular | 1 symlink | 2 directory)
//!   regular:  32B digest hash, u64 size, i64 mtime_ns, u8 executable,
//!             u32 target_len (always 0), 32B action hash, u64 action size,
//!             u32 cmd_hash_len, cmd_hash bytes
//!   symlink:  u32 target_len, target bytes, i64 mtime_ns
//! }
//! u32 missing_count; missing_count x { u32 len, path bytes }
//! ```
//!
//! Saving is atomic (temp file + rename), so a mid-build crash leaves the
//! previous state file intact. On load every entry's `updated_time` is
//! reset so the first stat per path re-verifies disk.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use bx_digest::Digest;

use crate::entry::{FileEntry, RegularEntry, SymlinkEntry};
use crate::error::FsError;
use crate::HashFS;

pub const STATE_MAGIC: u32 = 0x4846_5353;
pub const STATE_VERSION: u32 = 1;

const KIND_REGULAR: u8 = 0;
const KIND_SYMLINK: u8 = 1;
const KIND_DIRECTORY: u8 = 2;

impl HashFS {
    /// Serialize the overlay to `path`, atomically.
    pub fn save(&self, path: &Utf8Path) -> Result<(), FsError> {
        let entries = self.snapshot();
        let missing = self.missing_paths();

        let mut buf = Vec::with_capacity(entries.len() * 96 + 64);
        put_u32(&mut buf, STATE_MAGIC);
        put_u32(&mut buf, STATE_VERSION);
        put_u64(&mut buf, entries.len() as u64);
        for (p, entry) in &entries {
            put_bytes(&mut buf, p.as_bytes());
            match entry {
                FileEntry::Regular(r) => {
                    buf.push(KIND_REGULAR);
                    buf.extend_from_slice(&r.digest.hash);
                    put_u64(&mut buf, r.digest.size_bytes);
                    put_i64(&mut buf, r.mtime_ns);
                    buf.push(r.executable as u8);
                    put_u32(&mut buf, 0); // target_len, none for regular
                    buf.extend_from_slice(&r.action_digest.hash);
                    put_u64(&mut buf, r.action_digest.size_bytes);
                    put_bytes(&mut buf, &r.cmd_hash);
                }
                FileEntry::Symlink(s) => {
                    buf.push(KIND_SYMLINK);
                    put_bytes(&mut buf, s.target.as_bytes());
                    put_i64(&mut buf, s.mtime_ns);
                }
                FileEntry::Directory { .. } => {
                    buf.push(KIND_DIRECTORY);
                }
            }
        }
        put_u32(&mut buf, missing.len() as u32);
        for m in &missing {
            put_bytes(&mut buf, m.as_bytes());
        }

        let parent = path.parent().unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent).map_err(|e| FsError::io("mkdir", parent, e))?;
        let tmp = Utf8PathBuf::from(format!("{}.tmp.{}", path, std::process::id()));
        fs::write(&tmp, &buf).map_err(|e| FsError::io("write", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| FsError::io("rename", path, e))?;
        info!(path = %path, entries = entries.len(), missing = missing.len(), "saved fs state");
        Ok(())
    }

    /// Load a previously saved overlay into this (empty) filesystem.
    ///
    /// Missing state file is not an error: the overlay starts cold.
    pub fn load(&self, path: &Utf8Path) -> Result<(), FsError> {
        let buf = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "no fs state file");
                return Ok(());
            }
            Err(e) => return Err(FsError::io("read", path, e)),
        };
        let mut dec = Dec { buf: &buf, off: 0 };
        if dec.u32()? != STATE_MAGIC {
            return Err(FsError::InvalidState {
                reason: format!("{}: bad magic", path),
            });
        }
        let version = dec.u32()?;
        if version == 0 || version > STATE_VERSION {
            return Err(FsError::InvalidState {
                reason: format!("{}: unsupported version {}", path, version),
            });
        }
        let count = dec.u64()?;
        for _ in 0..count {
            let p = dec.string()?;
            let kind = dec.u8()?;
            let entry = match kind {
                KIND_REGULAR => {
                    let hash = dec.hash()?;
                    let size = dec.u64()?;
                    let mtime_ns = dec.i64()?;
                    let executable = dec.u8()? != 0;
                    let target_len = dec.u32()?;
                    if target_len != 0 {
                        return Err(FsError::InvalidState {
                            reason: format!("{}: regular entry with target", p),
                        });
                    }
                    let action_hash = dec.hash()?;
                    let action_size = dec.u64()?;
                    let cmd_hash = dec.bytes()?.to_vec();
                    FileEntry::Regular(RegularEntry {
                        digest: Digest {
                            hash,
                            size_bytes: size,
                        },
                        mtime_ns,
                        executable,
                        action_digest: Digest {
                            hash: action_hash,
                            size_bytes: action_size,
                        },
                        cmd_hash,
                        is_changed: false,
                        updated_time: 0,
                    })
                }
                KIND_SYMLINK => {
                    let target = dec.string()?;
                    let mtime_ns = dec.i64()?;
                    FileEntry::Symlink(SymlinkEntry {
                        target,
                        mtime_ns,
                        updated_time: 0,
                    })
                }
                KIND_DIRECTORY => FileEntry::Directory { mtime_ns: 0 },
                k => {
                    return Err(FsError::InvalidState {
                        reason: format!("{}: unknown entry kind {}", p, k),
                    })
                }
            };
            self.install_loaded(&p, entry);
        }
        let missing_count = dec.u32()?;
        let mut missing = Vec::with_capacity(missing_count as usize);
        for _ in 0..missing_count {
            missing.push(dec.string()?);
        }
        self.restore_missing(missing);
        info!(path = %path, entries = count, "loaded fs state");
        Ok(())
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}

struct Dec<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Dec<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FsError> {
        if self.off + n > self.buf.len() {
            return Err(FsError::InvalidState {
                reason: format!("truncated at offset {}", self.off),
            });
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, FsError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FsError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FsError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, FsError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn hash(&mut self) -> Result<[u8; 32], FsError> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    fn bytes(&mut self) -> Result<&'a [u8], FsError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, FsError> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec()).map_err(|_| FsError::InvalidState {
            reason: format!("non-utf8 path at offset {}", self.off),
        })
    }
}
