//! Deterministic binary encoding for wire messages.
//!
//! Digests are computed over these encodings, so the byte layout is
//! part of the cache-key contract: length-prefixed fields, little-endian
//! integers, fields in fixed order, repeated fields in the order the
//! message carries them (messages sort their repeated fields before
//! encoding where the wire contract requires canonical order).

use bx_digest::Digest;

use crate::{Action, Command};
use crate::merkle::{DirNode, FileNode, SymlinkNode};

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn put_digest(buf: &mut Vec<u8>, d: &Digest) {
    buf.extend_from_slice(&d.hash);
    put_u64(buf, d.size_bytes);
}

pub fn command(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(b"CMD1");
    put_u32(&mut buf, cmd.arguments.len() as u32);
    for a in &cmd.arguments {
        put_str(&mut buf, a);
    }
    put_u32(&mut buf, cmd.env.len() as u32);
    for (k, v) in &cmd.env {
        put_str(&mut buf, k);
        put_str(&mut buf, v);
    }
    put_u32(&mut buf, cmd.output_paths.len() as u32);
    for p in &cmd.output_paths {
        put_str(&mut buf, p);
    }
    put_u32(&mut buf, cmd.platform.len() as u32);
    for (k, v) in &cmd.platform {
        put_str(&mut buf, k);
        put_str(&mut buf, v);
    }
    put_str(&mut buf, &cmd.working_directory);
    buf
}

pub fn action(action: &Action) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(b"ACT1");
    put_digest(&mut buf, &action.command_digest);
    put_digest(&mut buf, &action.input_root_digest);
    put_u64(&mut buf, action.timeout_secs);
    buf.push(action.do_not_cache as u8);
    buf
}

/// Decode a [`Command`] encoded by [`command`]. Used by the loopback
/// backend; the production transport has real protobufs.
pub fn decode_command(buf: &[u8]) -> Option<Command> {
    let mut d = Reader { buf, off: 0 };
    if d.take(4)? != b"CMD1" {
        return None;
    }
    let mut cmd = Command::default();
    for _ in 0..d.u32()? {
        cmd.arguments.push(d.string()?);
    }
    for _ in 0..d.u32()? {
        cmd.env.push((d.string()?, d.string()?));
    }
    for _ in 0..d.u32()? {
        cmd.output_paths.push(d.string()?);
    }
    for _ in 0..d.u32()? {
        cmd.platform.push((d.string()?, d.string()?));
    }
    cmd.working_directory = d.string()?;
    Some(cmd)
}

/// Decode an [`Action`] encoded by [`action`].
pub fn decode_action(buf: &[u8]) -> Option<Action> {
    let mut d = Reader { buf, off: 0 };
    if d.take(4)? != b"ACT1" {
        return None;
    }
    Some(Action {
        command_digest: d.digest()?,
        input_root_digest: d.digest()?,
        timeout_secs: d.u64()?,
        do_not_cache: d.u8()? != 0,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return None;
        }
        let s = &self.buf[self.off..self.off + n];
        self.off += n;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }

    fn digest(&mut self) -> Option<Digest> {
        let hash: [u8; 32] = self.take(32)?.try_into().ok()?;
        let size_bytes = self.u64()?;
        Some(Digest { hash, size_bytes })
    }
}

/// Encode one Merkle directory node. Children must already be sorted by
/// name; the builder guarantees this.
pub fn directory(
    files: &[FileNode],
    dirs: &[DirNode],
    symlinks: &[SymlinkNode],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(b"DIR1");
    put_u32(&mut buf, files.len() as u32);
    for f in files {
        put_str(&mut buf, &f.name);
        put_digest(&mut buf, &f.digest);
        buf.push(f.is_executable as u8);
    }
    put_u32(&mut buf, dirs.len() as u32);
    for d in dirs {
        put_str(&mut buf, &d.name);
        put_digest(&mut buf, &d.digest);
    }
    put_u32(&mut buf, symlinks.len() as u32);
    for s in symlinks {
        put_str(&mut buf, &s.name);
        put_str(&mut buf, &s.target);
    }
    buf
}
