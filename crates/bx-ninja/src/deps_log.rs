//! Binary append-only deps log.
//!
//! Stores, per primary output, the dependencies discovered from the
//! compiler's depfile plus the output mtime observed when they were
//! recorded. Paths are interned: a path record assigns the next id, and
//! deps records refer to ids. All integers little-endian.
//!
//! ```text
//! u32 magic "BXDP"
//! u32 version
//! records:
//!   u8 0: path record   { u32 len, bytes path }            -> next id
//!   u8 1: deps record   { u32 target_id, i64 mtime_ns,
//!                         u32 count, count x u32 dep_id }
//! ```
//!
//! A truncated tail (crash mid-append) is tolerated: parsing stops at
//! the first short record and the log is recompacted on the next save.

use std::collections::HashMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::LogError;

const MAGIC: u32 = 0x4258_4450;
const VERSION: u32 = 1;

const REC_PATH: u8 = 0;
const REC_DEPS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deps {
    pub mtime_ns: i64,
    pub deps: Vec<String>,
}

/// The deps log for one build directory.
pub struct DepsLog {
    path: Utf8PathBuf,
    ids: HashMap<String, u32>,
    paths: Vec<String>,
    deps: HashMap<u32, (i64, Vec<u32>)>,
    file: Option<fs::File>,
    needs_recompact: bool,
}

impl DepsLog {
    pub fn open(path: &Utf8Path) -> Result<Self, LogError> {
        let mut log = Self {
            path: path.to_owned(),
            ids: HashMap::new(),
            paths: Vec::new(),
            deps: HashMap::new(),
            file: None,
            needs_recompact: false,
        };
        let buf = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(LogError::io("read", path, e)),
        };
        if buf.len() < 8 {
            warn!(path = %path, "deps log too short, starting fresh");
            log.needs_recompact = true;
            return Ok(log);
        }
        if u32::from_le_bytes(buf[0..4].try_into().unwrap()) != MAGIC {
            return Err(LogError::Invalid {
                path: path.to_owned(),
                reason: "bad magic".to_string(),
            });
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version == 0 || version > VERSION {
            return Err(LogError::Invalid {
                path: path.to_owned(),
                reason: format!("unsupported version {version}"),
            });
        }

        let mut off = 8usize;
        while off < buf.len() {
            match log.parse_record(&buf, off) {
                Some(next) => off = next,
                None => {
                    warn!(path = %path, off, "truncated deps log record, dropping tail");
                    log.needs_recompact = true;
                    break;
                }
            }
        }
        debug!(path = %path, targets = log.deps.len(), paths = log.paths.len(), "loaded deps log");
        Ok(log)
    }

    fn parse_record(&mut self, buf: &[u8], mut off: usize) -> Option<usize> {
        let kind = *buf.get(off)?;
        off += 1;
        match kind {
            REC_PATH => {
                let len = read_u32(buf, &mut off)? as usize;
                let bytes = buf.get(off..off + len)?;
                off += len;
                let p = String::from_utf8(bytes.to_vec()).ok()?;
                let id = self.paths.len() as u32;
                self.ids.insert(p.clone(), id);
                self.paths.push(p);
                Some(off)
            }
            REC_DEPS => {
                let target = read_u32(buf, &mut off)?;
                let mtime_ns = read_i64(buf, &mut off)?;
                let count = read_u32(buf, &mut off)? as usize;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = read_u32(buf, &mut off)?;
                    // Validity: ids must have been interned already.
                    if id as usize >= self.paths.len() {
                        return None;
                    }
                    ids.push(id);
                }
                if target as usize >= self.paths.len() {
                    return None;
                }
                self.deps.insert(target, (mtime_ns, ids));
                Some(off)
            }
            _ => None,
        }
    }

    /// Recorded deps for a target, if any.
    pub fn get(&self, target: &str) -> Option<Deps> {
        let id = self.ids.get(target)?;
        let (mtime_ns, dep_ids) = self.deps.get(id)?;
        Some(Deps {
            mtime_ns: *mtime_ns,
            deps: dep_ids
                .iter()
                .map(|i| self.paths[*i as usize].clone())
                .collect(),
        })
    }

    pub fn targets(&self) -> usize {
        self.deps.len()
    }

    /// Record deps for a target. Writes nothing when the stored record
    /// is already identical.
    pub fn record(
        &mut self,
        target: &str,
        mtime_ns: i64,
        deps: &[String],
    ) -> Result<(), LogError> {
        if let Some(existing) = self.get(target) {
            if existing.mtime_ns == mtime_ns && existing.deps == deps {
                return Ok(());
            }
        }

        let mut buf = Vec::new();
        let target_id = self.intern(target, &mut buf);
        let dep_ids: Vec<u32> = deps.iter().map(|d| self.intern(d, &mut buf)).collect();

        buf.push(REC_DEPS);
        buf.extend_from_slice(&target_id.to_le_bytes());
        buf.extend_from_slice(&mtime_ns.to_le_bytes());
        buf.extend_from_slice(&(dep_ids.len() as u32).to_le_bytes());
        for id in &dep_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }

        self.append(&buf)?;
        self.deps.insert(target_id, (mtime_ns, dep_ids));
        Ok(())
    }

    fn intern(&mut self, path: &str, buf: &mut Vec<u8>) -> u32 {
        if let Some(&id) = self.ids.get(path) {
            return id;
        }
        let id = self.paths.len() as u32;
        self.ids.insert(path.to_string(), id);
        self.paths.push(path.to_string());
        buf.push(REC_PATH);
        buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
        buf.extend_from_slice(path.as_bytes());
        id
    }

    fn append(&mut self, record: &[u8]) -> Result<(), LogError> {
        if self.file.is_none() {
            let fresh = !self.path.as_std_path().exists();
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| LogError::io("open", &self.path, e))?;
            if fresh {
                file.write_all(&MAGIC.to_le_bytes())
                    .map_err(|e| LogError::io("write", &self.path, e))?;
                file.write_all(&VERSION.to_le_bytes())
                    .map_err(|e| LogError::io("write", &self.path, e))?;
            }
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .unwrap()
            .write_all(record)
            .map_err(|e| LogError::io("write", &self.path, e))
    }

    /// Rewrite the log from the in-memory state, dropping dead records
    /// and any damaged tail.
    pub fn recompact(&mut self) -> Result<(), LogError> {
        self.file = None;
        let old_deps: Vec<(String, i64, Vec<String>)> = {
            let mut v: Vec<_> = self
                .deps
                .iter()
                .map(|(target, (mtime, ids))| {
                    (
                        self.paths[*target as usize].clone(),
                        *mtime,
                        ids.iter().map(|i| self.paths[*i as usize].clone()).collect(),
                    )
                })
                .collect();
            v.sort();
            v
        };
        self.ids.clear();
        self.paths.clear();
        self.deps.clear();
        let tmp_path = Utf8PathBuf::from(format!("{}.tmp", self.path));
        let real_path = self.path.clone();
        self.path = tmp_path.clone();
        let _ = fs::remove_file(&tmp_path);
        for (target, mtime, deps) in &old_deps {
            self.record(target, *mtime, deps)?;
        }
        self.file = None;
        self.path = real_path;
        fs::rename(&tmp_path, &self.path).map_err(|e| LogError::io("rename", &self.path, e))?;
        self.needs_recompact = false;
        Ok(())
    }

    pub fn needs_recompact(&self) -> bool {
        self.needs_recompact
    }
}

fn read_u32(buf: &[u8], off: &mut usize) -> Option<u32> {
    let b = buf.get(*off..*off + 4)?;
    *off += 4;
    Some(u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_i64(buf: &[u8], off: &mut usize) -> Option<i64> {
    let b = buf.get(*off..*off + 8)?;
    *off += 8;
    Some(i64::from_le_bytes(b.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(".bx_deps")).unwrap()
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn record_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = temp_path(&dir);
        {
            let mut log = DepsLog::open(&path).unwrap();
            log.record("obj/apps.o", 100, &strs(&["apps/apps.cc", "apps/apps.h"]))
                .unwrap();
            log.record("obj/base.o", 200, &strs(&["base/base.cc", "apps/apps.h"]))
                .unwrap();
        }
        let log = DepsLog::open(&path).unwrap();
        assert_eq!(log.targets(), 2);
        let d = log.get("obj/apps.o").unwrap();
        assert_eq!(d.mtime_ns, 100);
        assert_eq!(d.deps, strs(&["apps/apps.cc", "apps/apps.h"]));
        let d = log.get("obj/base.o").unwrap();
        assert_eq!(d.deps, strs(&["base/base.cc", "apps/apps.h"]));
        assert!(log.get("obj/unknown.o").is_none());
    }

    #[test]
    fn rerecord_updates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = temp_path(&dir);
        let mut log = DepsLog::open(&path).unwrap();
        log.record("t.o", 1, &strs(&["a.h"])).unwrap();
        log.record("t.o", 2, &strs(&["a.h", "b.h"])).unwrap();
        drop(log);
        let log = DepsLog::open(&path).unwrap();
        let d = log.get("t.o").unwrap();
        assert_eq!(d.mtime_ns, 2);
        assert_eq!(d.deps, strs(&["a.h", "b.h"]));
    }

    #[test]
    fn identical_record_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = temp_path(&dir);
        let mut log = DepsLog::open(&path).unwrap();
        log.record("t.o", 1, &strs(&["a.h"])).unwrap();
        let size1 = fs::metadata(path.as_std_path()).unwrap().len();
        log.record("t.o", 1, &strs(&["a.h"])).unwrap();
        let size2 = fs::metadata(path.as_std_path()).unwrap().len();
        assert_eq!(size1, size2);
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = temp_path(&dir);
        let mut log = DepsLog::open(&path).unwrap();
        log.record("t.o", 1, &strs(&["a.h"])).unwrap();
        drop(log);
        // Simulate a crash mid-append.
        let mut buf = fs::read(path.as_std_path()).unwrap();
        buf.extend_from_slice(&[REC_DEPS, 0xff]);
        fs::write(path.as_std_path(), &buf).unwrap();

        let log = DepsLog::open(&path).unwrap();
        assert!(log.needs_recompact());
        assert_eq!(log.get("t.o").unwrap().deps, strs(&["a.h"]));
    }

    #[test]
    fn recompact_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = temp_path(&dir);
        let mut log = DepsLog::open(&path).unwrap();
        log.record("a.o", 1, &strs(&["x.h"])).unwrap();
        log.record("a.o", 2, &strs(&["x.h", "y.h"])).unwrap();
        log.record("b.o", 3, &strs(&["y.h"])).unwrap();
        log.recompact().unwrap();
        drop(log);
        let log = DepsLog::open(&path).unwrap();
        assert_eq!(log.targets(), 2);
        assert_eq!(log.get("a.o").unwrap().deps, strs(&["x.h", "y.h"]));
        assert_eq!(log.get("b.o").unwrap().mtime_ns, 3);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = temp_path(&dir);
        fs::write(path.as_std_path(), b"garbage!").unwrap();
        assert!(matches!(
            DepsLog::open(&path),
            Err(LogError::Invalid { .. })
        ));
    }
}
