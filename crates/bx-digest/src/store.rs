//! Local content-addressed blob store.
//!
//! Blobs live under `<root>/blobs/sha256/<hh>/<hex>` where `hh` is the
//! first two hex characters of the hash. Writes are atomic (temp file +
//! rename), so a successful put is immediately visible to concurrent
//! readers. A small LRU of recently inserted digests answers repeated
//! `exists` checks without touching disk.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest as _, Sha256};

use crate::Digest;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(Digest),

    #[error("store i/o failed: {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(op: &'static str, path: &Utf8Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_owned(),
            source,
        }
    }
}

/// Capacity of the recently-inserted digest LRU.
const RECENT_LRU_CAPACITY: usize = 1024;

/// Fixed-capacity LRU set of digests.
///
/// Recency is a monotonically increasing tick; eviction scans for the
/// minimum, which is fine at this capacity.
struct RecentDigests {
    ticks: HashMap<Digest, u64>,
    next_tick: u64,
}

impl RecentDigests {
    fn new() -> Self {
        Self {
            ticks: HashMap::with_capacity(RECENT_LRU_CAPACITY),
            next_tick: 0,
        }
    }

    fn insert(&mut self, d: Digest) {
        if self.ticks.len() >= RECENT_LRU_CAPACITY && !self.ticks.contains_key(&d) {
            if let Some(oldest) = self
                .ticks
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(d, _)| *d)
            {
                self.ticks.remove(&oldest);
            }
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.ticks.insert(d, tick);
    }

    fn contains(&mut self, d: &Digest) -> bool {
        let tick = self.next_tick;
        match self.ticks.get_mut(d) {
            Some(t) => {
                *t = tick;
                self.next_tick += 1;
                true
            }
            None => false,
        }
    }
}

/// Local content-addressed store of blob bytes.
pub struct ContentStore {
    root: Utf8PathBuf,
    recent: Mutex<RecentDigests>,
    /// Digests with a put in flight; concurrent puts of the same digest
    /// wait for the first writer instead of racing on the temp file.
    in_flight: Mutex<HashMap<Digest, ()>>,
    in_flight_cv: Condvar,
    next_tmp: AtomicU64,
}

impl ContentStore {
    /// Open (or create) a store rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let store = Self {
            root,
            recent: Mutex::new(RecentDigests::new()),
            in_flight: Mutex::new(HashMap::new()),
            in_flight_cv: Condvar::new(),
            next_tmp: AtomicU64::new(1),
        };
        for dir in [store.blobs_dir(), store.tmp_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io("mkdir", &dir, e))?;
        }
        Ok(store)
    }

    fn blobs_dir(&self) -> Utf8PathBuf {
        self.root.join("blobs/sha256")
    }

    fn tmp_dir(&self) -> Utf8PathBuf {
        self.root.join("tmp")
    }

    fn blob_path(&self, d: &Digest) -> Utf8PathBuf {
        let hex = d.to_hex();
        self.blobs_dir().join(&hex[..2]).join(&hex)
    }

    /// Store a blob, returns its digest.
    pub fn put(&self, data: &[u8]) -> Result<Digest, StoreError> {
        let d = Digest::from_bytes(data);
        if self.probe(&d) {
            return Ok(d);
        }
        let guard = self.begin_put(d);
        if !guard.already_present {
            let dest = self.blob_path(&d);
            self.atomic_write(&dest, data)?;
        }
        self.note_recent(d);
        Ok(d)
    }

    /// Hash a file on disk into the store, streaming its contents.
    ///
    /// If `known` is supplied the file is linked in under that digest
    /// without re-hashing (used when HashFS already holds a fresh digest
    /// for an unchanged file).
    pub fn put_file(
        &self,
        path: &Utf8Path,
        known: Option<Digest>,
    ) -> Result<Digest, StoreError> {
        if let Some(d) = known {
            if self.probe(&d) {
                return Ok(d);
            }
        }
        let mut f = fs::File::open(path).map_err(|e| StoreError::io("open", path, e))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let tmp = self.tmp_path();
        {
            let mut out =
                fs::File::create(&tmp).map_err(|e| StoreError::io("create", &tmp, e))?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = f.read(&mut buf).map_err(|e| StoreError::io("read", path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])
                    .map_err(|e| StoreError::io("write", &tmp, e))?;
                size += n as u64;
            }
        }
        let d = Digest {
            hash: hasher.finalize().into(),
            size_bytes: size,
        };
        let guard = self.begin_put(d);
        if guard.already_present {
            let _ = fs::remove_file(&tmp);
        } else {
            let dest = self.blob_path(&d);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io("mkdir", parent, e))?;
            }
            fs::rename(&tmp, &dest).map_err(|e| StoreError::io("rename", &dest, e))?;
        }
        self.note_recent(d);
        Ok(d)
    }

    /// Open a blob for reading. Fails `NotFound` if absent locally; the
    /// caller decides whether to fetch from the remote backend.
    pub fn open(&self, d: &Digest) -> Result<fs::File, StoreError> {
        if d.is_zero() {
            // Empty digest always reads as empty; hand back an empty temp
            // file so the caller gets a uniform Reader.
            let tmp = self.tmp_path();
            fs::File::create(&tmp).map_err(|e| StoreError::io("create", &tmp, e))?;
            let f = fs::File::open(&tmp).map_err(|e| StoreError::io("open", &tmp, e))?;
            let _ = fs::remove_file(&tmp);
            return Ok(f);
        }
        let path = self.blob_path(d);
        match fs::File::open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(*d))
            }
            Err(e) => Err(StoreError::io("open", &path, e)),
        }
    }

    /// Read a whole blob into memory.
    pub fn read(&self, d: &Digest) -> Result<Vec<u8>, StoreError> {
        let mut f = self.open(d)?;
        let mut buf = Vec::with_capacity(d.size_bytes as usize);
        let path = self.blob_path(d);
        f.read_to_end(&mut buf)
            .map_err(|e| StoreError::io("read", &path, e))?;
        Ok(buf)
    }

    /// Whether the blob is present locally.
    pub fn exists(&self, d: &Digest) -> bool {
        if d.is_zero() {
            return true;
        }
        self.probe(d) || self.blob_path(d).exists()
    }

    fn probe(&self, d: &Digest) -> bool {
        self.recent.lock().unwrap().contains(d)
    }

    fn note_recent(&self, d: Digest) {
        self.recent.lock().unwrap().insert(d);
    }

    fn tmp_path(&self) -> Utf8PathBuf {
        let n = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        self.tmp_dir()
            .join(format!("put-{}-{}", std::process::id(), n))
    }

    fn atomic_write(&self, dest: &Utf8Path, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("mkdir", parent, e))?;
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, data).map_err(|e| StoreError::io("write", &tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| StoreError::io("rename", dest, e))?;
        Ok(())
    }

    fn begin_put(&self, d: Digest) -> PutGuard<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        while in_flight.contains_key(&d) {
            in_flight = self.in_flight_cv.wait(in_flight).unwrap();
        }
        // Either the earlier writer finished (blob now on disk) or we are
        // the first writer for this digest.
        let already_present = self.blob_path(&d).exists();
        if !already_present {
            in_flight.insert(d, ());
        }
        PutGuard {
            store: self,
            digest: d,
            already_present,
        }
    }
}

struct PutGuard<'a> {
    store: &'a ContentStore,
    digest: Digest,
    already_present: bool,
}

impl Drop for PutGuard<'_> {
    fn drop(&mut self) {
        if !self.already_present {
            let mut in_flight = self.store.in_flight.lock().unwrap();
            in_flight.remove(&self.digest);
            self.store.in_flight_cv.notify_all();
        }
    }
}
