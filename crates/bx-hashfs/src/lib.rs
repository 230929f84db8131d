//! In-memory content-addressed overlay filesystem.
//!
//! HashFS caches stat, digest, symlink, and generated-file state across a
//! build and across runs. It is consulted for every input/output reference
//! during a build:
//!
//! - `stat` never silently resolves symlinks. A symlink met *inside* the
//!   requested path surfaces as [`FsError::Symlink`] so the caller can
//!   record both the link and the resolved target.
//! - Disk is touched lazily: an entry refreshed after the current build
//!   epoch is authoritative and stat stays in memory.
//! - Generated outputs are installed with [`HashFS::update`]; their
//!   content may live only in the content store until flushed.
//! - The whole overlay persists to a state file at build end and reloads
//!   at startup (see [`state`]).

mod entry;
mod error;
pub mod paths;
pub mod state;

pub use entry::{DirEntry, FileEntry, FileInfo, RegularEntry, Source, StatResult, SymlinkEntry};
pub use error::FsError;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Read;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use camino::Utf8PathBuf;
use sha2::{Digest as _, Sha256};
use tracing::warn;

use bx_digest::{ContentStore, Digest};

/// Maximum number of symlinks followed before giving up with
/// [`FsError::Loop`].
pub const MAX_SYMLINKS: usize = 40;

/// A file or symlink node.
struct Leaf {
    entry: FileEntry,
    src: Source,
}

/// A directory node. Children are guarded by this node's own lock, so
/// parallel lookups in disjoint subtrees never contend.
struct DirNode {
    state: RwLock<DirState>,
}

struct DirState {
    children: HashMap<String, Node>,
    mtime_ns: i64,
}

#[derive(Clone)]
enum Node {
    Dir(Arc<DirNode>),
    Leaf(Arc<Mutex<Leaf>>),
}

impl DirNode {
    fn new(mtime_ns: i64) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(DirState {
                children: HashMap::new(),
                mtime_ns,
            }),
        })
    }
}

/// Options for constructing a [`HashFS`].
pub struct Options {
    pub store: Arc<ContentStore>,
}

/// The overlay filesystem.
pub struct HashFS {
    root: Arc<DirNode>,
    store: Arc<ContentStore>,
    /// Entries refreshed at or after this instant are authoritative.
    build_epoch_ns: AtomicI64,
    /// Paths whose content we know to be absent; persisted so the next
    /// run re-checks them.
    missing: Mutex<BTreeSet<String>>,
}

impl HashFS {
    pub fn new(opts: Options) -> Self {
        Self {
            root: DirNode::new(0),
            store: opts.store,
            build_epoch_ns: AtomicI64::new(0),
            missing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Mark the start of a build. Entries refreshed before this instant
    /// will be re-verified against disk on their next stat.
    pub fn set_build_epoch(&self, epoch_ns: i64) {
        self.build_epoch_ns.store(epoch_ns, Ordering::SeqCst);
    }

    /// Current wall clock in nanoseconds since epoch.
    pub fn now_ns() -> i64 {
        jiff::Timestamp::now().as_nanosecond() as i64
    }

    // ------------------------------------------------------------------
    // stat family
    // ------------------------------------------------------------------

    /// Stat without following symlinks.
    ///
    /// A symlink as the *final* component is returned as its own entry.
    /// A symlink met earlier in the path surfaces as
    /// [`FsError::Symlink`] with the link's path and target.
    pub fn stat(&self, root: &str, name: &str) -> Result<FileInfo, FsError> {
        self.stat_abs(&paths::canon_join(root, name))
    }

    /// Stat following symlinks (both intermediate and final), recording
    /// every symlink node traversed.
    pub fn stat_follow(&self, root: &str, name: &str) -> Result<StatResult, FsError> {
        let mut name = paths::canon_join(root, name);
        let mut visited = Vec::new();
        for _ in 0..MAX_SYMLINKS {
            match self.stat_abs(&name) {
                Ok(fi) if fi.target().is_empty() => {
                    return Ok(StatResult { info: fi, visited });
                }
                Ok(fi) => {
                    let next = paths::resolve_symlink(&fi.path, fi.target());
                    visited.push(fi);
                    name = next;
                }
                Err(FsError::Symlink { path, target }) => {
                    let rest = name[path.len()..].trim_start_matches('/').to_string();
                    // Record the intermediate link itself.
                    let link_fi = self.stat_abs(&path)?;
                    visited.push(link_fi);
                    let resolved = paths::resolve_symlink(&path, &target);
                    name = if rest.is_empty() {
                        resolved
                    } else {
                        paths::normalize(&format!("{}/{}", resolved, rest))
                    };
                }
                Err(e) => return Err(e),
            }
        }
        Err(FsError::Loop { path: name })
    }

    fn stat_abs(&self, abs: &str) -> Result<FileInfo, FsError> {
        if abs == "/" {
            let st = self.root.state.read().unwrap();
            return Ok(FileInfo {
                path: "/".to_string(),
                entry: FileEntry::Directory {
                    mtime_ns: st.mtime_ns,
                },
            });
        }
        let dir = self.lookup_dir(abs, LookupMode::Disk)?;
        let name = paths::base(abs);

        if let Some(node) = dir.state.read().unwrap().children.get(name).cloned() {
            return match node {
                Node::Dir(d) => Ok(FileInfo {
                    path: abs.to_string(),
                    entry: FileEntry::Directory {
                        mtime_ns: d.state.read().unwrap().mtime_ns,
                    },
                }),
                Node::Leaf(leaf) => self.revalidate(abs, &dir, &leaf),
            };
        }

        // Not in the overlay yet; probe disk.
        match self.probe_disk(abs)? {
            Some(node) => {
                let fi = match &node {
                    Node::Dir(d) => FileInfo {
                        path: abs.to_string(),
                        entry: FileEntry::Directory {
                            mtime_ns: d.state.read().unwrap().mtime_ns,
                        },
                    },
                    Node::Leaf(leaf) => FileInfo {
                        path: abs.to_string(),
                        entry: leaf.lock().unwrap().entry.clone(),
                    },
                };
                let mut st = dir.state.write().unwrap();
                let mtime = fi.entry.mtime_ns();
                st.children.entry(name.to_string()).or_insert(node);
                if mtime > st.mtime_ns {
                    st.mtime_ns = mtime;
                }
                Ok(fi)
            }
            None => Err(FsError::NotFound {
                path: abs.to_string(),
            }),
        }
    }

    /// Re-verify a cached leaf against disk if it is older than the build
    /// epoch. Remote-sourced entries are authoritative without disk.
    fn revalidate(
        &self,
        abs: &str,
        parent: &Arc<DirNode>,
        leaf: &Arc<Mutex<Leaf>>,
    ) -> Result<FileInfo, FsError> {
        let epoch = self.build_epoch_ns.load(Ordering::SeqCst);
        let mut l = leaf.lock().unwrap();
        let (stale, src) = match &l.entry {
            FileEntry::Regular(r) => (r.updated_time < epoch, l.src),
            FileEntry::Symlink(s) => (s.updated_time < epoch, l.src),
            FileEntry::Directory { .. } => (false, l.src),
        };
        if !stale || src == Source::Remote {
            return Ok(FileInfo {
                path: abs.to_string(),
                entry: l.entry.clone(),
            });
        }

        match disk_entry(abs) {
            Ok(Some(DiskEntry::Symlink { target, mtime_ns })) => {
                let changed = l.entry.target() != target;
                l.entry = FileEntry::Symlink(SymlinkEntry {
                    target,
                    mtime_ns,
                    updated_time: Self::now_ns(),
                });
                if changed {
                    tracing::debug!(path = abs, "symlink retargeted on disk");
                }
                Ok(FileInfo {
                    path: abs.to_string(),
                    entry: l.entry.clone(),
                })
            }
            Ok(Some(DiskEntry::Dir { mtime_ns })) => {
                // A file was replaced by a directory; swap the node kind.
                drop(l);
                let node = Node::Dir(DirNode::new(mtime_ns));
                let mut st = parent.state.write().unwrap();
                st.children.insert(paths::base(abs).to_string(), node);
                Ok(FileInfo {
                    path: abs.to_string(),
                    entry: FileEntry::Directory { mtime_ns },
                })
            }
            Ok(Some(DiskEntry::File(meta))) => {
                let unchanged = match &l.entry {
                    FileEntry::Regular(r) => {
                        r.mtime_ns == meta.mtime_ns && r.digest.size_bytes == meta.size
                    }
                    _ => false,
                };
                if unchanged {
                    if let FileEntry::Regular(r) = &mut l.entry {
                        r.updated_time = Self::now_ns();
                    }
                } else {
                    let digest = digest_file(abs)?;
                    let prior = l.entry.digest();
                    l.entry = FileEntry::Regular(RegularEntry {
                        digest,
                        mtime_ns: meta.mtime_ns,
                        executable: meta.executable,
                        action_digest: Digest::empty(),
                        cmd_hash: Vec::new(),
                        is_changed: prior != digest,
                        updated_time: Self::now_ns(),
                    });
                    l.src = Source::Local;
                }
                Ok(FileInfo {
                    path: abs.to_string(),
                    entry: l.entry.clone(),
                })
            }
            Ok(None) => {
                drop(l);
                let mut st = parent.state.write().unwrap();
                st.children.remove(paths::base(abs));
                st.mtime_ns = st.mtime_ns.max(Self::now_ns());
                drop(st);
                self.note_missing(abs);
                Err(FsError::NotFound {
                    path: abs.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // read family
    // ------------------------------------------------------------------

    /// Read file contents, following symlinks up to [`MAX_SYMLINKS`].
    pub fn read_file(&self, root: &str, name: &str) -> Result<Vec<u8>, FsError> {
        let st = self.stat_follow(root, name)?;
        match &st.info.entry {
            FileEntry::Regular(r) => self.read_regular(&st.info.path, r),
            FileEntry::Directory { .. } => Err(FsError::io(
                "read",
                Utf8PathBuf::from(&st.info.path),
                std::io::Error::other("is a directory"),
            )),
            FileEntry::Symlink(_) => unreachable!("stat_follow resolved symlinks"),
        }
    }

    fn read_regular(&self, abs: &str, r: &RegularEntry) -> Result<Vec<u8>, FsError> {
        match fs::read(abs) {
            Ok(buf) => {
                // Trust disk only when it still matches the cached size;
                // generated entries may not be flushed yet.
                if buf.len() as u64 == r.digest.size_bytes {
                    return Ok(buf);
                }
                self.store.read(&r.digest).map_err(FsError::from)
            }
            Err(_) => self.store.read(&r.digest).map_err(FsError::from),
        }
    }

    /// Read directory entries. A symlink anywhere in the path (final
    /// component included) surfaces as [`FsError::Symlink`].
    pub fn read_dir(&self, root: &str, name: &str) -> Result<Vec<DirEntry>, FsError> {
        let abs = paths::canon_join(root, name);
        let fi = self.stat_abs(&abs)?;
        match &fi.entry {
            FileEntry::Directory { .. } => {}
            FileEntry::Symlink(s) => {
                return Err(FsError::Symlink {
                    path: abs,
                    target: s.target.clone(),
                })
            }
            FileEntry::Regular(_) => return Err(FsError::NotADirectory { path: abs }),
        }

        // Merge disk names into the overlay, then list the overlay.
        if let Ok(rd) = fs::read_dir(&abs) {
            for dent in rd.flatten() {
                if let Some(name) = dent.file_name().to_str() {
                    let child = paths::normalize(&format!("{}/{}", abs, name));
                    // Populates the overlay as a side effect; errors here
                    // mean a racing unlink, which listing tolerates.
                    let _ = self.stat_abs(&child);
                }
            }
        }

        let dir = self.lookup_dir(&format!("{}/x", abs), LookupMode::Disk)?;
        let st = dir.state.read().unwrap();
        let mut out = Vec::with_capacity(st.children.len());
        for (name, node) in &st.children {
            let entry = match node {
                Node::Dir(d) => FileEntry::Directory {
                    mtime_ns: d.state.read().unwrap().mtime_ns,
                },
                Node::Leaf(l) => l.lock().unwrap().entry.clone(),
            };
            out.push(DirEntry {
                name: name.clone(),
                entry,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Return the target of a symlink.
    pub fn read_link(&self, root: &str, name: &str) -> Result<String, FsError> {
        let fi = self.stat(root, name)?;
        match fi.entry {
            FileEntry::Symlink(s) => Ok(s.target),
            _ => Err(FsError::io(
                "readlink",
                Utf8PathBuf::from(fi.path),
                std::io::Error::other("not a symlink"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // mutation
    // ------------------------------------------------------------------

    /// Install or replace the node at `path`.
    ///
    /// Intermediate directories are created in the overlay. Parent
    /// directory mtimes are raised to at least the new entry's mtime.
    pub fn update(
        &self,
        root: &str,
        path: &str,
        mut entry: FileEntry,
        src: Source,
    ) -> Result<(), FsError> {
        let abs = paths::canon_join(root, path);
        let now = Self::now_ns();
        match &mut entry {
            FileEntry::Regular(r) => {
                if r.updated_time == 0 {
                    r.updated_time = now;
                }
            }
            FileEntry::Symlink(s) => {
                if s.updated_time == 0 {
                    s.updated_time = now;
                }
            }
            FileEntry::Directory { .. } => {}
        }
        let mtime = entry.mtime_ns();
        let ancestors = self.lookup_dir_path(&abs, LookupMode::Create)?;
        let dir = ancestors.last().expect("root ancestor always present");
        {
            let mut st = dir.state.write().unwrap();
            let node = match &entry {
                FileEntry::Directory { mtime_ns } => Node::Dir(DirNode::new(*mtime_ns)),
                _ => Node::Leaf(Arc::new(Mutex::new(Leaf { entry, src }))),
            };
            st.children.insert(paths::base(&abs).to_string(), node);
        }
        for anc in &ancestors {
            let mut st = anc.state.write().unwrap();
            if mtime > st.mtime_ns {
                st.mtime_ns = mtime;
            }
        }
        self.missing.lock().unwrap().remove(&abs);
        Ok(())
    }

    /// Remove `path` from the overlay. Used when a rule is no longer
    /// valid; the next stat re-reads disk.
    pub fn forget(&self, root: &str, path: &str) {
        let abs = paths::canon_join(root, path);
        if let Ok(dir) = self.lookup_dir(&abs, LookupMode::OverlayOnly) {
            let mut st = dir.state.write().unwrap();
            if st.children.remove(paths::base(&abs)).is_some() {
                st.mtime_ns = st.mtime_ns.max(Self::now_ns());
            }
        }
    }

    /// Record that `path`'s content is known to be absent.
    pub fn note_missing(&self, path: &str) {
        self.missing
            .lock()
            .unwrap()
            .insert(paths::normalize(path));
    }

    pub(crate) fn missing_paths(&self) -> Vec<String> {
        self.missing.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn restore_missing(&self, paths: Vec<String>) {
        let mut m = self.missing.lock().unwrap();
        m.extend(paths);
    }

    // ------------------------------------------------------------------
    // executor support
    // ------------------------------------------------------------------

    /// Collect entries for Merkle-tree construction, keyed by exec-root
    /// relative path.
    ///
    /// Symlinks whose targets stay under the exec root are returned as
    /// symlink entries; ones escaping the root are resolved to their real
    /// entry. Every regular entry's digest is guaranteed resolvable via
    /// the content store after this call (entries of remote origin are
    /// resolvable via the backend instead).
    pub fn entries(
        &self,
        root: &str,
        names: &[String],
    ) -> Result<Vec<(String, FileEntry)>, FsError> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let abs = paths::canon_join(root, name);
            let fi = match self.stat_abs(&abs) {
                Ok(fi) => fi,
                Err(FsError::Symlink { .. }) => {
                    // Intermediate symlink: resolve the whole path.
                    self.stat_follow(root, name)?.info
                }
                Err(e) => return Err(e),
            };
            let (path, entry) = match &fi.entry {
                FileEntry::Symlink(s) => {
                    let resolved = paths::resolve_symlink(&fi.path, &s.target);
                    if paths::rel_under(root, &resolved).is_some() {
                        (fi.path.clone(), fi.entry.clone())
                    } else {
                        // Out of exec root: present the resolved node.
                        let st = self.stat_follow(root, name)?;
                        (fi.path.clone(), st.info.entry)
                    }
                }
                _ => (fi.path.clone(), fi.entry.clone()),
            };
            if let FileEntry::Regular(r) = &entry {
                if r.action_digest.is_zero() && !self.store.exists(&r.digest) {
                    self.store
                        .put_file(camino::Utf8Path::new(&path), Some(r.digest))?;
                }
            }
            let rel = paths::rel_under(root, &path)
                .unwrap_or(&path)
                .to_string();
            out.push((rel, entry));
        }
        Ok(out)
    }

    /// Materialize entries whose content lives only in the content store
    /// onto the real filesystem (inputs of a local execution, or outputs
    /// at build end).
    pub fn flush(&self, root: &str, names: &[String]) -> Result<(), FsError> {
        for name in names {
            let abs = paths::canon_join(root, name);
            let fi = match self.stat_abs(&abs) {
                Ok(fi) => fi,
                Err(FsError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            match &fi.entry {
                FileEntry::Regular(r) => {
                    if fs::metadata(&abs)
                        .map(|m| m.len() == r.digest.size_bytes)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    let data = self.store.read(&r.digest)?;
                    let path = Utf8PathBuf::from(&abs);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| FsError::io("mkdir", parent, e))?;
                    }
                    fs::write(&path, &data).map_err(|e| FsError::io("write", &path, e))?;
                    #[cfg(unix)]
                    if r.executable {
                        use std::os::unix::fs::PermissionsExt;
                        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                            .map_err(|e| FsError::io("chmod", &path, e))?;
                    }
                    self.mark_local(&abs);
                }
                FileEntry::Symlink(s) => {
                    #[cfg(unix)]
                    if fs::symlink_metadata(&abs).is_err() {
                        let path = Utf8PathBuf::from(&abs);
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)
                                .map_err(|e| FsError::io("mkdir", parent, e))?;
                        }
                        std::os::unix::fs::symlink(&s.target, &path)
                            .map_err(|e| FsError::io("symlink", &path, e))?;
                    }
                }
                FileEntry::Directory { .. } => {}
            }
        }
        Ok(())
    }

    fn mark_local(&self, abs: &str) {
        if let Ok(dir) = self.lookup_dir(abs, LookupMode::OverlayOnly) {
            let st = dir.state.read().unwrap();
            if let Some(Node::Leaf(leaf)) = st.children.get(paths::base(abs)) {
                let mut l = leaf.lock().unwrap();
                l.src = Source::Local;
                if let FileEntry::Regular(r) = &mut l.entry {
                    r.updated_time = Self::now_ns();
                }
            }
        }
    }

    /// Every intermediate symlink under `root` on the way to `name`,
    /// followed by the fully resolved name. Used to record accessed
    /// paths.
    pub fn expand_symlinks(&self, root: &str, name: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rel = name.to_string();
        'resolve: for _ in 0..MAX_SYMLINKS {
            let elems: Vec<String> = rel.split('/').map(str::to_string).collect();
            for i in 0..elems.len() {
                let prefix = elems[..=i].join("/");
                let fi = match self.stat(root, &prefix) {
                    Ok(fi) => fi,
                    Err(FsError::Symlink { path, target }) => {
                        // stat resolves lazily; treat like a symlink node
                        // at `path`.
                        let rel_link = paths::rel_under(root, &path)
                            .unwrap_or(&path)
                            .to_string();
                        names.push(rel_link.clone());
                        let resolved = paths::resolve_symlink(&path, &target);
                        match paths::rel_under(root, &resolved) {
                            Some(r) => {
                                let rest = elems[i + 1..].join("/");
                                rel = if rest.is_empty() {
                                    r.to_string()
                                } else {
                                    paths::normalize(&format!("{}/{}", r, rest))
                                };
                                continue 'resolve;
                            }
                            None => break 'resolve,
                        }
                    }
                    Err(e) => {
                        warn!(name, prefix = %prefix, err = %e, "no intermediate dir");
                        break 'resolve;
                    }
                };
                if !fi.target().is_empty() {
                    names.push(prefix.clone());
                    let resolved = paths::resolve_symlink(&fi.path, fi.target());
                    match paths::rel_under(root, &resolved) {
                        Some(r) => {
                            let rest = elems[i + 1..].join("/");
                            rel = if rest.is_empty() {
                                r.to_string()
                            } else {
                                paths::normalize(&format!("{}/{}", r, rest))
                            };
                            continue 'resolve;
                        }
                        None => break 'resolve,
                    }
                }
            }
            break;
        }
        names.push(rel);
        names
    }

    /// Exec-root-relative paths visited by a [`stat_follow`], including
    /// the final node, excluding anything escaping the root.
    pub fn visited_paths(&self, root: &str, st: &StatResult) -> Vec<String> {
        let mut out = Vec::with_capacity(st.visited.len() + 1);
        for fi in st.visited.iter().chain(std::iter::once(&st.info)) {
            if let Some(rel) = paths::rel_under(root, &fi.path) {
                out.push(rel.to_string());
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // tree walking
    // ------------------------------------------------------------------

    /// Locate the parent directory node of `abs`, returning all walked
    /// ancestors (root first).
    fn lookup_dir_path(
        &self,
        abs: &str,
        mode: LookupMode,
    ) -> Result<Vec<Arc<DirNode>>, FsError> {
        let comps: Vec<&str> = abs
            .strip_prefix('/')
            .unwrap_or(abs)
            .split('/')
            .collect();
        let mut ancestors = vec![self.root.clone()];
        let mut prefix = String::new();
        for comp in &comps[..comps.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(comp);
            let cur = ancestors.last().unwrap().clone();
            let existing = cur.state.read().unwrap().children.get(*comp).cloned();
            let next = match existing {
                Some(Node::Dir(d)) => d,
                Some(Node::Leaf(leaf)) => {
                    let l = leaf.lock().unwrap();
                    return match &l.entry {
                        FileEntry::Symlink(s) => Err(FsError::Symlink {
                            path: prefix.clone(),
                            target: s.target.clone(),
                        }),
                        _ => Err(FsError::NotADirectory {
                            path: prefix.clone(),
                        }),
                    };
                }
                None => {
                    let node = match mode {
                        LookupMode::OverlayOnly => {
                            return Err(FsError::NotFound {
                                path: prefix.clone(),
                            })
                        }
                        LookupMode::Disk | LookupMode::Create => self.probe_disk(&prefix)?,
                    };
                    let node = match node {
                        Some(n) => n,
                        None if mode == LookupMode::Create => Node::Dir(DirNode::new(0)),
                        None => {
                            return Err(FsError::NotFound {
                                path: prefix.clone(),
                            })
                        }
                    };
                    match &node {
                        Node::Leaf(leaf) => {
                            let l = leaf.lock().unwrap();
                            let err = match &l.entry {
                                FileEntry::Symlink(s) => FsError::Symlink {
                                    path: prefix.clone(),
                                    target: s.target.clone(),
                                },
                                _ => FsError::NotADirectory {
                                    path: prefix.clone(),
                                },
                            };
                            drop(l);
                            let mut st = cur.state.write().unwrap();
                            st.children.entry(comp.to_string()).or_insert(node.clone());
                            return Err(err);
                        }
                        Node::Dir(d) => {
                            let d = d.clone();
                            let mut st = cur.state.write().unwrap();
                            match st.children.entry(comp.to_string()) {
                                std::collections::hash_map::Entry::Occupied(e) => {
                                    match e.get() {
                                        Node::Dir(existing) => existing.clone(),
                                        Node::Leaf(_) => d,
                                    }
                                }
                                std::collections::hash_map::Entry::Vacant(e) => {
                                    e.insert(Node::Dir(d.clone()));
                                    d
                                }
                            }
                        }
                    }
                }
            };
            ancestors.push(next);
        }
        Ok(ancestors)
    }

    fn lookup_dir(&self, abs: &str, mode: LookupMode) -> Result<Arc<DirNode>, FsError> {
        Ok(self.lookup_dir_path(abs, mode)?.last().unwrap().clone())
    }

    /// Probe the real filesystem for `abs` without following symlinks.
    fn probe_disk(&self, abs: &str) -> Result<Option<Node>, FsError> {
        match disk_entry(abs)? {
            Some(DiskEntry::Dir { mtime_ns }) => Ok(Some(Node::Dir(DirNode::new(mtime_ns)))),
            Some(DiskEntry::Symlink { target, mtime_ns }) => {
                Ok(Some(Node::Leaf(Arc::new(Mutex::new(Leaf {
                    entry: FileEntry::Symlink(SymlinkEntry {
                        target,
                        mtime_ns,
                        updated_time: Self::now_ns(),
                    }),
                    src: Source::Local,
                })))))
            }
            Some(DiskEntry::File(meta)) => {
                let digest = digest_file(abs)?;
                Ok(Some(Node::Leaf(Arc::new(Mutex::new(Leaf {
                    entry: FileEntry::Regular(RegularEntry {
                        digest,
                        mtime_ns: meta.mtime_ns,
                        executable: meta.executable,
                        action_digest: Digest::empty(),
                        cmd_hash: Vec::new(),
                        is_changed: false,
                        updated_time: Self::now_ns(),
                    }),
                    src: Source::Local,
                })))))
            }
            None => Ok(None),
        }
    }

    /// Flat snapshot of every overlay node, sorted by path.
    pub(crate) fn snapshot(&self) -> Vec<(String, FileEntry)> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), self.root.clone())];
        while let Some((prefix, dir)) = stack.pop() {
            let st = dir.state.read().unwrap();
            for (name, node) in &st.children {
                let path = format!("{}/{}", prefix, name);
                match node {
                    Node::Dir(d) => {
                        out.push((
                            path.clone(),
                            FileEntry::Directory {
                                mtime_ns: d.state.read().unwrap().mtime_ns,
                            },
                        ));
                        stack.push((path, d.clone()));
                    }
                    Node::Leaf(leaf) => {
                        out.push((path, leaf.lock().unwrap().entry.clone()));
                    }
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Install a loaded entry without disk probing. `updated_time` is
    /// reset so the first stat per path re-verifies disk.
    pub(crate) fn install_loaded(&self, path: &str, mut entry: FileEntry) {
        match &mut entry {
            FileEntry::Regular(r) => {
                r.updated_time = 0;
            }
            FileEntry::Symlink(s) => {
                s.updated_time = 0;
            }
            FileEntry::Directory { .. } => {}
        }
        let src = match &entry {
            FileEntry::Regular(r) if !r.action_digest.is_zero() => Source::Remote,
            _ => Source::Local,
        };
        // Create strictly in the overlay; loading must not touch disk.
        if let Ok(ancestors) = self.lookup_dir_path_overlay_create(path) {
            let dir = ancestors.last().unwrap();
            let mut st = dir.state.write().unwrap();
            let node = match &entry {
                FileEntry::Directory { mtime_ns } => Node::Dir(DirNode::new(*mtime_ns)),
                _ => Node::Leaf(Arc::new(Mutex::new(Leaf { entry, src }))),
            };
            st.children.entry(paths::base(path).to_string()).or_insert(node);
        }
    }

    fn lookup_dir_path_overlay_create(
        &self,
        abs: &str,
    ) -> Result<Vec<Arc<DirNode>>, FsError> {
        let comps: Vec<&str> = abs
            .strip_prefix('/')
            .unwrap_or(abs)
            .split('/')
            .collect();
        let mut ancestors = vec![self.root.clone()];
        for comp in &comps[..comps.len().saturating_sub(1)] {
            let cur = ancestors.last().unwrap().clone();
            let mut st = cur.state.write().unwrap();
            let next = match st
                .children
                .entry(comp.to_string())
                .or_insert_with(|| Node::Dir(DirNode::new(0)))
            {
                Node::Dir(d) => d.clone(),
                Node::Leaf(_) => {
                    return Err(FsError::NotADirectory {
                        path: abs.to_string(),
                    })
                }
            };
            drop(st);
            ancestors.push(next);
        }
        Ok(ancestors)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LookupMode {
    /// Overlay only; never touch disk.
    OverlayOnly,
    /// Fill missing nodes from disk; missing on disk is an error.
    Disk,
    /// Fill from disk, creating overlay directories where disk has none.
    Create,
}

enum DiskEntry {
    File(DiskFileMeta),
    Dir { mtime_ns: i64 },
    Symlink { target: String, mtime_ns: i64 },
}

struct DiskFileMeta {
    size: u64,
    mtime_ns: i64,
    executable: bool,
}

fn mtime_ns_of(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn disk_entry(abs: &str) -> Result<Option<DiskEntry>, FsError> {
    let meta = match fs::symlink_metadata(abs) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::io("lstat", Utf8PathBuf::from(abs), e)),
    };
    let mtime_ns = mtime_ns_of(&meta);
    if meta.file_type().is_symlink() {
        let target = fs::read_link(abs)
            .map_err(|e| FsError::io("readlink", Utf8PathBuf::from(abs), e))?;
        let target = target.to_string_lossy().into_owned();
        return Ok(Some(DiskEntry::Symlink { target, mtime_ns }));
    }
    if meta.is_dir() {
        return Ok(Some(DiskEntry::Dir { mtime_ns }));
    }
    #[cfg(unix)]
    let executable = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    };
    #[cfg(not(unix))]
    let executable = false;
    Ok(Some(DiskEntry::File(DiskFileMeta {
        size: meta.len(),
        mtime_ns,
        executable,
    })))
}

/// Streaming sha256 of a file's contents.
fn digest_file(abs: &str) -> Result<Digest, FsError> {
    let mut f =
        fs::File::open(abs).map_err(|e| FsError::io("open", Utf8PathBuf::from(abs), e))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| FsError::io("read", Utf8PathBuf::from(abs), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(Digest {
        hash: hasher.finalize().into(),
        size_bytes: size,
    })
}

#[cfg(test)]
mod tests;
