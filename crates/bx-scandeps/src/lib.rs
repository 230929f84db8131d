//! Dependency scanner for C/C++/Obj-C compiles.
//!
//! Given a compile's include configuration, derives the exact set of
//! files and directories the compiler would read, without invoking it.
//! The scanner lexes a preprocessor subset (see [`lexer`]): comments are
//! skipped, `#include`/`#import` in quote, angle, and macro-valued forms
//! are followed, and `#define`/`#undef` are tracked just enough to
//! evaluate macro-valued includes. Conditionals are not evaluated; both
//! branches are scanned.
//!
//! Results are exec-root relative, deduplicated, and sorted. For every
//! resolved file the scanner also records the file's directory and the
//! include search directory that matched. Symlinks encountered during
//! resolution are recorded as both the link and the resolved path.
//!
//! Include directories covered by an input-deps group (key `dir` or
//! `dir:headers`) are opaque: an include satisfied by the group's file
//! list is marked seen and contributes nothing to the result, because
//! the whole group is already declared as a step input.

pub mod flags;
mod lexer;
mod path_table;

pub use flags::ScanDepsParams;
pub use lexer::{Directive, Include};
pub use path_table::{PathTable, SeenSet};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;

use bx_hashfs::{paths, FileEntry, FsError, HashFS};

/// Inputs for one scan: the compile's sources and include configuration.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Source files.
    pub sources: Vec<String>,
    /// Forced includes (`-include`).
    pub includes: Vec<String>,
    /// Include directories, in search order. An empty string means the
    /// exec root itself.
    pub dirs: Vec<String>,
    /// Framework directories (`-F`).
    pub frameworks: Vec<String>,
    /// Sysroot and toolchain directories; resolved only through
    /// input-deps groups.
    pub sysroots: Vec<String>,
    /// Macros defined on the command line; only include-shaped values
    /// (`"path"` / `<path>`) matter.
    pub defines: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// The dependency scanner. One instance serves a whole build; per-scan
/// state lives on the stack.
pub struct Scandeps {
    fs: Arc<HashFS>,
    input_deps: HashMap<String, Vec<String>>,
    table: Mutex<PathTable>,
}

enum DirRule {
    /// Search by stat; record the dir when it matches (if non-empty).
    Plain(String),
    /// Covered by an input-deps group; match against the member list.
    Opaque { dir: String, members: Vec<String> },
}

struct Scan<'a> {
    sd: &'a Scandeps,
    root: &'a str,
    dirs: Vec<DirRule>,
    frameworks: Vec<String>,
    results: BTreeSet<String>,
    seen: SeenSet,
    /// Macro name -> accumulated include-shaped values. Values are never
    /// removed: an `#undef` may sit in a branch the compiler does not
    /// take.
    macros: HashMap<String, Vec<String>>,
    /// Macro name -> files whose `#include MACRO` must be re-evaluated
    /// when a new value appears, with each file's directory.
    macro_users: HashMap<String, Vec<(String, String)>>,
    worklist: VecDeque<String>,
}

impl Scandeps {
    /// `input_deps` maps a group label (`dir` or `dir:headers`) to its
    /// member paths; members may themselves be labels.
    pub fn new(fs: Arc<HashFS>, input_deps: HashMap<String, Vec<String>>) -> Self {
        Self {
            fs,
            input_deps,
            table: Mutex::new(PathTable::new()),
        }
    }

    /// Scan `req` against `exec_root`, returning the sorted, deduplicated
    /// set of exec-root-relative files and directories the compile reads.
    pub fn scan(&self, exec_root: &str, req: &Request) -> Result<Vec<String>, ScanError> {
        let mut dirs = Vec::with_capacity(req.dirs.len() + req.sysroots.len());
        for d in &req.dirs {
            dirs.push(self.dir_rule(d, false));
        }
        for s in &req.sysroots {
            // Sysroots resolve only via their input-deps group.
            if let DirRule::Opaque { dir, members } = self.dir_rule(s, true) {
                dirs.push(DirRule::Opaque { dir, members });
            }
        }

        let mut scan = Scan {
            sd: self,
            root: exec_root,
            dirs,
            frameworks: req.frameworks.clone(),
            results: BTreeSet::new(),
            seen: SeenSet::new(),
            macros: HashMap::new(),
            macro_users: HashMap::new(),
            worklist: VecDeque::new(),
        };

        for (name, value) in &req.defines {
            scan.macros
                .entry(name.clone())
                .or_default()
                .push(value.clone());
        }

        for inc in &req.includes {
            scan.resolve(&Include::Quote(inc.clone()), "")?;
        }
        for src in &req.sources {
            let rel = paths::normalize(src);
            if let Some(accessed) = scan.try_file(&rel)? {
                scan.enqueue(accessed);
            } else {
                warn!(source = %src, "source not found");
            }
        }

        while let Some(file) = scan.worklist.pop_front() {
            scan.scan_file(&file)?;
        }

        Ok(scan.results.into_iter().collect())
    }

    fn dir_rule(&self, dir: &str, sysroot: bool) -> DirRule {
        let stripped = dir.strip_suffix(":headers").unwrap_or(dir);
        let label = if self.input_deps.contains_key(dir) {
            Some(dir)
        } else {
            None
        };
        let headers_label = format!("{}:headers", stripped);
        let members = match label {
            Some(l) => Some(self.expand_group(l)),
            None if self.input_deps.contains_key(headers_label.as_str()) => {
                Some(self.expand_group(&headers_label))
            }
            None => None,
        };
        match members {
            Some(members) => DirRule::Opaque {
                dir: stripped.to_string(),
                members,
            },
            None if sysroot => DirRule::Plain(String::new()),
            None => DirRule::Plain(dir.to_string()),
        }
    }

    /// Expand a group label recursively; members may be further labels.
    fn expand_group(&self, label: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![label.to_string()];
        while let Some(l) = stack.pop() {
            if !visited.insert(l.clone()) {
                continue;
            }
            match self.input_deps.get(&l) {
                Some(members) => stack.extend(members.iter().cloned()),
                None => out.push(l),
            }
        }
        out
    }
}

impl Scan<'_> {
    fn record(&mut self, rel: &str) {
        if rel.is_empty() {
            return;
        }
        self.results.insert(rel.to_string());
    }

    fn rel(&self, abs: &str) -> Option<String> {
        paths::rel_under(self.root, abs).map(str::to_string)
    }

    fn enqueue(&mut self, accessed: String) {
        let id = self.sd.table.lock().unwrap().intern(&accessed);
        if self.seen.insert(id) {
            self.worklist.push_back(accessed);
        }
    }

    /// Stat a candidate exec-root-relative path; on success record the
    /// file, its directory, and any symlinks traversed, and return the
    /// accessed path.
    fn try_file(&mut self, cand: &str) -> Result<Option<String>, ScanError> {
        let cand = paths::normalize(cand);
        let st = match self.sd.fs.stat_follow(self.root, &cand) {
            Ok(st) => st,
            Err(FsError::NotFound { .. }) => return Ok(None),
            Err(FsError::Loop { path }) => {
                warn!(path = %path, "symlink loop during include resolution");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if !matches!(st.info.entry, FileEntry::Regular(_)) {
            return Ok(None);
        }

        self.record(&cand);
        self.record(&rel_parent(&cand));

        if !st.visited.is_empty() {
            for v in &st.visited {
                if let Some(rel) = self.rel(&v.path) {
                    self.record(&rel);
                }
            }
            // The final component itself may have been a link; then the
            // resolved file is a real dependency too. Otherwise only the
            // resolved directory is.
            let last = st.visited.last().unwrap();
            let file_level = paths::base(&last.path) == paths::base(&st.info.path);
            if file_level {
                if let Some(rel) = self.rel(&st.info.path) {
                    self.record(&rel);
                }
                let link_dir = paths::parent(&last.path);
                if self.rel(link_dir) != Some(rel_parent(&cand)) {
                    if let Some(rel) = self.rel(link_dir) {
                        self.record(&rel);
                    }
                }
            } else if let Some(rel) = self.rel(paths::parent(&st.info.path)) {
                self.record(&rel);
            }
        }
        Ok(Some(cand))
    }

    fn scan_file(&mut self, accessed: &str) -> Result<(), ScanError> {
        let buf = match self.sd.fs.read_file(self.root, accessed) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(file = accessed, err = %e, "failed to read for scanning");
                return Ok(());
            }
        };
        let src = String::from_utf8_lossy(&buf);
        let from_dir = rel_parent(accessed);
        let from_dir = if from_dir == "." { String::new() } else { from_dir };

        for directive in lexer::scan_directives(&src) {
            match directive {
                Directive::Include(Include::Macro(name)) => {
                    let users = self.macro_users.entry(name.clone()).or_default();
                    let key = (accessed.to_string(), from_dir.clone());
                    if !users.contains(&key) {
                        users.push(key);
                    }
                    let values = self.macros.get(&name).cloned().unwrap_or_default();
                    for value in values {
                        if let Some(inc) = lexer::parse_include(&value) {
                            self.resolve(&inc, &from_dir)?;
                        }
                    }
                }
                Directive::Include(inc) => {
                    self.resolve(&inc, &from_dir)?;
                }
                Directive::Define { name, value } => {
                    let values = self.macros.entry(name.clone()).or_default();
                    if values.contains(&value) {
                        continue;
                    }
                    values.push(value.clone());
                    // Re-evaluate every file that already used this macro
                    // in an include.
                    let users = self.macro_users.get(&name).cloned().unwrap_or_default();
                    if let Some(inc) = lexer::parse_include(&value) {
                        for (_, user_dir) in users {
                            self.resolve(&inc, &user_dir)?;
                        }
                    }
                }
                Directive::Undef(_) => {
                    // Values are kept: the undef may be in a branch the
                    // compiler does not take.
                }
            }
        }
        Ok(())
    }

    fn resolve(&mut self, inc: &Include, from_dir: &str) -> Result<(), ScanError> {
        let (text, quote) = match inc {
            Include::Quote(t) => (t.as_str(), true),
            Include::Angle(t) => (t.as_str(), false),
            Include::Macro(_) => unreachable!("macro includes expand before resolve"),
        };

        if text.starts_with('/') {
            return self.resolve_absolute(text);
        }

        // Quote form searches the including file's directory first.
        if quote {
            let cand = join_rel(from_dir, text);
            if let Some(accessed) = self.try_file(&cand)? {
                self.enqueue(accessed);
                return Ok(());
            }
        }

        for i in 0..self.dirs.len() {
            match &self.dirs[i] {
                DirRule::Plain(d) => {
                    let d = d.clone();
                    let cand = join_rel(&d, text);
                    if let Some(accessed) = self.try_file(&cand)? {
                        if !d.is_empty() {
                            self.record(&paths::normalize(&d));
                        }
                        self.enqueue(accessed);
                        return Ok(());
                    }
                }
                DirRule::Opaque { dir, members } => {
                    let joined = join_rel(dir, text);
                    let suffix = format!("/{}", text);
                    if members
                        .iter()
                        .any(|m| *m == joined || m.ends_with(&suffix))
                    {
                        // Satisfied by the group; the whole group is a
                        // declared step input already.
                        return Ok(());
                    }
                }
            }
        }

        // Framework form: <Name/Header.h> under <fw>/Name.framework/Headers/.
        if let Some((fw_name, rest)) = text.split_once('/') {
            for i in 0..self.frameworks.len() {
                let fw = self.frameworks[i].clone();
                let cand = join_rel(&fw, &format!("{}.framework/Headers/{}", fw_name, rest));
                if let Some(accessed) = self.try_file(&cand)? {
                    if !fw.is_empty() {
                        self.record(&paths::normalize(&fw));
                    }
                    self.enqueue(accessed);
                    return Ok(());
                }
            }
        }

        warn!(include = text, from = from_dir, "include not found");
        Ok(())
    }

    /// An absolute include inside the exec root is normalized to its
    /// relative form (and the exec root itself becomes a dependency);
    /// outside, it is recorded verbatim.
    fn resolve_absolute(&mut self, text: &str) -> Result<(), ScanError> {
        let abs = paths::normalize(text);
        if let Some(rel) = self.rel(&abs) {
            if let Some(accessed) = self.try_file(&rel)? {
                self.record(".");
                self.enqueue(accessed);
                return Ok(());
            }
            warn!(include = text, "absolute include not found");
            return Ok(());
        }
        match self.sd.fs.stat_follow("", &abs) {
            Ok(st) if matches!(st.info.entry, FileEntry::Regular(_)) => {
                self.record(&abs);
                Ok(())
            }
            Ok(_) | Err(FsError::NotFound { .. }) => {
                warn!(include = text, "absolute include not found");
                Ok(())
            }
            Err(FsError::Loop { path }) => {
                warn!(path = %path, "symlink loop during include resolution");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn rel_parent(p: &str) -> String {
    match p.rfind('/') {
        Some(i) => p[..i].to_string(),
        None => ".".to_string(),
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        paths::normalize(name)
    } else {
        paths::normalize(&format!("{}/{}", dir, name))
    }
}
