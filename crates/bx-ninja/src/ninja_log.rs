//! `.ninja_log` v5 reader/writer.
//!
//! One record per finished target:
//!
//! ```text
//! # ninja log v5
//! <start_ms>\t<end_ms>\t<mtime>\t<target>\t<cmd_hash_hex>
//! ```
//!
//! Later records for the same target win. The log recompacts on load
//! when the dead-record ratio gets large.

use std::collections::HashMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::LogError;

const HEADER: &str = "# ninja log v5\n";
/// Recompact when the file holds this many times more records than
/// distinct targets.
const COMPACT_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NinjaLogEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    /// Output mtime in nanoseconds, as ninja records it.
    pub mtime_ns: i64,
    pub target: String,
    /// Stable hash of the command line.
    pub cmd_hash: u64,
}

impl NinjaLogEntry {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{:x}\n",
            self.start_ms, self.end_ms, self.mtime_ns, self.target, self.cmd_hash
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut f = line.split('\t');
        let start_ms = f.next()?.parse().ok()?;
        let end_ms = f.next()?.parse().ok()?;
        let mtime_ns = f.next()?.parse().ok()?;
        let target = f.next()?.to_string();
        let cmd_hash = u64::from_str_radix(f.next()?.trim_end(), 16).ok()?;
        Some(Self {
            start_ms,
            end_ms,
            mtime_ns,
            target,
            cmd_hash,
        })
    }
}

/// The `.ninja_log` for one build directory.
pub struct NinjaLog {
    path: Utf8PathBuf,
    entries: HashMap<String, NinjaLogEntry>,
    file: Option<fs::File>,
}

impl NinjaLog {
    /// Load (or create) the log at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, LogError> {
        let mut entries = HashMap::new();
        let mut total_records = 0usize;
        match fs::read_to_string(path) {
            Ok(content) => {
                let mut lines = content.lines();
                match lines.next() {
                    Some(h) if format!("{}\n", h) == HEADER => {}
                    Some(h) => {
                        warn!(path = %path, header = h, "unknown ninja log version, starting fresh");
                        lines = "".lines();
                    }
                    None => {}
                }
                for line in lines {
                    if line.is_empty() {
                        continue;
                    }
                    match NinjaLogEntry::parse(line) {
                        Some(e) => {
                            total_records += 1;
                            entries.insert(e.target.clone(), e);
                        }
                        None => warn!(path = %path, line, "skipping bad ninja log line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LogError::io("read", path, e)),
        }

        let mut log = Self {
            path: path.to_owned(),
            entries,
            file: None,
        };
        if total_records > COMPACT_RATIO * log.entries.len().max(1) {
            debug!(path = %path, total_records, live = log.entries.len(), "recompacting ninja log");
            log.recompact()?;
        }
        Ok(log)
    }

    pub fn get(&self, target: &str) -> Option<&NinjaLogEntry> {
        self.entries.get(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the recorded command hash for `target` differs from
    /// `cmd_hash` (true also when the target is unknown).
    pub fn cmd_changed(&self, target: &str, cmd_hash: u64) -> bool {
        self.entries
            .get(target)
            .is_none_or(|e| e.cmd_hash != cmd_hash)
    }

    /// Append a record for a finished step.
    pub fn record(&mut self, entry: NinjaLogEntry) -> Result<(), LogError> {
        if self.file.is_none() {
            let fresh = !self.path.as_std_path().exists();
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| LogError::io("open", &self.path, e))?;
            if fresh {
                file.write_all(HEADER.as_bytes())
                    .map_err(|e| LogError::io("write", &self.path, e))?;
            }
            self.file = Some(file);
        }
        let line = entry.to_line();
        self.file
            .as_mut()
            .unwrap()
            .write_all(line.as_bytes())
            .map_err(|e| LogError::io("write", &self.path, e))?;
        self.entries.insert(entry.target.clone(), entry);
        Ok(())
    }

    /// Rewrite the log with only the live records.
    pub fn recompact(&mut self) -> Result<(), LogError> {
        self.file = None;
        let tmp = Utf8PathBuf::from(format!("{}.tmp", self.path));
        {
            let mut f =
                fs::File::create(&tmp).map_err(|e| LogError::io("create", &tmp, e))?;
            f.write_all(HEADER.as_bytes())
                .map_err(|e| LogError::io("write", &tmp, e))?;
            let mut targets: Vec<_> = self.entries.keys().cloned().collect();
            targets.sort();
            for t in targets {
                f.write_all(self.entries[&t].to_line().as_bytes())
                    .map_err(|e| LogError::io("write", &tmp, e))?;
            }
        }
        fs::rename(&tmp, &self.path).map_err(|e| LogError::io("rename", &self.path, e))?;
        Ok(())
    }
}
