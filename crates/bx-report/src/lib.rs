//! Build report types and persistence.
//!
//! Captures per-step and per-build outcomes so "what happened and why"
//! is answerable after the fact: statuses, cache outcomes, timing, and
//! the action digests involved. Reports persist as JSON under
//! `.bx/runs/`.

use camino::{Utf8Path, Utf8PathBuf};
use facet::Facet;

/// Current report schema version.
/// Bump when the schema changes in backwards-incompatible ways.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// A unique run identifier, ordered by creation time.
///
/// Shape: `<millis>-<entropy>`, both fixed-width lowercase hex, so ids
/// sort lexicographically by millisecond timestamp. The suffix hashes
/// the clock, the pid, and a process-local counter, which keeps
/// concurrent runs (and multiple runs within one millisecond) distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Facet)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let millis = now.as_millis() as u64;

        let mut hasher = DefaultHasher::new();
        now.as_nanos().hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        NEXT_SEQ.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
        let entropy = hasher.finish();

        Self(format!("{:016x}-{:016x}", millis, entropy))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (millis, entropy) = s.split_once('-')?;
        let hex_ok = |part: &str| {
            part.len() == 16 && part.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        };
        if !hex_ok(millis) || !hex_ok(entropy) {
            return None;
        }
        Some(Self(s.to_string()))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final classification of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum StepStatusReport {
    Success,
    CacheHit,
    Skipped,
    NonZeroExit,
    Timeout,
    Canceled,
}

/// One step's record.
#[derive(Debug, Clone, Facet)]
pub struct StepReport {
    /// Step identity (primary output).
    pub step_id: String,
    pub rule: String,
    pub status: StepStatusReport,
    pub exit_code: i32,
    /// Hex action digest, empty for steps that never fingerprinted.
    pub action_digest: String,
    pub duration_ms: u64,
    /// Infrastructure error, if the step failed outside the command.
    pub error: Option<String>,
}

/// Complete report for a single build invocation.
#[derive(Debug, Clone, Facet)]
pub struct BuildReport {
    pub schema: u32,
    pub run_id: RunId,
    pub started_at_unix_ms: u64,
    pub ended_at_unix_ms: u64,
    pub exec_root: String,
    pub success: bool,
    pub steps: Vec<StepReport>,
    /// Aggregates, for a one-line summary without walking `steps`.
    pub done: u64,
    pub cache_hits: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl BuildReport {
    pub fn new(exec_root: String) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            schema: REPORT_SCHEMA_VERSION,
            run_id: RunId::new(),
            started_at_unix_ms: now,
            ended_at_unix_ms: now,
            exec_root,
            success: false,
            steps: Vec::new(),
            done: 0,
            cache_hits: 0,
            skipped: 0,
            failed: 0,
        }
    }

    pub fn finish(&mut self, success: bool) {
        use std::time::{SystemTime, UNIX_EPOCH};
        self.ended_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.success = success;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report i/o failed: {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("report parse failed: {path}: {reason}")]
    Parse { path: Utf8PathBuf, reason: String },
}

/// Reads and writes reports under `<root>/.bx/runs/`.
pub struct ReportStore {
    dir: Utf8PathBuf,
}

impl ReportStore {
    pub fn new(exec_root: &Utf8Path) -> Self {
        Self {
            dir: exec_root.join(".bx/runs"),
        }
    }

    pub fn save(&self, report: &BuildReport) -> Result<Utf8PathBuf, ReportError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ReportError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(format!("{}.json", report.run_id));
        let json = facet_json::to_string(report).map_err(|e| ReportError::Parse {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(&self, run_id: &RunId) -> Result<BuildReport, ReportError> {
        let path = self.dir.join(format!("{}.json", run_id));
        let json = std::fs::read_to_string(&path).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        facet_json::from_str(&json).map_err(|e| ReportError::Parse {
            path,
            reason: e.to_string(),
        })
    }

    /// Run ids present on disk, oldest first.
    pub fn list(&self) -> Vec<RunId> {
        let Ok(entries) = std::fs::read_dir(self.dir.as_std_path()) else {
            return Vec::new();
        };
        let mut ids: Vec<RunId> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                RunId::parse(name.strip_suffix(".json")?)
            })
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_shape() {
        let id = RunId::new();
        assert_eq!(id.0.len(), 33);
        assert!(RunId::parse(&id.0).is_some());
        assert!(RunId::parse("short").is_none());
        assert!(RunId::parse("0123456789abcdef_0123456789abcdef").is_none());
        assert!(RunId::parse("0123456789ABCDEF-0123456789abcdef").is_none());
    }

    #[test]
    fn run_ids_are_unique_and_time_ordered() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        // Fixed-width hex keeps lexicographic order aligned with
        // creation order at millisecond granularity.
        assert!(a.0[..16] <= b.0[..16]);
    }

    #[test]
    fn report_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = ReportStore::new(&root);

        let mut report = BuildReport::new(root.to_string());
        report.steps.push(StepReport {
            step_id: "obj/apps/apps.o".to_string(),
            rule: "cxx".to_string(),
            status: StepStatusReport::CacheHit,
            exit_code: 0,
            action_digest: "ab".repeat(32),
            duration_ms: 12,
            error: None,
        });
        report.cache_hits = 1;
        report.finish(true);

        store.save(&report).unwrap();
        let loaded = store.load(&report.run_id).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert!(loaded.success);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].status, StepStatusReport::CacheHit);
        assert_eq!(store.list(), vec![report.run_id]);
    }

    #[test]
    fn failed_step_report() {
        let mut report = BuildReport::new("/b/chromium/src".to_string());
        report.steps.push(StepReport {
            step_id: "obj/base/base.o".to_string(),
            rule: "cxx".to_string(),
            status: StepStatusReport::NonZeroExit,
            exit_code: 1,
            action_digest: String::new(),
            duration_ms: 900,
            error: None,
        });
        report.failed = 1;
        report.finish(false);
        assert!(!report.success);
        assert!(report.ended_at_unix_ms >= report.started_at_unix_ms);
    }
}
