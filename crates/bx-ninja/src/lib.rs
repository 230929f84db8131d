//! Ninja-compatibility logs and depfile parsing.
//!
//! - [`makeutil`]: make-format depfile parsing (the format compilers
//!   emit under `-MD`/`-MMD`, and `rustc --emit=dep-info`).
//! - [`ninja_log`]: the `.ninja_log` v5 text log, read at startup for
//!   cross-run command-hash change detection and appended per finished
//!   step.
//! - [`deps_log`]: the binary append-only deps log keyed by primary
//!   output, with an interned path table.

pub mod deps_log;
pub mod makeutil;
pub mod ninja_log;

pub use deps_log::DepsLog;
pub use ninja_log::{NinjaLog, NinjaLogEntry};

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log i/o failed: {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log: {path}: {reason}")]
    Invalid { path: Utf8PathBuf, reason: String },
}

impl LogError {
    fn io(op: &'static str, path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
