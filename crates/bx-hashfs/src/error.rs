//! Error type for the overlay filesystem.

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found: {path}")]
    NotFound { path: String },

    /// A symlink was encountered inside the requested path. The caller
    /// decides whether (and how) to resolve it.
    #[error("symlink at {path} -> {target}")]
    Symlink { path: String, target: String },

    #[error("too many levels of symbolic links: {path}")]
    Loop { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("fs {op} failed: {path}: {source}")]
    Io {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] bx_digest::StoreError),

    #[error("invalid state file: {reason}")]
    InvalidState { reason: String },
}

impl FsError {
    pub fn io(op: &'static str, path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }
}
