//! The action execution core.
//!
//! Drives each build step through its state machine — preprocess,
//! dependency scan, cache lookup, dispatch (remote or local), output
//! recording — and walks the whole DAG with priority-weighted admission
//! control. See [`Scheduler`] for the top-level entry point.

pub mod cache;
pub mod cmd;
pub mod executor;
pub mod graph;
pub mod local;
pub mod scheduler;

pub use cache::ActionCache;
pub use cmd::{Cmd, DepsMode, StepResult, StepStatus};
pub use executor::{ExecConfig, StepExecutor};
pub use graph::{BuildGraph, StepDef, StepId};
pub use scheduler::{BuildResult, Scheduler, StepOutcome};

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Fs(#[from] bx_hashfs::FsError),

    #[error(transparent)]
    Store(#[from] bx_digest::StoreError),

    #[error(transparent)]
    Rpc(#[from] bx_reapi::RpcError),

    #[error(transparent)]
    Merkle(#[from] bx_reapi::merkle::MerkleError),

    #[error(transparent)]
    Scan(#[from] bx_scandeps::ScanError),

    #[error(transparent)]
    Log(#[from] bx_ninja::LogError),

    #[error("step canceled")]
    Canceled,

    #[error("missing input for {step}: {input}")]
    MissingInput { step: String, input: String },

    #[error("missing output for {step}: {output}")]
    MissingOutput { step: String, output: String },

    #[error("subprocess spawn failed: {path}: {source}")]
    Spawn {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest invalid: {0}")]
    InvalidManifest(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<bx_sema::Canceled> for ExecError {
    fn from(_: bx_sema::Canceled) -> Self {
        ExecError::Canceled
    }
}
