//! Remote execution API surface.
//!
//! The data model (Action, Command, ActionResult, Merkle directory
//! tree) plus the [`RemoteBackend`] trait the executor talks to. The
//! production implementation wraps a gRPC transport elsewhere; the
//! [`loopback`] module provides an in-process implementation for tests.
//!
//! Wire messages are hashed with a deterministic length-prefixed binary
//! encoding (see [`encode`]); the digest of the encoded [`Action`] is
//! the action cache key.

mod backend;
pub mod encode;
pub mod loopback;
pub mod merkle;
pub mod retry;

pub use backend::{ExecuteStream, Operation, RemoteBackend};
pub use bx_digest::Digest;

/// gRPC-style status codes for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
    Unauthenticated,
}

/// A failed remote call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcCode::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    /// Whether the call may be retried with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.code,
            RpcCode::ResourceExhausted
                | RpcCode::Internal
                | RpcCode::Unavailable
                | RpcCode::Aborted
                | RpcCode::Unknown
        )
    }

    /// Whether the call may be retried once after a credential refresh.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self.code,
            RpcCode::Unauthenticated | RpcCode::PermissionDenied
        )
    }
}

/// The command an action runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub arguments: Vec<String>,
    /// Environment, sorted by name.
    pub env: Vec<(String, String)>,
    /// Declared outputs in canonical (sorted) order.
    pub output_paths: Vec<String>,
    /// Platform properties, sorted by name.
    pub platform: Vec<(String, String)>,
    pub working_directory: String,
}

impl Command {
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&encode::command(self))
    }
}

/// A hashed description of a command and its input tree. The digest of
/// the encoded action is the ActionCache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    /// Execution timeout in seconds; zero means backend default.
    pub timeout_secs: u64,
    pub do_not_cache: bool,
}

impl Action {
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&encode::action(self))
    }
}

/// An output file recorded in an action result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// An output symlink recorded in an action result. The target is
/// recorded verbatim; it may dangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSymlink {
    pub path: String,
    pub target: String,
}

/// The result of executing (or cache-hitting) an action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    pub exit_code: i32,
    pub output_files: Vec<OutputFile>,
    pub output_symlinks: Vec<OutputSymlink>,
    /// Inline stdout, or empty with `stdout_digest` set.
    pub stdout_raw: Vec<u8>,
    pub stdout_digest: Digest,
    pub stderr_raw: Vec<u8>,
    pub stderr_digest: Digest,
    /// Worker that executed the action, for diagnostics.
    pub worker: String,
}

/// Request for `Execute`.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub action_digest: Digest,
    /// Skip the remote action cache lookup.
    pub skip_cache_lookup: bool,
    /// Backend scheduling priority; semantics are backend-defined.
    pub execution_priority: i32,
}

/// Response carried by the final operation of an execute stream.
#[derive(Debug, Clone)]
pub struct ExecuteResponse {
    pub result: ActionResult,
    /// Set when the backend reports an execution-level error.
    pub status: Option<RpcError>,
    /// Whether the result was served from the action cache.
    pub cached_result: bool,
}

/// Server capabilities relevant to the executor.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Maximum total size for a batch blob update; zero means the
    /// backend default (4 MiB).
    pub max_batch_total_size_bytes: u64,
    pub exec_enabled: bool,
}

impl Capabilities {
    /// Effective batch ceiling.
    pub fn batch_limit(&self) -> u64 {
        if self.max_batch_total_size_bytes == 0 {
            4 * 1024 * 1024
        } else {
            self.max_batch_total_size_bytes
        }
    }
}
