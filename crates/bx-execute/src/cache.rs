//! Action cache lookups.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use bx_digest::Digest;
use bx_hashfs::HashFS;
use bx_reapi::{ActionResult, RemoteBackend, RpcCode};
use bx_sema::PrioritySemaphore;

use crate::cmd::{record_outputs, StepResult, StepStatus};
use crate::{Cmd, ExecError};

/// Get-or-store of action results against the remote action cache.
pub struct ActionCache {
    backend: Arc<dyn RemoteBackend>,
    enable_read: bool,
    sema: Arc<PrioritySemaphore>,
}

impl ActionCache {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        enable_read: bool,
        sema: Arc<PrioritySemaphore>,
    ) -> Self {
        Self {
            backend,
            enable_read,
            sema,
        }
    }

    /// Look up `action_digest` in the cache. Any failure along the way —
    /// lookup, stdout/stderr fetch, output recording — degrades to a
    /// miss; the step falls through to execution.
    pub async fn get(
        &self,
        fs: &HashFS,
        exec_root: &str,
        cmd: &Cmd,
        action_digest: Digest,
        cancel: &CancellationToken,
    ) -> Option<StepResult> {
        if !self.enable_read {
            return None;
        }
        let permit = match self.sema.wait_acquire(cmd.weight, cancel).await {
            Ok(p) => p,
            Err(_) => return None,
        };

        let result = match self.backend.get_action_result(action_digest).await {
            Ok(r) => r,
            Err(e) => {
                if e.code != RpcCode::NotFound {
                    warn!(step = %cmd.id, err = %e, "action cache lookup failed");
                }
                return None;
            }
        };
        drop(permit);

        let stdout = match self.fetch_log(&result.stdout_raw, result.stdout_digest).await {
            Ok(b) => b,
            Err(e) => {
                warn!(step = %cmd.id, err = %e, "failed to fetch cached stdout");
                return None;
            }
        };
        let stderr = match self.fetch_log(&result.stderr_raw, result.stderr_digest).await {
            Ok(b) => b,
            Err(e) => {
                warn!(step = %cmd.id, err = %e, "failed to fetch cached stderr");
                return None;
            }
        };

        if let Err(e) = self
            .record(fs, exec_root, cmd, action_digest, &result)
            .await
        {
            warn!(step = %cmd.id, err = %e, "failed to record cached outputs");
            return None;
        }

        debug!(step = %cmd.id, digest = %action_digest, "action cache hit");
        Some(StepResult {
            status: StepStatus::CacheHit,
            exit_code: result.exit_code,
            stdout,
            stderr,
            action_digest,
            rusage: None,
        })
    }

    async fn fetch_log(
        &self,
        raw: &[u8],
        digest: Digest,
    ) -> Result<Vec<u8>, bx_reapi::RpcError> {
        if !raw.is_empty() {
            return Ok(raw.to_vec());
        }
        if digest.is_zero() || digest.size_bytes == 0 {
            return Ok(Vec::new());
        }
        self.backend.read_blob(digest).await
    }

    /// Pull small output blobs into the local content store and install
    /// the entries into HashFS.
    async fn record(
        &self,
        fs: &HashFS,
        exec_root: &str,
        cmd: &Cmd,
        action_digest: Digest,
        result: &ActionResult,
    ) -> Result<(), ExecError> {
        let missing: Vec<Digest> = result
            .output_files
            .iter()
            .map(|f| f.digest)
            .filter(|d| !d.is_zero() && !fs.store().exists(d))
            .collect();
        if !missing.is_empty() {
            let blobs = self.backend.batch_read_blobs(missing).await?;
            for (d, data) in blobs {
                let data = bx_digest::hash_reader::verify_blob(data, d)
                    .await
                    .map_err(|e| ExecError::Internal(format!("corrupt blob {d}: {e}")))?;
                fs.store().put(&data)?;
            }
        }
        record_outputs(
            fs,
            exec_root,
            action_digest,
            cmd.cmd_hash(),
            result,
            HashFS::now_ns(),
        )
    }

    /// Best-effort store of a locally produced result: upload whichever
    /// output blobs the backend lacks, then the result itself. Failures
    /// are logged and non-fatal; the next build simply misses.
    pub async fn put(
        &self,
        action_digest: Digest,
        result: ActionResult,
        blobs: Vec<(Digest, Vec<u8>)>,
    ) {
        let digests: Vec<Digest> = blobs.iter().map(|(d, _)| *d).collect();
        match self.backend.find_missing_blobs(digests).await {
            Ok(missing) => {
                let upload: Vec<(Digest, Vec<u8>)> = blobs
                    .into_iter()
                    .filter(|(d, _)| missing.contains(d))
                    .collect();
                if !upload.is_empty() {
                    if let Err(e) = self.backend.batch_update_blobs(upload).await {
                        warn!(digest = %action_digest, err = %e, "output blob upload failed");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(digest = %action_digest, err = %e, "find missing blobs failed");
                return;
            }
        }
        if let Err(e) = self
            .backend
            .update_action_result(action_digest, result)
            .await
        {
            warn!(digest = %action_digest, err = %e, "action cache update failed");
        }
    }
}
