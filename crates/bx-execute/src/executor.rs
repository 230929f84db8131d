//! The per-step state machine.
//!
//! Each step moves through `Ready -> Preproc -> Scandeps -> CacheLookup
//! -> Dispatching -> Running -> Recording -> Done | Failed | Canceled`.
//! Dispatch picks remote execution when the command is pure and carries
//! platform properties, the reproxy wrapper when configured, and local
//! execution otherwise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use bx_digest::Digest;
use bx_hashfs::{paths, FileEntry, HashFS};
use bx_ninja::{makeutil, DepsLog, NinjaLog, NinjaLogEntry};
use bx_reapi::{
    retry, ActionResult, ExecuteRequest, ExecuteResponse, OutputFile, OutputSymlink,
    RemoteBackend, RpcCode, RpcError,
};
use bx_scandeps::{flags, Scandeps};
use bx_sema::Limits;

use crate::cmd::{record_outputs, Fingerprint, StepResult, StepStatus};
use crate::{local, ActionCache, Cmd, DepsMode, ExecError};

/// Close and reconnect the execute stream after this long, mitigating
/// silent network breakage on long compiles.
const EXEC_STREAM_CAP: Duration = Duration::from_secs(60);

/// Step phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Preproc,
    Scandeps,
    CacheLookup,
    Dispatching,
    Running,
    Recording,
    Done,
    Failed,
    Canceled,
}

/// Per-build executor configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub exec_root: String,
    /// When set, a missing output after a local run warns instead of
    /// failing the step.
    pub ignore_missing_outputs: bool,
    /// Backend scheduling priority for remote actions.
    pub execution_priority: i32,
}

/// Drives individual steps. Shared by all scheduler workers.
pub struct StepExecutor {
    fs: Arc<HashFS>,
    scandeps: Option<Arc<Scandeps>>,
    backend: Option<Arc<dyn RemoteBackend>>,
    cache: Option<Arc<ActionCache>>,
    limits: Arc<Limits>,
    deps_log: Arc<Mutex<DepsLog>>,
    ninja_log: Arc<Mutex<NinjaLog>>,
    config: ExecConfig,
    build_start: Instant,
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<HashFS>,
        scandeps: Option<Arc<Scandeps>>,
        backend: Option<Arc<dyn RemoteBackend>>,
        cache: Option<Arc<ActionCache>>,
        limits: Arc<Limits>,
        deps_log: Arc<Mutex<DepsLog>>,
        ninja_log: Arc<Mutex<NinjaLog>>,
        config: ExecConfig,
    ) -> Self {
        Self {
            fs,
            scandeps,
            backend,
            cache,
            limits,
            deps_log,
            ninja_log,
            config,
            build_start: Instant::now(),
        }
    }

    pub fn exec_root(&self) -> &str {
        &self.config.exec_root
    }

    pub fn fs(&self) -> &Arc<HashFS> {
        &self.fs
    }

    fn phase(&self, cmd: &Cmd, phase: Phase) {
        trace!(step = %cmd.id, ?phase, "phase");
    }

    /// Run one step to completion. Infrastructure errors come back as
    /// `Err`; command failures come back as a result with a non-ok
    /// status so stderr is preserved for the user.
    pub async fn run_step(
        &self,
        cmd: &Cmd,
        cancel: &CancellationToken,
    ) -> Result<StepResult, ExecError> {
        let started = Instant::now();
        let _step = self.limits.step.wait_acquire(cmd.weight, cancel).await?;
        if cancel.is_cancelled() {
            return Err(ExecError::Canceled);
        }

        if let Some(skipped) = self.check_up_to_date(cmd) {
            self.phase(cmd, Phase::Done);
            return Ok(skipped);
        }

        // Prior output state, for restat.
        let prior_outputs = self.capture_outputs(cmd);

        self.phase(cmd, Phase::Preproc);
        let inputs = self.expand_inputs(cmd, cancel).await?;

        self.phase(cmd, Phase::CacheLookup);
        // Hashing the input set touches disk; keep it off the scheduler
        // loop.
        let fp = {
            let _thread = self.limits.thread.wait_acquire(cmd.weight, cancel).await?;
            let fs = self.fs.clone();
            let root = self.config.exec_root.clone();
            let cmd_owned = cmd.clone();
            let fp_inputs = inputs.clone();
            tokio::task::spawn_blocking(move || cmd_owned.fingerprint(&fs, &root, &fp_inputs))
                .await
                .map_err(|e| ExecError::Internal(format!("fingerprint task: {e}")))??
        };
        if cmd.pure {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache
                    .get(&self.fs, &self.config.exec_root, cmd, fp.action_digest, cancel)
                    .await
                {
                    let hit = self.record_finish(cmd, hit, started)?;
                    self.phase(cmd, Phase::Done);
                    return Ok(hit);
                }
            }
        }

        self.phase(cmd, Phase::Dispatching);
        let (result, ran_locally) = if cmd.pure
            && self.backend.is_some()
            && !cmd.platform.is_empty()
        {
            if self.take_fastlocal() {
                // Remote admission is saturated and a fastlocal slot is
                // free; run this remote-eligible step locally instead.
                let _fast = self.limits.fastlocal.wait_acquire(cmd.weight, cancel).await?;
                (self.run_local(cmd, &prior_outputs, cancel).await?, true)
            } else {
                (
                    self.run_remote(cmd, &fp, &prior_outputs, cancel).await?,
                    false,
                )
            }
        } else if cmd.pure && cmd.reproxy_config.is_some() {
            (self.run_reproxy(cmd, cancel).await?, true)
        } else {
            (self.run_local(cmd, &prior_outputs, cancel).await?, true)
        };

        self.phase(cmd, Phase::Recording);
        let result = self.record_finish(cmd, result, started)?;
        if ran_locally && cmd.pure && result.status == StepStatus::Success {
            // The other half of get-or-store: publish the pure result so
            // the next build (or another machine) can hit on it.
            self.put_local_result(cmd, &fp, &result).await;
        }
        let phase = match result.status {
            StepStatus::Canceled => Phase::Canceled,
            _ if result.ok() => Phase::Done,
            _ => Phase::Failed,
        };
        self.phase(cmd, phase);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // up-to-date check
    // ------------------------------------------------------------------

    /// A step whose command is unchanged since the last run, with all
    /// outputs present and no input newer than the oldest output, is
    /// skipped.
    fn check_up_to_date(&self, cmd: &Cmd) -> Option<StepResult> {
        if cmd.outputs.is_empty() {
            return None;
        }
        let root = &self.config.exec_root;
        {
            let log = self.ninja_log.lock().unwrap();
            if log.cmd_changed(cmd.primary_output(), cmd.cmd_hash()) {
                return None;
            }
        }
        let mut oldest_output = i64::MAX;
        for out in &cmd.outputs {
            match self.fs.stat(root, out) {
                Ok(fi) => oldest_output = oldest_output.min(fi.entry.mtime_ns()),
                Err(_) => return None,
            }
        }
        let mut check_inputs: Vec<String> = cmd.inputs.clone();
        if let Some(deps) = self.deps_log.lock().unwrap().get(cmd.primary_output()) {
            check_inputs.extend(deps.deps);
        }
        for input in &check_inputs {
            match self.input_mtime(input) {
                Some(mtime) if mtime <= oldest_output => {}
                _ => return None,
            }
        }
        debug!(step = %cmd.id, "up to date");
        Some(StepResult {
            status: StepStatus::Skipped,
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            action_digest: Digest::empty(),
            rusage: None,
        })
    }

    /// Staleness mtime of an input. A symlink input surfaces both the
    /// link mtime and the target mtime; the later of the two wins.
    fn input_mtime(&self, input: &str) -> Option<i64> {
        let root = &self.config.exec_root;
        let fi = self.fs.stat(root, input).ok()?;
        let mut mtime = fi.entry.mtime_ns();
        if fi.entry.is_symlink() {
            if let Ok(st) = self.fs.stat_follow(root, input) {
                mtime = mtime.max(st.info.entry.mtime_ns());
            }
        }
        Some(mtime)
    }

    /// Publish a successful pure local (or reproxy) run to the action
    /// cache, best-effort: the result's outputs are read back from the
    /// overlay, their blobs from the content store.
    async fn put_local_result(&self, cmd: &Cmd, fp: &Fingerprint, result: &StepResult) {
        let Some(cache) = &self.cache else {
            return;
        };
        let root = &self.config.exec_root;

        let mut action_result = ActionResult {
            exit_code: result.exit_code,
            stdout_raw: result.stdout.clone(),
            stderr_raw: result.stderr.clone(),
            ..Default::default()
        };
        let mut blobs = Vec::new();
        // The declared outputs plus the depfile, the same set the wire
        // command advertises. entries() guarantees local digests resolve
        // via the content store.
        let outputs = fp.command.output_paths.clone();
        let entries = match self.fs.entries(root, &outputs) {
            Ok(e) => e,
            Err(e) => {
                warn!(step = %cmd.id, err = %e, "skipping action cache publish");
                return;
            }
        };
        for (path, entry) in entries {
            match entry {
                FileEntry::Regular(r) => {
                    match self.fs.store().read(&r.digest) {
                        Ok(data) => blobs.push((r.digest, data)),
                        Err(e) => {
                            warn!(step = %cmd.id, output = %path, err = %e, "skipping action cache publish");
                            return;
                        }
                    }
                    action_result.output_files.push(OutputFile {
                        path,
                        digest: r.digest,
                        is_executable: r.executable,
                    });
                }
                FileEntry::Symlink(s) => {
                    action_result.output_symlinks.push(OutputSymlink {
                        path,
                        target: s.target,
                    });
                }
                FileEntry::Directory { .. } => {}
            }
        }
        cache.put(fp.action_digest, action_result, blobs).await;
    }

    /// The fastlocal heuristic: a remote-eligible step takes a local
    /// slot when the remote pool is backed up and fastlocal capacity is
    /// free. Capacity zero disables the behavior entirely.
    fn take_fastlocal(&self) -> bool {
        let fast = &self.limits.fastlocal;
        self.limits.fastlocal_enabled()
            && fast.num_servs() < fast.capacity()
            && self.limits.remote.num_waits() > 0
    }

    fn capture_outputs(&self, cmd: &Cmd) -> HashMap<String, (Digest, i64)> {
        let root = &self.config.exec_root;
        let mut prior = HashMap::new();
        for out in &cmd.outputs {
            if let Ok(fi) = self.fs.stat(root, out) {
                prior.insert(out.clone(), (fi.entry.digest(), fi.entry.mtime_ns()));
            }
        }
        prior
    }

    // ------------------------------------------------------------------
    // preproc + scandeps
    // ------------------------------------------------------------------

    /// Expand declared inputs with the scanned include closure for
    /// compile steps. Scan failures degrade to the declared inputs.
    async fn expand_inputs(
        &self,
        cmd: &Cmd,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ExecError> {
        let mut inputs: Vec<String> = cmd.inputs.iter().map(|p| paths::normalize(p)).collect();
        let (Some(scandeps), DepsMode::Gcc | DepsMode::Msvc) = (&self.scandeps, cmd.deps)
        else {
            inputs.sort();
            inputs.dedup();
            return Ok(inputs);
        };

        let _preproc = self.limits.preproc.wait_acquire(cmd.weight, cancel).await?;
        let fs = self.fs.clone();
        let root = self.config.exec_root.clone();
        let params = flags::extract_scan_deps_params(&cmd.args, |p| {
            fs.read_file(&root, p)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .map_err(|e| e.to_string())
        });
        let params = match params {
            Ok(p) => p,
            Err(e) => {
                warn!(step = %cmd.id, err = %e, "flag extraction failed; using declared inputs");
                inputs.sort();
                inputs.dedup();
                return Ok(inputs);
            }
        };
        drop(_preproc);

        self.phase(cmd, Phase::Scandeps);
        let _scan = self.limits.scandeps.wait_acquire(cmd.weight, cancel).await?;
        let sd = scandeps.clone();
        let root = self.config.exec_root.clone();
        let extra_files = params.files.clone();
        let req = params.into_request();
        let scanned = tokio::task::spawn_blocking(move || sd.scan(&root, &req))
            .await
            .map_err(|e| ExecError::Internal(format!("scandeps task: {e}")))?;
        match scanned {
            Ok(scanned) => {
                inputs.extend(scanned);
                inputs.extend(extra_files);
            }
            Err(e) => {
                warn!(step = %cmd.id, err = %e, "scandeps failed; using declared inputs");
            }
        }
        inputs.sort();
        inputs.dedup();
        Ok(inputs)
    }

    // ------------------------------------------------------------------
    // remote execution
    // ------------------------------------------------------------------

    async fn run_remote(
        &self,
        cmd: &Cmd,
        fp: &Fingerprint,
        prior_outputs: &HashMap<String, (Digest, i64)>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, ExecError> {
        let backend = self.backend.as_ref().expect("dispatch checked backend");
        let _remote = self.limits.remote.wait_acquire(cmd.weight, cancel).await?;

        self.upload_inputs(backend, fp, cancel).await?;

        self.phase(cmd, Phase::Running);
        let req = ExecuteRequest {
            action_digest: fp.action_digest,
            skip_cache_lookup: false,
            execution_priority: self.config.execution_priority,
        };
        let response = self.execute_with_retry(backend, req, cancel).await?;

        // Classify.
        if let Some(status) = &response.status {
            match status.code {
                RpcCode::DeadlineExceeded => {
                    return Ok(StepResult {
                        status: StepStatus::Timeout,
                        exit_code: -1,
                        stdout: Vec::new(),
                        stderr: status.message.clone().into_bytes(),
                        action_digest: fp.action_digest,
                        rusage: None,
                    });
                }
                RpcCode::Canceled => return Err(ExecError::Canceled),
                _ => return Err(ExecError::Rpc(status.clone())),
            }
        }

        let result = &response.result;
        let stdout = self.fetch_log(backend, &result.stdout_raw, result.stdout_digest).await?;
        let stderr = self.fetch_log(backend, &result.stderr_raw, result.stderr_digest).await?;

        if result.exit_code != 0 {
            return Ok(StepResult {
                status: StepStatus::NonZeroExit,
                exit_code: result.exit_code,
                stdout,
                stderr,
                action_digest: fp.action_digest,
                rusage: None,
            });
        }

        // Bring small output blobs home so reads resolve locally,
        // verifying content against the digests the backend claimed.
        let missing: Vec<Digest> = result
            .output_files
            .iter()
            .map(|f| f.digest)
            .filter(|d| !d.is_zero() && !self.fs.store().exists(d))
            .collect();
        if !missing.is_empty() {
            let blobs = backend.batch_read_blobs(missing).await?;
            for (d, data) in blobs {
                let data = bx_digest::hash_reader::verify_blob(data, d)
                    .await
                    .map_err(|e| ExecError::Internal(format!("corrupt blob {d}: {e}")))?;
                self.fs.store().put(&data)?;
            }
        }
        record_outputs(
            &self.fs,
            &self.config.exec_root,
            fp.action_digest,
            cmd.cmd_hash(),
            result,
            HashFS::now_ns(),
        )?;
        if cmd.restat {
            self.restat_outputs(cmd, prior_outputs)?;
        }

        Ok(StepResult {
            status: if response.cached_result {
                StepStatus::CacheHit
            } else {
                StepStatus::Success
            },
            exit_code: 0,
            stdout,
            stderr,
            action_digest: fp.action_digest,
            rusage: None,
        })
    }

    async fn fetch_log(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        raw: &[u8],
        digest: Digest,
    ) -> Result<Vec<u8>, ExecError> {
        if !raw.is_empty() {
            return Ok(raw.to_vec());
        }
        if digest.is_zero() || digest.size_bytes == 0 {
            return Ok(Vec::new());
        }
        Ok(backend.read_blob(digest).await?)
    }

    /// Upload every blob the action needs that the backend does not
    /// already have: the action, the command, the Merkle directories,
    /// and input file contents.
    async fn upload_inputs(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        fp: &Fingerprint,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let action_blob = bx_reapi::encode::action(&fp.action);
        let command_blob = bx_reapi::encode::command(&fp.command);

        let mut candidates: HashMap<Digest, Option<Vec<u8>>> = HashMap::new();
        candidates.insert(Digest::from_bytes(&action_blob), Some(action_blob));
        candidates.insert(Digest::from_bytes(&command_blob), Some(command_blob));
        for (d, blob) in &fp.tree.tree_blobs {
            candidates.insert(*d, Some(blob.clone()));
        }
        for d in &fp.tree.file_digests {
            candidates.entry(*d).or_insert(None);
        }

        let digests: Vec<Digest> = candidates.keys().copied().collect();
        let missing = retry::call(cancel, || backend.find_missing_blobs(digests.clone()))
            .await?;

        let caps = backend.get_capabilities().await.unwrap_or_default();
        let batch_limit = caps.batch_limit();

        let mut batch: Vec<(Digest, Vec<u8>)> = Vec::new();
        let mut batch_size = 0u64;
        for d in missing {
            let data = match candidates.get(&d) {
                Some(Some(blob)) => blob.clone(),
                _ => self.fs.store().read(&d)?,
            };
            if data.len() as u64 > batch_limit {
                retry::call(cancel, || backend.write_blob(d, data.clone())).await?;
                continue;
            }
            if batch_size + data.len() as u64 > batch_limit && !batch.is_empty() {
                let sending = std::mem::take(&mut batch);
                batch_size = 0;
                retry::call(cancel, || backend.batch_update_blobs(sending.clone())).await?;
            }
            batch_size += data.len() as u64;
            batch.push((d, data));
        }
        if !batch.is_empty() {
            retry::call(cancel, || backend.batch_update_blobs(batch.clone())).await?;
        }
        Ok(())
    }

    /// Execute with transparent retry: transient RPC errors back off and
    /// re-issue, broken or long-lived streams reconnect with
    /// `wait_execution`.
    async fn execute_with_retry(
        &self,
        backend: &Arc<dyn RemoteBackend>,
        req: ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResponse, ExecError> {
        let mut backoff = retry::ExponentialBackoff::new();
        let mut op_name: Option<String> = None;
        'reconnect: loop {
            if cancel.is_cancelled() {
                return Err(ExecError::Canceled);
            }
            let stream = match &op_name {
                None => backend.execute(req.clone()).await,
                Some(name) => backend.wait_execution(name.clone()).await,
            };
            let mut stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    // A lost operation cannot be waited on again.
                    if e.code == RpcCode::NotFound && op_name.take().is_some() {
                        continue 'reconnect;
                    }
                    self.backoff_sleep(&mut backoff, e, cancel).await?;
                    continue 'reconnect;
                }
            };
            loop {
                let next = tokio::select! {
                    next = tokio::time::timeout(EXEC_STREAM_CAP, stream.next()) => next,
                    _ = cancel.cancelled() => return Err(ExecError::Canceled),
                };
                match next {
                    Ok(Some(Ok(op))) => {
                        if !op.name.is_empty() {
                            op_name = Some(op.name.clone());
                        }
                        if op.done {
                            return op.response.ok_or_else(|| {
                                ExecError::Internal("done operation without response".into())
                            });
                        }
                    }
                    Ok(Some(Err(e))) => {
                        if e.is_retriable() && op_name.is_some() {
                            // Reconnect to the running operation.
                            continue 'reconnect;
                        }
                        self.backoff_sleep(&mut backoff, e, cancel).await?;
                        continue 'reconnect;
                    }
                    Ok(None) => {
                        self.backoff_sleep(
                            &mut backoff,
                            RpcError::unavailable("execute stream closed early"),
                            cancel,
                        )
                        .await?;
                        continue 'reconnect;
                    }
                    Err(_elapsed) => {
                        // Stream cap: reconnect transparently.
                        trace!("execute stream cap reached; reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    async fn backoff_sleep(
        &self,
        backoff: &mut retry::ExponentialBackoff,
        err: RpcError,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let delay = backoff.next(err).map_err(ExecError::Rpc)?;
        warn!(delay = ?delay, "retrying execute");
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(ExecError::Canceled),
        }
    }

    // ------------------------------------------------------------------
    // local execution
    // ------------------------------------------------------------------

    /// Dispatch through the reproxy wrapper: the command runs locally
    /// prefixed with the wrapper, gated by the rewrap pool.
    async fn run_reproxy(
        &self,
        cmd: &Cmd,
        cancel: &CancellationToken,
    ) -> Result<StepResult, ExecError> {
        let wrapper = cmd
            .reproxy_config
            .clone()
            .expect("dispatch checked reproxy config");
        let _rewrap = self.limits.rewrap.wait_acquire(cmd.weight, cancel).await?;
        let mut wrapped = cmd.clone();
        wrapped.args.insert(0, wrapper);
        let prior = self.capture_outputs(cmd);
        self.run_local(&wrapped, &prior, cancel).await
    }

    /// Re-stat outputs after a restat rule ran: when an output's digest
    /// is unchanged, its mtime is restored so dependents are not
    /// re-triggered. Symlink outputs are never followed.
    fn restat_outputs(
        &self,
        cmd: &Cmd,
        prior_outputs: &HashMap<String, (Digest, i64)>,
    ) -> Result<(), ExecError> {
        let root = &self.config.exec_root;
        for out in &cmd.outputs {
            let Some((prior_digest, prior_mtime)) = prior_outputs.get(out) else {
                continue;
            };
            let Ok(fi) = self.fs.stat(root, out) else {
                continue;
            };
            if let FileEntry::Regular(mut r) = fi.entry {
                if r.digest == *prior_digest && r.mtime_ns != *prior_mtime {
                    trace!(step = %cmd.id, output = %out, "restat: content unchanged");
                    r.mtime_ns = *prior_mtime;
                    r.is_changed = false;
                    let src = if r.action_digest.is_zero() {
                        bx_hashfs::Source::Local
                    } else {
                        bx_hashfs::Source::Remote
                    };
                    self.fs.update(root, out, FileEntry::Regular(r), src)?;
                }
            }
        }
        Ok(())
    }

    async fn run_local(
        &self,
        cmd: &Cmd,
        prior_outputs: &HashMap<String, (Digest, i64)>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, ExecError> {
        let root = &self.config.exec_root;
        let _local = self.limits.local.wait_acquire(cmd.weight, cancel).await?;

        {
            // Process-start setup (input flush, rspfile, output dirs) is
            // disk-heavy; gate the burst with the startlocal pool.
            let _start = self.limits.startlocal.wait_acquire(cmd.weight, cancel).await?;

            // Inputs produced remotely may exist only in the content
            // store.
            let mut flush: Vec<String> = cmd.inputs.clone();
            flush.sort();
            flush.dedup();
            self.fs.flush(root, &flush)?;

            if let Some((name, content)) = &cmd.rspfile {
                let path = Utf8PathBuf::from(format!("{}/{}", root, name));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| bx_hashfs::FsError::io("mkdir", parent, e))?;
                }
                std::fs::write(&path, content)
                    .map_err(|e| bx_hashfs::FsError::io("write", &path, e))?;
            }
            for out in &cmd.outputs {
                let path = Utf8PathBuf::from(format!("{}/{}", root, out));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| bx_hashfs::FsError::io("mkdir", parent, e))?;
                }
            }
        }

        self.phase(cmd, Phase::Running);
        let res = local::run(cmd, root, cancel).await?;

        if res.canceled {
            return Ok(StepResult {
                status: StepStatus::Canceled,
                exit_code: res.exit_code,
                stdout: res.stdout,
                stderr: res.stderr,
                action_digest: Digest::empty(),
                rusage: res.rusage,
            });
        }
        if res.timed_out {
            return Ok(StepResult {
                status: StepStatus::Timeout,
                exit_code: res.exit_code,
                stdout: res.stdout,
                stderr: res.stderr,
                action_digest: Digest::empty(),
                rusage: res.rusage,
            });
        }
        if res.exit_code != 0 {
            return Ok(StepResult {
                status: StepStatus::NonZeroExit,
                exit_code: res.exit_code,
                stdout: res.stdout,
                stderr: res.stderr,
                action_digest: Digest::empty(),
                rusage: res.rusage,
            });
        }

        self.stat_outputs(cmd, prior_outputs)?;

        Ok(StepResult {
            status: StepStatus::Success,
            exit_code: 0,
            stdout: res.stdout,
            stderr: res.stderr,
            action_digest: Digest::empty(),
            rusage: res.rusage,
        })
    }

    /// Refresh output entries from disk after a local run, tagging them
    /// with the command hash. Restat rules restore the prior mtime when
    /// content is unchanged so dependents are not re-triggered; a
    /// dangling symlink output is left as the link record, never
    /// followed.
    fn stat_outputs(
        &self,
        cmd: &Cmd,
        prior_outputs: &HashMap<String, (Digest, i64)>,
    ) -> Result<(), ExecError> {
        let root = &self.config.exec_root;
        let cmd_hash = cmd.cmd_hash().to_le_bytes().to_vec();
        for out in &cmd.outputs {
            self.fs.forget(root, out);
            let fi = match self.fs.stat(root, out) {
                Ok(fi) => fi,
                Err(e) if e.is_not_found() => {
                    if self.config.ignore_missing_outputs {
                        warn!(step = %cmd.id, output = %out, "output missing (ignored)");
                        continue;
                    }
                    return Err(ExecError::MissingOutput {
                        step: cmd.id.clone(),
                        output: out.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            match fi.entry {
                FileEntry::Regular(mut r) => {
                    r.action_digest = Digest::empty();
                    r.cmd_hash = cmd_hash.clone();
                    if cmd.restat {
                        if let Some((prior_digest, prior_mtime)) = prior_outputs.get(out) {
                            if *prior_digest == r.digest {
                                trace!(step = %cmd.id, output = %out, "restat: content unchanged");
                                r.mtime_ns = *prior_mtime;
                                r.is_changed = false;
                            }
                        }
                    }
                    self.fs.update(
                        root,
                        out,
                        FileEntry::Regular(r),
                        bx_hashfs::Source::Local,
                    )?;
                }
                // Symlink and directory outputs are kept as stat'd.
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // recording
    // ------------------------------------------------------------------

    /// Merge discovered dependencies into the deps log and append the
    /// ninja log record.
    fn record_finish(
        &self,
        cmd: &Cmd,
        mut result: StepResult,
        started: Instant,
    ) -> Result<StepResult, ExecError> {
        if !result.ok() {
            return Ok(result);
        }
        let root = &self.config.exec_root;

        let deps_mtime = self
            .fs
            .stat(root, cmd.primary_output())
            .map(|fi| fi.entry.mtime_ns())
            .unwrap_or(0);

        match cmd.deps {
            DepsMode::Gcc => {
                if let Some(depfile) = &cmd.depfile {
                    match self.fs.read_file(root, depfile) {
                        Ok(content) => {
                            let content = String::from_utf8_lossy(&content);
                            let deps: Vec<String> = makeutil::parse_deps(&content)
                                .into_iter()
                                .map(|p| self.normalize_dep(p.as_str()))
                                .collect();
                            self.deps_log
                                .lock()
                                .unwrap()
                                .record(cmd.primary_output(), deps_mtime, &deps)?;
                        }
                        Err(e) => {
                            warn!(step = %cmd.id, depfile = %depfile, err = %e, "depfile unreadable");
                        }
                    }
                }
            }
            DepsMode::Msvc => {
                let stdout = String::from_utf8_lossy(&result.stdout).into_owned();
                let deps: Vec<String> = makeutil::parse_show_includes(&stdout)
                    .into_iter()
                    .map(|p| self.normalize_dep(p.as_str()))
                    .collect();
                if !deps.is_empty() {
                    self.deps_log
                        .lock()
                        .unwrap()
                        .record(cmd.primary_output(), deps_mtime, &deps)?;
                }
                result.stdout = makeutil::filter_show_includes(&stdout).into_bytes();
            }
            DepsMode::None => {}
        }

        let end = Instant::now();
        self.ninja_log.lock().unwrap().record(NinjaLogEntry {
            start_ms: started
                .saturating_duration_since(self.build_start)
                .as_millis() as u64,
            end_ms: end.saturating_duration_since(self.build_start).as_millis() as u64,
            mtime_ns: deps_mtime,
            target: cmd.primary_output().to_string(),
            cmd_hash: cmd.cmd_hash(),
        })?;
        Ok(result)
    }

    /// Depfile paths may be absolute; inside the exec root they
    /// normalize to relative form.
    fn normalize_dep(&self, dep: &str) -> String {
        if let Some(rel) = paths::rel_under(&self.config.exec_root, dep) {
            rel.to_string()
        } else {
            paths::normalize(dep)
        }
    }
}
