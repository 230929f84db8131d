//! The per-step command model.

use std::time::Duration;

use bx_digest::Digest;
use bx_hashfs::{FileEntry, HashFS, RegularEntry, Source, SymlinkEntry};
use bx_reapi::{merkle, Action, ActionResult, Command};

use crate::ExecError;

/// How the compiler reports discovered dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepsMode {
    #[default]
    None,
    /// Depfile in make format (`-MD`/`-MMD`).
    Gcc,
    /// `/showIncludes` notes on stdout.
    Msvc,
}

/// One build step's command, as read from the manifest plus runtime
/// fields filled by the executor.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    /// Step identity; the primary output path.
    pub id: String,
    pub rule: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory relative to the exec root; empty means the
    /// exec root itself.
    pub dir: String,
    /// Response file name and content, written next to the outputs.
    pub rspfile: Option<(String, String)>,
    /// Declared inputs, exec-root relative. Scandeps may extend these.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub depfile: Option<String>,
    pub deps: DepsMode,
    pub restat: bool,
    pub pool: String,
    /// Remote platform properties; empty means not remote-executable.
    pub platform: Vec<(String, String)>,
    pub exec_timeout: Duration,
    /// Whether the command is a pure function of its declared inputs.
    pub pure: bool,
    /// REProxy configuration, when the step should dispatch through a
    /// local proxy wrapper instead of the backend.
    pub reproxy_config: Option<String>,
    /// Scheduling weight; higher runs earlier under contention.
    pub weight: i32,
}

impl Cmd {
    /// Primary output, the key used in the ninja and deps logs.
    pub fn primary_output(&self) -> &str {
        self.outputs.first().map(String::as_str).unwrap_or(&self.id)
    }

    /// Stable hash of the command line and response-file content,
    /// recorded in the ninja log and on produced outputs.
    pub fn cmd_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cmd:");
        for a in &self.args {
            hasher.update(a.as_bytes());
            hasher.update(b"\0");
        }
        if let Some((name, content)) = &self.rspfile {
            hasher.update(b"rsp:");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(content.as_bytes());
        }
        u64::from_le_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap())
    }

    /// Stable hash of the step's position in the graph (sorted inputs
    /// and outputs).
    pub fn edge_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"edge:");
        let mut inputs = self.inputs.clone();
        inputs.sort();
        for p in &inputs {
            hasher.update(p.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"|");
        let mut outputs = self.outputs.clone();
        outputs.sort();
        for p in &outputs {
            hasher.update(p.as_bytes());
            hasher.update(b"\0");
        }
        u64::from_le_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap())
    }

    /// Assemble the wire command. Outputs are canonicalized (sorted);
    /// environment and platform are kept sorted by key.
    pub fn reapi_command(&self) -> Command {
        let mut env = self.env.clone();
        env.sort();
        let mut output_paths = self.outputs.clone();
        if let Some(depfile) = &self.depfile {
            if !output_paths.contains(depfile) {
                output_paths.push(depfile.clone());
            }
        }
        output_paths.sort();
        let mut platform = self.platform.clone();
        platform.sort();
        Command {
            arguments: self.args.clone(),
            env,
            output_paths,
            platform,
            working_directory: self.dir.clone(),
        }
    }

    /// Compute the step fingerprint: the Merkle input tree from
    /// `inputs` (post-scandeps), the wire command, and the hashed
    /// action.
    pub fn fingerprint(
        &self,
        fs: &HashFS,
        exec_root: &str,
        inputs: &[String],
    ) -> Result<Fingerprint, ExecError> {
        let mut entries = fs.entries(exec_root, inputs)?;
        if let Some((name, content)) = &self.rspfile {
            let digest = fs.store().put(content.as_bytes())?;
            entries.push((
                name.clone(),
                FileEntry::Regular(RegularEntry {
                    digest,
                    mtime_ns: 0,
                    executable: false,
                    action_digest: Digest::empty(),
                    cmd_hash: Vec::new(),
                    is_changed: false,
                    updated_time: 0,
                }),
            ));
        }
        let tree = merkle::build(&entries)?;
        let command = self.reapi_command();
        let command_digest = command.digest();
        let action = Action {
            command_digest,
            input_root_digest: tree.root_digest,
            timeout_secs: self.exec_timeout.as_secs(),
            do_not_cache: !self.pure,
        };
        Ok(Fingerprint {
            action_digest: action.digest(),
            action,
            command,
            tree,
        })
    }
}

/// A computed step fingerprint.
pub struct Fingerprint {
    pub action: Action,
    pub action_digest: Digest,
    pub command: Command,
    pub tree: merkle::MerkleTree,
}

/// Classification of a finished step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    CacheHit,
    /// Up to date; nothing ran.
    Skipped,
    NonZeroExit,
    Timeout,
    Canceled,
}

/// What a step produced.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub status: StepStatus,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub action_digest: Digest,
    /// Resource usage of a local subprocess, when collected.
    pub rusage: Option<local::Rusage>,
}

impl StepResult {
    pub fn ok(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Success | StepStatus::CacheHit | StepStatus::Skipped
        )
    }
}

use crate::local;

/// Install an action result's outputs into HashFS, tagged with the
/// producing action digest and command hash.
pub fn record_outputs(
    fs: &HashFS,
    exec_root: &str,
    action_digest: Digest,
    cmd_hash: u64,
    result: &ActionResult,
    now_ns: i64,
) -> Result<(), ExecError> {
    let cmd_hash_bytes = cmd_hash.to_le_bytes().to_vec();
    for f in &result.output_files {
        fs.update(
            exec_root,
            &f.path,
            FileEntry::Regular(RegularEntry {
                digest: f.digest,
                mtime_ns: now_ns,
                executable: f.is_executable,
                action_digest,
                cmd_hash: cmd_hash_bytes.clone(),
                is_changed: true,
                updated_time: 0,
            }),
            Source::Remote,
        )?;
    }
    for s in &result.output_symlinks {
        // A dangling target is still a valid product; the entry is the
        // link record itself.
        fs.update(
            exec_root,
            &s.path,
            FileEntry::Symlink(SymlinkEntry {
                target: s.target.clone(),
                mtime_ns: now_ns,
                updated_time: 0,
            }),
            Source::Remote,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cmd() -> Cmd {
        Cmd {
            id: "obj/apps/apps.o".into(),
            rule: "cxx".into(),
            args: vec!["clang++".into(), "-c".into(), "apps/apps.cc".into()],
            outputs: vec!["obj/apps/apps.o".into()],
            inputs: vec!["apps/apps.cc".into()],
            pure: true,
            ..Default::default()
        }
    }

    #[test]
    fn cmd_hash_tracks_args_and_rspfile() {
        let base = sample_cmd();
        let mut changed = base.clone();
        changed.args.push("-O2".into());
        assert_ne!(base.cmd_hash(), changed.cmd_hash());

        let mut with_rsp = base.clone();
        with_rsp.rspfile = Some(("apps.rsp".into(), "-DX=1".into()));
        assert_ne!(base.cmd_hash(), with_rsp.cmd_hash());

        // Inputs do not affect the command hash.
        let mut more_inputs = base.clone();
        more_inputs.inputs.push("apps/apps.h".into());
        assert_eq!(base.cmd_hash(), more_inputs.cmd_hash());
    }

    #[test]
    fn edge_hash_is_order_insensitive() {
        let mut a = sample_cmd();
        a.inputs = vec!["x.h".into(), "y.h".into()];
        let mut b = sample_cmd();
        b.inputs = vec!["y.h".into(), "x.h".into()];
        assert_eq!(a.edge_hash(), b.edge_hash());

        let mut c = sample_cmd();
        c.inputs = vec!["x.h".into(), "z.h".into()];
        assert_ne!(a.edge_hash(), c.edge_hash());
    }

    #[test]
    fn reapi_command_includes_depfile_output() {
        let mut cmd = sample_cmd();
        cmd.depfile = Some("obj/apps/apps.o.d".into());
        let wire = cmd.reapi_command();
        assert_eq!(
            wire.output_paths,
            vec!["obj/apps/apps.o".to_string(), "obj/apps/apps.o.d".to_string()]
        );
    }
}
