//! Local subprocess execution.

use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Cmd, ExecError};

/// How long a canceled process gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Resource usage of a finished subprocess (Unix only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rusage {
    pub user_us: i64,
    pub sys_us: i64,
    pub max_rss_kb: i64,
}

/// Result of a local run.
#[derive(Debug)]
pub struct LocalResult {
    pub exit_code: i32,
    pub timed_out: bool,
    pub canceled: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub rusage: Option<Rusage>,
}

#[cfg(unix)]
fn children_rusage() -> Rusage {
    // SAFETY: plain getrusage call writing into a zeroed struct.
    unsafe {
        let mut ru: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_CHILDREN, &mut ru) != 0 {
            return Rusage::default();
        }
        Rusage {
            user_us: ru.ru_utime.tv_sec as i64 * 1_000_000 + ru.ru_utime.tv_usec as i64,
            sys_us: ru.ru_stime.tv_sec as i64 * 1_000_000 + ru.ru_stime.tv_usec as i64,
            max_rss_kb: ru.ru_maxrss as i64,
        }
    }
}

/// Run `cmd` as a subprocess under `exec_root`, honoring the step
/// timeout and cooperative cancellation. On cancel the process gets
/// SIGTERM, then SIGKILL after a grace period.
pub async fn run(
    cmd: &Cmd,
    exec_root: &str,
    cancel: &CancellationToken,
) -> Result<LocalResult, ExecError> {
    let program = cmd
        .args
        .first()
        .ok_or_else(|| ExecError::Internal(format!("{}: empty command", cmd.id)))?;
    let cwd = if cmd.dir.is_empty() {
        exec_root.to_string()
    } else {
        format!("{}/{}", exec_root, cmd.dir)
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(&cmd.args[1..])
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !cmd.env.is_empty() {
        for (k, v) in &cmd.env {
            command.env(k, v);
        }
    }

    #[cfg(unix)]
    let usage_before = children_rusage();

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        path: Utf8PathBuf::from(program),
        source,
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(out) = stdout_pipe.as_mut() {
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(err) = stderr_pipe.as_mut() {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    let timeout = if cmd.exec_timeout.is_zero() {
        Duration::from_secs(24 * 60 * 60)
    } else {
        cmd.exec_timeout
    };

    let mut timed_out = false;
    let mut canceled = false;
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            None
        }
        _ = cancel.cancelled() => {
            canceled = true;
            None
        }
    };

    let status = match status {
        Some(status) => status,
        None => {
            terminate(&mut child, canceled).await;
            child.wait().await
        }
    };

    let exit_code = match status {
        Ok(st) => exit_code_of(st),
        Err(e) => {
            warn!(step = %cmd.id, err = %e, "wait failed");
            -1
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    #[cfg(unix)]
    let rusage = {
        let after = children_rusage();
        Some(Rusage {
            user_us: after.user_us - usage_before.user_us,
            sys_us: after.sys_us - usage_before.sys_us,
            max_rss_kb: after.max_rss_kb,
        })
    };
    #[cfg(not(unix))]
    let rusage = None;

    debug!(step = %cmd.id, exit_code, timed_out, canceled, "local run finished");
    Ok(LocalResult {
        exit_code,
        timed_out,
        canceled,
        stdout,
        stderr,
        rusage,
    })
}

/// Stop a process: SIGTERM and a grace period when canceled, straight
/// SIGKILL on timeout.
async fn terminate(child: &mut tokio::process::Child, graceful: bool) {
    #[cfg(unix)]
    if graceful {
        if let Some(pid) = child.id() {
            // SAFETY: signaling a child we own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tokio::select! {
                _ = child.wait() => return,
                _ = tokio::time::sleep(KILL_GRACE) => {}
            }
        }
    }
    let _ = graceful;
    let _ = child.start_kill();
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(id: &str, script: &str) -> Cmd {
        Cmd {
            id: id.into(),
            rule: "sh".into(),
            args: vec!["/bin/sh".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let cancel = CancellationToken::new();

        let res = run(&shell("t", "echo out; echo err >&2; exit 3"), root, &cancel)
            .await
            .unwrap();
        assert_eq!(res.exit_code, 3);
        assert_eq!(res.stdout, b"out\n");
        assert_eq!(res.stderr, b"err\n");
        assert!(!res.timed_out);
        assert!(res.rusage.is_some());
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let cancel = CancellationToken::new();

        let mut cmd = shell("t", "sleep 30");
        cmd.exec_timeout = Duration::from_millis(100);
        let res = run(&cmd, root, &cancel).await.unwrap();
        assert!(res.timed_out);
        assert_ne!(res.exit_code, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let cancel = CancellationToken::new();

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });
        let res = run(&shell("t", "sleep 30"), root, &cancel).await.unwrap();
        assert!(res.canceled);
        assert_ne!(res.exit_code, 0);
    }

    #[tokio::test]
    async fn runs_in_exec_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let root = root.to_str().unwrap();
        let cancel = CancellationToken::new();

        let res = run(&shell("t", "pwd"), root, &cancel).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&res.stdout).trim(), root);
    }
}
