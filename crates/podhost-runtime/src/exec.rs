//! Synchronous command execution for `ExecSync` and the diagnostics channel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use podhost_common::error::{PodhostError, Result};
use tokio::process::Command;

/// Output from an exec command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i32,
}

/// Runs a command to completion and captures its output.
///
/// `on_spawn` receives the PID right after the process starts, before any
/// output is read; the process is killed if it fails. A `None` timeout
/// waits indefinitely.
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty command or one that cannot be
/// started, `DeadlineExceeded` if `timeout` passes first, or whatever
/// `on_spawn` returns.
pub async fn run(
    argv: &[String],
    env: &[(String, String)],
    cwd: &Path,
    timeout: Option<Duration>,
    on_spawn: impl FnOnce(u32) -> Result<()> + Send,
) -> Result<ExecOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| PodhostError::invalid("exec command is empty"))?;
    tracing::debug!(cmd = ?argv, cwd = %cwd.display(), "exec");

    let mut child = Command::new(resolve_program(program)?)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PodhostError::invalid(format!("starting {program:?}: {e}")))?;

    let pid = child.id();
    if let Some(pid) = pid {
        if let Err(e) = on_spawn(pid) {
            kill_group(pid);
            let _ = child.start_kill();
            return Err(e);
        }
    }

    let output = match timeout {
        Some(limit) => {
            let Ok(output) = tokio::time::timeout(limit, child.wait_with_output()).await else {
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                return Err(PodhostError::DeadlineExceeded {
                    operation: format!("exec {program}"),
                    timeout: limit,
                });
            };
            output
        }
        None => child.wait_with_output().await,
    }
    .map_err(|e| PodhostError::internal(format!("collecting output of {program:?}: {e}")))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Kills every process in the group led by `pid`, including children the
/// command left behind.
fn kill_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "killing exec process group"),
    }
}

/// Resolves a bare program name through `PATH`; paths are used as given.
///
/// # Errors
///
/// Returns `InvalidArgument` if the program cannot be found.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program)
        .map_err(|_| PodhostError::invalid(format!("executable {program:?} not found in PATH")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run(
            &argv(&["sh", "-c", "echo out; echo err >&2; exit 7"]),
            &[],
            dir.path(),
            None,
            |_| Ok(()),
        )
        .await
        .expect("exec");
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn timeout_is_deadline_exceeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run(
            &argv(&["sleep", "10"]),
            &[],
            dir.path(),
            Some(Duration::from_millis(200)),
            |_| Ok(()),
        )
        .await
        .expect_err("timeout");
        assert!(matches!(err, PodhostError::DeadlineExceeded { .. }));
    }

    fn is_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run(
            &argv(&["sh", "-c", "sleep 30 & echo $! > child.pid; wait"]),
            &[],
            dir.path(),
            Some(Duration::from_millis(300)),
            |_| Ok(()),
        )
        .await
        .expect_err("timeout");
        assert!(matches!(err, PodhostError::DeadlineExceeded { .. }));

        let child: i32 = std::fs::read_to_string(dir.path().join("child.pid"))
            .expect("child pid")
            .trim()
            .parse()
            .expect("pid");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !is_gone(child) {
            assert!(std::time::Instant::now() < deadline, "background sleep {child} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn missing_program_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run(&argv(&["podhost-no-such-binary"]), &[], dir.path(), None, |_| Ok(()))
            .await
            .expect_err("missing");
        assert!(err.to_string().contains("not found in PATH"));
    }

    #[tokio::test]
    async fn failed_spawn_hook_aborts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run(&argv(&["sleep", "10"]), &[], dir.path(), None, |_| {
            Err(PodhostError::internal("no cgroup"))
        })
        .await
        .expect_err("hook failure");
        assert!(matches!(err, PodhostError::Internal { .. }));
    }
}
