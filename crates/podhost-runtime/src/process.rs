//! Workload process supervision.
//!
//! Each workload runs in its own process group with stdout and stderr
//! appended to its log file. A reaper task waits on the child and publishes
//! its exit code, so any number of callers can wait for the exit.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use podhost_common::error::{PodhostError, Result};
use tokio::process::Command;
use tokio::sync::watch;

/// Everything needed to start a workload process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Environment added on top of the runtime's own.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: PathBuf,
    /// File receiving stdout and stderr.
    pub log_path: PathBuf,
}

/// Handle to a supervised process group.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    /// PID of the group leader.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code if the process has already exited.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Waits for the process to exit and returns its exit code.
    ///
    /// A process killed by a signal reports `128 + signal`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reaper task went away without an exit code.
    pub async fn wait(&self) -> Result<i32> {
        let mut exit = self.exit.clone();
        let code = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PodhostError::internal(format!("reaper for pid {} vanished", self.pid)))?;
        Ok((*code).unwrap_or(-1))
    }

    /// Sends a signal to the whole process group.
    ///
    /// A group that has already exited is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pgid = i32::try_from(self.pid)
            .map_err(|_| PodhostError::internal(format!("pid {} out of range", self.pid)))?;
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {
                tracing::debug!(pid = self.pid, ?signal, "signalled process group");
                Ok(())
            }
            Err(e) => Err(PodhostError::internal(format!(
                "sending {signal:?} to process group {}: {e}",
                self.pid
            ))),
        }
    }

    /// Stops the process group and returns its exit code.
    ///
    /// Sends `SIGTERM`, waits up to `grace` for the process to exit, then
    /// sends `SIGKILL`. A zero `grace` kills immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if signalling or waiting fails.
    pub async fn terminate(&self, grace: Duration) -> Result<i32> {
        if let Some(code) = self.exit_code() {
            return Ok(code);
        }
        if !grace.is_zero() {
            self.signal(Signal::SIGTERM)?;
            if let Ok(code) = tokio::time::timeout(grace, self.wait()).await {
                return code;
            }
            tracing::info!(pid = self.pid, ?grace, "grace period elapsed, killing");
        }
        self.signal(Signal::SIGKILL)?;
        self.wait().await
    }
}

/// Spawns a workload in a new process group and starts its reaper.
///
/// # Errors
///
/// Returns an error if the command is empty, the log file cannot be opened,
/// or the process cannot be spawned.
pub fn spawn(spec: &SpawnSpec) -> Result<ProcessHandle> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| PodhostError::invalid("command is empty"))?;
    let log = crate::logs::open_log(&spec.log_path)?;
    let log_err = log.try_clone().map_err(|e| PodhostError::Io {
        path: spec.log_path.clone(),
        source: e,
    })?;

    let mut child = Command::new(crate::exec::resolve_program(program)?)
        .args(args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()
        .map_err(|e| PodhostError::invalid(format!("starting {program:?}: {e}")))?;
    let pid = child.id().ok_or_else(|| {
        PodhostError::internal(format!("{program:?} exited before reporting a pid"))
    })?;

    let (tx, rx) = watch::channel(None);
    drop(tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status
                .code()
                .or_else(|| status.signal().map(|sig| 128 + sig))
                .unwrap_or(-1),
            Err(e) => {
                tracing::error!(pid, error = %e, "waiting on workload failed");
                -1
            }
        };
        tracing::debug!(pid, code, "workload exited");
        let _ = tx.send(Some(code));
    }));

    tracing::info!(pid, program = %program, "workload spawned");
    Ok(ProcessHandle { pid, exit: rx })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn spec(dir: &std::path::Path, argv: &[&str]) -> SpawnSpec {
        SpawnSpec {
            argv: argv.iter().map(ToString::to_string).collect(),
            env: vec![("GREETING".into(), "hello".into())],
            cwd: dir.to_path_buf(),
            log_path: dir.join("out.log"),
        }
    }

    #[tokio::test]
    async fn natural_exit_code_is_published() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = spawn(&spec(dir.path(), &["sh", "-c", "echo $GREETING; exit 3"]))
            .expect("spawn");
        assert_eq!(handle.wait().await.expect("wait"), 3);
        assert_eq!(handle.exit_code(), Some(3));
        let log = std::fs::read_to_string(dir.path().join("out.log")).expect("log");
        assert!(log.contains("hello"));
    }

    #[tokio::test]
    async fn terminate_with_zero_grace_kills_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = spawn(&spec(dir.path(), &["sleep", "30"])).expect("spawn");
        let started = Instant::now();
        let code = handle.terminate(Duration::ZERO).await.expect("terminate");
        assert_eq!(code, 128 + 9);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminate_escalates_after_grace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = spawn(&spec(dir.path(), &["sh", "-c", "trap '' TERM; sleep 30"]))
            .expect("spawn");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        let code = handle
            .terminate(Duration::from_secs(1))
            .await
            .expect("terminate");
        let elapsed = started.elapsed();
        assert_eq!(code, 128 + 9);
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(spawn(&spec(dir.path(), &[])).is_err());
    }
}
