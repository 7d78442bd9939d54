//! Isolation backend abstraction.
//!
//! A backend provides the sandbox boundary: it boots and tears down
//! sandboxes, runs container workloads inside them, and (for backends that
//! support templates) snapshots a sandbox and forks new sandboxes from the
//! snapshot.

pub mod hypervisor;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ContainerId, IsolationKind, ResourceLimits, SandboxId};
use podhost_core::enforcer::ResourceEnforcer;
use podhost_core::scope::Scope;

use crate::exec::ExecOutput;
use crate::options::{SandboxOptions, VmTopology};
use crate::process::{ProcessHandle, SpawnSpec};

/// What a backend needs to boot a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Sandbox identity.
    pub id: SandboxId,
    /// Parsed sandbox annotations.
    pub options: SandboxOptions,
    /// Scratch directory owned by the sandbox.
    pub root: PathBuf,
}

/// A booted sandbox as seen by its backend.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Sandbox identity.
    pub id: SandboxId,
    /// Backend that owns the sandbox.
    pub isolation: IsolationKind,
    /// Scratch directory owned by the sandbox.
    pub root: PathBuf,
}

impl SandboxHandle {
    /// Root filesystem directory of a container in this sandbox.
    #[must_use]
    pub fn container_rootfs(&self, container: &ContainerId) -> PathBuf {
        container_dir(&self.root, container).join("rootfs")
    }
}

/// A container workload to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Container the workload belongs to.
    pub container: ContainerId,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Environment for the workload.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: PathBuf,
    /// File receiving stdout and stderr.
    pub log_path: PathBuf,
}

/// Captured sandbox state a clone can be forked from.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Template sandbox the snapshot was taken from.
    pub template: SandboxId,
    /// Directory holding the captured state.
    pub image_dir: PathBuf,
    /// VM shape at the time of the snapshot.
    pub topology: VmTopology,
}

/// Platform isolation backend.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Isolation this backend provides.
    fn kind(&self) -> IsolationKind;

    /// Boots a fresh sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox cannot be created or configured.
    async fn boot(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Boots a sandbox from a template snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for backends without templates.
    async fn fork(&self, spec: &SandboxSpec, snapshot: &Snapshot) -> Result<SandboxHandle> {
        let _ = (spec, snapshot);
        Err(PodhostError::unsupported(format!(
            "cloning a {} sandbox",
            self.kind()
        )))
    }

    /// Stops the sandbox; its scratch state stays until [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to stop.
    async fn shutdown(&self, sandbox: &SandboxHandle) -> Result<()>;

    /// Frees everything the sandbox holds. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if scratch state cannot be removed.
    async fn release(&self, sandbox: &SandboxHandle) -> Result<()>;

    /// Creates an empty root directory for a new container.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn prepare_container(
        &self,
        sandbox: &SandboxHandle,
        container: &ContainerId,
    ) -> Result<PathBuf> {
        let rootfs = sandbox.container_rootfs(container);
        std::fs::create_dir_all(&rootfs).map_err(|e| PodhostError::Io {
            path: rootfs.clone(),
            source: e,
        })?;
        Ok(rootfs)
    }

    /// Gives a new container the saved state of a template container.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for backends without templates.
    async fn restore_container(
        &self,
        sandbox: &SandboxHandle,
        template_container: &ContainerId,
        container: &ContainerId,
    ) -> Result<PathBuf> {
        let _ = (sandbox, template_container, container);
        Err(PodhostError::unsupported(format!(
            "restoring a container in a {} sandbox",
            self.kind()
        )))
    }

    /// Removes a container's root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    fn discard_container(&self, sandbox: &SandboxHandle, container: &ContainerId) -> Result<()> {
        remove_dir_if_exists(&container_dir(&sandbox.root, container))
    }

    /// Starts a container workload.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox cannot run workloads or the process
    /// fails to start.
    async fn launch(
        &self,
        sandbox: &SandboxHandle,
        workload: &WorkloadSpec,
    ) -> Result<ProcessHandle>;

    /// Runs a command in a container's context and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot run or times out.
    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        workload: &WorkloadSpec,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput>;

    /// Captures the sandbox's state into `image_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for backends without templates.
    async fn snapshot(&self, sandbox: &SandboxHandle, image_dir: &Path) -> Result<Snapshot> {
        let _ = (sandbox, image_dir);
        Err(PodhostError::unsupported(format!(
            "saving a {} sandbox as a template",
            self.kind()
        )))
    }

    /// Reads back the sandbox-level resource configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox is unknown to the backend.
    fn sandbox_resources(&self, sandbox: &SandboxHandle) -> Result<ResourceLimits>;

    /// Changes sandbox-level resources on a running sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the new limits cannot be applied.
    fn update_sandbox_resources(&self, sandbox: &SandboxHandle, limits: &ResourceLimits)
    -> Result<()>;
}

/// Directory holding everything a container owns inside a sandbox.
#[must_use]
pub fn container_dir(sandbox_root: &Path, container: &ContainerId) -> PathBuf {
    sandbox_root.join("containers").join(container.as_str())
}

/// Runs a workload as a host process group confined to its container's cgroup.
pub(crate) fn spawn_confined(
    enforcer: &Arc<dyn ResourceEnforcer>,
    sandbox: &SandboxHandle,
    workload: &WorkloadSpec,
) -> Result<ProcessHandle> {
    let handle = crate::process::spawn(&SpawnSpec {
        argv: workload.argv.clone(),
        env: workload.env.clone(),
        cwd: workload.cwd.clone(),
        log_path: workload.log_path.clone(),
    })?;
    let scope = Scope::container(sandbox.id.clone(), workload.container.clone());
    if let Err(e) = enforcer.attach(&scope, handle.pid()) {
        let _ = handle.signal(nix::sys::signal::Signal::SIGKILL);
        return Err(e);
    }
    Ok(handle)
}

/// Runs a command in a container's context, confined to its cgroup.
pub(crate) async fn exec_confined(
    enforcer: &Arc<dyn ResourceEnforcer>,
    sandbox: &SandboxHandle,
    workload: &WorkloadSpec,
    timeout: Option<Duration>,
) -> Result<ExecOutput> {
    let scope = Scope::container(sandbox.id.clone(), workload.container.clone());
    crate::exec::run(
        &workload.argv,
        &workload.env,
        &workload.cwd,
        timeout,
        |pid| enforcer.attach(&scope, pid),
    )
    .await
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PodhostError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
