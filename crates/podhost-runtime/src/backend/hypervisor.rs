//! Hypervisor-isolation backend.
//!
//! Each sandbox is a utility VM with its own topology. The VM's state lives
//! in the sandbox root (`vm.json` plus the container directories), so a
//! snapshot is a copy of that tree and a fork boots from the copy. Guest
//! workloads run as process groups confined to per-container cgroups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use podhost_common::config::VmDefaults;
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ContainerId, IsolationKind, ResourceLimits, SandboxId};
use podhost_core::enforcer::ResourceEnforcer;
use podhost_core::scope::Scope;
use walkdir::WalkDir;

use super::{
    IsolationBackend, SandboxHandle, SandboxSpec, Snapshot, WorkloadSpec, container_dir,
    exec_confined, remove_dir_if_exists, spawn_confined,
};
use crate::exec::ExecOutput;
use crate::options::VmTopology;
use crate::process::ProcessHandle;

const VM_CONFIG_FILE: &str = "vm.json";
const SNAPSHOT_STATE_DIR: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmState {
    Running,
    Saved,
    Stopped,
}

#[derive(Debug, Clone)]
struct VmRecord {
    topology: VmTopology,
    state: VmState,
}

/// Runs each sandbox in its own utility VM.
pub struct HypervisorBackend {
    enforcer: Arc<dyn ResourceEnforcer>,
    defaults: VmDefaults,
    vms: Mutex<HashMap<SandboxId, VmRecord>>,
}

impl HypervisorBackend {
    /// Creates a backend whose VMs fall back to `defaults` for unset
    /// topology fields.
    #[must_use]
    pub fn new(enforcer: Arc<dyn ResourceEnforcer>, defaults: VmDefaults) -> Self {
        Self {
            enforcer,
            defaults,
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Topology of a live VM.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the backend has no VM for `sandbox`.
    pub fn topology(&self, sandbox: &SandboxId) -> Result<VmTopology> {
        self.vms()?
            .get(sandbox)
            .map(|vm| vm.topology)
            .ok_or_else(|| vm_not_found(sandbox))
    }

    fn vms(&self) -> Result<MutexGuard<'_, HashMap<SandboxId, VmRecord>>> {
        self.vms
            .lock()
            .map_err(|_| PodhostError::internal("VM table lock poisoned"))
    }

    fn ensure_running(&self, sandbox: &SandboxId) -> Result<()> {
        let vms = self.vms()?;
        let vm = vms.get(sandbox).ok_or_else(|| vm_not_found(sandbox))?;
        match vm.state {
            VmState::Running => Ok(()),
            VmState::Saved => Err(PodhostError::precondition(format!(
                "VM {sandbox} has been saved as a template and cannot run workloads"
            ))),
            VmState::Stopped => Err(PodhostError::precondition(format!("VM {sandbox} is stopped"))),
        }
    }

    fn register(&self, spec: &SandboxSpec, topology: VmTopology) -> Result<SandboxHandle> {
        write_vm_config(&spec.root, &topology)?;
        let _ = self.vms()?.insert(
            spec.id.clone(),
            VmRecord {
                topology,
                state: VmState::Running,
            },
        );
        Ok(SandboxHandle {
            id: spec.id.clone(),
            isolation: IsolationKind::Hypervisor,
            root: spec.root.clone(),
        })
    }
}

#[async_trait]
impl IsolationBackend for HypervisorBackend {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Hypervisor
    }

    async fn boot(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let topology = spec.options.topology(&self.defaults);
        std::fs::create_dir_all(&spec.root).map_err(|e| PodhostError::Io {
            path: spec.root.clone(),
            source: e,
        })?;
        let handle = self.register(spec, topology)?;
        tracing::info!(
            sandbox_id = %spec.id,
            memory_mb = topology.memory_mb,
            processors = topology.processor_count,
            "utility VM booted"
        );
        Ok(handle)
    }

    async fn fork(&self, spec: &SandboxSpec, snapshot: &Snapshot) -> Result<SandboxHandle> {
        let topology = spec.options.topology(&self.defaults);
        snapshot.topology.check_clone(&topology)?;
        let state = snapshot.image_dir.join(SNAPSHOT_STATE_DIR);
        if let Err(e) = copy_tree(&state, &spec.root) {
            let _ = remove_dir_if_exists(&spec.root);
            return Err(e);
        }
        let handle = self.register(spec, topology)?;
        tracing::info!(
            sandbox_id = %spec.id,
            template_id = %snapshot.template,
            "utility VM forked from template"
        );
        Ok(handle)
    }

    async fn shutdown(&self, sandbox: &SandboxHandle) -> Result<()> {
        if let Some(vm) = self.vms()?.get_mut(&sandbox.id) {
            vm.state = VmState::Stopped;
        }
        tracing::debug!(sandbox_id = %sandbox.id, "utility VM shut down");
        Ok(())
    }

    async fn release(&self, sandbox: &SandboxHandle) -> Result<()> {
        let _ = self.vms()?.remove(&sandbox.id);
        self.enforcer.release(&Scope::sandbox(sandbox.id.clone()))?;
        remove_dir_if_exists(&sandbox.root)
    }

    async fn restore_container(
        &self,
        sandbox: &SandboxHandle,
        template_container: &ContainerId,
        container: &ContainerId,
    ) -> Result<PathBuf> {
        self.ensure_running(&sandbox.id)?;
        let from = container_dir(&sandbox.root, template_container);
        let to = container_dir(&sandbox.root, container);
        if !from.is_dir() {
            return Err(PodhostError::precondition(format!(
                "VM {} holds no saved state for container {template_container}",
                sandbox.id
            )));
        }
        std::fs::rename(&from, &to).map_err(|e| PodhostError::Io {
            path: from.clone(),
            source: e,
        })?;
        tracing::debug!(
            sandbox_id = %sandbox.id,
            %template_container,
            %container,
            "container restored from template state"
        );
        Ok(sandbox.container_rootfs(container))
    }

    async fn launch(
        &self,
        sandbox: &SandboxHandle,
        workload: &WorkloadSpec,
    ) -> Result<ProcessHandle> {
        self.ensure_running(&sandbox.id)?;
        spawn_confined(&self.enforcer, sandbox, workload)
    }

    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        workload: &WorkloadSpec,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        self.ensure_running(&sandbox.id)?;
        exec_confined(&self.enforcer, sandbox, workload, timeout).await
    }

    async fn snapshot(&self, sandbox: &SandboxHandle, image_dir: &Path) -> Result<Snapshot> {
        let topology = {
            let mut vms = self.vms()?;
            let vm = vms
                .get_mut(&sandbox.id)
                .ok_or_else(|| vm_not_found(&sandbox.id))?;
            if vm.state != VmState::Running {
                return Err(PodhostError::precondition(format!(
                    "VM {} cannot be saved from state {:?}",
                    sandbox.id, vm.state
                )));
            }
            vm.state = VmState::Saved;
            vm.topology
        };
        let state = image_dir.join(SNAPSHOT_STATE_DIR);
        if let Err(e) = copy_tree(&sandbox.root, &state) {
            let _ = remove_dir_if_exists(image_dir);
            if let Some(vm) = self.vms()?.get_mut(&sandbox.id) {
                vm.state = VmState::Running;
            }
            return Err(e);
        }
        tracing::info!(
            sandbox_id = %sandbox.id,
            image = %image_dir.display(),
            "utility VM state saved"
        );
        Ok(Snapshot {
            template: sandbox.id.clone(),
            image_dir: image_dir.to_path_buf(),
            topology,
        })
    }

    fn sandbox_resources(&self, sandbox: &SandboxHandle) -> Result<ResourceLimits> {
        Ok(self.topology(&sandbox.id)?.limits())
    }

    fn update_sandbox_resources(
        &self,
        sandbox: &SandboxHandle,
        limits: &ResourceLimits,
    ) -> Result<()> {
        let mut vms = self.vms()?;
        let vm = vms
            .get_mut(&sandbox.id)
            .ok_or_else(|| vm_not_found(&sandbox.id))?;
        if vm.state != VmState::Running {
            return Err(PodhostError::precondition(format!(
                "VM {} is not running",
                sandbox.id
            )));
        }
        let mut topology = vm.topology;
        topology.update(limits);
        write_vm_config(&sandbox.root, &topology)?;
        vm.topology = topology;
        drop(vms);
        tracing::debug!(sandbox_id = %sandbox.id, "VM resources updated");
        Ok(())
    }
}

fn vm_not_found(sandbox: &SandboxId) -> PodhostError {
    PodhostError::NotFound {
        kind: "VM",
        id: sandbox.to_string(),
    }
}

fn write_vm_config(root: &Path, topology: &VmTopology) -> Result<()> {
    let path = root.join(VM_CONFIG_FILE);
    let json = serde_json::to_vec_pretty(topology)?;
    std::fs::write(&path, json).map_err(|e| PodhostError::Io { path, source: e })
}

/// Copies a directory tree, preserving symlinks as links.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| PodhostError::Io {
            path: e.path().unwrap_or(from).to_path_buf(),
            source: e.into(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| PodhostError::internal(format!("walking {}: {e}", from.display())))?;
        let target = to.join(relative);
        let io_err = |e| PodhostError::Io {
            path: target.clone(),
            source: e,
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(io_err)?;
            std::os::unix::fs::symlink(link, &target).map_err(io_err)?;
        } else {
            let _ = std::fs::copy(entry.path(), &target).map_err(io_err)?;
        }
    }
    Ok(())
}
