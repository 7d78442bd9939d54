//! Runtime handle and the state it shares across requests.
//!
//! Sandboxes and containers live in two maps guarded by short-lived
//! `RwLock`s; each entry carries its own async mutex so unrelated sandboxes
//! never serialize on each other. When both are needed the sandbox record
//! is locked before the container record.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use podhost_common::config::RuntimeConfig;
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{
    ContainerId, ContainerState, DeviceRef, IsolationKind, ResourceLimits, SandboxId,
    SandboxMetadata, SandboxState,
};
use podhost_core::device::{DeviceAssigner, HostDeviceTable};
use podhost_core::enforcer::{CgroupEnforcer, ResourceEnforcer};
use tokio::sync::{Mutex, broadcast};

use crate::api::{ContainerConfig, ExitReason};
use crate::backend::hypervisor::HypervisorBackend;
use crate::backend::process::ProcessBackend;
use crate::backend::{IsolationBackend, SandboxHandle};
use crate::diag::Diagnostics;
use crate::events::{EventBus, LifecycleEvent};
use crate::options::{Annotations, ContainerOptions, SandboxOptions};
use crate::process::ProcessHandle;
use crate::state::TemplateStore;
use crate::template::TemplateManager;

pub(crate) struct SandboxEntry {
    pub(crate) id: SandboxId,
    pub(crate) metadata: SandboxMetadata,
    pub(crate) isolation: IsolationKind,
    pub(crate) annotations: Annotations,
    pub(crate) options: SandboxOptions,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) handle: SandboxHandle,
    pub(crate) record: Mutex<SandboxRecord>,
}

pub(crate) struct SandboxRecord {
    pub(crate) state: SandboxState,
    pub(crate) containers: BTreeSet<ContainerId>,
}

pub(crate) struct ContainerEntry {
    pub(crate) id: ContainerId,
    pub(crate) sandbox_id: SandboxId,
    pub(crate) config: ContainerConfig,
    pub(crate) options: ContainerOptions,
    /// Limits requested at creation; clones are checked against these.
    pub(crate) initial_limits: ResourceLimits,
    pub(crate) devices: Vec<DeviceRef>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) cloned_from: Option<ContainerId>,
    pub(crate) is_template: bool,
    pub(crate) rootfs: PathBuf,
    pub(crate) log_path: PathBuf,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) record: Mutex<ContainerRecord>,
}

pub(crate) struct ContainerRecord {
    pub(crate) state: ContainerState,
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) limits: ResourceLimits,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) reason: Option<ExitReason>,
}

pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) enforcer: Arc<dyn ResourceEnforcer>,
    pub(crate) devices: Arc<dyn DeviceAssigner>,
    process: Arc<dyn IsolationBackend>,
    hypervisor: Arc<dyn IsolationBackend>,
    pub(crate) sandboxes: RwLock<HashMap<SandboxId, Arc<SandboxEntry>>>,
    pub(crate) containers: RwLock<HashMap<ContainerId, Arc<ContainerEntry>>>,
    pub(crate) templates: TemplateManager,
    pub(crate) events: EventBus,
}

/// Handle to the sandbox and container runtime.
///
/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) shared: Arc<Shared>,
}

/// Builder for [`Runtime`], allowing the host capabilities to be replaced.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    enforcer: Option<Arc<dyn ResourceEnforcer>>,
    devices: Option<Arc<dyn DeviceAssigner>>,
}

impl RuntimeBuilder {
    /// Uses `enforcer` instead of a cgroup enforcer at the configured root.
    #[must_use]
    pub fn enforcer(mut self, enforcer: Arc<dyn ResourceEnforcer>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    /// Uses `devices` instead of a fresh in-memory device table.
    #[must_use]
    pub fn devices(mut self, devices: Arc<dyn DeviceAssigner>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Creates the data directory, clears stale template state, and starts
    /// the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be prepared.
    pub fn build(self) -> Result<Runtime> {
        let config = self.config;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| PodhostError::Io {
            path: config.data_dir.clone(),
            source: e,
        })?;
        let enforcer = self.enforcer.unwrap_or_else(|| {
            Arc::new(CgroupEnforcer::new(&config.cgroup_root, &config.data_dir))
        });
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(HostDeviceTable::new()));

        let store = TemplateStore::new(&config.data_dir);
        let _ = store.purge()?;

        let process: Arc<dyn IsolationBackend> =
            Arc::new(ProcessBackend::new(Arc::clone(&enforcer)));
        let hypervisor: Arc<dyn IsolationBackend> = Arc::new(HypervisorBackend::new(
            Arc::clone(&enforcer),
            config.default_vm,
        ));
        tracing::info!(data_dir = %config.data_dir.display(), "runtime started");
        Ok(Runtime {
            shared: Arc::new(Shared {
                config,
                enforcer,
                devices,
                process,
                hypervisor,
                sandboxes: RwLock::new(HashMap::new()),
                containers: RwLock::new(HashMap::new()),
                templates: TemplateManager::new(store),
                events: EventBus::new(),
            }),
        })
    }
}

impl Runtime {
    /// Starts a runtime with the default host capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be prepared.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Returns a builder for a runtime using `config`.
    #[must_use]
    pub const fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            enforcer: None,
            devices: None,
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    /// Out-of-band diagnostics for this runtime.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.clone())
    }

    pub(crate) fn backend(&self, kind: IsolationKind) -> &Arc<dyn IsolationBackend> {
        match kind {
            IsolationKind::Process => &self.shared.process,
            IsolationKind::Hypervisor => &self.shared.hypervisor,
        }
    }

    pub(crate) fn publish(&self, event: LifecycleEvent) {
        self.shared.events.publish(event);
    }

    pub(crate) fn find_sandbox(&self, id: &SandboxId) -> Result<Option<Arc<SandboxEntry>>> {
        let sandboxes = self
            .shared
            .sandboxes
            .read()
            .map_err(|_| PodhostError::internal("sandbox table lock poisoned"))?;
        Ok(sandboxes.get(id).cloned())
    }

    pub(crate) fn sandbox(&self, id: &SandboxId) -> Result<Arc<SandboxEntry>> {
        self.find_sandbox(id)?.ok_or_else(|| PodhostError::NotFound {
            kind: "sandbox",
            id: id.to_string(),
        })
    }

    pub(crate) fn find_container(&self, id: &ContainerId) -> Result<Option<Arc<ContainerEntry>>> {
        let containers = self
            .shared
            .containers
            .read()
            .map_err(|_| PodhostError::internal("container table lock poisoned"))?;
        Ok(containers.get(id).cloned())
    }

    pub(crate) fn container(&self, id: &ContainerId) -> Result<Arc<ContainerEntry>> {
        self.find_container(id)?.ok_or_else(|| PodhostError::NotFound {
            kind: "container",
            id: id.to_string(),
        })
    }

    pub(crate) fn all_sandboxes(&self) -> Result<Vec<Arc<SandboxEntry>>> {
        let sandboxes = self
            .shared
            .sandboxes
            .read()
            .map_err(|_| PodhostError::internal("sandbox table lock poisoned"))?;
        Ok(sandboxes.values().cloned().collect())
    }

    pub(crate) fn all_containers(&self) -> Result<Vec<Arc<ContainerEntry>>> {
        let containers = self
            .shared
            .containers
            .read()
            .map_err(|_| PodhostError::internal("container table lock poisoned"))?;
        Ok(containers.values().cloned().collect())
    }

    pub(crate) fn insert_sandbox(&self, entry: Arc<SandboxEntry>) -> Result<()> {
        let mut sandboxes = self
            .shared
            .sandboxes
            .write()
            .map_err(|_| PodhostError::internal("sandbox table lock poisoned"))?;
        let _ = sandboxes.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub(crate) fn drop_sandbox(&self, id: &SandboxId) -> Result<()> {
        let mut sandboxes = self
            .shared
            .sandboxes
            .write()
            .map_err(|_| PodhostError::internal("sandbox table lock poisoned"))?;
        let _ = sandboxes.remove(id);
        Ok(())
    }

    pub(crate) fn insert_container(&self, entry: Arc<ContainerEntry>) -> Result<()> {
        let mut containers = self
            .shared
            .containers
            .write()
            .map_err(|_| PodhostError::internal("container table lock poisoned"))?;
        let _ = containers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub(crate) fn drop_container(&self, id: &ContainerId) -> Result<()> {
        let mut containers = self
            .shared
            .containers
            .write()
            .map_err(|_| PodhostError::internal("container table lock poisoned"))?;
        let _ = containers.remove(id);
        Ok(())
    }
}

/// Undoes a partially completed operation unless disarmed.
///
/// Runs on early return and when the owning future is dropped, so a failed
/// or cancelled call leaves nothing half-built behind.
pub(crate) struct Rollback {
    what: &'static str,
    undo: Option<Box<dyn FnOnce() + Send>>,
}

impl Rollback {
    pub(crate) fn new(what: &'static str, undo: impl FnOnce() + Send + 'static) -> Self {
        Self {
            what,
            undo: Some(Box::new(undo)),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.undo = None;
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            tracing::debug!(what = self.what, "rolling back");
            undo();
        }
    }
}

/// Spawns async cleanup from a synchronous context, if a runtime is available.
pub(crate) fn spawn_cleanup(
    what: &'static str,
    cleanup: impl std::future::Future<Output = ()> + Send + 'static,
) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => drop(handle.spawn(cleanup)),
        Err(_) => tracing::error!(what, "no async runtime to run cleanup on"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn rollback_runs_unless_disarmed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        drop(Rollback::new("test", move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&runs);
        Rollback::new("test", move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        })
        .disarm();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime =
            Runtime::new(RuntimeConfig::with_dirs(dir.path().join("data"), dir.path().join("cg")))
                .expect("runtime");
        let err = runtime
            .sandbox(&SandboxId::new("missing"))
            .err()
            .expect("missing sandbox");
        assert!(matches!(err, PodhostError::NotFound { kind: "sandbox", .. }));
        assert!(runtime.find_container(&ContainerId::new("missing")).expect("lookup").is_none());
    }
}
