//! Process-isolation backend.
//!
//! A sandbox is a cgroup and a scratch directory on the host; its
//! containers are host process groups confined to nested cgroups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{IsolationKind, ResourceLimits};
use podhost_core::enforcer::ResourceEnforcer;
use podhost_core::scope::Scope;

use super::{
    IsolationBackend, SandboxHandle, SandboxSpec, WorkloadSpec, exec_confined,
    remove_dir_if_exists, spawn_confined,
};
use crate::exec::ExecOutput;
use crate::process::ProcessHandle;

/// Runs sandboxes as cgroup-confined host process groups.
pub struct ProcessBackend {
    enforcer: Arc<dyn ResourceEnforcer>,
}

impl ProcessBackend {
    /// Creates a backend that confines sandboxes through `enforcer`.
    #[must_use]
    pub fn new(enforcer: Arc<dyn ResourceEnforcer>) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Process
    }

    async fn boot(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        std::fs::create_dir_all(&spec.root).map_err(|e| PodhostError::Io {
            path: spec.root.clone(),
            source: e,
        })?;
        if !spec.options.limits.is_empty() {
            let scope = Scope::sandbox(spec.id.clone());
            if let Err(e) = self.enforcer.apply(&scope, &spec.options.limits) {
                let _ = self.enforcer.release(&scope);
                let _ = remove_dir_if_exists(&spec.root);
                return Err(e);
            }
        }
        tracing::info!(sandbox_id = %spec.id, "process sandbox booted");
        Ok(SandboxHandle {
            id: spec.id.clone(),
            isolation: IsolationKind::Process,
            root: spec.root.clone(),
        })
    }

    async fn shutdown(&self, sandbox: &SandboxHandle) -> Result<()> {
        tracing::debug!(sandbox_id = %sandbox.id, "process sandbox shut down");
        Ok(())
    }

    async fn release(&self, sandbox: &SandboxHandle) -> Result<()> {
        self.enforcer.release(&Scope::sandbox(sandbox.id.clone()))?;
        remove_dir_if_exists(&sandbox.root)
    }

    async fn launch(
        &self,
        sandbox: &SandboxHandle,
        workload: &WorkloadSpec,
    ) -> Result<ProcessHandle> {
        spawn_confined(&self.enforcer, sandbox, workload)
    }

    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        workload: &WorkloadSpec,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        exec_confined(&self.enforcer, sandbox, workload, timeout).await
    }

    fn sandbox_resources(&self, sandbox: &SandboxHandle) -> Result<ResourceLimits> {
        match self.enforcer.query(&Scope::sandbox(sandbox.id.clone())) {
            Err(PodhostError::NotFound { .. }) => Ok(ResourceLimits::default()),
            other => other,
        }
    }

    fn update_sandbox_resources(
        &self,
        sandbox: &SandboxHandle,
        limits: &ResourceLimits,
    ) -> Result<()> {
        self.enforcer
            .apply(&Scope::sandbox(sandbox.id.clone()), limits)
    }
}
