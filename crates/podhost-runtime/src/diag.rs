//! Diagnostics side-channel.
//!
//! An out-of-band view of the host, independent of the lifecycle calls:
//! it lists compute systems with their save state, runs commands in a
//! sandbox's host context outside any container, and reads back applied
//! resource limits.

use std::time::Duration;

use podhost_common::error::Result;
use podhost_common::types::{
    ContainerId, IsolationKind, ResourceLimits, SandboxId, SandboxState, TemplateStatus,
};
use podhost_core::scope::Scope;

use crate::exec::{ExecOutput, run};
use crate::runtime::Runtime;

/// One compute system as reported by [`Diagnostics::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeSystem {
    /// Sandbox backing the compute system.
    pub id: SandboxId,
    /// Isolation backend.
    pub isolation: IsolationKind,
    /// `Created`, `Running`, `Stopped`, or `SavedAsTemplate`.
    pub state: String,
}

impl ComputeSystem {
    /// Whether the compute system has been saved as a template.
    #[must_use]
    pub fn is_saved_as_template(&self) -> bool {
        self.state == TemplateStatus::SavedAsTemplate.to_string()
    }
}

/// Out-of-band diagnostics for a [`Runtime`].
#[derive(Clone)]
pub struct Diagnostics {
    runtime: Runtime,
}

impl Diagnostics {
    pub(crate) const fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// Lists every live compute system.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox table is unavailable.
    pub async fn list(&self) -> Result<Vec<ComputeSystem>> {
        let templates = &self.runtime.shared.templates;
        let mut systems = Vec::new();
        for entry in self.runtime.all_sandboxes()? {
            let state = entry.record.lock().await.state;
            let state = match (templates.status(&entry.id), state) {
                (TemplateStatus::SavedAsTemplate, _) => TemplateStatus::SavedAsTemplate.to_string(),
                (_, SandboxState::Created) => "Created".to_string(),
                (_, SandboxState::Running) => "Running".to_string(),
                (_, SandboxState::Stopped) => "Stopped".to_string(),
            };
            systems.push(ComputeSystem {
                id: entry.id.clone(),
                isolation: entry.isolation,
                state,
            });
        }
        systems.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(systems)
    }

    /// Template save progress of a sandbox.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sandboxes.
    pub fn template_status(&self, sandbox: &SandboxId) -> Result<TemplateStatus> {
        let _ = self.runtime.sandbox(sandbox)?;
        Ok(self.runtime.shared.templates.status(sandbox))
    }

    /// Runs a command in the sandbox's host context, outside any container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sandboxes, `DeadlineExceeded` if the
    /// timeout passes, or an error if the command cannot start.
    pub async fn exec_in_host(
        &self,
        sandbox: &SandboxId,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        let entry = self.runtime.sandbox(sandbox)?;
        let env = [(
            podhost_common::constants::SANDBOX_ID_ENV.to_string(),
            sandbox.to_string(),
        )];
        run(cmd, &env, &entry.handle.root, timeout, |_| Ok(())).await
    }

    /// Sandbox-level limits as applied by the backend.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sandboxes.
    pub fn sandbox_resources(&self, sandbox: &SandboxId) -> Result<ResourceLimits> {
        let entry = self.runtime.sandbox(sandbox)?;
        self.runtime
            .backend(entry.isolation)
            .sandbox_resources(&entry.handle)
    }

    /// Container limits read back from the host.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown containers or containers with no
    /// applied limits.
    pub fn container_resources(&self, container: &ContainerId) -> Result<ResourceLimits> {
        let entry = self.runtime.container(container)?;
        self.runtime
            .shared
            .enforcer
            .query(&Scope::container(entry.sandbox_id.clone(), container.clone()))
    }
}
