//! Request and response types of the runtime service.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use podhost_common::types::{
    ContainerId, ContainerMetadata, ContainerState, DeviceRef, IsolationKind, Mount,
    ResourceLimits, SandboxId, SandboxMetadata, SandboxState, TemplateStatus,
};
use serde::{Deserialize, Serialize};

use crate::options::Annotations;

/// Sandbox creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxConfig {
    /// Caller-supplied identity.
    pub metadata: SandboxMetadata,
    /// Annotations controlling resources, templates, and policy.
    #[serde(default)]
    pub annotations: Annotations,
    /// Named backend selection; empty selects process isolation.
    #[serde(default)]
    pub runtime_handler: String,
}

/// Container creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Caller-supplied identity.
    pub metadata: ContainerMetadata,
    /// Image reference.
    pub image: String,
    /// Entrypoint.
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments appended to the entrypoint.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub envs: Vec<(String, String)>,
    /// Working directory relative to the container root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// File shares.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Device references in `scheme://id` form.
    #[serde(default)]
    pub devices: Vec<String>,
    /// Annotations controlling resources, templates, and policy.
    #[serde(default)]
    pub annotations: Annotations,
    /// Explicit resource limits, overriding annotation values.
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    /// Credential spec requested for the container.
    #[serde(default)]
    pub credential_spec: Option<String>,
}

impl ContainerConfig {
    /// Entrypoint followed by arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        self.command.iter().chain(&self.args).cloned().collect()
    }
}

/// Why a container exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// The workload exited on its own with status 0.
    Completed,
    /// The workload exited on its own with a non-zero status.
    Error,
    /// The workload was terminated by a stop request.
    Killed,
}

/// Status of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSandboxStatus {
    /// Sandbox ID.
    pub id: SandboxId,
    /// Caller-supplied identity.
    pub metadata: SandboxMetadata,
    /// Lifecycle state.
    pub state: SandboxState,
    /// Isolation backend.
    pub isolation: IsolationKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Annotations the sandbox was created with.
    pub annotations: Annotations,
    /// Recognized annotations ignored by the backend.
    pub ignored_annotations: Vec<String>,
    /// Template save progress.
    pub template_status: TemplateStatus,
    /// Template this sandbox was cloned from.
    pub cloned_from: Option<SandboxId>,
    /// Containers in the sandbox.
    pub containers: Vec<ContainerId>,
}

/// One row of `ListPodSandbox`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSandboxSummary {
    /// Sandbox ID.
    pub id: SandboxId,
    /// Caller-supplied identity.
    pub metadata: SandboxMetadata,
    /// Lifecycle state.
    pub state: SandboxState,
    /// Isolation backend.
    pub isolation: IsolationKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Filter for `ListPodSandbox`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodSandboxFilter {
    /// Only sandboxes in this state.
    pub state: Option<SandboxState>,
}

/// Status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Container ID.
    pub id: ContainerId,
    /// Owning sandbox.
    pub sandbox_id: SandboxId,
    /// Caller-supplied identity.
    pub metadata: ContainerMetadata,
    /// Image reference.
    pub image: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time, once started.
    pub started_at: Option<DateTime<Utc>>,
    /// Exit time, once exited.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code, once exited.
    pub exit_code: Option<i32>,
    /// Exit reason, once exited.
    pub reason: Option<ExitReason>,
    /// PID of the workload while it runs.
    pub pid: Option<u32>,
    /// File shares.
    pub mounts: Vec<Mount>,
    /// Devices visible to the container.
    pub devices: Vec<DeviceRef>,
    /// Resource limits currently applied.
    pub limits: ResourceLimits,
    /// Log file.
    pub log_path: PathBuf,
    /// Template container this container was restored from.
    pub cloned_from: Option<ContainerId>,
}

/// One row of `ListContainers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container ID.
    pub id: ContainerId,
    /// Owning sandbox.
    pub sandbox_id: SandboxId,
    /// Caller-supplied identity.
    pub metadata: ContainerMetadata,
    /// Image reference.
    pub image: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Filter for `ListContainers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Only containers in this sandbox.
    pub sandbox_id: Option<SandboxId>,
    /// Only containers in this state.
    pub state: Option<ContainerState>,
}

/// Parameters of `ExecSync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSyncRequest {
    /// Target container.
    pub container_id: ContainerId,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Time limit; zero waits indefinitely.
    pub timeout: Duration,
}
