//! Domain primitive types used across the podhost workspace.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PodhostError;

/// Unique identifier for a pod sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    /// Creates a sandbox ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random sandbox ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mechanism providing a sandbox's isolation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    /// Containers are host process groups confined by cgroups.
    Process,
    /// Containers run inside a dedicated virtual machine.
    Hypervisor,
}

impl fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Hypervisor => write!(f, "hypervisor"),
        }
    }
}

/// Lifecycle state of a pod sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxState {
    /// Identity allocated, backend not yet booted.
    Created,
    /// Backend booted and accepting containers.
    Running,
    /// Containers and backend torn down; awaiting removal.
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container has been created but not yet started.
    Created,
    /// Container's process is running.
    Running,
    /// Container's process has exited or was stopped.
    Exited,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Progress of a sandbox through the save-as-template protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStatus {
    /// The sandbox is not a template.
    None,
    /// Marked for saving; waiting for the template container to exit.
    Pending,
    /// The template container exited and its state is being captured.
    Saving,
    /// State captured; the sandbox can be cloned.
    SavedAsTemplate,
    /// The save did not happen.
    Failed {
        /// Why the save failed.
        reason: String,
    },
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Pending => write!(f, "Pending"),
            Self::Saving => write!(f, "Saving"),
            Self::SavedAsTemplate => write!(f, "SavedAsTemplate"),
            Self::Failed { reason } => write!(f, "Failed: {reason}"),
        }
    }
}

/// Resource limits for a sandbox or container.
///
/// CPU limit is expressed in hundredths of a percent of the host's (or the
/// VM's) total processor capacity, `1..=10000`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: Option<u64>,
    /// Number of processors.
    pub cpu_count: Option<u32>,
    /// Processor cap, `1..=10000`.
    pub cpu_limit: Option<u32>,
    /// Relative processor weight, `1..=10000`.
    pub cpu_weight: Option<u32>,
    /// Maximum storage bandwidth in bytes per second.
    pub storage_bandwidth_max: Option<u64>,
    /// Maximum storage operations per second.
    pub storage_iops_max: Option<u64>,
}

impl ResourceLimits {
    /// Returns `true` if no limit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `self` with every field set in `update` overriding it.
    ///
    /// Processor count and processor limit both map onto a bandwidth quota,
    /// so setting either one in `update` replaces both.
    #[must_use]
    pub fn merged_with(&self, update: &Self) -> Self {
        let (cpu_count, cpu_limit) = if update.cpu_count.is_some() || update.cpu_limit.is_some() {
            (update.cpu_count, update.cpu_limit)
        } else {
            (self.cpu_count, self.cpu_limit)
        };
        Self {
            memory_mb: update.memory_mb.or(self.memory_mb),
            cpu_count,
            cpu_limit,
            cpu_weight: update.cpu_weight.or(self.cpu_weight),
            storage_bandwidth_max: update.storage_bandwidth_max.or(self.storage_bandwidth_max),
            storage_iops_max: update.storage_iops_max.or(self.storage_iops_max),
        }
    }
}

/// Mount propagation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Propagation {
    /// No propagation in either direction.
    #[default]
    Private,
    /// Host mounts propagate into the container.
    HostToContainer,
    /// Mounts propagate both ways.
    Bidirectional,
}

/// A host path exposed inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mount {
    /// Absolute path on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: PathBuf,
    /// Whether the container sees the share read-only.
    pub readonly: bool,
    /// Propagation mode.
    #[serde(default)]
    pub propagation: Propagation,
}

impl Mount {
    /// Creates a read-only mount with private propagation.
    #[must_use]
    pub fn readonly(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly: true,
            propagation: Propagation::Private,
        }
    }

    /// Creates a writable mount with private propagation.
    #[must_use]
    pub fn writable(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            readonly: false,
            ..Self::readonly(host_path, container_path)
        }
    }
}

/// Category of an assignable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    /// A GPU passed through to a VM.
    Gpu,
    /// A generic PCI device passed through to a VM.
    Vpci,
    /// A device interface class shared from the host.
    Class,
}

impl DeviceKind {
    /// URI scheme for this kind.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Vpci => "vpci",
            Self::Class => "class",
        }
    }

    /// Whether the device can only be assigned to a hypervisor-isolated sandbox.
    #[must_use]
    pub const fn requires_hypervisor(self) -> bool {
        matches!(self, Self::Gpu | Self::Vpci)
    }

    /// Whether the device can be owned by only one sandbox at a time.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Gpu | Self::Vpci)
    }
}

/// A device reference in `scheme://identifier` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Device category.
    pub kind: DeviceKind,
    /// Backend-specific identifier (location path, instance ID, class GUID).
    pub id: String,
}

impl FromStr for DeviceRef {
    type Err = PodhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, id) = s.split_once("://").ok_or_else(|| {
            PodhostError::invalid(format!("device {s:?} is not of the form scheme://id"))
        })?;
        let kind = match scheme {
            "gpu" => DeviceKind::Gpu,
            "vpci" => DeviceKind::Vpci,
            "class" => DeviceKind::Class,
            other => {
                return Err(PodhostError::invalid(format!(
                    "unsupported device scheme {other:?} in {s:?}"
                )));
            }
        };
        if id.is_empty() {
            return Err(PodhostError::invalid(format!("device {s:?} has an empty identifier")));
        }
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.id)
    }
}

/// Caller-supplied identity of a pod sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetadata {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod UID assigned by the orchestrator.
    pub uid: String,
    /// Attempt number for restarts of the same pod.
    pub attempt: u32,
}

/// Caller-supplied identity of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Container name, unique within its sandbox.
    pub name: String,
    /// Attempt number for restarts of the same container.
    pub attempt: u32,
}
