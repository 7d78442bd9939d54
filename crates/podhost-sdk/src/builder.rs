//! Fluent API for sandbox and container configs.

use std::path::PathBuf;

use podhost_common::annotations as keys;
use podhost_common::constants::TEMPLATE_VM_SUFFIX;
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{
    ContainerId, ContainerMetadata, Mount, ResourceLimits, SandboxId, SandboxMetadata,
};
use podhost_runtime::api::{ContainerConfig, PodSandboxConfig};
use podhost_runtime::options::Annotations;

/// Builder for a [`PodSandboxConfig`].
#[derive(Debug, Clone)]
pub struct PodSandboxConfigBuilder {
    metadata: SandboxMetadata,
    runtime_handler: String,
    annotations: Annotations,
}

impl PodSandboxConfigBuilder {
    /// Creates a builder for a pod named `name` in the `default` namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: SandboxMetadata {
                name: name.into(),
                namespace: "default".to_string(),
                ..SandboxMetadata::default()
            },
            runtime_handler: String::new(),
            annotations: Annotations::new(),
        }
    }

    /// Sets the pod namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = namespace.into();
        self
    }

    /// Sets the pod UID.
    #[must_use]
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.metadata.uid = uid.into();
        self
    }

    /// Sets the restart attempt.
    #[must_use]
    pub const fn attempt(mut self, attempt: u32) -> Self {
        self.metadata.attempt = attempt;
        self
    }

    /// Selects the backend by runtime handler name.
    #[must_use]
    pub fn runtime_handler(mut self, handler: impl Into<String>) -> Self {
        self.runtime_handler = handler.into();
        self
    }

    /// Adds a raw annotation.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets sandbox memory in megabytes.
    #[must_use]
    pub fn memory_mb(self, mb: u64) -> Self {
        self.annotation(keys::VM_MEMORY_SIZE_MB, mb.to_string())
    }

    /// Sets the sandbox processor count.
    #[must_use]
    pub fn processor_count(self, count: u32) -> Self {
        self.annotation(keys::VM_PROCESSOR_COUNT, count.to_string())
    }

    /// Sets whether VM memory may be overcommitted.
    #[must_use]
    pub fn allow_overcommit(self, allow: bool) -> Self {
        self.annotation(keys::VM_MEMORY_ALLOW_OVERCOMMIT, allow.to_string())
    }

    /// Denies writable file shares and credential specs in the sandbox.
    #[must_use]
    pub fn disable_unsafe_operations(self) -> Self {
        self.annotation(keys::DISABLE_UNSAFE_OPERATIONS, "true")
    }

    /// Marks the sandbox to be saved as a template.
    #[must_use]
    pub fn save_as_template(self) -> Self {
        self.annotation(keys::SAVE_AS_TEMPLATE, "true")
    }

    /// Forks the sandbox from a saved template sandbox.
    #[must_use]
    pub fn clone_of(self, template: &SandboxId) -> Self {
        self.annotation(keys::TEMPLATE_ID, format!("{template}{TEMPLATE_VM_SUFFIX}"))
    }

    /// Returns the configured sandbox config.
    #[must_use]
    pub fn build(self) -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: self.metadata,
            annotations: self.annotations,
            runtime_handler: self.runtime_handler,
        }
    }
}

/// Builder for a [`ContainerConfig`].
#[derive(Debug, Clone)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    /// Creates a builder for a container named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ContainerConfig {
                metadata: ContainerMetadata {
                    name: name.into(),
                    attempt: 0,
                },
                ..ContainerConfig::default()
            },
        }
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Sets the entrypoint.
    #[must_use]
    pub fn command(mut self, command: Vec<String>) -> Self {
        self.config.command = command;
        self
    }

    /// Sets the arguments appended to the entrypoint.
    #[must_use]
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.config.args = args;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.envs.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory inside the container.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    /// Adds a file share.
    #[must_use]
    pub fn mount(mut self, mount: Mount) -> Self {
        self.config.mounts.push(mount);
        self
    }

    /// Adds a device in `scheme://id` form.
    #[must_use]
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.devices.push(device.into());
        self
    }

    /// Adds a raw annotation.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.config.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets explicit resource limits, overriding annotation values.
    #[must_use]
    pub fn resources(mut self, limits: ResourceLimits) -> Self {
        self.config.resources = Some(limits);
        self
    }

    /// Requests a credential spec.
    #[must_use]
    pub fn credential_spec(mut self, spec: impl Into<String>) -> Self {
        self.config.credential_spec = Some(spec.into());
        self
    }

    /// Marks the container as the template container of its sandbox.
    #[must_use]
    pub fn save_as_template(self) -> Self {
        self.annotation(keys::SAVE_AS_TEMPLATE, "true")
    }

    /// Restores the container from a template container's saved state.
    #[must_use]
    pub fn clone_of(self, template_container: &ContainerId) -> Self {
        self.annotation(keys::TEMPLATE_ID, template_container.as_str())
    }

    /// Returns the configured container config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no image or no command was set.
    pub fn build(self) -> Result<ContainerConfig> {
        if self.config.image.is_empty() {
            return Err(PodhostError::invalid("container image is required"));
        }
        if self.config.argv().is_empty() {
            return Err(PodhostError::invalid("container command is required"));
        }
        Ok(self.config)
    }
}
