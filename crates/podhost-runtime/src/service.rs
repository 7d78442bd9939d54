//! CRI-shaped service facade.
//!
//! [`RuntimeServer`] exposes a [`Runtime`] through the [`RuntimeService`]
//! trait. Every call takes a [`CallContext`] carrying a deadline and a
//! cancellation token; errors cross the boundary as [`Status`], whose text
//! form is what remote callers match on.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use podhost_common::error::{Code, PodhostError};
use podhost_common::types::{ContainerId, ResourceLimits, SandboxId};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ContainerConfig, ContainerFilter, ContainerStatus, ContainerSummary, ExecSyncRequest,
    PodSandboxConfig, PodSandboxFilter, PodSandboxStatus, PodSandboxSummary,
};
use crate::exec::ExecOutput;
use crate::runtime::Runtime;

/// Error returned across the service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct Status {
    /// Status code.
    pub code: Code,
    /// Human-readable description.
    pub message: String,
}

impl From<PodhostError> for Status {
    fn from(err: PodhostError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Per-call deadline and cancellation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Point in time after which the call fails with `DeadlineExceeded`.
    pub deadline: Option<Instant>,
    /// Cancelling this token fails the call with `Cancelled`.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose deadline is `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` as the call's cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drives `call` under this context. A call cut short by the deadline
    /// or by cancellation is dropped, which rolls back anything it had
    /// half-built.
    ///
    /// # Errors
    ///
    /// Returns the call's own error, `DeadlineExceeded`, or `Cancelled`.
    pub async fn run<T>(
        &self,
        operation: &str,
        call: impl Future<Output = podhost_common::error::Result<T>> + Send,
    ) -> Result<T, Status> {
        let started = Instant::now();
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(PodhostError::DeadlineExceeded {
                            operation: operation.to_string(),
                            timeout: deadline.saturating_duration_since(started),
                        })
                    }),
                None => call.await,
            }
        };
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(PodhostError::Cancelled {
                operation: operation.to_string(),
            }),
            result = bounded => result,
        };
        result.map_err(|e| {
            tracing::debug!(operation, error = %e, "call failed");
            Status::from(e)
        })
    }
}

/// The runtime control-plane surface.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    /// Creates and boots a sandbox.
    async fn run_pod_sandbox(
        &self,
        ctx: &CallContext,
        config: PodSandboxConfig,
    ) -> Result<SandboxId, Status>;

    /// Stops a sandbox and its containers.
    async fn stop_pod_sandbox(&self, ctx: &CallContext, id: &SandboxId) -> Result<(), Status>;

    /// Removes a sandbox, stopping it first if needed.
    async fn remove_pod_sandbox(&self, ctx: &CallContext, id: &SandboxId) -> Result<(), Status>;

    /// Reports a sandbox's status.
    async fn pod_sandbox_status(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
    ) -> Result<PodSandboxStatus, Status>;

    /// Lists sandboxes.
    async fn list_pod_sandbox(
        &self,
        ctx: &CallContext,
        filter: PodSandboxFilter,
    ) -> Result<Vec<PodSandboxSummary>, Status>;

    /// Changes sandbox-level resources.
    async fn update_pod_sandbox_resources(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        limits: ResourceLimits,
    ) -> Result<(), Status>;

    /// Creates a container in a sandbox.
    async fn create_container(
        &self,
        ctx: &CallContext,
        sandbox_id: &SandboxId,
        config: ContainerConfig,
    ) -> Result<ContainerId, Status>;

    /// Starts a created container.
    async fn start_container(&self, ctx: &CallContext, id: &ContainerId) -> Result<(), Status>;

    /// Stops a container within `timeout`.
    async fn stop_container(
        &self,
        ctx: &CallContext,
        id: &ContainerId,
        timeout: Duration,
    ) -> Result<(), Status>;

    /// Removes a container.
    async fn remove_container(&self, ctx: &CallContext, id: &ContainerId) -> Result<(), Status>;

    /// Reports a container's status.
    async fn container_status(
        &self,
        ctx: &CallContext,
        id: &ContainerId,
    ) -> Result<ContainerStatus, Status>;

    /// Lists containers.
    async fn list_containers(
        &self,
        ctx: &CallContext,
        filter: ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, Status>;

    /// Changes a running container's resources.
    async fn update_container_resources(
        &self,
        ctx: &CallContext,
        id: &ContainerId,
        limits: ResourceLimits,
    ) -> Result<(), Status>;

    /// Runs a command in a container and waits for it.
    async fn exec_sync(
        &self,
        ctx: &CallContext,
        request: ExecSyncRequest,
    ) -> Result<ExecOutput, Status>;
}

/// [`RuntimeService`] backed by a local [`Runtime`].
#[derive(Clone)]
pub struct RuntimeServer {
    runtime: Runtime,
}

impl RuntimeServer {
    /// Serves `runtime`.
    #[must_use]
    pub const fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// The served runtime.
    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

#[async_trait]
impl RuntimeService for RuntimeServer {
    async fn run_pod_sandbox(
        &self,
        ctx: &CallContext,
        config: PodSandboxConfig,
    ) -> Result<SandboxId, Status> {
        ctx.run("RunPodSandbox", self.runtime.run_pod_sandbox(&config))
            .await
    }

    async fn stop_pod_sandbox(&self, ctx: &CallContext, id: &SandboxId) -> Result<(), Status> {
        ctx.run("StopPodSandbox", self.runtime.stop_pod_sandbox(id))
            .await
    }

    async fn remove_pod_sandbox(&self, ctx: &CallContext, id: &SandboxId) -> Result<(), Status> {
        ctx.run("RemovePodSandbox", self.runtime.remove_pod_sandbox(id))
            .await
    }

    async fn pod_sandbox_status(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
    ) -> Result<PodSandboxStatus, Status> {
        ctx.run("PodSandboxStatus", self.runtime.pod_sandbox_status(id))
            .await
    }

    async fn list_pod_sandbox(
        &self,
        ctx: &CallContext,
        filter: PodSandboxFilter,
    ) -> Result<Vec<PodSandboxSummary>, Status> {
        ctx.run("ListPodSandbox", self.runtime.list_pod_sandbox(filter))
            .await
    }

    async fn update_pod_sandbox_resources(
        &self,
        ctx: &CallContext,
        id: &SandboxId,
        limits: ResourceLimits,
    ) -> Result<(), Status> {
        ctx.run(
            "UpdatePodSandboxResources",
            self.runtime.update_pod_sandbox_resources(id, &limits),
        )
        .await
    }

    async fn create_container(
        &self,
        ctx: &CallContext,
        sandbox_id: &SandboxId,
        config: ContainerConfig,
    ) -> Result<ContainerId, Status> {
        ctx.run(
            "CreateContainer",
            self.runtime.create_container(sandbox_id, &config),
        )
        .await
    }

    async fn start_container(&self, ctx: &CallContext, id: &ContainerId) -> Result<(), Status> {
        ctx.run("StartContainer", self.runtime.start_container(id))
            .await
    }

    async fn stop_container(
        &self,
        ctx: &CallContext,
        id: &ContainerId,
        timeout: Duration,
    ) -> Result<(), Status> {
        ctx.run("StopContainer", self.runtime.stop_container(id, timeout))
            .await
    }

    async fn remove_container(&self, ctx: &CallContext, id: &ContainerId) -> Result<(), Status> {
        ctx.run("RemoveContainer", self.runtime.remove_container(id))
            .await
    }

    async fn container_status(
        &self,
        ctx: &CallContext,
        id: &ContainerId,
    ) -> Result<ContainerStatus, Status> {
        ctx.run("ContainerStatus", self.runtime.container_status(id))
            .await
    }

    async fn list_containers(
        &self,
        ctx: &CallContext,
        filter: ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, Status> {
        ctx.run("ListContainers", self.runtime.list_containers(&filter))
            .await
    }

    async fn update_container_resources(
        &self,
        ctx: &CallContext,
        id: &ContainerId,
        limits: ResourceLimits,
    ) -> Result<(), Status> {
        ctx.run(
            "UpdateContainerResources",
            self.runtime.update_container_resources(id, &limits),
        )
        .await
    }

    async fn exec_sync(
        &self,
        ctx: &CallContext,
        request: ExecSyncRequest,
    ) -> Result<ExecOutput, Status> {
        ctx.run("ExecSync", self.runtime.exec_sync(&request)).await
    }
}
