//! Container lifecycle, and the template save that follows a template
//! container's natural exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use podhost_common::constants::{
    CONTAINER_ID_ENV, ROOTFS_ENV, SANDBOX_ID_ENV, VISIBLE_DEVICES_ENV,
};
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{
    ContainerId, ContainerState, DeviceRef, ResourceLimits, SandboxId, SandboxState,
    TemplateStatus,
};
use podhost_core::mount;
use podhost_core::scope::Scope;

use crate::api::{
    ContainerConfig, ContainerFilter, ContainerStatus, ContainerSummary, ExecSyncRequest,
    ExitReason,
};
use crate::backend::WorkloadSpec;
use crate::events::LifecycleEvent;
use crate::exec::ExecOutput;
use crate::logs;
use crate::options::{ContainerOptions, check_processor_exclusive};
use crate::process::ProcessHandle;
use crate::runtime::{
    ContainerEntry, ContainerRecord, Rollback, Runtime, SandboxEntry, SandboxRecord,
};
use crate::state::{TemplateConfig, TemplateContainerSpec};
use crate::template::SavedTemplate;

impl Runtime {
    /// Creates a container in a running sandbox.
    ///
    /// Resource limits and devices are applied before the container becomes
    /// visible. A container carrying a template reference is restored from
    /// the template container's saved state.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown sandbox.
    /// - `InvalidArgument` for malformed configuration, conflicting processor
    ///   settings, memory above the sandbox's, or a clone that doesn't match
    ///   its template container.
    /// - `FailedPrecondition` if the sandbox is not running, has been saved
    ///   as a template, or already restored its cloned container, or if a
    ///   device is owned by another sandbox.
    /// - `Unsupported` for a second template container in one sandbox.
    pub async fn create_container(
        &self,
        sandbox_id: &SandboxId,
        config: &ContainerConfig,
    ) -> Result<ContainerId> {
        let sandbox = self.sandbox(sandbox_id)?;
        let options = ContainerOptions::parse(&config.annotations)?;
        let limits = match &config.resources {
            Some(explicit) => options.limits.merged_with(explicit),
            None => options.limits.clone(),
        };
        check_processor_exclusive(&limits)?;
        mount::validate_mounts(&config.mounts)?;
        let devices = config
            .devices
            .iter()
            .map(|raw| raw.parse::<DeviceRef>())
            .collect::<Result<Vec<_>>>()?;
        if config.argv().is_empty() {
            return Err(PodhostError::invalid("container command is empty"));
        }

        let mut record = sandbox.record.lock().await;
        if record.state != SandboxState::Running {
            return Err(PodhostError::precondition(format!(
                "sandbox {sandbox_id} is {}, containers can only be created in a running sandbox",
                record.state
            )));
        }
        match self.shared.templates.status(sandbox_id) {
            TemplateStatus::Saving | TemplateStatus::SavedAsTemplate => {
                return Err(PodhostError::precondition(format!(
                    "sandbox {sandbox_id} has been saved as a template"
                )));
            }
            _ => {}
        }
        self.check_memory_fits(&sandbox, &limits)?;

        let id = ContainerId::generate();
        let scope = Scope::container(sandbox_id.clone(), id.clone());
        let rollback = {
            let runtime = self.clone();
            let sandbox = Arc::clone(&sandbox);
            let id = id.clone();
            Rollback::new("container create", move || runtime.release_container(&sandbox, &id))
        };

        if options.save_as_template {
            self.shared
                .templates
                .register_template_container(sandbox_id, &id)?;
        }
        let rootfs = match &options.template {
            Some(template_container) => {
                let spec = TemplateContainerSpec {
                    image: config.image.clone(),
                    limits: limits.clone(),
                    devices: devices.clone(),
                };
                self.shared.templates.claim_container_clone(
                    sandbox_id,
                    template_container,
                    &id,
                    &spec,
                )?;
                self.backend(sandbox.isolation)
                    .restore_container(&sandbox.handle, template_container, &id)
                    .await?
            }
            None => self
                .backend(sandbox.isolation)
                .prepare_container(&sandbox.handle, &id)?,
        };
        if !limits.is_empty() {
            self.shared.enforcer.apply(&scope, &limits)?;
        }
        for device in &devices {
            self.shared.devices.assign(&scope, sandbox.isolation, device)?;
        }

        let entry = Arc::new(ContainerEntry {
            id: id.clone(),
            sandbox_id: sandbox_id.clone(),
            config: config.clone(),
            is_template: options.save_as_template,
            cloned_from: options.template.clone(),
            options,
            initial_limits: limits.clone(),
            devices,
            created_at: chrono::Utc::now(),
            rootfs,
            log_path: logs::log_path(
                &self.shared.config.data_dir,
                sandbox_id.as_str(),
                id.as_str(),
            ),
            stop_requested: AtomicBool::new(false),
            record: tokio::sync::Mutex::new(ContainerRecord {
                state: ContainerState::Created,
                process: None,
                limits,
                started_at: None,
                finished_at: None,
                exit_code: None,
                reason: None,
            }),
        });
        self.insert_container(entry)?;
        let _ = record.containers.insert(id.clone());
        drop(record);
        rollback.disarm();

        tracing::info!(
            sandbox_id = %sandbox_id,
            container_id = %id,
            name = %config.metadata.name,
            image = %config.image,
            "container created"
        );
        self.publish(LifecycleEvent::ContainerStateChanged {
            sandbox_id: sandbox_id.clone(),
            container_id: id.clone(),
            state: ContainerState::Created,
        });
        Ok(id)
    }

    /// Starts a created container.
    ///
    /// A container denied by the sandbox's file-share or credential policy
    /// stays in `Created` and must be removed by the caller.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown containers.
    /// - `FailedPrecondition` if the container is not in `Created` or its
    ///   sandbox is not running.
    /// - `PermissionDenied` for a policy denial.
    pub async fn start_container(&self, id: &ContainerId) -> Result<()> {
        let entry = self.container(id)?;
        let sandbox = self.sandbox(&entry.sandbox_id)?;
        let sandbox_record = sandbox.record.lock().await;
        if sandbox_record.state != SandboxState::Running {
            return Err(PodhostError::precondition(format!(
                "sandbox {} is {}",
                sandbox.id, sandbox_record.state
            )));
        }
        let mut record = entry.record.lock().await;
        if record.state != ContainerState::Created {
            return Err(PodhostError::precondition(format!(
                "container {id} is {}, only created containers can be started",
                record.state
            )));
        }

        mount::check_writable_shares(
            &entry.config.mounts,
            sandbox.options.writable_shares_disabled,
        )?;
        if entry.config.credential_spec.is_some()
            && (sandbox.options.credentials_disabled || entry.options.credentials_disabled)
        {
            return Err(PodhostError::denied("credential specs are disabled"));
        }
        mount::link_mounts(&entry.rootfs, &entry.config.mounts)?;

        let workload = self.workload(&entry, entry.config.argv())?;
        let process = self
            .backend(sandbox.isolation)
            .launch(&sandbox.handle, &workload)
            .await?;
        record.state = ContainerState::Running;
        record.started_at = Some(chrono::Utc::now());
        record.process = Some(process.clone());
        drop(record);
        drop(sandbox_record);

        drop(tokio::spawn(self.clone().monitor(Arc::clone(&entry), process.clone())));
        tracing::info!(
            sandbox_id = %entry.sandbox_id,
            container_id = %id,
            pid = process.pid(),
            "container started"
        );
        self.publish(LifecycleEvent::ContainerStateChanged {
            sandbox_id: entry.sandbox_id.clone(),
            container_id: id.clone(),
            state: ContainerState::Running,
        });
        Ok(())
    }

    /// Stops a container: `SIGTERM`, then `SIGKILL` once `timeout` passes.
    /// A zero timeout kills immediately. Stopping an exited, removed or
    /// unknown container succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be signalled.
    pub async fn stop_container(&self, id: &ContainerId, timeout: Duration) -> Result<()> {
        let Some(entry) = self.find_container(id)? else {
            tracing::debug!(container_id = %id, "stop of unknown container ignored");
            return Ok(());
        };
        self.stop_container_entry(&entry, timeout).await
    }

    /// Stops the container if needed and releases everything it holds.
    /// Removing an unknown container succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    pub async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        let Some(entry) = self.find_container(id)? else {
            tracing::debug!(container_id = %id, "remove of unknown container ignored");
            return Ok(());
        };
        let Some(sandbox) = self.find_sandbox(&entry.sandbox_id)? else {
            self.drop_container(id)?;
            return Ok(());
        };
        let mut sandbox_record = sandbox.record.lock().await;
        self.stop_container_entry(&entry, Duration::ZERO).await?;
        self.discard_container(&sandbox, &mut sandbox_record, &entry);
        drop(sandbox_record);
        tracing::info!(sandbox_id = %entry.sandbox_id, container_id = %id, "container removed");
        Ok(())
    }

    /// Reports a container's state and configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or removed containers.
    pub async fn container_status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let entry = self.container(id)?;
        let record = entry.record.lock().await;
        let scope = Scope::container(entry.sandbox_id.clone(), id.clone());
        Ok(ContainerStatus {
            id: id.clone(),
            sandbox_id: entry.sandbox_id.clone(),
            metadata: entry.config.metadata.clone(),
            image: entry.config.image.clone(),
            state: record.state,
            created_at: entry.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: record.exit_code,
            reason: record.reason,
            pid: record
                .process
                .as_ref()
                .filter(|_| record.state == ContainerState::Running)
                .map(ProcessHandle::pid),
            mounts: entry.config.mounts.clone(),
            devices: self.shared.devices.visible(&scope),
            limits: record.limits.clone(),
            log_path: entry.log_path.clone(),
            cloned_from: entry.cloned_from.clone(),
        })
    }

    /// Lists containers, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the container table is unavailable.
    pub async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        let mut summaries = Vec::new();
        for entry in self.all_containers()? {
            if filter
                .sandbox_id
                .as_ref()
                .is_some_and(|wanted| *wanted != entry.sandbox_id)
            {
                continue;
            }
            let state = entry.record.lock().await.state;
            if filter.state.is_some_and(|wanted| wanted != state) {
                continue;
            }
            summaries.push(ContainerSummary {
                id: entry.id.clone(),
                sandbox_id: entry.sandbox_id.clone(),
                metadata: entry.config.metadata.clone(),
                image: entry.config.image.clone(),
                state,
                created_at: entry.created_at,
            });
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// Changes a container's resource limits without restarting it. The
    /// new limits are readable through diagnostics once this returns.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown containers.
    /// - `FailedPrecondition` once the container has exited.
    /// - `InvalidArgument` for conflicting processor settings or memory
    ///   above the sandbox's.
    pub async fn update_container_resources(
        &self,
        id: &ContainerId,
        limits: &ResourceLimits,
    ) -> Result<()> {
        let entry = self.container(id)?;
        let sandbox = self.sandbox(&entry.sandbox_id)?;
        let mut record = entry.record.lock().await;
        if record.state == ContainerState::Exited {
            return Err(PodhostError::precondition(format!(
                "container {id} has exited"
            )));
        }
        let merged = record.limits.merged_with(limits);
        check_processor_exclusive(&merged)?;
        self.check_memory_fits(&sandbox, &merged)?;
        let scope = Scope::container(entry.sandbox_id.clone(), id.clone());
        self.shared.enforcer.apply(&scope, limits)?;
        record.limits = merged;
        drop(record);
        tracing::info!(container_id = %id, ?limits, "container resources updated");
        Ok(())
    }

    /// Runs a command in a running container and waits for it.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown containers.
    /// - `FailedPrecondition` if the container is not running.
    /// - `DeadlineExceeded` if the timeout passes first.
    pub async fn exec_sync(&self, request: &ExecSyncRequest) -> Result<ExecOutput> {
        let entry = self.container(&request.container_id)?;
        let state = entry.record.lock().await.state;
        if state != ContainerState::Running {
            return Err(PodhostError::precondition(format!(
                "container {} is {state}, exec needs a running container",
                request.container_id
            )));
        }
        let sandbox = self.sandbox(&entry.sandbox_id)?;
        let workload = self.workload(&entry, request.cmd.clone())?;
        let timeout = (!request.timeout.is_zero()).then_some(request.timeout);
        self.backend(sandbox.isolation)
            .exec(&sandbox.handle, &workload, timeout)
            .await
    }

    /// Returns everything the container wrote to stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown containers, or an error if the log
    /// cannot be read.
    pub fn container_logs(&self, id: &ContainerId) -> Result<String> {
        let entry = self.container(id)?;
        logs::read_logs(&entry.log_path)
    }

    pub(crate) async fn stop_container_entry(
        &self,
        entry: &ContainerEntry,
        grace: Duration,
    ) -> Result<()> {
        let mut record = entry.record.lock().await;
        let was = record.state;
        match record.state {
            ContainerState::Exited => return Ok(()),
            ContainerState::Created => {
                record.exit_code = None;
            }
            ContainerState::Running => {
                entry.stop_requested.store(true, Ordering::SeqCst);
                if let Some(process) = record.process.clone() {
                    let code = process.terminate(grace).await?;
                    record.exit_code = Some(code);
                }
            }
        }
        record.state = ContainerState::Exited;
        record.reason = Some(ExitReason::Killed);
        record.finished_at = Some(chrono::Utc::now());
        drop(record);

        if entry.is_template {
            self.fail_template(
                &entry.sandbox_id,
                "template container was stopped before it exited on its own",
            );
        }
        tracing::info!(
            sandbox_id = %entry.sandbox_id,
            container_id = %entry.id,
            from = %was,
            ?grace,
            "container stopped"
        );
        self.publish(LifecycleEvent::ContainerStateChanged {
            sandbox_id: entry.sandbox_id.clone(),
            container_id: entry.id.clone(),
            state: ContainerState::Exited,
        });
        Ok(())
    }

    /// Drops a stopped container from its sandbox and the container table.
    pub(crate) fn discard_container(
        &self,
        sandbox: &SandboxEntry,
        record: &mut SandboxRecord,
        entry: &ContainerEntry,
    ) {
        self.release_container(sandbox, &entry.id);
        let _ = record.containers.remove(&entry.id);
        if let Err(e) = std::fs::remove_file(&entry.log_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(container_id = %entry.id, error = %e, "container log not removed");
            }
        }
    }

    /// Releases host state of a container; every step tolerates state that
    /// was never created.
    fn release_container(&self, sandbox: &SandboxEntry, id: &ContainerId) {
        let shared = &self.shared;
        if let Err(e) = shared
            .enforcer
            .release(&Scope::container(sandbox.id.clone(), id.clone()))
        {
            tracing::warn!(container_id = %id, error = %e, "container cgroup not released");
        }
        shared.devices.release_container(&sandbox.id, id);
        if let Err(e) = self
            .backend(sandbox.isolation)
            .discard_container(&sandbox.handle, id)
        {
            tracing::warn!(container_id = %id, error = %e, "container root not removed");
        }
        shared.templates.unregister_template_container(&sandbox.id, id);
        shared.templates.unclaim_container_clone(&sandbox.id, id);
        if let Err(e) = self.drop_container(id) {
            tracing::warn!(container_id = %id, error = %e, "container entry not dropped");
        }
    }

    fn check_memory_fits(&self, sandbox: &SandboxEntry, limits: &ResourceLimits) -> Result<()> {
        let Some(container_mb) = limits.memory_mb else {
            return Ok(());
        };
        let sandbox_mb = self
            .backend(sandbox.isolation)
            .sandbox_resources(&sandbox.handle)?
            .memory_mb;
        if let Some(sandbox_mb) = sandbox_mb {
            if container_mb > sandbox_mb {
                return Err(PodhostError::invalid(format!(
                    "container memory {container_mb} MB exceeds sandbox {} memory {sandbox_mb} MB",
                    sandbox.id
                )));
            }
        }
        Ok(())
    }

    fn workload(&self, entry: &ContainerEntry, argv: Vec<String>) -> Result<WorkloadSpec> {
        let scope = Scope::container(entry.sandbox_id.clone(), entry.id.clone());
        let visible = self
            .shared
            .devices
            .visible(&scope)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut env = entry.config.envs.clone();
        env.extend([
            (SANDBOX_ID_ENV.to_string(), entry.sandbox_id.to_string()),
            (CONTAINER_ID_ENV.to_string(), entry.id.to_string()),
            (ROOTFS_ENV.to_string(), entry.rootfs.display().to_string()),
            (VISIBLE_DEVICES_ENV.to_string(), visible),
        ]);
        let cwd = entry
            .config
            .working_dir
            .as_deref()
            .map_or_else(
                || entry.rootfs.clone(),
                |dir| mount::target_in_rootfs(&entry.rootfs, dir),
            );
        std::fs::create_dir_all(&cwd).map_err(|e| PodhostError::Io {
            path: cwd.clone(),
            source: e,
        })?;
        Ok(WorkloadSpec {
            container: entry.id.clone(),
            argv,
            env,
            cwd,
            log_path: entry.log_path.clone(),
        })
    }

    /// Waits for a workload to exit and records how it ended.
    async fn monitor(self, entry: Arc<ContainerEntry>, process: ProcessHandle) {
        let code = match process.wait().await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(container_id = %entry.id, error = %e, "lost track of workload");
                -1
            }
        };
        let natural = !entry.stop_requested.load(Ordering::SeqCst);
        {
            let mut record = entry.record.lock().await;
            if record.state != ContainerState::Running {
                return;
            }
            record.state = ContainerState::Exited;
            record.exit_code = Some(code);
            record.finished_at = Some(chrono::Utc::now());
            record.reason = Some(match (natural, code) {
                (false, _) => ExitReason::Killed,
                (true, 0) => ExitReason::Completed,
                (true, _) => ExitReason::Error,
            });
        }
        tracing::info!(
            sandbox_id = %entry.sandbox_id,
            container_id = %entry.id,
            code,
            "container exited"
        );
        self.publish(LifecycleEvent::ContainerStateChanged {
            sandbox_id: entry.sandbox_id.clone(),
            container_id: entry.id.clone(),
            state: ContainerState::Exited,
        });

        if natural && entry.is_template {
            self.save_template(&entry).await;
        }
    }

    /// Captures a template sandbox once its template container has exited.
    async fn save_template(&self, container: &ContainerEntry) {
        let sandbox_id = &container.sandbox_id;
        let Ok(Some(sandbox)) = self.find_sandbox(sandbox_id) else {
            return;
        };
        let record = sandbox.record.lock().await;
        if record.state != SandboxState::Running {
            self.fail_template(sandbox_id, "sandbox stopped before its template could be saved");
            return;
        }
        if let Err(e) = self.shared.templates.begin_save(sandbox_id) {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "template save skipped");
            return;
        }
        tracing::info!(sandbox_id = %sandbox_id, container_id = %container.id, "saving template");

        let result = self.capture_template(&sandbox, container).await;
        drop(record);
        match result {
            Ok(saved) => {
                if let Err(e) = self.shared.templates.finish_save(sandbox_id, saved) {
                    self.fail_template(sandbox_id, &e.to_string());
                    return;
                }
                tracing::info!(sandbox_id = %sandbox_id, "sandbox saved as template");
                self.publish(LifecycleEvent::TemplateSaved {
                    sandbox_id: sandbox_id.clone(),
                });
            }
            Err(e) => self.fail_template(sandbox_id, &e.to_string()),
        }
    }

    async fn capture_template(
        &self,
        sandbox: &SandboxEntry,
        container: &ContainerEntry,
    ) -> Result<SavedTemplate> {
        let store = self.shared.templates.store();
        let snapshot = self
            .backend(sandbox.isolation)
            .snapshot(&sandbox.handle, &store.image_dir(&sandbox.id))
            .await?;
        let config = TemplateConfig::new(
            sandbox.id.clone(),
            container.id.clone(),
            snapshot.topology,
            TemplateContainerSpec {
                image: container.config.image.clone(),
                limits: container.initial_limits.clone(),
                devices: container.devices.clone(),
            },
        );
        store.save(&config)?;
        Ok(SavedTemplate { config, snapshot })
    }

    /// Marks a pending template as never to be saved.
    pub(crate) fn fail_template(&self, sandbox_id: &SandboxId, reason: &str) {
        let status = self.shared.templates.status(sandbox_id);
        if !matches!(status, TemplateStatus::Pending | TemplateStatus::Saving) {
            return;
        }
        self.shared.templates.fail(sandbox_id, reason);
        tracing::error!(sandbox_id = %sandbox_id, reason, "template save failed");
        self.publish(LifecycleEvent::TemplateSaveFailed {
            sandbox_id: sandbox_id.clone(),
            reason: reason.to_string(),
        });
    }
}
