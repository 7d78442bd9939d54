//! Pod sandbox lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ResourceLimits, SandboxId, SandboxState, TemplateStatus};

use crate::api::{PodSandboxConfig, PodSandboxFilter, PodSandboxStatus, PodSandboxSummary};
use crate::backend::SandboxSpec;
use crate::events::LifecycleEvent;
use crate::logs;
use crate::options::SandboxOptions;
use crate::runtime::{Rollback, Runtime, SandboxEntry, SandboxRecord, spawn_cleanup};

impl Runtime {
    /// Creates and boots a sandbox, forking it from a template when the
    /// annotations reference one.
    ///
    /// The sandbox becomes visible to other calls only once it is running.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an unknown runtime handler, malformed
    ///   annotations, or a clone whose configuration doesn't match its template.
    /// - `NotFound` / `FailedPrecondition` / `Unsupported` for a clone of an
    ///   unknown, unsaved, or unsaveable template.
    /// - Backend errors if the sandbox cannot boot.
    pub async fn run_pod_sandbox(&self, config: &PodSandboxConfig) -> Result<SandboxId> {
        let shared = &self.shared;
        let isolation = shared.config.isolation_for_handler(&config.runtime_handler)?;
        let options =
            SandboxOptions::parse(&config.annotations, isolation, &shared.config.default_vm)?;
        let id = SandboxId::generate();
        let spec = SandboxSpec {
            id: id.clone(),
            options: options.clone(),
            root: shared.config.data_dir.join("sandboxes").join(id.as_str()),
        };
        let backend = Arc::clone(self.backend(isolation));

        let (handle, template) = match &options.template {
            Some(template_id) => {
                let topology = options.topology(&shared.config.default_vm);
                let saved = shared.templates.resolve_sandbox_clone(template_id, &topology)?;
                let handle = backend.fork(&spec, &saved.snapshot).await?;
                (handle, Some(saved))
            }
            None => (backend.boot(&spec).await?, None),
        };

        let rollback = {
            let runtime = self.clone();
            let backend = Arc::clone(&backend);
            let handle = handle.clone();
            Rollback::new("sandbox boot", move || {
                if let Err(e) = runtime.shared.templates.forget(&handle.id) {
                    tracing::warn!(
                        sandbox_id = %handle.id,
                        error = %e,
                        "template bookkeeping not cleared"
                    );
                }
                spawn_cleanup("sandbox boot", async move {
                    let _ = backend.shutdown(&handle).await;
                    if let Err(e) = backend.release(&handle).await {
                        tracing::error!(
                            sandbox_id = %handle.id,
                            error = %e,
                            "sandbox rollback failed"
                        );
                    }
                });
            })
        };

        if options.save_as_template {
            shared.templates.register_template(&id)?;
        }
        if let Some(saved) = template {
            shared.templates.register_clone(&id, saved)?;
        }

        self.insert_sandbox(Arc::new(SandboxEntry {
            id: id.clone(),
            metadata: config.metadata.clone(),
            isolation,
            annotations: config.annotations.clone(),
            options,
            created_at: chrono::Utc::now(),
            handle,
            record: tokio::sync::Mutex::new(SandboxRecord {
                state: SandboxState::Running,
                containers: BTreeSet::new(),
            }),
        }))?;
        rollback.disarm();

        tracing::info!(
            sandbox_id = %id,
            %isolation,
            name = %config.metadata.name,
            "sandbox running"
        );
        self.publish(LifecycleEvent::SandboxStateChanged {
            sandbox_id: id.clone(),
            state: SandboxState::Running,
        });
        Ok(id)
    }

    /// Stops every container in the sandbox, then the sandbox itself.
    ///
    /// Stopping a stopped or unknown sandbox succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if a container or the backend fails to stop.
    pub async fn stop_pod_sandbox(&self, id: &SandboxId) -> Result<()> {
        let Some(entry) = self.find_sandbox(id)? else {
            tracing::debug!(sandbox_id = %id, "stop of unknown sandbox ignored");
            return Ok(());
        };
        let mut record = entry.record.lock().await;
        if record.state == SandboxState::Stopped {
            return Ok(());
        }

        let grace = self.shared.config.sandbox_stop_grace();
        for container_id in &record.containers {
            if let Some(container) = self.find_container(container_id)? {
                self.stop_container_entry(&container, grace).await?;
            }
        }
        if self.shared.templates.status(id) == TemplateStatus::Pending {
            self.fail_template(id, "sandbox stopped before its template container exited");
        }
        self.backend(entry.isolation).shutdown(&entry.handle).await?;
        record.state = SandboxState::Stopped;
        drop(record);

        tracing::info!(sandbox_id = %id, "sandbox stopped");
        self.publish(LifecycleEvent::SandboxStateChanged {
            sandbox_id: id.clone(),
            state: SandboxState::Stopped,
        });
        Ok(())
    }

    /// Stops the sandbox if needed, removes its containers, and releases
    /// everything it holds. Removing an unknown sandbox succeeds.
    ///
    /// Clones forked from a removed template keep running.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping or releasing the sandbox fails.
    pub async fn remove_pod_sandbox(&self, id: &SandboxId) -> Result<()> {
        let Some(entry) = self.find_sandbox(id)? else {
            tracing::debug!(sandbox_id = %id, "remove of unknown sandbox ignored");
            return Ok(());
        };
        self.stop_pod_sandbox(id).await?;

        let mut record = entry.record.lock().await;
        let containers: Vec<_> = record.containers.iter().cloned().collect();
        for container_id in containers {
            if let Some(container) = self.find_container(&container_id)? {
                self.discard_container(&entry, &mut record, &container);
            }
        }
        self.shared.devices.release_sandbox(id);
        self.backend(entry.isolation).release(&entry.handle).await?;
        self.shared.templates.forget(id)?;
        logs::remove_sandbox_logs(&self.shared.config.data_dir, id.as_str())?;
        self.drop_sandbox(id)?;
        drop(record);

        tracing::info!(sandbox_id = %id, "sandbox removed");
        self.publish(LifecycleEvent::SandboxRemoved {
            sandbox_id: id.clone(),
        });
        Ok(())
    }

    /// Reports a sandbox's state and configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or removed sandboxes.
    pub async fn pod_sandbox_status(&self, id: &SandboxId) -> Result<PodSandboxStatus> {
        let entry = self.sandbox(id)?;
        let record = entry.record.lock().await;
        Ok(PodSandboxStatus {
            id: entry.id.clone(),
            metadata: entry.metadata.clone(),
            state: record.state,
            isolation: entry.isolation,
            created_at: entry.created_at,
            annotations: entry.annotations.clone(),
            ignored_annotations: entry.options.ignored.clone(),
            template_status: self.shared.templates.status(id),
            cloned_from: self.shared.templates.cloned_from(id),
            containers: record.containers.iter().cloned().collect(),
        })
    }

    /// Lists live sandboxes, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox table is unavailable.
    pub async fn list_pod_sandbox(
        &self,
        filter: PodSandboxFilter,
    ) -> Result<Vec<PodSandboxSummary>> {
        let mut summaries = Vec::new();
        for entry in self.all_sandboxes()? {
            let state = entry.record.lock().await.state;
            if filter.state.is_some_and(|wanted| wanted != state) {
                continue;
            }
            summaries.push(PodSandboxSummary {
                id: entry.id.clone(),
                metadata: entry.metadata.clone(),
                state,
                isolation: entry.isolation,
                created_at: entry.created_at,
            });
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// Changes sandbox-level resources on a running sandbox.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown sandboxes.
    /// - `FailedPrecondition` if the sandbox is not running.
    /// - Backend errors if the limits cannot be applied.
    pub async fn update_pod_sandbox_resources(
        &self,
        id: &SandboxId,
        limits: &ResourceLimits,
    ) -> Result<()> {
        let entry = self.sandbox(id)?;
        let record = entry.record.lock().await;
        if record.state != SandboxState::Running {
            return Err(PodhostError::precondition(format!(
                "sandbox {id} is {}, resources can only change while it runs",
                record.state
            )));
        }
        self.backend(entry.isolation)
            .update_sandbox_resources(&entry.handle, limits)?;
        drop(record);
        tracing::info!(sandbox_id = %id, ?limits, "sandbox resources updated");
        Ok(())
    }
}
