//! Template and clone bookkeeping.
//!
//! A template sandbox moves through [`TemplateStatus`]:
//! `Pending` when created, `Saving` once its template container exits,
//! then `SavedAsTemplate` or `Failed`. Clone sandboxes and clone containers
//! are admitted only against a template in `SavedAsTemplate`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ContainerId, SandboxId, TemplateStatus};

use crate::backend::Snapshot;
use crate::options::VmTopology;
use crate::state::{TemplateConfig, TemplateContainerSpec, TemplateStore};

/// A template that finished saving.
#[derive(Debug, Clone)]
pub struct SavedTemplate {
    /// Persisted template record.
    pub config: TemplateConfig,
    /// Captured VM state.
    pub snapshot: Snapshot,
}

#[derive(Debug)]
struct TemplateEntry {
    status: TemplateStatus,
    container: Option<ContainerId>,
    saved: Option<Arc<SavedTemplate>>,
}

#[derive(Debug)]
struct CloneEntry {
    template: Arc<SavedTemplate>,
    restored: Option<ContainerId>,
}

#[derive(Debug, Default)]
struct Registry {
    templates: HashMap<SandboxId, TemplateEntry>,
    clones: HashMap<SandboxId, CloneEntry>,
}

/// Tracks template sandboxes and the clones forked from them.
#[derive(Debug)]
pub struct TemplateManager {
    store: TemplateStore,
    registry: Mutex<Registry>,
}

impl TemplateManager {
    /// Creates a manager persisting to `store`.
    #[must_use]
    pub fn new(store: TemplateStore) -> Self {
        Self {
            store,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Backing store.
    #[must_use]
    pub const fn store(&self) -> &TemplateStore {
        &self.store
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| PodhostError::internal("template registry lock poisoned"))
    }

    /// Marks a new sandbox as a template waiting for its template container.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn register_template(&self, sandbox: &SandboxId) -> Result<()> {
        let _ = self.registry()?.templates.insert(
            sandbox.clone(),
            TemplateEntry {
                status: TemplateStatus::Pending,
                container: None,
                saved: None,
            },
        );
        Ok(())
    }

    /// Designates the template container of a template sandbox.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the sandbox is not a template, or
    /// `Unsupported` if it already has a template container.
    pub fn register_template_container(
        &self,
        sandbox: &SandboxId,
        container: &ContainerId,
    ) -> Result<()> {
        let mut registry = self.registry()?;
        let entry = registry.templates.get_mut(sandbox).ok_or_else(|| {
            PodhostError::invalid(format!(
                "sandbox {sandbox} is not marked to be saved as a template"
            ))
        })?;
        if let Some(existing) = &entry.container {
            return Err(PodhostError::unsupported(format!(
                "a second template container in sandbox {sandbox} (already {existing})"
            )));
        }
        if entry.status != TemplateStatus::Pending {
            return Err(PodhostError::unsupported(format!(
                "saving template {sandbox} again"
            )));
        }
        entry.container = Some(container.clone());
        Ok(())
    }

    /// Releases a template container slot whose container was never created.
    pub fn unregister_template_container(&self, sandbox: &SandboxId, container: &ContainerId) {
        if let Ok(mut registry) = self.registry() {
            if let Some(entry) = registry.templates.get_mut(sandbox) {
                if entry.container.as_ref() == Some(container) {
                    entry.container = None;
                }
            }
        }
    }

    /// Template status of a sandbox; `None` for sandboxes that are not templates.
    #[must_use]
    pub fn status(&self, sandbox: &SandboxId) -> TemplateStatus {
        self.registry()
            .ok()
            .and_then(|registry| registry.templates.get(sandbox).map(|e| e.status.clone()))
            .unwrap_or(TemplateStatus::None)
    }

    /// Moves a template from `Pending` to `Saving`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the template is not pending.
    pub fn begin_save(&self, sandbox: &SandboxId) -> Result<()> {
        let mut registry = self.registry()?;
        let entry = registry.templates.get_mut(sandbox).ok_or_else(|| {
            PodhostError::invalid(format!("sandbox {sandbox} is not a template"))
        })?;
        if entry.status != TemplateStatus::Pending {
            return Err(PodhostError::unsupported(format!(
                "saving template {sandbox} from status {}",
                entry.status
            )));
        }
        entry.status = TemplateStatus::Saving;
        Ok(())
    }

    /// Records a completed save.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn finish_save(&self, sandbox: &SandboxId, saved: SavedTemplate) -> Result<()> {
        if let Some(entry) = self.registry()?.templates.get_mut(sandbox) {
            entry.status = TemplateStatus::SavedAsTemplate;
            entry.saved = Some(Arc::new(saved));
        }
        Ok(())
    }

    /// Records that a template will never be saved.
    pub fn fail(&self, sandbox: &SandboxId, reason: impl Into<String>) {
        if let Ok(mut registry) = self.registry() {
            if let Some(entry) = registry.templates.get_mut(sandbox) {
                if entry.status != TemplateStatus::SavedAsTemplate {
                    entry.status = TemplateStatus::Failed {
                        reason: reason.into(),
                    };
                }
            }
        }
    }

    /// Resolves the template a new clone sandbox forks from.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `template` is not a known template.
    /// - `FailedPrecondition` if the template has not finished saving.
    /// - `Unsupported` if the template can never be saved.
    /// - `InvalidArgument` if `topology` is incompatible with the template.
    pub fn resolve_sandbox_clone(
        &self,
        template: &SandboxId,
        topology: &VmTopology,
    ) -> Result<Arc<SavedTemplate>> {
        let saved = {
            let registry = self.registry()?;
            let entry = registry
                .templates
                .get(template)
                .ok_or_else(|| PodhostError::NotFound {
                    kind: "template",
                    id: template.to_string(),
                })?;
            match (&entry.status, &entry.saved) {
                (TemplateStatus::SavedAsTemplate, Some(saved)) => Arc::clone(saved),
                (TemplateStatus::Failed { reason }, _) => {
                    return Err(PodhostError::unsupported(format!(
                        "cloning template {template}, which will never be saved: {reason}"
                    )));
                }
                (status, _) => {
                    return Err(PodhostError::precondition(format!(
                        "template {template} is not saved yet (status {status})"
                    )));
                }
            }
        };
        let persisted = self.store.load(template)?;
        persisted.topology.check_clone(topology)?;
        Ok(saved)
    }

    /// Records a clone sandbox forked from `saved`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn register_clone(&self, sandbox: &SandboxId, saved: Arc<SavedTemplate>) -> Result<()> {
        let _ = self.registry()?.clones.insert(
            sandbox.clone(),
            CloneEntry {
                template: saved,
                restored: None,
            },
        );
        Ok(())
    }

    /// Template a clone sandbox was forked from.
    #[must_use]
    pub fn cloned_from(&self, sandbox: &SandboxId) -> Option<SandboxId> {
        self.registry().ok().and_then(|registry| {
            registry
                .clones
                .get(sandbox)
                .map(|e| e.template.config.template_sandbox_id.clone())
        })
    }

    /// Claims the single restorable container of a clone sandbox.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `sandbox` is not a clone or if `spec` is
    ///   incompatible.
    /// - `NotFound` if `template_container` is not the template's container.
    /// - `FailedPrecondition` if the clone already restored a container.
    pub fn claim_container_clone(
        &self,
        sandbox: &SandboxId,
        template_container: &ContainerId,
        container: &ContainerId,
        spec: &TemplateContainerSpec,
    ) -> Result<()> {
        let mut registry = self.registry()?;
        let entry = registry.clones.get_mut(sandbox).ok_or_else(|| {
            PodhostError::invalid(format!(
                "container clones need a sandbox cloned from a template; {sandbox} is not one"
            ))
        })?;
        let config = &entry.template.config;
        if &config.template_container_id != template_container {
            tracing::debug!(
                %template_container,
                template = %config.template_sandbox_id,
                "not the template container of this template"
            );
            return Err(PodhostError::NotFound {
                kind: "template container",
                id: template_container.to_string(),
            });
        }
        if let Some(existing) = &entry.restored {
            return Err(PodhostError::precondition(format!(
                "clone sandbox {sandbox} already restored its template container as {existing}"
            )));
        }
        config.container.check_clone(spec)?;
        entry.restored = Some(container.clone());
        Ok(())
    }

    /// Gives back a claim taken by [`claim_container_clone`](Self::claim_container_clone)
    /// for a container that was never created.
    pub fn unclaim_container_clone(&self, sandbox: &SandboxId, container: &ContainerId) {
        if let Ok(mut registry) = self.registry() {
            if let Some(entry) = registry.clones.get_mut(sandbox) {
                if entry.restored.as_ref() == Some(container) {
                    entry.restored = None;
                }
            }
        }
    }

    /// Forgets a removed sandbox and deletes any template state it owned.
    ///
    /// Clones keep working after their template is removed: each clone
    /// holds its own copy of the template's VM state.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted template state cannot be removed.
    pub fn forget(&self, sandbox: &SandboxId) -> Result<()> {
        let was_template = {
            let mut registry = self.registry()?;
            let _ = registry.clones.remove(sandbox);
            registry.templates.remove(sandbox).is_some()
        };
        if was_template {
            self.store.remove(sandbox)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use podhost_common::config::VmDefaults;
    use podhost_common::types::{IsolationKind, ResourceLimits};

    use super::*;
    use crate::options::SandboxOptions;

    fn topology() -> VmTopology {
        let defaults = VmDefaults::default();
        SandboxOptions::parse(&Default::default(), IsolationKind::Hypervisor, &defaults)
            .expect("options")
            .topology(&defaults)
    }

    fn container_spec() -> TemplateContainerSpec {
        TemplateContainerSpec {
            image: "busybox".into(),
            limits: ResourceLimits::default(),
            devices: Vec::new(),
        }
    }

    fn saved(store: &TemplateStore, id: &SandboxId) -> SavedTemplate {
        let config = TemplateConfig::new(
            id.clone(),
            ContainerId::new("tc"),
            topology(),
            container_spec(),
        );
        store.save(&config).expect("persist");
        SavedTemplate {
            config,
            snapshot: Snapshot {
                template: id.clone(),
                image_dir: store.image_dir(id),
                topology: topology(),
            },
        }
    }

    #[test]
    fn template_lifecycle_gates_clones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(dir.path());
        let manager = TemplateManager::new(store.clone());
        let id = SandboxId::new("tmpl");

        let err = manager
            .resolve_sandbox_clone(&id, &topology())
            .expect_err("unknown");
        assert!(matches!(err, PodhostError::NotFound { .. }));

        manager.register_template(&id).expect("register");
        manager
            .register_template_container(&id, &ContainerId::new("tc"))
            .expect("template container");
        let err = manager
            .register_template_container(&id, &ContainerId::new("other"))
            .expect_err("second");
        assert!(matches!(err, PodhostError::Unsupported { .. }));

        let err = manager
            .resolve_sandbox_clone(&id, &topology())
            .expect_err("pending");
        assert!(matches!(err, PodhostError::FailedPrecondition { .. }));

        manager.begin_save(&id).expect("begin");
        manager.finish_save(&id, saved(&store, &id)).expect("finish");
        assert_eq!(manager.status(&id), TemplateStatus::SavedAsTemplate);
        assert!(manager.begin_save(&id).is_err());
        manager
            .resolve_sandbox_clone(&id, &topology())
            .expect("clone admitted");
    }

    #[test]
    fn failed_template_is_unsupported_for_clones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = TemplateManager::new(TemplateStore::new(dir.path()));
        let id = SandboxId::new("tmpl");
        manager.register_template(&id).expect("register");
        manager.fail(&id, "template container was stopped");
        let err = manager
            .resolve_sandbox_clone(&id, &topology())
            .expect_err("failed");
        assert!(matches!(err, PodhostError::Unsupported { .. }));
    }

    #[test]
    fn one_restored_container_per_clone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(dir.path());
        let manager = TemplateManager::new(store.clone());
        let template = SandboxId::new("tmpl");
        let clone = SandboxId::new("clone");
        manager
            .register_clone(&clone, Arc::new(saved(&store, &template)))
            .expect("register clone");
        assert_eq!(manager.cloned_from(&clone), Some(template));

        let err = manager
            .claim_container_clone(
                &clone,
                &ContainerId::new("wrong"),
                &ContainerId::new("c1"),
                &container_spec(),
            )
            .expect_err("wrong template container");
        assert!(matches!(err, PodhostError::NotFound { .. }));

        manager
            .claim_container_clone(
                &clone,
                &ContainerId::new("tc"),
                &ContainerId::new("c1"),
                &container_spec(),
            )
            .expect("claim");
        let err = manager
            .claim_container_clone(
                &clone,
                &ContainerId::new("tc"),
                &ContainerId::new("c2"),
                &container_spec(),
            )
            .expect_err("second");
        assert!(matches!(err, PodhostError::FailedPrecondition { .. }));

        manager.unclaim_container_clone(&clone, &ContainerId::new("c1"));
        manager
            .claim_container_clone(
                &clone,
                &ContainerId::new("tc"),
                &ContainerId::new("c2"),
                &container_spec(),
            )
            .expect("claim after unclaim");
    }
}
