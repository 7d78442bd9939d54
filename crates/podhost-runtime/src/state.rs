//! On-disk template persistence.
//!
//! Each saved template owns `<data_dir>/templates/<sandbox_id>/`, holding
//! `config.json` (the [`TemplateConfig`]) and `image/` (the captured VM
//! state). The config is written once; a second save of the same template
//! is rejected.

use std::path::{Path, PathBuf};

use podhost_common::constants::{TEMPLATE_CONFIG_FILE, TEMPLATE_SERIAL_VERSION};
use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ContainerId, DeviceRef, ResourceLimits, SandboxId};
use serde::{Deserialize, Serialize};

use crate::backend::remove_dir_if_exists;
use crate::options::{VmTopology, check_field};

/// Container facts a clone container must reproduce.
///
/// Mounts are not part of it; each clone brings its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContainerSpec {
    /// Image reference.
    pub image: String,
    /// Container resource limits.
    pub limits: ResourceLimits,
    /// Assigned devices.
    pub devices: Vec<DeviceRef>,
}

impl TemplateContainerSpec {
    /// Checks that a clone container is compatible with the template container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first field that differs.
    pub fn check_clone(&self, clone: &Self) -> Result<()> {
        check_field("image", &self.image, &clone.image)?;
        check_field("resource limits", &self.limits, &clone.limits)?;
        check_field("devices", &self.devices, &clone.devices)
    }
}

/// Everything needed to fork clones from a saved template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Format version of this record.
    pub serial_version_id: u32,
    /// Template sandbox.
    pub template_sandbox_id: SandboxId,
    /// The sandbox's template container.
    pub template_container_id: ContainerId,
    /// VM shape at save time.
    pub topology: VmTopology,
    /// Template container facts.
    pub container: TemplateContainerSpec,
    /// RFC 3339 timestamp of the save.
    pub saved_at: String,
}

impl TemplateConfig {
    /// Creates a config stamped with the current format version and time.
    #[must_use]
    pub fn new(
        template_sandbox_id: SandboxId,
        template_container_id: ContainerId,
        topology: VmTopology,
        container: TemplateContainerSpec,
    ) -> Self {
        Self {
            serial_version_id: TEMPLATE_SERIAL_VERSION,
            template_sandbox_id,
            template_container_id,
            topology,
            container,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Directory-backed store of template configs.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    /// Creates a store under `<data_dir>/templates`.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("templates"),
        }
    }

    /// Directory owned by one template.
    #[must_use]
    pub fn template_dir(&self, id: &SandboxId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Directory receiving a template's captured VM state.
    #[must_use]
    pub fn image_dir(&self, id: &SandboxId) -> PathBuf {
        self.template_dir(id).join("image")
    }

    fn config_path(&self, id: &SandboxId) -> PathBuf {
        self.template_dir(id).join(TEMPLATE_CONFIG_FILE)
    }

    /// Persists a template config.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the template was already saved, or an I/O
    /// error if the config cannot be written.
    pub fn save(&self, config: &TemplateConfig) -> Result<()> {
        let id = &config.template_sandbox_id;
        let path = self.config_path(id);
        if path.exists() {
            return Err(PodhostError::unsupported(format!(
                "saving template {id} again"
            )));
        }
        let dir = self.template_dir(id);
        std::fs::create_dir_all(&dir).map_err(|e| PodhostError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let tmp = dir.join(format!("{TEMPLATE_CONFIG_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(config)?;
        std::fs::write(&tmp, json).map_err(|e| PodhostError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| PodhostError::Io {
            path: path.clone(),
            source: e,
        })?;
        tracing::info!(template_id = %id, "template config saved");
        Ok(())
    }

    /// Loads a template config.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no config was saved for `id`, or
    /// `FailedPrecondition` if it was written by an incompatible version.
    pub fn load(&self, id: &SandboxId) -> Result<TemplateConfig> {
        let path = self.config_path(id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PodhostError::NotFound {
                    kind: "template",
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(PodhostError::Io { path, source: e }),
        };
        let config: TemplateConfig = serde_json::from_str(&content)?;
        if config.serial_version_id != TEMPLATE_SERIAL_VERSION {
            return Err(PodhostError::precondition(format!(
                "serialized version of template config: {} doesn't match with the current \
                 version: {}",
                config.serial_version_id, TEMPLATE_SERIAL_VERSION
            )));
        }
        Ok(config)
    }

    /// Deletes a template's config and captured state. Missing templates
    /// are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self, id: &SandboxId) -> Result<()> {
        remove_dir_if_exists(&self.template_dir(id))?;
        tracing::debug!(template_id = %id, "template state removed");
        Ok(())
    }

    /// Deletes every template left behind by an earlier process.
    ///
    /// Templates are only cloneable while their sandbox is known to the
    /// running process, so anything on disk at startup is stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or cleared.
    pub fn purge(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(PodhostError::Io {
                    path: self.root.clone(),
                    source: e,
                });
            }
        };
        let mut purged = 0;
        for entry in entries.flatten() {
            remove_dir_if_exists(&entry.path())?;
            purged += 1;
        }
        if purged > 0 {
            tracing::info!(purged, "stale templates removed");
        }
        Ok(purged)
    }
}
