//! Global configuration model for the podhost runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PodhostError, Result};
use crate::types::IsolationKind;

/// Root configuration for the podhost runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for sandbox scratch space, logs, and template state.
    pub data_dir: PathBuf,
    /// Cgroup v2 directory under which sandbox and container cgroups live.
    pub cgroup_root: PathBuf,
    /// Maps a runtime handler name to the isolation backend it selects.
    pub runtime_handlers: BTreeMap<String, IsolationKind>,
    /// Grace period given to containers when their sandbox is stopped.
    pub sandbox_stop_grace_secs: u64,
    /// Default interval between template-save polls.
    pub template_save_poll_interval_ms: u64,
    /// VM topology used when a hypervisor sandbox does not override it.
    pub default_vm: VmDefaults,
}

/// Default topology for hypervisor-isolated sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    /// VM memory in megabytes.
    pub memory_mb: u64,
    /// Virtual processor count.
    pub processor_count: u32,
    /// Whether VM memory may be overcommitted.
    pub allow_overcommit: bool,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            processor_count: 2,
            allow_overcommit: true,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let runtime_handlers = [
            ("", IsolationKind::Process),
            ("process", IsolationKind::Process),
            ("hypervisor", IsolationKind::Hypervisor),
            ("vm", IsolationKind::Hypervisor),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();
        Self {
            data_dir: crate::constants::data_dir().clone(),
            cgroup_root: PathBuf::from(crate::constants::CGROUP_V2_PATH)
                .join(crate::constants::CGROUP_SUBTREE),
            runtime_handlers,
            sandbox_stop_grace_secs: 0,
            template_save_poll_interval_ms: crate::constants::DEFAULT_POLL_INTERVAL_MS,
            default_vm: VmDefaults::default(),
        }
    }
}

impl RuntimeConfig {
    /// Returns a default configuration rooted at the given directories.
    #[must_use]
    pub fn with_dirs(data_dir: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cgroup_root: cgroup_root.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file. Missing fields take their
    /// defaults and unknown fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PodhostError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "runtime configuration loaded");
        Ok(config)
    }

    /// Resolves a runtime handler name to its isolation backend.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the handler is not configured.
    pub fn isolation_for_handler(&self, handler: &str) -> Result<IsolationKind> {
        self.runtime_handlers
            .get(handler)
            .copied()
            .ok_or_else(|| PodhostError::invalid(format!("unknown runtime handler {handler:?}")))
    }

    /// Grace period given to containers when their sandbox is stopped.
    #[must_use]
    pub const fn sandbox_stop_grace(&self) -> Duration {
        Duration::from_secs(self.sandbox_stop_grace_secs)
    }

    /// Default interval between template-save polls.
    #[must_use]
    pub const fn template_save_poll_interval(&self) -> Duration {
        Duration::from_millis(self.template_save_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handlers_cover_both_backends() {
        let config = RuntimeConfig::default();
        assert_eq!(
            config.isolation_for_handler("").expect("default handler"),
            IsolationKind::Process
        );
        assert_eq!(
            config.isolation_for_handler("vm").expect("vm handler"),
            IsolationKind::Hypervisor
        );
        assert!(config.isolation_for_handler("kata").is_err());
    }

    #[test]
    fn from_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("podhost.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/srv/podhost", "default_vm": {"memory_mb": 2048}, "extra": 1}"#,
        )
        .expect("write config");

        let config = RuntimeConfig::from_file(&path).expect("load");
        assert_eq!(config.data_dir, PathBuf::from("/srv/podhost"));
        assert_eq!(config.default_vm.memory_mb, 2048);
        assert_eq!(config.default_vm.processor_count, 2);
        assert_eq!(config.template_save_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RuntimeConfig::from_file(&dir.path().join("absent.json")).expect_err("missing");
        assert!(matches!(err, PodhostError::Io { .. }));
    }
}
