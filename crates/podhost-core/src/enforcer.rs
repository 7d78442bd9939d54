//! Resource limit enforcement shared by all sandboxes on a host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use podhost_common::error::{PodhostError, Result};
use podhost_common::types::ResourceLimits;

use crate::cgroup::io::BlockDevice;
use crate::cgroup::memory::BYTES_PER_MB;
use crate::cgroup::{Cgroup, cpu, io, memory};
use crate::scope::Scope;

/// Applies and reads back resource limits for a sandbox or container.
///
/// Implementations are shared across sandboxes and must be safe under
/// concurrent calls for unrelated scopes.
pub trait ResourceEnforcer: Send + Sync {
    /// Applies `limits` on top of whatever is already set for `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is invalid or cannot be written.
    fn apply(&self, scope: &Scope, limits: &ResourceLimits) -> Result<()>;

    /// Reads back the limits currently in force for `scope`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing was ever applied for `scope`.
    fn query(&self, scope: &Scope) -> Result<ResourceLimits>;

    /// Places a process under the limits of `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be moved.
    fn attach(&self, scope: &Scope, pid: u32) -> Result<()>;

    /// Drops `scope` and every scope nested inside it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing state cannot be removed.
    fn release(&self, scope: &Scope) -> Result<()>;
}

/// Enforcer backed by the cgroup v2 unified hierarchy.
///
/// Sandbox cgroups live at `<root>/<sandbox>`, container cgroups nest
/// beneath their sandbox at `<root>/<sandbox>/<container>`.
#[derive(Debug)]
pub struct CgroupEnforcer {
    root: PathBuf,
    host_cpus: u32,
    io_device: Option<BlockDevice>,
    applied: Mutex<HashMap<Scope, ResourceLimits>>,
}

impl CgroupEnforcer {
    /// Creates an enforcer rooted at `root`, throttling storage on the
    /// device that backs `data_dir`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, data_dir: &Path) -> Self {
        let io_device = match io::block_device_of(data_dir) {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::warn!(error = %e, "storage QoS disabled: no block device for data dir");
                None
            }
        };
        let host_cpus = std::thread::available_parallelism()
            .ok()
            .and_then(|n| u32::try_from(n.get()).ok())
            .unwrap_or(1);
        Self {
            root: root.into(),
            host_cpus,
            io_device,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the host processor count used for processor-limit quotas.
    #[must_use]
    pub const fn with_host_cpus(mut self, host_cpus: u32) -> Self {
        self.host_cpus = host_cpus;
        self
    }

    /// Overrides the block device throttled by storage QoS.
    #[must_use]
    pub const fn with_io_device(mut self, device: BlockDevice) -> Self {
        self.io_device = Some(device);
        self
    }

    /// Cgroup directory for a scope.
    #[must_use]
    pub fn cgroup_path(&self, scope: &Scope) -> PathBuf {
        self.root.join(scope.relative_path())
    }

    fn ensure_cgroup(&self, scope: &Scope) -> Result<Cgroup> {
        let sandbox_scope = Scope::sandbox(scope.sandbox.clone());
        let sandbox_path = self.cgroup_path(&sandbox_scope);
        if !sandbox_path.is_dir() {
            let sandbox = Cgroup::create(sandbox_path)?;
            sandbox.enable_subtree_controllers();
        }
        Cgroup::create(self.cgroup_path(scope))
    }

    fn recorded(&self, scope: &Scope) -> Result<Option<ResourceLimits>> {
        let applied = self
            .applied
            .lock()
            .map_err(|_| PodhostError::internal("enforcer state lock poisoned"))?;
        Ok(applied.get(scope).cloned())
    }

    fn write_limits(&self, cgroup: &Cgroup, limits: &ResourceLimits) -> Result<()> {
        let path = cgroup.path();
        if let Some(mb) = limits.memory_mb {
            let bytes = mb.checked_mul(BYTES_PER_MB).ok_or_else(|| {
                PodhostError::invalid(format!("memory limit of {mb} MB does not fit in bytes"))
            })?;
            memory::set_memory_max(path, Some(bytes))?;
        }
        if let Some(count) = limits.cpu_count {
            cpu::set_cpu_max(path, Some(cpu::count_to_quota(count)))?;
        } else if let Some(limit) = limits.cpu_limit {
            cpu::set_cpu_max(path, Some(cpu::limit_to_quota(limit, self.host_cpus)))?;
        }
        if let Some(weight) = limits.cpu_weight {
            cpu::set_cpu_weight(path, weight)?;
        }
        if limits.storage_bandwidth_max.is_some() || limits.storage_iops_max.is_some() {
            let device = self.io_device.ok_or_else(|| {
                PodhostError::unsupported("storage QoS without a resolvable block device")
            })?;
            io::set_io_max(
                path,
                device,
                limits.storage_bandwidth_max,
                limits.storage_iops_max,
            )?;
        }
        Ok(())
    }
}

fn validate_cpu(limits: &ResourceLimits) -> Result<()> {
    if limits.cpu_count.is_some() && limits.cpu_limit.is_some() {
        return Err(PodhostError::invalid(
            "processor count and processor limit cannot both be enforced on one cgroup",
        ));
    }
    Ok(())
}

impl ResourceEnforcer for CgroupEnforcer {
    fn apply(&self, scope: &Scope, limits: &ResourceLimits) -> Result<()> {
        let merged = self
            .recorded(scope)?
            .unwrap_or_default()
            .merged_with(limits);
        validate_cpu(&merged)?;
        let cgroup = self.ensure_cgroup(scope)?;
        self.write_limits(&cgroup, &merged)?;

        let mut applied = self
            .applied
            .lock()
            .map_err(|_| PodhostError::internal("enforcer state lock poisoned"))?;
        let _ = applied.insert(scope.clone(), merged);
        drop(applied);
        tracing::debug!(%scope, "resource limits applied");
        Ok(())
    }

    fn query(&self, scope: &Scope) -> Result<ResourceLimits> {
        let cgroup = Cgroup::open(self.cgroup_path(scope));
        let Some(recorded) = self.recorded(scope)? else {
            return Err(PodhostError::NotFound {
                kind: "cgroup",
                id: scope.to_string(),
            });
        };
        if !cgroup.exists() {
            return Err(PodhostError::NotFound {
                kind: "cgroup",
                id: scope.to_string(),
            });
        }
        let path = cgroup.path();
        let mut limits = ResourceLimits {
            memory_mb: memory::read_memory_max(path)?.map(|bytes| bytes / BYTES_PER_MB),
            ..ResourceLimits::default()
        };
        // cpu.max cannot tell a count from a limit; decode as whichever was set.
        if let Some(quota) = cpu::read_cpu_max(path)? {
            if recorded.cpu_limit.is_some() {
                limits.cpu_limit = Some(cpu::quota_to_limit(quota, self.host_cpus));
            } else {
                limits.cpu_count = Some(cpu::quota_to_count(quota));
            }
        }
        if recorded.cpu_weight.is_some() {
            limits.cpu_weight = cpu::read_cpu_weight(path)?;
        }
        if let Some(device) = self.io_device {
            let caps = io::read_io_max(path, device)?;
            limits.storage_bandwidth_max = caps.bps;
            limits.storage_iops_max = caps.iops;
        }
        Ok(limits)
    }

    fn attach(&self, scope: &Scope, pid: u32) -> Result<()> {
        let cgroup = self.ensure_cgroup(scope)?;
        cgroup.add_process(pid)
    }

    fn release(&self, scope: &Scope) -> Result<()> {
        Cgroup::open(self.cgroup_path(scope)).destroy()?;
        let mut applied = self
            .applied
            .lock()
            .map_err(|_| PodhostError::internal("enforcer state lock poisoned"))?;
        applied.retain(|recorded, _| !scope.contains(recorded));
        drop(applied);
        tracing::debug!(%scope, "resource scope released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use podhost_common::types::{ContainerId, SandboxId};

    use super::*;

    fn enforcer(root: &Path) -> CgroupEnforcer {
        CgroupEnforcer::new(root, root)
            .with_host_cpus(4)
            .with_io_device(BlockDevice { major: 8, minor: 0 })
    }

    fn container_scope(sandbox: &str, container: &str) -> Scope {
        Scope::container(SandboxId::new(sandbox), ContainerId::new(container))
    }

    #[test]
    fn every_limit_reads_back_exactly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforcer = enforcer(dir.path());
        let scope = container_scope("s1", "c1");

        for limits in [
            ResourceLimits {
                memory_mb: Some(768),
                cpu_count: Some(2),
                cpu_weight: Some(300),
                storage_bandwidth_max: Some(2_000_000),
                storage_iops_max: Some(150),
                ..ResourceLimits::default()
            },
            ResourceLimits {
                cpu_limit: Some(2500),
                ..ResourceLimits::default()
            },
        ] {
            enforcer.apply(&scope, &limits).expect("apply");
            let read = enforcer.query(&scope).expect("query");
            if let Some(mb) = limits.memory_mb {
                assert_eq!(read.memory_mb, Some(mb));
            }
            assert_eq!(read.cpu_count, limits.cpu_count);
            assert_eq!(read.cpu_limit, limits.cpu_limit);
            if limits.cpu_weight.is_some() {
                assert_eq!(read.cpu_weight, limits.cpu_weight);
                assert_eq!(read.storage_bandwidth_max, limits.storage_bandwidth_max);
                assert_eq!(read.storage_iops_max, limits.storage_iops_max);
            }
        }
    }

    #[test]
    fn updates_keep_unrelated_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforcer = enforcer(dir.path());
        let scope = container_scope("s1", "c1");
        enforcer
            .apply(
                &scope,
                &ResourceLimits {
                    memory_mb: Some(128),
                    ..ResourceLimits::default()
                },
            )
            .expect("apply");
        enforcer
            .apply(
                &scope,
                &ResourceLimits {
                    cpu_weight: Some(50),
                    ..ResourceLimits::default()
                },
            )
            .expect("update");

        let read = enforcer.query(&scope).expect("query");
        assert_eq!(read.memory_mb, Some(128));
        assert_eq!(read.cpu_weight, Some(50));
    }

    #[test]
    fn limits_do_not_leak_between_sandboxes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforcer = enforcer(dir.path());
        let a = container_scope("s1", "c1");
        let b = container_scope("s2", "c1");
        enforcer
            .apply(
                &a,
                &ResourceLimits {
                    memory_mb: Some(64),
                    ..ResourceLimits::default()
                },
            )
            .expect("apply a");
        enforcer
            .apply(
                &b,
                &ResourceLimits {
                    memory_mb: Some(512),
                    ..ResourceLimits::default()
                },
            )
            .expect("apply b");

        assert_eq!(enforcer.query(&a).expect("a").memory_mb, Some(64));
        assert_eq!(enforcer.query(&b).expect("b").memory_mb, Some(512));
    }

    #[test]
    fn count_and_limit_together_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforcer = enforcer(dir.path());
        let err = enforcer
            .apply(
                &container_scope("s1", "c1"),
                &ResourceLimits {
                    cpu_count: Some(1),
                    cpu_limit: Some(100),
                    ..ResourceLimits::default()
                },
            )
            .expect_err("conflict");
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));
    }

    #[test]
    fn memory_that_overflows_bytes_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforcer = enforcer(dir.path());
        let err = enforcer
            .apply(
                &container_scope("s1", "c1"),
                &ResourceLimits {
                    memory_mb: Some(u64::MAX),
                    ..ResourceLimits::default()
                },
            )
            .expect_err("overflow");
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));
    }

    #[test]
    fn release_sandbox_drops_nested_containers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enforcer = enforcer(dir.path());
        let scope = container_scope("s1", "c1");
        enforcer
            .apply(
                &scope,
                &ResourceLimits {
                    memory_mb: Some(64),
                    ..ResourceLimits::default()
                },
            )
            .expect("apply");

        enforcer
            .release(&Scope::sandbox(SandboxId::new("s1")))
            .expect("release");
        assert!(!dir.path().join("s1").exists());
        assert!(matches!(
            enforcer.query(&scope),
            Err(PodhostError::NotFound { .. })
        ));
    }
}
