//! Device assignment shared by all sandboxes on a host.
//!
//! Passthrough devices (`gpu://`, `vpci://`) are owned by at most one
//! sandbox at a time and need hypervisor isolation. Class devices
//! (`class://`) are shared from the host and work with either backend.
//! Inside a sandbox a device is visible only to the containers that
//! declared it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{ContainerId, DeviceRef, IsolationKind, SandboxId};

use crate::scope::Scope;

/// Attaches devices to sandboxes and scopes their visibility to containers.
pub trait DeviceAssigner: Send + Sync {
    /// Attaches `device` to the sandbox of `scope` and makes it visible to
    /// the container of `scope`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the device needs a different isolation
    /// backend, or `FailedPrecondition` if another sandbox owns it.
    fn assign(&self, scope: &Scope, isolation: IsolationKind, device: &DeviceRef) -> Result<()>;

    /// Devices visible to a container, in stable order.
    fn visible(&self, scope: &Scope) -> Vec<DeviceRef>;

    /// Detaches every device from a container, returning passthrough devices
    /// to the host once no container in the sandbox uses them.
    fn release_container(&self, sandbox: &SandboxId, container: &ContainerId);

    /// Detaches every device from a sandbox and its containers.
    fn release_sandbox(&self, sandbox: &SandboxId);
}

#[derive(Debug, Default)]
struct DeviceTable {
    owners: HashMap<DeviceRef, SandboxId>,
    attachments: HashMap<Scope, BTreeSet<DeviceRef>>,
}

impl DeviceTable {
    fn in_use_by_sandbox(&self, sandbox: &SandboxId, device: &DeviceRef) -> bool {
        self.attachments
            .iter()
            .any(|(scope, devices)| scope.sandbox == *sandbox && devices.contains(device))
    }
}

/// In-memory device table for one host.
#[derive(Debug, Default)]
pub struct HostDeviceTable {
    table: Mutex<DeviceTable>,
}

impl HostDeviceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sandbox currently owning a passthrough device, if any.
    #[must_use]
    pub fn owner(&self, device: &DeviceRef) -> Option<SandboxId> {
        self.table
            .lock()
            .ok()
            .and_then(|table| table.owners.get(device).cloned())
    }
}

impl DeviceAssigner for HostDeviceTable {
    fn assign(&self, scope: &Scope, isolation: IsolationKind, device: &DeviceRef) -> Result<()> {
        if device.kind.requires_hypervisor() && isolation != IsolationKind::Hypervisor {
            return Err(PodhostError::invalid(format!(
                "device {device} requires hypervisor isolation, sandbox {} uses {isolation}",
                scope.sandbox
            )));
        }
        let mut table = self
            .table
            .lock()
            .map_err(|_| PodhostError::internal("device table lock poisoned"))?;
        if device.kind.is_exclusive() {
            match table.owners.get(device) {
                Some(owner) if *owner != scope.sandbox => {
                    return Err(PodhostError::precondition(format!(
                        "device {device} is assigned to sandbox {owner}"
                    )));
                }
                Some(_) => {}
                None => {
                    let _ = table.owners.insert(device.clone(), scope.sandbox.clone());
                }
            }
        }
        let _ = table
            .attachments
            .entry(scope.clone())
            .or_default()
            .insert(device.clone());
        drop(table);
        tracing::info!(%scope, %device, "device assigned");
        Ok(())
    }

    fn visible(&self, scope: &Scope) -> Vec<DeviceRef> {
        self.table
            .lock()
            .ok()
            .and_then(|table| table.attachments.get(scope).cloned())
            .map(|devices| devices.into_iter().collect())
            .unwrap_or_default()
    }

    fn release_container(&self, sandbox: &SandboxId, container: &ContainerId) {
        let Ok(mut table) = self.table.lock() else {
            tracing::error!(%sandbox, %container, "device table lock poisoned");
            return;
        };
        let scope = Scope::container(sandbox.clone(), container.clone());
        let Some(released) = table.attachments.remove(&scope) else {
            return;
        };
        for device in released {
            if device.kind.is_exclusive() && !table.in_use_by_sandbox(sandbox, &device) {
                let _ = table.owners.remove(&device);
                tracing::info!(%sandbox, %device, "device returned to host");
            }
        }
    }

    fn release_sandbox(&self, sandbox: &SandboxId) {
        let Ok(mut table) = self.table.lock() else {
            tracing::error!(%sandbox, "device table lock poisoned");
            return;
        };
        table.attachments.retain(|scope, _| scope.sandbox != *sandbox);
        table.owners.retain(|_, owner| owner != sandbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu() -> DeviceRef {
        "gpu://PCIP\\VEN_10DE&DEV_1EB8".parse().expect("gpu ref")
    }

    fn scope(sandbox: &str, container: &str) -> Scope {
        Scope::container(SandboxId::new(sandbox), ContainerId::new(container))
    }

    #[test]
    fn device_is_visible_only_to_declaring_container() {
        let table = HostDeviceTable::new();
        table
            .assign(&scope("s1", "a"), IsolationKind::Hypervisor, &gpu())
            .expect("assign");
        assert_eq!(table.visible(&scope("s1", "a")), vec![gpu()]);
        assert!(table.visible(&scope("s1", "b")).is_empty());
    }

    #[test]
    fn passthrough_device_is_exclusive_to_one_sandbox() {
        let table = HostDeviceTable::new();
        table
            .assign(&scope("s1", "a"), IsolationKind::Hypervisor, &gpu())
            .expect("first");
        table
            .assign(&scope("s1", "b"), IsolationKind::Hypervisor, &gpu())
            .expect("same sandbox shares");
        let err = table
            .assign(&scope("s2", "a"), IsolationKind::Hypervisor, &gpu())
            .expect_err("other sandbox");
        assert!(matches!(err, PodhostError::FailedPrecondition { .. }));
    }

    #[test]
    fn passthrough_needs_hypervisor() {
        let table = HostDeviceTable::new();
        let err = table
            .assign(&scope("s1", "a"), IsolationKind::Process, &gpu())
            .expect_err("process isolation");
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));

        let class: DeviceRef = "class://5B45201D-F2F2-4F3B-85BB-30FF1F953599"
            .parse()
            .expect("class ref");
        table
            .assign(&scope("s1", "a"), IsolationKind::Process, &class)
            .expect("class device on process sandbox");
    }

    #[test]
    fn device_returns_to_host_after_last_container() {
        let table = HostDeviceTable::new();
        let s1 = SandboxId::new("s1");
        table
            .assign(&scope("s1", "a"), IsolationKind::Hypervisor, &gpu())
            .expect("a");
        table
            .assign(&scope("s1", "b"), IsolationKind::Hypervisor, &gpu())
            .expect("b");

        table.release_container(&s1, &ContainerId::new("a"));
        assert_eq!(table.owner(&gpu()), Some(s1.clone()));
        table.release_container(&s1, &ContainerId::new("b"));
        assert_eq!(table.owner(&gpu()), None);

        table
            .assign(&scope("s2", "a"), IsolationKind::Hypervisor, &gpu())
            .expect("free again");
        table.release_sandbox(&SandboxId::new("s2"));
        assert_eq!(table.owner(&gpu()), None);
    }
}
