//! Recognized annotation keys.
//!
//! Sandbox and container configs carry a free-form annotation map. Only the
//! keys listed here have an effect; every other key is ignored.

/// Sandbox memory in megabytes.
pub const VM_MEMORY_SIZE_MB: &str = "io.podhost.vm.memory.sizeinmb";
/// Whether VM memory may be backed by host virtual memory.
pub const VM_MEMORY_ALLOW_OVERCOMMIT: &str = "io.podhost.vm.memory.allowovercommit";
/// Whether VM memory is committed lazily.
pub const VM_MEMORY_ENABLE_DEFERRED_COMMIT: &str = "io.podhost.vm.memory.enabledeferredcommit";
/// Forces overcommit and deferred commit off.
pub const VM_FULLY_PHYSICALLY_BACKED: &str = "io.podhost.vm.fullyphysicallybacked";
/// Size of the low MMIO gap in megabytes.
pub const VM_LOW_MMIO_GAP_MB: &str = "io.podhost.vm.memory.lowmmiogapinmb";
/// Base address of the high MMIO region in megabytes.
pub const VM_HIGH_MMIO_BASE_MB: &str = "io.podhost.vm.memory.highmmiobaseinmb";
/// Size of the high MMIO gap in megabytes.
pub const VM_HIGH_MMIO_GAP_MB: &str = "io.podhost.vm.memory.highmmiogapinmb";
/// Sandbox processor count.
pub const VM_PROCESSOR_COUNT: &str = "io.podhost.vm.processor.count";
/// Sandbox processor limit, `1..=10000`.
pub const VM_PROCESSOR_LIMIT: &str = "io.podhost.vm.processor.limit";
/// Sandbox processor weight, `0..=10000`.
pub const VM_PROCESSOR_WEIGHT: &str = "io.podhost.vm.processor.weight";
/// Sandbox storage bandwidth cap in bytes per second.
pub const VM_STORAGE_QOS_BANDWIDTH_MAX: &str = "io.podhost.vm.storageqos.bandwidthmaximum";
/// Sandbox storage IOPS cap.
pub const VM_STORAGE_QOS_IOPS_MAX: &str = "io.podhost.vm.storageqos.iopsmaximum";
/// Denies writable file shares for every container in the sandbox.
pub const VM_DISABLE_WRITABLE_FILE_SHARES: &str = "io.podhost.vm.fileshares.disablewritable";
/// Marks a sandbox or container to be saved as a template.
pub const SAVE_AS_TEMPLATE: &str = "io.podhost.vm.saveastemplate";
/// References the template to clone from.
///
/// On a sandbox the value is `<template sandbox id>@vm`; on a container it
/// is the template container ID.
pub const TEMPLATE_ID: &str = "io.podhost.vm.templateid";

/// Container memory in megabytes.
pub const CONTAINER_MEMORY_SIZE_MB: &str = "io.podhost.container.memory.sizeinmb";
/// Container processor count.
pub const CONTAINER_PROCESSOR_COUNT: &str = "io.podhost.container.processor.count";
/// Container processor limit, `1..=10000`.
pub const CONTAINER_PROCESSOR_LIMIT: &str = "io.podhost.container.processor.limit";
/// Container processor weight, `0..=10000`.
pub const CONTAINER_PROCESSOR_WEIGHT: &str = "io.podhost.container.processor.weight";
/// Container storage bandwidth cap in bytes per second.
pub const CONTAINER_STORAGE_QOS_BANDWIDTH_MAX: &str =
    "io.podhost.container.storage.qos.bandwidthmaximum";
/// Container storage IOPS cap.
pub const CONTAINER_STORAGE_QOS_IOPS_MAX: &str = "io.podhost.container.storage.qos.iopsmaximum";
/// Denies credential specs.
pub const DISABLE_CREDENTIALS: &str = "io.podhost.container.credentials.disable";

/// Expands to [`VM_DISABLE_WRITABLE_FILE_SHARES`] and [`DISABLE_CREDENTIALS`].
pub const DISABLE_UNSAFE_OPERATIONS: &str = "io.podhost.disable-unsafe-operations";

/// Keys that only have meaning for a hypervisor-isolated sandbox.
pub const HYPERVISOR_ONLY: &[&str] = &[
    VM_MEMORY_ALLOW_OVERCOMMIT,
    VM_MEMORY_ENABLE_DEFERRED_COMMIT,
    VM_FULLY_PHYSICALLY_BACKED,
    VM_LOW_MMIO_GAP_MB,
    VM_HIGH_MMIO_BASE_MB,
    VM_HIGH_MMIO_GAP_MB,
];
