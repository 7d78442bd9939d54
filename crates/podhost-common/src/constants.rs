//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for podhost data on a host with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/podhost";

/// Returns the data directory, preferring `$HOME/.podhost` and falling back
/// to `/var/lib/podhost`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".podhost");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this process.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Name of the cgroup subtree owned by podhost.
pub const CGROUP_SUBTREE: &str = "podhost";

/// Scheduling period written to `cpu.max`, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

/// Upper bound of the processor limit and weight scales.
pub const CPU_SCALE_MAX: u32 = 10_000;

/// Suffix that turns a template sandbox ID into a VM-level template reference.
pub const TEMPLATE_VM_SUFFIX: &str = "@vm";

/// Version of the persisted template configuration layout.
pub const TEMPLATE_SERIAL_VERSION: u32 = 1;

/// File name of a persisted template configuration.
pub const TEMPLATE_CONFIG_FILE: &str = "config.json";

/// Default interval between template-save polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Environment variable listing the devices visible to a container.
pub const VISIBLE_DEVICES_ENV: &str = "PODHOST_VISIBLE_DEVICES";

/// Environment variable carrying the sandbox ID into workloads.
pub const SANDBOX_ID_ENV: &str = "PODHOST_SANDBOX_ID";

/// Environment variable carrying the container ID into workloads.
pub const CONTAINER_ID_ENV: &str = "PODHOST_CONTAINER_ID";

/// Environment variable pointing a workload at its root filesystem.
pub const ROOTFS_ENV: &str = "PODHOST_ROOTFS";

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
