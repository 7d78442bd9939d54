//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.max` and `cpu.weight`, and converts between processor
//! count/limit settings and bandwidth quotas.

use std::path::Path;

use podhost_common::constants::{CPU_PERIOD_US, CPU_SCALE_MAX};
use podhost_common::error::{PodhostError, Result};

use super::{parse_limit, read_control, write_control};

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u32) -> Result<()> {
    write_control(cgroup_path, "cpu.weight", &weight.to_string())?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}

/// Reads the CPU weight of a cgroup.
///
/// # Errors
///
/// Returns an error if `cpu.weight` exists but cannot be read or parsed.
pub fn read_cpu_weight(cgroup_path: &Path) -> Result<Option<u32>> {
    let Some(raw) = read_control(cgroup_path, "cpu.weight")? else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| PodhostError::internal(format!("unexpected value {raw:?} in cpu.weight")))
}

/// Sets the CPU bandwidth limit (max microseconds per period).
///
/// Writes `quota_us period_us` to `cpu.max`; a `None` quota removes the cap.
///
/// # Errors
///
/// Returns an error if writing to `cpu.max` fails.
pub fn set_cpu_max(cgroup_path: &Path, quota_us: Option<u64>) -> Result<()> {
    let value = quota_us.map_or_else(
        || format!("max {CPU_PERIOD_US}"),
        |quota| format!("{quota} {CPU_PERIOD_US}"),
    );
    write_control(cgroup_path, "cpu.max", &value)?;
    tracing::debug!(?quota_us, period_us = CPU_PERIOD_US, "CPU max quota set");
    Ok(())
}

/// Reads the CPU bandwidth quota of a cgroup, `None` when uncapped.
///
/// # Errors
///
/// Returns an error if `cpu.max` exists but cannot be read or parsed.
pub fn read_cpu_max(cgroup_path: &Path) -> Result<Option<u64>> {
    let Some(raw) = read_control(cgroup_path, "cpu.max")? else {
        return Ok(None);
    };
    let quota = raw.split_whitespace().next().unwrap_or("max");
    parse_limit("cpu.max", quota)
}

/// Quota granting `count` full processors per period.
#[must_use]
pub fn count_to_quota(count: u32) -> u64 {
    u64::from(count) * CPU_PERIOD_US
}

/// Processor count represented by a quota.
#[must_use]
pub fn quota_to_count(quota_us: u64) -> u32 {
    u32::try_from(quota_us / CPU_PERIOD_US).unwrap_or(u32::MAX)
}

/// Quota granting `limit` ten-thousandths of `host_cpus` processors.
#[must_use]
pub fn limit_to_quota(limit: u32, host_cpus: u32) -> u64 {
    u64::from(limit) * u64::from(host_cpus) * CPU_PERIOD_US / u64::from(CPU_SCALE_MAX)
}

/// Processor limit represented by a quota on a host with `host_cpus` processors.
#[must_use]
pub fn quota_to_limit(quota_us: u64, host_cpus: u32) -> u32 {
    let per_unit = u64::from(host_cpus) * CPU_PERIOD_US / u64::from(CPU_SCALE_MAX);
    if per_unit == 0 {
        return 0;
    }
    u32::try_from(quota_us / per_unit).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_limit_conversions_invert() {
        assert_eq!(count_to_quota(3), 300_000);
        assert_eq!(quota_to_count(count_to_quota(3)), 3);
        for limit in [1, 250, 5000, 10_000] {
            assert_eq!(quota_to_limit(limit_to_quota(limit, 8), 8), limit);
        }
    }

    #[test]
    fn cpu_max_roundtrip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_cpu_max(dir.path(), Some(150_000)).expect("set");
        assert_eq!(read_cpu_max(dir.path()).expect("read"), Some(150_000));
        set_cpu_max(dir.path(), None).expect("clear");
        assert_eq!(read_cpu_max(dir.path()).expect("read"), None);
    }

    #[test]
    fn cpu_weight_roundtrip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_cpu_weight(dir.path(), 640).expect("set");
        assert_eq!(read_cpu_weight(dir.path()).expect("read"), Some(640));
    }
}
