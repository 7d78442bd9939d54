//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max`.

use std::path::Path;

use podhost_common::error::Result;

use super::{parse_limit, read_control, write_control};

/// Bytes per megabyte.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Largest megabyte count whose byte size fits in `memory.max`.
pub const MAX_MEMORY_MB: u64 = u64::MAX / BYTES_PER_MB;

/// Sets the hard memory limit for a cgroup; `None` removes the limit.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: Option<u64>) -> Result<()> {
    let value = bytes.map_or_else(|| "max".to_string(), |b| b.to_string());
    write_control(cgroup_path, "memory.max", &value)?;
    tracing::debug!(?bytes, "memory max set");
    Ok(())
}

/// Reads the hard memory limit of a cgroup, `None` when unlimited.
///
/// # Errors
///
/// Returns an error if `memory.max` exists but cannot be read or parsed.
pub fn read_memory_max(cgroup_path: &Path) -> Result<Option<u64>> {
    match read_control(cgroup_path, "memory.max")? {
        Some(raw) => parse_limit("memory.max", &raw),
        None => Ok(None),
    }
}
