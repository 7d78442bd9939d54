//! I/O resource control via cgroups v2.
//!
//! Manages `io.max` for block device throttling.

use std::fmt;
use std::path::Path;

use podhost_common::error::{PodhostError, Result};

use super::{parse_limit, read_control, write_control};

/// A block device in `major:minor` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDevice {
    /// Major device number.
    pub major: u64,
    /// Minor device number.
    pub minor: u64,
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Throughput caps read back from `io.max`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoMax {
    /// Bytes per second cap.
    pub bps: Option<u64>,
    /// Operations per second cap.
    pub iops: Option<u64>,
}

/// Returns the block device backing `path`.
///
/// # Errors
///
/// Returns an error if `path` cannot be stat'ed.
#[cfg(target_os = "linux")]
pub fn block_device_of(path: &Path) -> Result<BlockDevice> {
    use nix::sys::stat::{major, minor, stat};

    let st = stat(path).map_err(|e| PodhostError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    })?;
    Ok(BlockDevice {
        major: major(st.st_dev),
        minor: minor(st.st_dev),
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: block device lookup requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn block_device_of(_path: &Path) -> Result<BlockDevice> {
    Err(PodhostError::unsupported("block device lookup requires Linux"))
}

/// Caps read and write throughput of a cgroup on one device.
///
/// # Errors
///
/// Returns an error if writing to `io.max` fails.
pub fn set_io_max(
    cgroup_path: &Path,
    device: BlockDevice,
    bps: Option<u64>,
    iops: Option<u64>,
) -> Result<()> {
    let fmt_cap = |v: Option<u64>| v.map_or_else(|| "max".to_string(), |v| v.to_string());
    let line = format!(
        "{device} rbps={b} wbps={b} riops={i} wiops={i}",
        b = fmt_cap(bps),
        i = fmt_cap(iops),
    );
    write_control(cgroup_path, "io.max", &line)?;
    tracing::debug!(%device, ?bps, ?iops, "I/O max set");
    Ok(())
}

/// Reads the caps a cgroup has on one device.
///
/// The read cap is reported; podhost always writes equal read and write caps.
///
/// # Errors
///
/// Returns an error if `io.max` exists but cannot be read or parsed.
pub fn read_io_max(cgroup_path: &Path, device: BlockDevice) -> Result<IoMax> {
    let Some(raw) = read_control(cgroup_path, "io.max")? else {
        return Ok(IoMax::default());
    };
    let prefix = device.to_string();
    let Some(line) = raw
        .lines()
        .find(|line| line.split_whitespace().next() == Some(prefix.as_str()))
    else {
        return Ok(IoMax::default());
    };
    let mut caps = IoMax::default();
    for token in line.split_whitespace().skip(1) {
        match token.split_once('=') {
            Some(("rbps", value)) => caps.bps = parse_limit("io.max", value)?,
            Some(("riops", value)) => caps.iops = parse_limit("io.max", value)?,
            _ => {}
        }
    }
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: BlockDevice = BlockDevice { major: 8, minor: 0 };

    #[test]
    fn io_max_roundtrip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        set_io_max(dir.path(), DEV, Some(1_048_576), None).expect("set");
        let caps = read_io_max(dir.path(), DEV).expect("read");
        assert_eq!(caps.bps, Some(1_048_576));
        assert_eq!(caps.iops, None);
    }

    #[test]
    fn read_io_max_ignores_other_devices() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("io.max"),
            "259:0 rbps=10 wbps=10 riops=max wiops=max\n",
        )
        .expect("write");
        assert_eq!(read_io_max(dir.path(), DEV).expect("read"), IoMax::default());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn block_device_of_tempdir_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(block_device_of(dir.path()).is_ok());
    }
}
