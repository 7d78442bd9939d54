//! File-share validation and policy.
//!
//! Containers see host paths through links placed in their root
//! directory. Sandboxes may forbid writable shares outright.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use podhost_common::error::{PodhostError, Result};
use podhost_common::types::Mount;

/// Checks that every mount uses absolute paths and that no container path
/// is used twice.
///
/// # Errors
///
/// Returns `InvalidArgument` describing the first offending mount.
pub fn validate_mounts(mounts: &[Mount]) -> Result<()> {
    let mut seen = HashSet::new();
    for mount in mounts {
        if !mount.host_path.is_absolute() {
            return Err(PodhostError::invalid(format!(
                "mount host path {} must be absolute",
                mount.host_path.display()
            )));
        }
        if !mount.container_path.is_absolute() {
            return Err(PodhostError::invalid(format!(
                "mount container path {} must be absolute",
                mount.container_path.display()
            )));
        }
        if mount
            .container_path
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(PodhostError::invalid(format!(
                "mount container path {} must not contain '..'",
                mount.container_path.display()
            )));
        }
        if !seen.insert(&mount.container_path) {
            return Err(PodhostError::invalid(format!(
                "container path {} is mounted more than once",
                mount.container_path.display()
            )));
        }
    }
    Ok(())
}

/// Rejects writable shares when the sandbox forbids them.
///
/// # Errors
///
/// Returns `PermissionDenied` if a writable mount is present and
/// `writable_disabled` is set.
pub fn check_writable_shares(mounts: &[Mount], writable_disabled: bool) -> Result<()> {
    if !writable_disabled {
        return Ok(());
    }
    if let Some(mount) = mounts.iter().find(|m| !m.readonly) {
        tracing::warn!(host_path = %mount.host_path.display(), "writable share rejected by policy");
        return Err(PodhostError::denied(format!(
            "adding writable shares is denied: {}",
            mount.host_path.display()
        )));
    }
    Ok(())
}

/// Location of a mount's link inside a container root.
#[must_use]
pub fn target_in_rootfs(rootfs: &Path, container_path: &Path) -> PathBuf {
    let relative: PathBuf = container_path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    rootfs.join(relative)
}

/// Exposes each mount's host path inside `rootfs`.
///
/// # Errors
///
/// Returns `InvalidArgument` if a host path does not exist, or an I/O error
/// if a link cannot be created.
pub fn link_mounts(rootfs: &Path, mounts: &[Mount]) -> Result<()> {
    for mount in mounts {
        if !mount.host_path.exists() {
            return Err(PodhostError::invalid(format!(
                "mount source {} does not exist",
                mount.host_path.display()
            )));
        }
        let target = target_in_rootfs(rootfs, &mount.container_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PodhostError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        if target.symlink_metadata().is_ok() {
            continue;
        }
        std::os::unix::fs::symlink(&mount.host_path, &target).map_err(|e| PodhostError::Io {
            path: target.clone(),
            source: e,
        })?;
        tracing::debug!(
            source = %mount.host_path.display(),
            target = %target.display(),
            readonly = mount.readonly,
            "share linked"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_share_is_denied_when_disabled() {
        let mounts = vec![
            Mount::readonly("/srv/a", "/a"),
            Mount::writable("/srv/b", "/b"),
        ];
        check_writable_shares(&mounts, false).expect("allowed");
        let err = check_writable_shares(&mounts, true).expect_err("denied");
        assert!(err.to_string().contains("adding writable shares is denied"));
        check_writable_shares(&mounts[..1], true).expect("read-only allowed");
    }

    #[test]
    fn validate_rejects_relative_and_duplicate_paths() {
        assert!(validate_mounts(&[Mount::readonly("srv", "/a")]).is_err());
        assert!(validate_mounts(&[Mount::readonly("/srv", "a")]).is_err());
        assert!(validate_mounts(&[Mount::readonly("/srv", "/a/../b")]).is_err());
        assert!(
            validate_mounts(&[Mount::readonly("/x", "/a"), Mount::readonly("/y", "/a")]).is_err()
        );
        validate_mounts(&[Mount::readonly("/x", "/a"), Mount::readonly("/y", "/b")])
            .expect("valid");
    }

    #[test]
    fn link_mounts_exposes_host_path() {
        let host = tempfile::tempdir().expect("host");
        std::fs::write(host.path().join("data.txt"), "hello").expect("write");
        let rootfs = tempfile::tempdir().expect("rootfs");

        let mounts = vec![Mount::readonly(host.path(), "/mnt/share")];
        link_mounts(rootfs.path(), &mounts).expect("link");
        link_mounts(rootfs.path(), &mounts).expect("relink is a no-op");

        let linked = rootfs.path().join("mnt/share/data.txt");
        assert_eq!(std::fs::read_to_string(linked).expect("read"), "hello");
    }

    #[test]
    fn link_mounts_requires_existing_source() {
        let rootfs = tempfile::tempdir().expect("rootfs");
        let err = link_mounts(
            rootfs.path(),
            &[Mount::readonly("/definitely/not/here", "/x")],
        )
        .expect_err("missing");
        assert!(matches!(err, PodhostError::InvalidArgument { .. }));
    }
}
