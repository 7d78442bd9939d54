//! Cgroups v2 resource management.
//!
//! Provides a handle for one cgroup directory and subsystem-specific
//! writers and readers for CPU, memory, and I/O control files.

pub mod cpu;
pub mod io;
pub mod memory;

use std::path::{Path, PathBuf};

use podhost_common::error::{PodhostError, Result};
use walkdir::WalkDir;

/// Controllers delegated to child cgroups.
const SUBTREE_CONTROLLERS: &str = "+cpu +memory +io";

/// Handle to a single cgroup directory.
#[derive(Debug, Clone)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Creates the cgroup directory (and any missing parents).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).map_err(|e| PodhostError::Io {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Wraps an existing cgroup directory without touching the filesystem.
    #[must_use]
    pub const fn open(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cgroup directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Delegates CPU, memory, and I/O control to child cgroups.
    ///
    /// Hosts that do not offer a controller still get the others, so a
    /// failure here is logged rather than returned.
    pub fn enable_subtree_controllers(&self) {
        let file = self.path.join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&file, SUBTREE_CONTROLLERS) {
            tracing::warn!(
                path = %file.display(),
                error = %e,
                "could not delegate cgroup controllers"
            );
        }
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        write_control(&self.path, "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, path = %self.path.display(), "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup and every nested cgroup.
    ///
    /// Kernel cgroups are removed with `rmdir`, innermost first. Directories
    /// that `rmdir` cannot remove (a plain directory holding regular files)
    /// are removed recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        for entry in WalkDir::new(&self.path).contents_first(true) {
            let entry = entry.map_err(|e| PodhostError::internal(format!("walking cgroup: {e}")))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            if std::fs::remove_dir(dir).is_err() && dir.exists() {
                std::fs::remove_dir_all(dir).map_err(|e| PodhostError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
            }
        }
        tracing::debug!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

/// Writes a value to a control file inside a cgroup directory.
pub(crate) fn write_control(cgroup: &Path, name: &str, value: &str) -> Result<()> {
    let file = cgroup.join(name);
    std::fs::write(&file, value).map_err(|e| PodhostError::Io {
        path: file,
        source: e,
    })
}

/// Reads a control file, returning `None` if it does not exist.
pub(crate) fn read_control(cgroup: &Path, name: &str) -> Result<Option<String>> {
    let file = cgroup.join(name);
    match std::fs::read_to_string(&file) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PodhostError::Io {
            path: file,
            source: e,
        }),
    }
}

/// Parses a control-file number, where `max` means unlimited.
pub(crate) fn parse_limit(file: &str, value: &str) -> Result<Option<u64>> {
    if value == "max" {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| PodhostError::internal(format!("unexpected value {value:?} in {file}")))
}
