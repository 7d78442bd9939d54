//! Container log management.

use std::fs::File;
use std::path::{Path, PathBuf};

use podhost_common::error::{PodhostError, Result};

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(data_dir: &Path, sandbox_id: &str, container_id: &str) -> PathBuf {
    data_dir
        .join("logs")
        .join(sandbox_id)
        .join(format!("{container_id}.log"))
}

/// Opens a log file for appending, creating it and its directory.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PodhostError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PodhostError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Reads a log file.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(path).map_err(|e| PodhostError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Deletes the logs of every container in a sandbox.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_sandbox_logs(data_dir: &Path, sandbox_id: &str) -> Result<()> {
    let dir = data_dir.join("logs").join(sandbox_id);
    if !dir.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(&dir).map_err(|e| PodhostError::Io {
        path: dir,
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn log_path_is_constructed_correctly() {
        let p = log_path(Path::new("/var/lib/podhost"), "s1", "abc-123");
        assert_eq!(p.to_str().unwrap(), "/var/lib/podhost/logs/s1/abc-123.log");
    }

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(&dir.path().join("nonexistent.log")).expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn open_log_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = log_path(dir.path(), "s1", "c1");
        writeln!(open_log(&path).expect("open 1"), "line one").expect("write 1");
        writeln!(open_log(&path).expect("open 2"), "line two").expect("write 2");

        let content = read_logs(&path).expect("read");
        assert!(content.contains("line one"));
        assert!(content.contains("line two"));
    }

    #[test]
    fn separate_containers_have_separate_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = log_path(dir.path(), "s1", "a");
        let b = log_path(dir.path(), "s1", "b");
        writeln!(open_log(&a).expect("open a"), "from a").expect("write a");
        writeln!(open_log(&b).expect("open b"), "from b").expect("write b");

        let a_logs = read_logs(&a).expect("read a");
        assert!(a_logs.contains("from a"));
        assert!(!a_logs.contains("from b"));
    }

    #[test]
    fn remove_sandbox_logs_clears_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = log_path(dir.path(), "s1", "c1");
        drop(open_log(&path).expect("open"));
        remove_sandbox_logs(dir.path(), "s1").expect("remove");
        assert!(!path.exists());
        remove_sandbox_logs(dir.path(), "s1").expect("idempotent");
    }
}
