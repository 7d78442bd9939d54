//! Ownership scope for host resources.

use std::fmt;
use std::path::PathBuf;

use podhost_common::types::{ContainerId, SandboxId};

/// Identifies the sandbox, or the container within a sandbox, that owns a
/// limit or a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    /// Owning sandbox.
    pub sandbox: SandboxId,
    /// Owning container, or `None` for the sandbox itself.
    pub container: Option<ContainerId>,
}

impl Scope {
    /// Scope covering a whole sandbox.
    #[must_use]
    pub const fn sandbox(sandbox: SandboxId) -> Self {
        Self {
            sandbox,
            container: None,
        }
    }

    /// Scope covering one container inside a sandbox.
    #[must_use]
    pub const fn container(sandbox: SandboxId, container: ContainerId) -> Self {
        Self {
            sandbox,
            container: Some(container),
        }
    }

    /// Whether `other` is this scope or nested inside it.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.sandbox == other.sandbox
            && (self.container.is_none() || self.container == other.container)
    }

    /// Path of this scope relative to a hierarchy root.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(self.sandbox.as_str());
        if let Some(container) = &self.container {
            path.push(container.as_str());
        }
        path
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(f, "{}/{}", self.sandbox, container),
            None => write!(f, "{}", self.sandbox),
        }
    }
}
