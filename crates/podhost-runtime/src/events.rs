//! Lifecycle event bus.

use podhost_common::constants::EVENT_CHANNEL_CAPACITY;
use podhost_common::types::{ContainerId, ContainerState, SandboxId, SandboxState};
use tokio::sync::broadcast;

/// A lifecycle transition observed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A sandbox changed state.
    SandboxStateChanged {
        /// Sandbox that changed.
        sandbox_id: SandboxId,
        /// New state.
        state: SandboxState,
    },
    /// A sandbox was removed.
    SandboxRemoved {
        /// Sandbox that was removed.
        sandbox_id: SandboxId,
    },
    /// A container changed state.
    ContainerStateChanged {
        /// Owning sandbox.
        sandbox_id: SandboxId,
        /// Container that changed.
        container_id: ContainerId,
        /// New state.
        state: ContainerState,
    },
    /// A template sandbox finished saving.
    TemplateSaved {
        /// Template sandbox.
        sandbox_id: SandboxId,
    },
    /// A template sandbox could not be saved.
    TemplateSaveFailed {
        /// Template sandbox.
        sandbox_id: SandboxId,
        /// Why the save failed.
        reason: String,
    },
}

/// Fan-out channel for [`LifecycleEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event; events with no subscriber are dropped.
    pub fn publish(&self, event: LifecycleEvent) {
        tracing::trace!(?event, "lifecycle event");
        let _ = self.tx.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
