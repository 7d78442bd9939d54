//! Lifecycle event streaming.
//!
//! Wraps the runtime's broadcast channel. A listener that falls behind
//! skips the events it missed rather than failing.

use std::time::Duration;

use podhost_common::error::{PodhostError, Result};
use podhost_runtime::Runtime;
use podhost_runtime::events::LifecycleEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Listens for lifecycle events of one runtime.
#[derive(Debug)]
pub struct EventListener {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl EventListener {
    /// Subscribes to `runtime`. Only events published after this call are
    /// seen.
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            receiver: runtime.subscribe(),
        }
    }

    /// Next event, or `None` once the runtime is gone.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event listener fell behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the first event matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` if `timeout` passes first, or `Internal`
    /// if the runtime goes away.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut predicate: impl FnMut(&LifecycleEvent) -> bool + Send,
    ) -> Result<LifecycleEvent> {
        let wait = async {
            while let Some(event) = self.next().await {
                if predicate(&event) {
                    return Ok(event);
                }
            }
            Err(PodhostError::internal("runtime event channel closed"))
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PodhostError::DeadlineExceeded {
                operation: "waiting for lifecycle event".to_string(),
                timeout,
            })?
    }
}
