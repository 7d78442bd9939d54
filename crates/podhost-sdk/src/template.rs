//! Template helpers.

use std::time::Duration;

use podhost_common::error::{PodhostError, Result};
use podhost_common::types::{SandboxId, TemplateStatus};
use podhost_runtime::diag::Diagnostics;
use tokio::time::Instant;

/// Polls diagnostics every `interval` until `sandbox` is saved as a
/// template.
///
/// # Errors
///
/// - `DeadlineExceeded` if `timeout` passes before the save completes.
/// - `FailedPrecondition` if the sandbox is not a template or its save
///   failed.
/// - `NotFound` if the sandbox goes away.
pub async fn wait_for_template_save(
    diagnostics: &Diagnostics,
    sandbox: &SandboxId,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match diagnostics.template_status(sandbox)? {
            TemplateStatus::SavedAsTemplate => {
                tracing::debug!(sandbox_id = %sandbox, "template ready");
                return Ok(());
            }
            TemplateStatus::None => {
                return Err(PodhostError::precondition(format!(
                    "sandbox {sandbox} is not a template"
                )));
            }
            TemplateStatus::Failed { reason } => {
                return Err(PodhostError::precondition(format!(
                    "template {sandbox} will never be saved: {reason}"
                )));
            }
            TemplateStatus::Pending | TemplateStatus::Saving => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PodhostError::DeadlineExceeded {
                operation: format!("waiting for template {sandbox} to save"),
                timeout,
            });
        }
        // The last sleep is cut short so the status is checked once more at
        // the deadline.
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
