//! Readiness waiter: poll pod status until RUNNING, a terminal failure, or timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::runpod_ctl::ControlPlane;
use crate::runpod_error::{PodError, Result};
use crate::runpod_types::{PodDetail, PodId, PodStatus};

/// Polls the control plane at a fixed interval.
pub struct ReadinessWaiter {
    control: Arc<dyn ControlPlane>,
    poll_interval: Duration,
}

impl ReadinessWaiter {
    /// Create a waiter polling every `poll_interval`.
    #[must_use]
    pub fn new(control: Arc<dyn ControlPlane>, poll_interval: Duration) -> Self {
        Self {
            control,
            poll_interval,
        }
    }

    /// Wait until `pod_id` is RUNNING.
    ///
    /// Transient control plane errors count as an UNKNOWN observation and
    /// polling continues.
    ///
    /// # Errors
    ///
    /// - `TerminalFailure` as soon as EXITED, TERMINATED, FAILED or OUT_OF_CREDIT is seen
    /// - `NotFound` when the pod no longer exists
    /// - `ReadyTimeout` when `timeout` elapses first
    pub async fn wait_ready(&self, pod_id: &PodId, timeout: Duration) -> Result<PodDetail> {
        let deadline = Instant::now() + timeout;
        info!(pod_id = %pod_id, timeout_s = timeout.as_secs(), "waiting for pod to be ready");

        loop {
            let status = match self.control.pod_status(pod_id).await {
                Ok(detail) if detail.status == PodStatus::Running => {
                    info!(pod_id = %pod_id, "pod is running");
                    return Ok(detail);
                }
                Ok(detail) if detail.status == PodStatus::NotFound => {
                    return Err(PodError::NotFound(pod_id.clone()));
                }
                Ok(detail) if detail.status.is_terminal_failure() => {
                    warn!(pod_id = %pod_id, status = %detail.status, "pod reached a terminal status");
                    return Err(PodError::TerminalFailure {
                        pod_id: pod_id.clone(),
                        status: detail.status,
                    });
                }
                Ok(detail) => detail.status,
                Err(e) if e.is_transient() => {
                    debug!(pod_id = %pod_id, error = %e, "status check failed");
                    PodStatus::Unknown
                }
                Err(e) => return Err(e),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(PodError::ReadyTimeout {
                    pod_id: pod_id.clone(),
                    timeout,
                });
            }
            debug!(pod_id = %pod_id, status = %status, "pod not ready yet");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
