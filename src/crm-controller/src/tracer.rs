//! Per-resource tracer: a task that watches one deploy-in-flight to
//! completion and bridges the result back into the state machine via
//! `fresh_deploying_status` — a dedicated loop, polling on an interval,
//! stopping on a terminal condition or external cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crm_ore::retry::Retry;

use crate::error::CrmError;
use crate::state_machine::ResourceManager;

const CHECKER_TIME_GAP: Duration = Duration::from_secs(1);
const ERROR_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Spawns a tracer for `resource_id`, cancelled early if `cancel` fires
/// (leader demotion).
pub fn spawn_tracer(manager: Arc<ResourceManager>, resource_id: String, cancel: CancellationToken) {
    crm_ore::task::spawn(
        || format!("tracer-{resource_id}"),
        async move {
            let mut ticker = tokio::time::interval(CHECKER_TIME_GAP);
            // Backs off an unreachable/flaky operator between polls instead
            // of hammering it every CHECKER_TIME_GAP.
            let mut backoff = Retry::default()
                .initial_backoff(CHECKER_TIME_GAP)
                .clamp_backoff(ERROR_BACKOFF_CAP)
                .into_retry_stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match manager.get_service_info(&resource_id).await {
                    Ok(done) if done => return,
                    Ok(false) => continue,
                    Err(CrmError::ResourceNoExist(_)) => {
                        // Release won the race; this is a terminal success,
                        // not an error.
                        return;
                    }
                    Err(CrmError::ManagerNotRunning) => return,
                    Err(e) => {
                        tracing::warn!(resource_id = %resource_id, error = %e, "tracer poll failed, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = backoff.next() => {}
                        }
                    }
                }
            }
        },
    );
}
