//! Keeps the host up for the lifetime of the daemon.
//!
//! Whenever the host lands in `Offline` (a failed first start, a failed
//! restart, a canceled build) a new start is attempted, backing off
//! exponentially between failures. A host the operator stopped is left
//! alone, and nothing is started once shutdown begins.

use std::time::Duration;

use tracing::{debug, info, warn};

use fnhost_lifecycle::{HostState, LifecycleController, LifecycleError};

const MIN_START_BACKOFF: Duration = Duration::from_secs(1);
const MAX_START_BACKOFF: Duration = Duration::from_secs(60);

pub async fn keep_host_running(controller: LifecycleController) {
    let shutdown = controller.shutdown_token();
    let mut state = controller.subscribe_state();
    let mut backoff = MIN_START_BACKOFF;

    loop {
        let current = *state.borrow_and_update();
        match current {
            HostState::Offline => match controller.start_host().await {
                Ok(()) => {
                    info!("host is up");
                    backoff = MIN_START_BACKOFF;
                }
                Err(LifecycleError::ShuttingDown) => return,
                Err(e) => {
                    warn!(error = %e, retry_in_secs = backoff.as_secs(), "host is offline, retrying start");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_START_BACKOFF);
                    continue;
                }
            },
            HostState::Running => backoff = MIN_START_BACKOFF,
            _ => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("host supervisor stopping");
                return;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
