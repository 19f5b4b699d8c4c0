//! Bounded parallel shutdown of managed services.
//!
//! Each service's `stop()` runs in its own task so one slow or failing service
//! cannot hold up the others. The caller gets an error only if some service
//! is still running once the bounded wait (and, if requested, forced
//! termination) is over.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::service::error::ShutdownError;
use crate::service::registry::ManagedService;

/// How long aborted stop tasks get to unwind after forced termination.
pub const FORCED_TERMINATION_GRACE: Duration = Duration::from_millis(500);

/// Stops `services` in parallel, waiting at most `timeout`.
///
/// A failing `stop()` is logged and does not affect the others. If some
/// services are still stopping when `timeout` expires and `terminate` is set,
/// their stop tasks are aborted and given [`FORCED_TERMINATION_GRACE`] to
/// unwind.
///
/// # Errors
///
/// - [`ShutdownError::NoServices`] if `services` is empty.
/// - [`ShutdownError::InvalidTimeout`] if `timeout` is zero.
/// - [`ShutdownError::NotTerminated`] if stop tasks are still running at the
///   end. Without `terminate` they are left to finish in the background.
pub async fn stop_all<S>(
    services: &[Arc<S>],
    timeout: Duration,
    terminate: bool,
) -> Result<(), ShutdownError>
where
    S: ManagedService + ?Sized,
{
    if services.is_empty() {
        return Err(ShutdownError::NoServices);
    }
    if timeout.is_zero() {
        return Err(ShutdownError::InvalidTimeout);
    }

    let mut tasks = JoinSet::new();
    for service in services {
        let service = Arc::clone(service);
        tasks.spawn(async move {
            if let Err(e) = service.stop().await {
                warn!(service = service.name(), error = %e, "service failed to stop");
            }
        });
    }

    if drain(&mut tasks, timeout).await {
        return Ok(());
    }

    if terminate {
        warn!(
            remaining = tasks.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "services did not stop in time, terminating"
        );
        tasks.abort_all();
        if drain(&mut tasks, FORCED_TERMINATION_GRACE).await {
            info!("remaining services terminated");
            return Ok(());
        }
    }

    let remaining = tasks.len();
    tasks.detach_all();
    Err(ShutdownError::NotTerminated { remaining, timeout })
}

/// Joins tasks until the set is empty or `timeout` elapses.
/// Returns `true` if every task finished.
async fn drain(tasks: &mut JoinSet<()>, timeout: Duration) -> bool {
    let joined = tokio::time::timeout(timeout, async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_panic() => warn!("service panicked while stopping"),
                Err(_) => {} // Cancelled by forced termination.
            }
        }
    })
    .await;
    joined.is_ok()
}
