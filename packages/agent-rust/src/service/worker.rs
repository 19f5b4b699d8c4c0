//! Background worker that turns pending remote operations into completed ones.
//!
//! A single loop task polls the platform for the next pending operation,
//! converts it to a typed operation, dispatches it to the owning handler, and
//! writes the status transitions back. Operations are processed strictly one
//! at a time in the order the platform hands them out.
//!
//! State machine: NotStarted -> Started -> Stopped (-> Started again)

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use devagent_core::{Operation, OperationFactory, OperationStatus, TypedOperation};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::error::OperationServiceError;
use super::handler::{HandlerRegistry, OperationHandler};
use crate::traits::OperationsApi;

/// Lower bound on the wait between polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of an [`OperationWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Started,
    Stopped,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// A spawned task that can be cancelled and whose exit can be awaited by any
/// number of callers. The task holds the sender; dropping it on completion or
/// cancellation closes every receiver.
struct TaskExit {
    abort: AbortHandle,
    exited: watch::Receiver<()>,
}

impl TaskExit {
    fn spawn<F>(future: F) -> (Self, JoinHandle<F::Output>)
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = watch::channel(());
        let task = tokio::spawn(async move {
            let _exited = tx;
            future.await
        });
        let exit = Self {
            abort: task.abort_handle(),
            exited: rx,
        };
        (exit, task)
    }
}

/// Resolves once the task behind `exited` is gone.
async fn wait_exited(mut exited: watch::Receiver<()>) {
    while exited.changed().await.is_ok() {}
}

/// Everything the loop task needs; shared between the worker handle and the
/// loop through an `Arc`.
struct Dispatcher {
    operations: Arc<dyn OperationsApi>,
    handlers: Arc<HandlerRegistry>,
    supported: HashSet<String>,
    poll_interval: Duration,
    /// The handler task currently executing an operation.
    in_flight: Mutex<Option<TaskExit>>,
}

impl Dispatcher {
    async fn run(self: Arc<Self>, running: Arc<AtomicBool>, mut shutdown: watch::Receiver<bool>) {
        info!(
            handlers = self.handlers.len(),
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "operation worker started"
        );

        while running.load(Ordering::SeqCst) {
            match self.poll_once().await {
                // Drain the queue before sleeping again.
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    metrics::counter!("devagent_operation_poll_errors_total").increment(1);
                    warn!(error = %e, "operation poll cycle failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("operation worker stopped");
    }

    /// Fetches and processes at most one operation.
    /// Returns `true` if an operation was processed.
    async fn poll_once(&self) -> anyhow::Result<bool> {
        let Some(op) = self.operations.next_pending_operation().await? else {
            return Ok(false);
        };
        let span = info_span!("operation", operation_id = %op.id);
        self.process(op).instrument(span).await?;
        Ok(true)
    }

    async fn process(&self, mut op: Operation) -> anyhow::Result<()> {
        let Some(mut typed) = OperationFactory::convert(&op, &self.supported) else {
            let fragments: Vec<&str> = op.fragment_names().collect();
            warn!(?fragments, "no handler supports operation");
            metrics::counter!("devagent_operations_total", "outcome" => "unsupported").increment(1);
            op.fail("no handler supports this operation")?;
            return self.write_status(&op).await;
        };

        let Some(handler) = self.handlers.handler_for(typed.kind()).cloned() else {
            warn!(kind = typed.kind(), "no handler registered for kind");
            metrics::counter!("devagent_operations_total", "outcome" => "unsupported").increment(1);
            op.fail(format!("no handler registered for {}", typed.kind()))?;
            return self.write_status(&op).await;
        };

        op.transition_to(OperationStatus::Executing)?;
        typed.transition_to(OperationStatus::Executing)?;
        self.write_status(&op).await?;

        debug!(kind = typed.kind(), handler = handler.name(), "dispatching operation");
        let (status, reason) = execute(handler, typed, &self.in_flight).await;

        op.transition_to(status)?;
        op.failure_reason = reason;
        self.write_status(&op).await
    }

    async fn write_status(&self, op: &Operation) -> anyhow::Result<()> {
        self.operations
            .update_operation_status(&op.id, op.status, op.failure_reason.as_deref())
            .await
    }
}

/// Runs the handler in its own task so that a panic is contained, then maps
/// the outcome to a terminal status and failure reason. The task is parked in
/// `in_flight` while it runs so the worker can cancel it.
async fn execute(
    handler: Arc<dyn OperationHandler>,
    operation: TypedOperation,
    in_flight: &Mutex<Option<TaskExit>>,
) -> (OperationStatus, Option<String>) {
    let handler_name = handler.name().to_string();
    let (exit, task) = TaskExit::spawn(async move { handler.execute(operation).await });
    *in_flight.lock() = Some(exit);
    let result = task.await;
    in_flight.lock().take();

    let (status, reason, outcome) = match result {
        Ok(Ok(status)) if status.is_terminal() => (status, None, status_outcome(status)),
        Ok(Ok(status)) => {
            error!(handler = %handler_name, %status, "handler returned a non-terminal status");
            (
                OperationStatus::Failed,
                Some(format!("handler returned non-terminal status {status}")),
                "handler_error",
            )
        }
        Ok(Err(e)) => {
            warn!(handler = %handler_name, error = %e, "handler failed to execute operation");
            (OperationStatus::Failed, Some(e.to_string()), "handler_error")
        }
        Err(e) if e.is_panic() => {
            error!(handler = %handler_name, "handler panicked while executing operation");
            (
                OperationStatus::Failed,
                Some("handler panicked".to_string()),
                "handler_panic",
            )
        }
        Err(e) => {
            error!(handler = %handler_name, error = %e, "handler task was cancelled");
            (
                OperationStatus::Failed,
                Some("handler was cancelled".to_string()),
                "handler_error",
            )
        }
    };

    metrics::counter!("devagent_operations_total", "outcome" => outcome).increment(1);
    info!(handler = %handler_name, %status, "operation finished");
    (status, reason)
}

fn status_outcome(status: OperationStatus) -> &'static str {
    if status == OperationStatus::Successful {
        "successful"
    } else {
        "failed"
    }
}

// ---------------------------------------------------------------------------
// OperationWorker
// ---------------------------------------------------------------------------

/// Handle to the operation polling loop.
///
/// `start()` spawns the loop onto the current Tokio runtime; `stop()` signals
/// it and waits for it to exit, so an operation that is being executed when
/// `stop()` is called is completed and its final status written first.
pub struct OperationWorker {
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    state: ArcSwap<WorkerState>,
    shutdown_signal: watch::Sender<bool>,
    loop_task: Mutex<Option<TaskExit>>,
}

impl OperationWorker {
    /// Creates a stopped worker. Intervals below [`MIN_POLL_INTERVAL`] are
    /// raised to it.
    #[must_use]
    pub fn new(
        operations: Arc<dyn OperationsApi>,
        handlers: Arc<HandlerRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let (tx, _rx) = watch::channel(false);
        let supported = handlers.supported_kinds();
        Self {
            dispatcher: Arc::new(Dispatcher {
                operations,
                handlers,
                supported,
                poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
                in_flight: Mutex::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            state: ArcSwap::from_pointee(WorkerState::NotStarted),
            shutdown_signal: tx,
            loop_task: Mutex::new(None),
        }
    }

    /// Spawns the polling loop. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`OperationServiceError::WorkerAlreadyStarted`] if the loop is
    /// already running.
    pub fn start(&self) -> Result<(), OperationServiceError> {
        let mut loop_task = self.loop_task.lock();
        if self.state() == WorkerState::Started {
            return Err(OperationServiceError::WorkerAlreadyStarted);
        }

        self.running.store(true, Ordering::SeqCst);
        self.shutdown_signal.send_replace(false);
        let shutdown = self.shutdown_signal.subscribe();
        let dispatcher = Arc::clone(&self.dispatcher);
        let running = Arc::clone(&self.running);
        let (exit, _detached) = TaskExit::spawn(dispatcher.run(running, shutdown));
        *loop_task = Some(exit);
        self.state.store(Arc::new(WorkerState::Started));
        Ok(())
    }

    /// Signals the loop to exit and waits until it has.
    ///
    /// Every concurrent caller waits for the same exit. Safe to call when not
    /// started or already stopped.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_signal.send_replace(true);

        let exited = self.loop_task.lock().as_ref().map(|t| t.exited.clone());
        if let Some(exited) = exited {
            wait_exited(exited).await;
            self.state.store(Arc::new(WorkerState::Stopped));
        }
    }

    /// Cancels the loop and any handler call in progress, then waits for both
    /// tasks to be gone. The current operation keeps its EXECUTING status.
    ///
    /// A handler blocking its thread delays the return until it yields, so
    /// callers should bound this wait.
    pub async fn abort(&self) {
        self.running.store(false, Ordering::SeqCst);
        let loop_exited = self.loop_task.lock().as_ref().map(|t| {
            t.abort.abort();
            t.exited.clone()
        });
        if let Some(exited) = loop_exited {
            wait_exited(exited).await;
        }

        // The loop is gone, so `in_flight` can no longer change. A cancelled
        // loop never clears it.
        let handler = self.dispatcher.in_flight.lock().take();
        if let Some(handler) = handler {
            handler.abort.abort();
            wait_exited(handler.exited).await;
        }
        self.state.store(Arc::new(WorkerState::Stopped));
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == WorkerState::Started
    }

    /// The effective wait between polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.dispatcher.poll_interval
    }
}

impl Drop for OperationWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.loop_task.get_mut().take() {
            task.abort.abort();
        }
        if let Some(task) = self.dispatcher.in_flight.lock().take() {
            task.abort.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::InMemoryPlatform;
    use crate::testing::{wait_until, Behavior, RecordingHandler};

    const RESTART: &str = "c8y_Restart";
    const WAIT: Duration = Duration::from_secs(5);

    fn worker_with(
        platform: &Arc<InMemoryPlatform>,
        handlers: Vec<Arc<RecordingHandler>>,
    ) -> OperationWorker {
        let handlers = handlers
            .into_iter()
            .map(|h| h as Arc<dyn OperationHandler>)
            .collect();
        let registry = HandlerRegistry::verify(handlers).unwrap();
        OperationWorker::new(platform.clone(), Arc::new(registry), MIN_POLL_INTERVAL)
    }

    fn is_done(platform: &InMemoryPlatform, id: &str) -> bool {
        platform
            .operation(id)
            .is_some_and(|op| op.status.is_terminal())
    }

    #[tokio::test]
    async fn successful_execution_writes_executing_then_result() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler =
            Arc::new(RecordingHandler::new("restart", &[RESTART]).observing(platform.clone()));
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &id)).await);
        worker.stop().await;

        assert_eq!(
            platform.statuses_for(&id),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
        // The EXECUTING write landed before the handler was invoked.
        assert_eq!(*handler.observed.lock(), vec![Some(OperationStatus::Executing)]);
        assert_eq!(handler.executed(), vec![id]);
    }

    #[tokio::test]
    async fn unsupported_operation_fails_and_polling_continues() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(RecordingHandler::new("restart", &[RESTART]));
        let unsupported = platform.issue("acme_Blink", json!({}));
        let supported = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &supported)).await);
        worker.stop().await;

        assert_eq!(platform.statuses_for(&unsupported), vec![OperationStatus::Failed]);
        assert!(platform
            .operation(&unsupported)
            .unwrap()
            .failure_reason
            .is_some());
        assert_eq!(handler.executed(), vec![supported]);
    }

    #[tokio::test]
    async fn handler_error_marks_failed_and_loop_survives() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(
            RecordingHandler::new("restart", &[RESTART])
                .with_behavior(Behavior::Fail("disk full".to_string())),
        );
        let first = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &first)).await);

        handler.set_behavior(Behavior::Return(OperationStatus::Successful));
        let second = platform.issue(RESTART, json!({}));
        assert!(wait_until(WAIT, || is_done(&platform, &second)).await);
        worker.stop().await;

        assert_eq!(
            platform.statuses_for(&first),
            vec![OperationStatus::Executing, OperationStatus::Failed]
        );
        assert_eq!(
            platform.operation(&first).unwrap().failure_reason.as_deref(),
            Some("disk full")
        );
        assert_eq!(
            platform.statuses_for(&second),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
    }

    #[tokio::test]
    async fn handler_panic_marks_failed_and_loop_survives() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(
            RecordingHandler::new("restart", &[RESTART]).with_behavior(Behavior::Panic),
        );
        let first = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &first)).await);

        handler.set_behavior(Behavior::Return(OperationStatus::Successful));
        let second = platform.issue(RESTART, json!({}));
        assert!(wait_until(WAIT, || is_done(&platform, &second)).await);
        worker.stop().await;

        assert_eq!(
            platform.statuses_for(&first),
            vec![OperationStatus::Executing, OperationStatus::Failed]
        );
        assert_eq!(
            platform.statuses_for(&second),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
    }

    #[tokio::test]
    async fn non_terminal_result_is_reported_as_failed() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(
            RecordingHandler::new("restart", &[RESTART])
                .with_behavior(Behavior::Return(OperationStatus::Executing)),
        );
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &id)).await);
        worker.stop().await;

        assert_eq!(
            platform.statuses_for(&id),
            vec![OperationStatus::Executing, OperationStatus::Failed]
        );
    }

    #[tokio::test]
    async fn failed_operations_are_not_retried() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(
            RecordingHandler::new("restart", &[RESTART])
                .with_behavior(Behavior::Return(OperationStatus::Failed)),
        );
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &id)).await);
        // Let a few more poll cycles run.
        tokio::time::sleep(MIN_POLL_INTERVAL * 3).await;
        worker.stop().await;

        assert_eq!(handler.executed().len(), 1);
        assert_eq!(platform.statuses_for(&id).len(), 2);
    }

    #[tokio::test]
    async fn poll_failures_are_retried() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(RecordingHandler::new("restart", &[RESTART]));
        platform.fail_next_polls(2);
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &id)).await);
        worker.stop().await;

        assert_eq!(
            platform.statuses_for(&id),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
    }

    #[tokio::test]
    async fn failed_executing_write_skips_handler_until_next_poll() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(RecordingHandler::new("restart", &[RESTART]));
        platform.fail_next_status_writes(1);
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &id)).await);
        worker.stop().await;

        assert_eq!(handler.executed().len(), 1);
        assert_eq!(
            platform.statuses_for(&id),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_operation() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(RecordingHandler::new("restart", &[RESTART]).with_behavior(
            Behavior::Delay(Duration::from_millis(200), OperationStatus::Successful),
        ));
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || !handler.executed().is_empty()).await);
        worker.stop().await;

        assert_eq!(
            platform.statuses_for(&id),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let platform = Arc::new(InMemoryPlatform::new());
        let worker = worker_with(&platform, Vec::new());

        worker.start().unwrap();
        assert!(matches!(
            worker.start(),
            Err(OperationServiceError::WorkerAlreadyStarted)
        ));
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restart_is_allowed() {
        let platform = Arc::new(InMemoryPlatform::new());
        let worker = worker_with(&platform, Vec::new());
        assert_eq!(worker.state(), WorkerState::NotStarted);

        // Stop before start is a no-op.
        worker.stop().await;
        assert!(!worker.is_started());

        worker.start().unwrap();
        assert!(worker.is_started());
        worker.stop().await;
        worker.stop().await;
        assert!(!worker.is_started());

        worker.start().unwrap();
        assert!(worker.is_started());
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn zero_interval_is_raised_to_floor() {
        let platform = Arc::new(InMemoryPlatform::new());
        let worker = OperationWorker::new(
            platform,
            Arc::new(HandlerRegistry::empty()),
            Duration::ZERO,
        );
        assert_eq!(worker.poll_interval(), MIN_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_polls_at_floor_rate() {
        let platform = Arc::new(InMemoryPlatform::new());
        let worker = OperationWorker::new(
            platform.clone(),
            Arc::new(HandlerRegistry::empty()),
            Duration::ZERO,
        );

        worker.start().unwrap();
        tokio::time::sleep(MIN_POLL_INTERVAL * 10 + MIN_POLL_INTERVAL / 2).await;
        let polls = platform.poll_count();
        worker.stop().await;

        // One poll at t=0, then one per elapsed interval.
        assert_eq!(polls, 11);
    }

    #[tokio::test]
    async fn concurrent_stops_all_wait_for_loop_exit() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(RecordingHandler::new("restart", &[RESTART]).with_behavior(
            Behavior::Delay(Duration::from_millis(300), OperationStatus::Successful),
        ));
        let id = platform.issue(RESTART, json!({}));

        let worker = Arc::new(worker_with(&platform, vec![handler.clone()]));
        worker.start().unwrap();
        assert!(wait_until(WAIT, || !handler.executed().is_empty()).await);

        let first = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        // The second caller returned only after the in-flight operation
        // was reported.
        assert_eq!(
            platform.statuses_for(&id),
            vec![OperationStatus::Executing, OperationStatus::Successful]
        );
        assert_eq!(worker.state(), WorkerState::Stopped);
        first.await.unwrap();
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_handler() {
        let platform = Arc::new(InMemoryPlatform::new());
        let handler = Arc::new(RecordingHandler::new("restart", &[RESTART]).with_behavior(
            Behavior::Delay(Duration::from_millis(300), OperationStatus::Successful),
        ));
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, vec![handler.clone()]);
        worker.start().unwrap();
        assert!(wait_until(WAIT, || !handler.executed().is_empty()).await);
        worker.abort().await;
        assert_eq!(worker.state(), WorkerState::Stopped);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handler.finished().is_empty());
        assert_eq!(platform.statuses_for(&id), vec![OperationStatus::Executing]);

        // A stop after an abort returns immediately.
        worker.stop().await;
    }

    #[tokio::test]
    async fn empty_registry_fails_every_operation() {
        let platform = Arc::new(InMemoryPlatform::new());
        let id = platform.issue(RESTART, json!({}));

        let worker = worker_with(&platform, Vec::new());
        worker.start().unwrap();
        assert!(wait_until(WAIT, || is_done(&platform, &id)).await);
        worker.stop().await;

        assert_eq!(platform.statuses_for(&id), vec![OperationStatus::Failed]);
    }
}
