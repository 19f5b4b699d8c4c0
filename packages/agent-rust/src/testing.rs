//! Test doubles shared by the worker, service, and shutdown tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use devagent_core::{OperationStatus, TypedOperation};
use parking_lot::Mutex;

use crate::memory::InMemoryPlatform;
use crate::service::error::HandlerError;
use crate::service::handler::OperationHandler;
use crate::service::registry::ManagedService;

/// What a [`RecordingHandler`] does when asked to execute.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Return(OperationStatus),
    Fail(String),
    Panic,
    Delay(Duration, OperationStatus),
}

/// Handler that records every lifecycle and execute call.
pub(crate) struct RecordingHandler {
    name: String,
    kinds: Vec<String>,
    behavior: Mutex<Behavior>,
    pub(crate) executed: Mutex<Vec<String>>,
    /// Operations whose `execute` ran to completion.
    pub(crate) finished: Mutex<Vec<String>>,
    /// Platform status of each operation at the moment `execute` was entered.
    pub(crate) observed: Mutex<Vec<Option<OperationStatus>>>,
    pub(crate) starts: AtomicU32,
    pub(crate) stops: AtomicU32,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    stop_delay: Mutex<Option<Duration>>,
    blocking_stop: Mutex<Option<Duration>>,
    platform: Mutex<Option<Arc<InMemoryPlatform>>>,
}

impl RecordingHandler {
    pub(crate) fn new(name: &str, kinds: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kinds: kinds.iter().map(|k| (*k).to_string()).collect(),
            behavior: Mutex::new(Behavior::Return(OperationStatus::Successful)),
            executed: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            observed: Mutex::new(Vec::new()),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            stop_delay: Mutex::new(None),
            blocking_stop: Mutex::new(None),
            platform: Mutex::new(None),
        }
    }

    pub(crate) fn with_behavior(self, behavior: Behavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub(crate) fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    /// `stop()` awaits this long before returning (cancellable).
    pub(crate) fn with_stop_delay(self, delay: Duration) -> Self {
        *self.stop_delay.lock() = Some(delay);
        self
    }

    /// `stop()` blocks its thread this long (not cancellable).
    pub(crate) fn with_blocking_stop(self, duration: Duration) -> Self {
        *self.blocking_stop.lock() = Some(duration);
        self
    }

    pub(crate) fn observing(self, platform: Arc<InMemoryPlatform>) -> Self {
        *self.platform.lock() = Some(platform);
        self
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub(crate) fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl ManagedService for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("{} refused to start", self.name);
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let blocking = *self.blocking_stop.lock();
        if let Some(duration) = blocking {
            std::thread::sleep(duration);
        }
        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("{} failed to stop", self.name);
        }
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for RecordingHandler {
    fn supported_operations(&self) -> Vec<String> {
        self.kinds.clone()
    }

    async fn execute(&self, operation: TypedOperation) -> Result<OperationStatus, HandlerError> {
        let platform = self.platform.lock().clone();
        if let Some(platform) = platform {
            let status = platform.operation(operation.id()).map(|op| op.status);
            self.observed.lock().push(status);
        }
        self.executed.lock().push(operation.id().to_string());

        let behavior = self.behavior.lock().clone();
        let result = match behavior {
            Behavior::Return(status) => Ok(status),
            Behavior::Fail(reason) => Err(HandlerError::Failed(reason)),
            Behavior::Panic => panic!("handler {} blew up", self.name),
            Behavior::Delay(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(status)
            }
        };
        self.finished.lock().push(operation.id().to_string());
        result
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
