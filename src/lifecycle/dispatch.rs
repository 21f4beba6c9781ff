//! Bounded worker pool for lifecycle operations
//!
//! Jobs go into a bounded queue drained by a single loop that spawns each job
//! under a semaphore permit. Submission never waits: a full or closed queue
//! is reported to the caller straight away. Outcomes are only visible through
//! the persisted record and the logs.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};

use super::VmLifecycle;
use crate::model::VirtualMachine;
use crate::{Error, Result};

/// Lifecycle operation to run in the background
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleOp {
    /// Stop and wait for Stopped
    Stop,
    /// Start and wait for Running
    Start,
    /// Soft-delete and remove cluster objects
    Delete,
    /// Wait for a new VM to report Running
    AwaitRunning,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Delete => "delete",
            Self::AwaitRunning => "await-running",
        };
        f.write_str(name)
    }
}

/// A queued operation against one VM snapshot
#[derive(Clone, Debug)]
pub struct LifecycleJob {
    /// What to do
    pub op: LifecycleOp,
    /// Record as it was when the job was queued
    pub vm: VirtualMachine,
}

/// Handle for queueing lifecycle jobs
#[derive(Clone, Debug)]
pub struct LifecycleDispatcher {
    sender: mpsc::Sender<LifecycleJob>,
}

impl LifecycleDispatcher {
    /// Start the pool; the returned handle finishes once every dispatcher
    /// clone is dropped and in-flight jobs are done
    pub fn spawn(
        lifecycle: Arc<VmLifecycle>,
        workers: usize,
        queue_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(run_pool(lifecycle, receiver, workers));
        info!(workers, queue_capacity, "Lifecycle worker pool started");
        (Self { sender }, handle)
    }

    /// Queue a job without waiting
    pub fn dispatch(&self, op: LifecycleOp, vm: VirtualMachine) -> Result<()> {
        let name = vm.name.clone();
        self.sender
            .try_send(LifecycleJob { op, vm })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::dispatch(format!("lifecycle queue full, {op} of {name} rejected"))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::dispatch(format!("lifecycle pool stopped, {op} of {name} rejected"))
                }
            })?;
        debug!(op = %op, vm = %name, "Queued lifecycle job");
        Ok(())
    }
}

async fn run_pool(
    lifecycle: Arc<VmLifecycle>,
    mut receiver: mpsc::Receiver<LifecycleJob>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(job) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let _permit = permit;
            execute(&lifecycle, job).await;
        });
    }

    // Drain: wait for in-flight jobs to hand back their permits
    if let Ok(all) = permits.acquire_many(workers as u32).await {
        drop(all);
    }
    info!("Lifecycle worker pool stopped");
}

async fn execute(lifecycle: &VmLifecycle, job: LifecycleJob) {
    let LifecycleJob { op, vm } = job;
    let result = match op {
        LifecycleOp::Stop => lifecycle.stop(&vm).await,
        LifecycleOp::Start => lifecycle.start(&vm).await,
        LifecycleOp::Delete => lifecycle.delete(&vm).await,
        LifecycleOp::AwaitRunning => lifecycle.await_running(&vm).await,
    };
    match result {
        Ok(()) => info!(op = %op, vm = %vm.name, "Lifecycle operation completed"),
        Err(e) if failure_level(&e) == Level::WARN => warn!(
            op = %op,
            vm = %vm.name,
            error = %e,
            "Lifecycle operation failed, may succeed on retry"
        ),
        Err(e) => error!(op = %op, vm = %vm.name, error = %e, "Lifecycle operation failed"),
    }
}

/// Failures a retry can clear are logged at warn, the rest at error
fn failure_level(error: &Error) -> Level {
    if error.is_retryable() {
        Level::WARN
    } else {
        Level::ERROR
    }
}
