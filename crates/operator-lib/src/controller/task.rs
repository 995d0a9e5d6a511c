//! Per-policy reconciliation task
//!
//! Each policy gets one task, so cycles of the same policy never overlap.
//! Triggers arriving while a cycle runs are coalesced into one rerun. A
//! deletion cancels an in-flight analysis but never an in-flight apply.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use super::reconciler::{Plan, Reconciler};
use super::state::Trigger;
use crate::models::PolicyKey;

/// Delay before retrying a cycle that failed without recording status
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMessage {
    Reconcile(Trigger),
    Delete,
}

pub struct TaskHandle {
    tx: mpsc::Sender<TaskMessage>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Queue a message; returns `false` if the task already exited
    pub async fn send(&self, message: TaskMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        drop(self.tx);
        if let Err(e) = self.join.await {
            error!(error = %e, "Policy task panicked");
        }
    }
}

/// Spawn the task for `key`, starting with a cycle for `initial`
pub fn spawn(
    key: PolicyKey,
    reconciler: Arc<Reconciler>,
    initial: TaskMessage,
    shutdown: watch::Receiver<bool>,
) -> TaskHandle {
    let (tx, rx) = mpsc::channel(16);
    let join = tokio::spawn(run(key, reconciler, initial, rx, shutdown));
    TaskHandle { tx, join }
}

async fn run(
    key: PolicyKey,
    reconciler: Arc<Reconciler>,
    initial: TaskMessage,
    mut inbox: mpsc::Receiver<TaskMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = Some(initial);
    let mut wake_at = Instant::now();

    loop {
        let message = match next.take() {
            Some(message) => message,
            None => tokio::select! {
                _ = shutdown.changed() => break,
                received = inbox.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
                _ = sleep_until(wake_at) => TaskMessage::Reconcile(Trigger::Timer),
            },
        };
        if *shutdown.borrow() {
            break;
        }

        match message {
            TaskMessage::Delete => {
                if finalize(&key, &reconciler).await {
                    break;
                }
                wake_at = Instant::now() + reconciler.config().reconcile_interval;
            }
            TaskMessage::Reconcile(trigger) => {
                match cycle(&key, &reconciler, trigger, &mut inbox, &mut shutdown).await {
                    CycleEnd::Requeue(after) => wake_at = Instant::now() + after,
                    CycleEnd::Rerun(message) => next = Some(message),
                    CycleEnd::Exit => break,
                }
            }
        }
    }
    debug!(policy = %key, "Policy task stopped");
}

enum CycleEnd {
    Requeue(Duration),
    Rerun(TaskMessage),
    Exit,
}

async fn cycle(
    key: &PolicyKey,
    reconciler: &Reconciler,
    trigger: Trigger,
    inbox: &mut mpsc::Receiver<TaskMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> CycleEnd {
    let mut rerun: Option<TaskMessage> = None;

    let plan = reconciler.plan(key, trigger);
    tokio::pin!(plan);
    let plan = loop {
        tokio::select! {
            result = &mut plan => break result,
            _ = shutdown.changed() => return CycleEnd::Exit,
            received = inbox.recv() => match received {
                Some(TaskMessage::Delete) => {
                    debug!(policy = %key, "Deletion requested, abandoning analysis");
                    return CycleEnd::Rerun(TaskMessage::Delete);
                }
                Some(message) => {
                    rerun.get_or_insert(message);
                }
                None => return CycleEnd::Exit,
            },
        }
    };

    let outcome = match plan {
        Ok(Plan::Idle(outcome)) => Ok(outcome),
        Ok(Plan::Apply(pending)) => reconciler.apply(*pending).await,
        Ok(Plan::Delete) => return CycleEnd::Rerun(TaskMessage::Delete),
        Ok(Plan::Gone) => return CycleEnd::Exit,
        Err(e) => Err(e),
    };

    if let Some(message) = rerun {
        return CycleEnd::Rerun(message);
    }
    match outcome {
        Ok(outcome) => CycleEnd::Requeue(outcome.requeue_after),
        Err(e) => {
            warn!(policy = %key, error = %e, "Reconcile cycle failed");
            CycleEnd::Requeue(ERROR_REQUEUE)
        }
    }
}

/// Returns `true` once the policy object is gone
async fn finalize(key: &PolicyKey, reconciler: &Reconciler) -> bool {
    match reconciler.finalize_deletion(key).await {
        Ok(finalized) => finalized,
        Err(e) => {
            warn!(policy = %key, error = %e, "Finalizing deletion failed");
            false
        }
    }
}
