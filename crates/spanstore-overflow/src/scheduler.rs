//! Task scheduling
//!
//! Builds and merges run on two bounded pools. A shard eligible for both is
//! queued on both; whichever pool reaches it first claims it and the other
//! drops its task. Atomic updates that follow a merge, and every task of a
//! planned cycle, run against the cycle deadline: tasks not yet started at
//! the deadline are abandoned, tasks still in their historical read are
//! cancelled, and tasks inside their atomic update are awaited.

use crate::error::OverflowResult;
use crate::metadata::{OverflowMetadata, ShardViewMetadata};
use crate::node::DataNode;
use crate::planner::{PlannedTask, after_merge};
use crate::tasks::{self, TaskProgress, TaskReport, TaskState};
use futures::stream::{FuturesUnordered, StreamExt};
use spanstore_common::{Error, OverflowAction};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A fixed number of task slots
#[derive(Debug)]
pub struct BoundedPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedPool {
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not taken by a running task
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` once a slot frees up. Tasks still waiting for a slot when
    /// the pool closes fail with a shutdown error.
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<OverflowResult<T>>
    where
        F: Future<Output = OverflowResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::ShuttingDown)?;
            task.await
        })
    }

    /// Refuse further work
    pub fn close(&self) {
        self.permits.close();
    }
}

/// How a scheduled task ended
#[derive(Clone, Debug)]
pub enum TaskOutcome {
    Completed(TaskReport),
    /// Another task claimed the shard first
    Dropped,
    /// Not started because the live journal is overextended
    Refused,
    /// Not started before the deadline
    Abandoned,
    /// Stopped before its atomic update
    Cancelled,
    /// Stopped because the node is shutting down
    Shutdown,
    Failed(String),
}

impl TaskOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub const fn report(&self) -> Option<&TaskReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Turn the result of a task into an outcome and count it
fn classify(
    node: &DataNode,
    label: &str,
    progress: Option<&TaskProgress>,
    joined: Result<OverflowResult<TaskOutcome>, JoinError>,
) -> TaskOutcome {
    let counters = &node.counters;
    let cancelled = progress.is_some_and(|p| p.state() == TaskState::Cancelled);
    let outcome = match joined {
        Ok(Ok(outcome)) => outcome,
        Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
        Ok(Err(_)) if cancelled => TaskOutcome::Cancelled,
        Ok(Err(e)) if e.is_normal_shutdown() => {
            warn!("{label} stopped: {e}");
            TaskOutcome::Shutdown
        }
        Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
        Err(e) => {
            error!("{label} panicked: {e}");
            TaskOutcome::Failed(e.to_string())
        }
    };
    let counter = match &outcome {
        TaskOutcome::Completed(_) => &counters.task_completed,
        TaskOutcome::Dropped | TaskOutcome::Refused => &counters.task_dropped,
        TaskOutcome::Abandoned => &counters.task_abandoned,
        TaskOutcome::Cancelled => &counters.task_cancelled,
        TaskOutcome::Failed(_) => &counters.task_failed,
        TaskOutcome::Shutdown => return outcome,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    outcome
}

/// Claim the shard of a build or merge and run it, or drop it when the
/// shard already has an action
async fn claim_and_run(
    node: Arc<DataNode>,
    metadata: Arc<OverflowMetadata>,
    vmd: Arc<ShardViewMetadata>,
    action: OverflowAction,
) -> OverflowResult<TaskOutcome> {
    if action == OverflowAction::Merge && node.is_journal_overextended() {
        info!("Refusing merge of {}: live journal overextended", vmd.name);
        return Ok(TaskOutcome::Refused);
    }
    if !vmd.try_claim(action) {
        debug!(
            "Dropping task for {}: action already {}",
            vmd.name,
            vmd.action().map_or_else(|| "none".to_string(), |a| a.to_string())
        );
        return Ok(TaskOutcome::Dropped);
    }
    let name = vmd.name.clone();
    let task = if action == OverflowAction::Merge {
        PlannedTask::Merge { name }
    } else {
        PlannedTask::Build { name }
    };
    let report = tasks::execute(node, metadata, task, TaskProgress::new()).await?;
    Ok(TaskOutcome::Completed(report))
}

/// Run builds and merges on the bounded pools and wait for all of them.
///
/// Returns the outcomes together with the follow-up split actions of
/// shards whose merge committed. With `force_compacting_merges` every
/// shard, copied ones included, is merged.
pub async fn schedule_and_await_tasks(
    node: &Arc<DataNode>,
    metadata: &Arc<OverflowMetadata>,
    force_compacting_merges: bool,
) -> (Vec<TaskOutcome>, Vec<PlannedTask>) {
    if force_compacting_merges {
        for vmd in metadata.views() {
            vmd.clear_copy();
        }
    }

    let mut optional: Vec<&Arc<ShardViewMetadata>> = metadata
        .views()
        .filter(|vmd| {
            !vmd.is_used()
                && !force_compacting_merges
                && !vmd.stats.mandatory_merge
                && vmd.stats.merge_priority > 0.0
        })
        .collect();
    optional.sort_by(|a, b| {
        b.stats
            .merge_priority
            .total_cmp(&a.stats.merge_priority)
            .then_with(|| a.name.cmp(&b.name))
    });
    optional.truncate(node.config.maximum_optional_merges_per_overflow);

    let mut handles = Vec::new();
    for vmd in metadata.views() {
        if vmd.is_used() {
            continue;
        }
        let must_merge = force_compacting_merges || vmd.stats.mandatory_merge;
        let may_merge = optional.iter().any(|o| o.name == vmd.name);
        if must_merge || may_merge {
            let task = claim_and_run(
                Arc::clone(node),
                Arc::clone(metadata),
                Arc::clone(vmd),
                OverflowAction::Merge,
            );
            handles.push((format!("Merge({})", vmd.name), node.merge_pool.submit(task)));
        }
        if !must_merge {
            let task = claim_and_run(
                Arc::clone(node),
                Arc::clone(metadata),
                Arc::clone(vmd),
                OverflowAction::Build,
            );
            handles.push((format!("Build({})", vmd.name), node.build_pool.submit(task)));
        }
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    let mut follow_ups = Vec::new();
    for (label, handle) in handles {
        let outcome = classify(node, &label, None, handle.await);
        if let Some(report) = outcome.report() {
            if report.action == OverflowAction::Merge {
                let next = report
                    .names
                    .first()
                    .and_then(|name| metadata.get(name))
                    .and_then(|vmd| after_merge(node, metadata, vmd));
                follow_ups.extend(next);
            }
        }
        outcomes.push(outcome);
    }
    info!(
        "Scheduled {} build and merge tasks, {} follow-up actions",
        outcomes.len(),
        follow_ups.len()
    );
    (outcomes, follow_ups)
}

/// True when no further task should start
fn should_abandon(node: &DataNode, deadline: Instant) -> bool {
    Instant::now() >= deadline
        || (node.config.overflow_cancelled_when_journal_full && node.should_overflow())
}

/// Run `tasks` in order against `deadline`, at most
/// `overflow_tasks_concurrent` at a time (0 = unbounded).
pub async fn run_tasks(
    node: &Arc<DataNode>,
    metadata: &Arc<OverflowMetadata>,
    tasks: Vec<PlannedTask>,
    deadline: Instant,
) -> Vec<TaskOutcome> {
    let limit = match node.config.overflow_tasks_concurrent {
        0 => Semaphore::MAX_PERMITS,
        n => n,
    };
    let permits = Arc::new(Semaphore::new(limit));
    let running = FuturesUnordered::new();
    let mut abandoned = Vec::new();

    for task in tasks {
        let label = task.to_string();
        let permit = if should_abandon(node, deadline) {
            None
        } else {
            tokio::time::timeout_at(deadline, Arc::clone(&permits).acquire_owned())
                .await
                .ok()
                .and_then(Result::ok)
        };
        let Some(permit) = permit.filter(|_| !should_abandon(node, deadline)) else {
            debug!("Abandoning {label}");
            abandoned.push(classify(node, &label, None, Ok(Ok(TaskOutcome::Abandoned))));
            continue;
        };

        let progress = TaskProgress::new();
        let handle = tokio::spawn({
            let node = Arc::clone(node);
            let metadata = Arc::clone(metadata);
            let progress = progress.clone();
            async move {
                let _permit = permit;
                tasks::execute(node, metadata, task, progress)
                    .await
                    .map(TaskOutcome::Completed)
            }
        });
        running.push(await_task(node, label, handle, progress, deadline));
    }

    if !abandoned.is_empty() {
        warn!("Abandoned {} tasks at the overflow deadline", abandoned.len());
    }
    let mut outcomes: Vec<TaskOutcome> = running.collect().await;
    outcomes.extend(abandoned);
    outcomes
}

/// Wait for a spawned task. Past the deadline the task is cancelled if its
/// atomic update has not begun, and awaited otherwise.
async fn await_task(
    node: &DataNode,
    label: String,
    mut handle: JoinHandle<OverflowResult<TaskOutcome>>,
    progress: TaskProgress,
    deadline: Instant,
) -> TaskOutcome {
    let joined = match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            if progress.cancel() {
                warn!("Cancelling {label} at the overflow deadline");
                handle.abort();
            } else {
                warn!("{label} is committing past the overflow deadline");
            }
            handle.await
        }
    };
    classify(node, &label, Some(&progress), joined)
}
