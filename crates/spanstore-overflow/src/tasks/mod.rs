//! Overflow tasks
//!
//! Every task runs in two phases. The first reads the shard's historical
//! view and builds new segments without touching any shared state; a task
//! cancelled during this phase leaves only unreferenced artifacts behind,
//! which the release sweep reclaims. The second phase takes the exclusive
//! locks of every shard it touches and performs the atomic update: it
//! redefines shards on this node and updates the metadata index. Once the
//! atomic update has begun a task is never cancelled.
//!
//! ```text
//! Planned ──► HistoricalReadDone ──► Committing ──► Committed
//!    │                │                   │
//!    │                │                   └──► Failed
//!    └────────────────┴──► Cancelled / Failed
//! ```

pub mod build;
pub mod join;
pub mod moves;
pub mod split;

pub use build::BuildResult;
pub use join::JoinResult;
pub use moves::MoveResult;
pub use split::{SplitKind, SplitOutput, SplitResult};

use crate::error::{OverflowError, OverflowResult};
use crate::metadata::{OverflowMetadata, ShardViewMetadata};
use crate::node::DataNode;
use crate::planner::PlannedTask;
use spanstore_common::{
    ArtifactMetadata, KeyRange, OverflowAction, Result, ShardName, StaleLocatorReason,
};
use spanstore_storage::{RetentionHold, View};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, error, warn};

/// Lifecycle state of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskState {
    Planned = 0,
    /// New artifacts are built and held; nothing shared has changed
    HistoricalReadDone = 1,
    /// The atomic update is running under the shard locks
    Committing = 2,
    Committed = 3,
    Failed = 4,
    /// Cancelled before its atomic update began
    Cancelled = 5,
}

impl TaskState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Planned,
            1 => Self::HistoricalReadDone,
            2 => Self::Committing,
            3 => Self::Committed,
            4 => Self::Failed,
            _ => Self::Cancelled,
        }
    }
}

/// Shared view of a running task's state
#[derive(Clone, Debug, Default)]
pub struct TaskProgress(Arc<AtomicU8>);

impl TaskProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `state` unless the task was cancelled
    pub(crate) fn advance(&self, state: TaskState) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current != TaskState::Cancelled as u8).then_some(state as u8)
        });
    }

    /// Enter the atomic update. Fails if the task was cancelled first.
    pub(crate) fn begin_commit(&self) -> Result<()> {
        let committing = TaskState::Committing as u8;
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current <= committing).then_some(committing)
            })
            .map(|_| ())
            .map_err(|_| spanstore_common::Error::Cancelled)
    }

    /// A task may be cancelled until its atomic update begins
    #[must_use]
    pub fn is_cancellable(&self) -> bool {
        self.state() < TaskState::Committing
    }

    /// Cancel the task unless its atomic update has begun. Returns true if
    /// the task will never commit.
    pub fn cancel(&self) -> bool {
        let committing = TaskState::Committing as u8;
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < committing).then_some(TaskState::Cancelled as u8)
            })
            .is_ok()
    }
}

/// Outcome of a committed task
#[derive(Clone, Debug)]
pub enum ActionResult {
    Build(BuildResult),
    Split(SplitResult),
    Join(JoinResult),
    Move(MoveResult),
}

/// Report of a task that ran to completion
#[derive(Clone, Debug)]
pub struct TaskReport {
    pub action: OverflowAction,
    pub names: Vec<ShardName>,
    pub result: ActionResult,
}

/// Run a planned task to completion
pub async fn execute(
    node: Arc<DataNode>,
    metadata: Arc<OverflowMetadata>,
    task: PlannedTask,
    progress: TaskProgress,
) -> OverflowResult<TaskReport> {
    let action = task.action();
    let names = task.names().to_vec();
    let result = run(&node, &metadata, task, &progress).await;
    match &result {
        Ok(_) => {
            progress.advance(TaskState::Committed);
            node.counters.record(action);
        }
        Err(e) => {
            progress.advance(TaskState::Failed);
            if e.is_precondition() {
                debug!("{action} of {names:?} refused: {e}");
            } else if e.is_normal_shutdown() || progress.state() == TaskState::Cancelled {
                warn!("{action} of {names:?} stopped: {e}");
            } else {
                error!("{action} of {names:?} failed: {e}");
            }
        }
    }
    result.map(|result| TaskReport {
        action,
        names,
        result,
    })
}

async fn run(
    node: &DataNode,
    metadata: &OverflowMetadata,
    task: PlannedTask,
    progress: &TaskProgress,
) -> OverflowResult<ActionResult> {
    let result = match task {
        PlannedTask::Build { name } => {
            let vmd = shard(metadata, &name)?;
            ActionResult::Build(build::run(node, vmd, false, progress).await?)
        }
        PlannedTask::Merge { name } => {
            let vmd = shard(metadata, &name)?;
            ActionResult::Build(build::run(node, vmd, true, progress).await?)
        }
        PlannedTask::Split { name, move_target } => {
            let vmd = shard(metadata, &name)?;
            ActionResult::Split(
                split::run(node, vmd, SplitKind::Balanced, move_target, progress).await?,
            )
        }
        PlannedTask::TailSplit { name, move_target } => {
            let vmd = shard(metadata, &name)?;
            ActionResult::Split(split::run(node, vmd, SplitKind::Tail, move_target, progress).await?)
        }
        PlannedTask::ScatterSplit {
            name,
            nsplits,
            targets,
        } => {
            let vmd = shard(metadata, &name)?;
            let kind = SplitKind::Scatter { nsplits, targets };
            ActionResult::Split(split::run(node, vmd, kind, None, progress).await?)
        }
        PlannedTask::Join { names } => {
            let shards = names
                .iter()
                .map(|name| shard(metadata, name))
                .collect::<OverflowResult<Vec<_>>>()?;
            ActionResult::Join(join::run(node, &shards, progress).await?)
        }
        PlannedTask::Move { name, target } => {
            let vmd = shard(metadata, &name)?;
            ActionResult::Move(moves::run(node, vmd, target, progress).await?)
        }
    };
    Ok(result)
}

fn shard<'a>(
    metadata: &'a OverflowMetadata,
    name: &ShardName,
) -> OverflowResult<&'a ShardViewMetadata> {
    metadata
        .get(name)
        .map(AsRef::as_ref)
        .ok_or_else(|| OverflowError::MissingView(name.clone()))
}

/// Historical view of a shard, which every task needs
pub(crate) fn historical_view(vmd: &ShardViewMetadata) -> OverflowResult<Arc<View>> {
    vmd.view()
        .ok_or_else(|| OverflowError::MissingView(vmd.name.clone()))
}

/// Build a segment from `range` of `view` and hold it in `hold`
pub(crate) fn build_held(
    node: &DataNode,
    hold: &mut RetentionHold,
    view: &View,
    compacting: bool,
    range: &KeyRange,
) -> Result<ArtifactMetadata> {
    let artifact = node.store.build_artifact(
        view,
        compacting,
        view.commit_time(),
        &range.left,
        range.right.as_deref(),
    )?;
    hold.adopt(artifact.id);
    Ok(artifact)
}

/// Delete artifacts a failed task built
pub(crate) fn discard(node: &DataNode, artifacts: &[&ArtifactMetadata]) {
    for artifact in artifacts {
        if let Err(e) = node.store.delete_artifact(&artifact.id) {
            warn!("Could not delete artifact {}: {e}", artifact.id);
        }
    }
}

/// Retire `name` once the metadata index no longer maps to it. A failed
/// local drop is only logged; the name is marked stale either way.
pub(crate) fn retire(node: &DataNode, name: &ShardName, reason: StaleLocatorReason) {
    if let Err(e) = node.store.drop_shard(name) {
        error!("Could not drop retired shard {name}: {e}");
    }
    node.stale.insert(name.clone(), reason);
}

/// Await a call to another service, failing with a timeout error once the
/// configured RPC timeout has passed
pub(crate) async fn with_rpc_timeout<T>(
    node: &DataNode,
    what: &str,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(node.config.rpc_timeout(), call)
        .await
        .map_err(|_| spanstore_common::Error::Timeout(what.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_transitions() {
        let progress = TaskProgress::new();
        assert_eq!(progress.state(), TaskState::Planned);
        assert!(progress.is_cancellable());

        progress.advance(TaskState::HistoricalReadDone);
        assert!(progress.is_cancellable());

        progress.advance(TaskState::Committing);
        assert!(!progress.is_cancellable());

        let shared = progress.clone();
        progress.advance(TaskState::Committed);
        assert_eq!(shared.state(), TaskState::Committed);
    }

    #[test]
    fn test_cancel_races_with_commit() {
        let progress = TaskProgress::new();
        progress.advance(TaskState::HistoricalReadDone);
        assert!(progress.cancel());
        assert!(matches!(
            progress.begin_commit(),
            Err(spanstore_common::Error::Cancelled)
        ));
        // a cancelled task stays cancelled
        progress.advance(TaskState::Failed);
        assert_eq!(progress.state(), TaskState::Cancelled);

        let committing = TaskProgress::new();
        committing.begin_commit().unwrap();
        // re-entering the update is fine, cancelling it is not
        committing.begin_commit().unwrap();
        assert!(!committing.cancel());
        assert_eq!(committing.state(), TaskState::Committing);
    }
}
