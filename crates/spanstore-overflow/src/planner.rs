//! Overflow action planning
//!
//! The planner walks the shards of one overflow snapshot and chooses at most
//! one action for each. Decisions are made in a fixed order: scatter splits,
//! joins, moves and finally split, build or merge for whatever is left. A
//! shard is claimed as soon as an action is chosen for it, so later phases
//! skip it.

use crate::error::{OverflowError, OverflowResult};
use crate::host::{DATA_DIR_FREE_CRITICAL, DATA_DIR_FREE_THRESHOLD, MAJOR_PAGE_FAULTS_THRESHOLD};
use crate::metadata::{OverflowMetadata, ShardViewMetadata, try_claim_all};
use crate::node::DataNode;
use bytes::Bytes;
use spanstore_common::{NodeId, OverflowAction, ShardName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Normalized rank below which a shard is not worth moving
pub const MOVE_MIN_SCORE: f64 = 0.1;

/// Shards above this percent of split are split before moving
const SPLIT_BEFORE_MOVE_PERCENT: f64 = 0.5;

/// Shards below this percent of split are join candidates
const JOIN_PERCENT_OF_SPLIT: f64 = 0.5;

/// A unit of overflow work chosen for one or more shards
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlannedTask {
    /// Build the buffered writes into a new segment
    Build { name: ShardName },
    /// Compact the whole view into one segment
    Merge { name: ShardName },
    /// Split into balanced shards, optionally moving the smallest away
    Split {
        name: ShardName,
        move_target: Option<NodeId>,
    },
    /// Split off the tail, optionally moving it away
    TailSplit {
        name: ShardName,
        move_target: Option<NodeId>,
    },
    /// Split the sole shard of an index and spread the pieces over `targets`
    ScatterSplit {
        name: ShardName,
        nsplits: usize,
        targets: Vec<NodeId>,
    },
    /// Join adjacent siblings, listed in key order
    Join { names: Vec<ShardName> },
    Move { name: ShardName, target: NodeId },
}

impl PlannedTask {
    #[must_use]
    pub const fn action(&self) -> OverflowAction {
        match self {
            Self::Build { .. } => OverflowAction::Build,
            Self::Merge { .. } => OverflowAction::Merge,
            Self::Split { .. } => OverflowAction::Split,
            Self::TailSplit { .. } => OverflowAction::TailSplit,
            Self::ScatterSplit { .. } => OverflowAction::ScatterSplit,
            Self::Join { .. } => OverflowAction::Join,
            Self::Move { .. } => OverflowAction::Move,
        }
    }

    /// Shards the task works on
    #[must_use]
    pub fn names(&self) -> &[ShardName] {
        match self {
            Self::Build { name }
            | Self::Merge { name }
            | Self::Split { name, .. }
            | Self::TailSplit { name, .. }
            | Self::ScatterSplit { name, .. }
            | Self::Move { name, .. } => std::slice::from_ref(name),
            Self::Join { names } => names,
        }
    }
}

impl std::fmt::Display for PlannedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split {
                name,
                move_target: Some(target),
            }
            | Self::TailSplit {
                name,
                move_target: Some(target),
            } => write!(f, "{}+Move({name} -> {target})", self.action()),
            Self::Move { name, target } => write!(f, "Move({name} -> {target})"),
            Self::Join { names } => {
                let names: Vec<String> = names.iter().map(ToString::to_string).collect();
                write!(f, "Join({})", names.join(", "))
            }
            _ => write!(f, "{}({})", self.action(), self.names()[0]),
        }
    }
}

/// Chooses the actions of one overflow cycle
pub struct ActionPlanner<'a> {
    node: &'a DataNode,
    metadata: &'a OverflowMetadata,
}

impl<'a> ActionPlanner<'a> {
    #[must_use]
    pub const fn new(node: &'a DataNode, metadata: &'a OverflowMetadata) -> Self {
        Self { node, metadata }
    }

    /// Choose the tasks of this cycle, highest priority first. With
    /// `force_compacting_merges` every unused shard is merged and no
    /// splits, joins or moves are considered.
    pub async fn choose_tasks(
        &self,
        force_compacting_merges: bool,
    ) -> OverflowResult<Vec<PlannedTask>> {
        for vmd in self.metadata.views() {
            if vmd.view().is_none() {
                return Err(OverflowError::MissingView(vmd.name.clone()));
            }
        }

        let mut tasks = Vec::new();
        if !force_compacting_merges {
            tasks.extend(self.choose_scatter_splits());
            tasks.extend(self.choose_joins().await);
            if self.should_move().await {
                tasks.extend(self.choose_moves().await);
            }
        }
        tasks.extend(self.choose_split_build_or_merge(force_compacting_merges));

        info!(
            "Planned {} tasks for {} shards at commit time {}",
            tasks.len(),
            self.metadata.len(),
            self.metadata.last_commit_time()
        );
        for task in &tasks {
            debug!("Planned {task}");
        }
        Ok(tasks)
    }

    /// Scatter the sole shard of a scale-out index across several nodes
    pub fn choose_scatter_splits(&self) -> Vec<PlannedTask> {
        let mut tasks = Vec::new();
        if !self.node.config.scatter_split_enabled {
            return tasks;
        }
        for vmd in self.metadata.views() {
            if vmd.is_used()
                || vmd.is_move_in_progress()
                || !vmd.scatter.enabled
                || !vmd.stats.compact
                || vmd.stats.percent_of_split < vmd.scatter.percent_of_split_threshold
                || self.metadata.partition_count(vmd.name.index()) != Some(1)
            {
                continue;
            }
            let Some(task) = scatter_task(self.node, vmd) else {
                continue;
            };
            if vmd.try_claim(OverflowAction::ScatterSplit) {
                info!("Scatter split of {}", vmd.name);
                tasks.push(task);
            }
        }
        tasks
    }

    /// Join under-capacity shards with their right siblings, or move them
    /// to the node owning the sibling
    pub async fn choose_joins(&self) -> Vec<PlannedTask> {
        let mut tasks = Vec::new();
        if !self.node.config.joins_enabled {
            return tasks;
        }

        let mut candidates: BTreeMap<&str, Vec<&Arc<ShardViewMetadata>>> = BTreeMap::new();
        for vmd in self.metadata.views() {
            if vmd.is_used()
                || vmd.is_move_in_progress()
                || vmd.range.right.is_none()
                || vmd.stats.percent_of_split >= JOIN_PERCENT_OF_SPLIT
            {
                continue;
            }
            candidates.entry(vmd.name.index()).or_default().push(vmd);
        }

        for (index, group) in candidates {
            let keys: Vec<Bytes> = group
                .iter()
                .filter_map(|vmd| vmd.range.right.clone())
                .collect();
            let siblings = match self.node.metadata_index.lookup_siblings(index, &keys).await {
                Ok(siblings) => siblings,
                Err(e) => {
                    warn!("Could not locate the right siblings in {index}: {e}");
                    continue;
                }
            };

            for (vmd, sibling) in group.into_iter().zip(siblings) {
                if vmd.is_used() {
                    continue;
                }
                if vmd.range.right.as_ref() != Some(&sibling.range.left) {
                    warn!("Right sibling of {} does not start at its right separator", vmd.name);
                    continue;
                }
                if sibling.node == self.node.node_id {
                    let sibling_name = ShardName::new(index, sibling.partition_id);
                    let Some(right) = self.metadata.get(&sibling_name) else {
                        continue;
                    };
                    if right.is_move_in_progress() {
                        continue;
                    }
                    if try_claim_all(&[vmd.as_ref(), right.as_ref()], OverflowAction::Join) {
                        info!("Join of {} and {sibling_name}", vmd.name);
                        tasks.push(PlannedTask::Join {
                            names: vec![vmd.name.clone(), sibling_name],
                        });
                    }
                } else if vmd.try_claim(OverflowAction::Move) {
                    info!(
                        "Move of {} to {} which owns its right sibling",
                        vmd.name, sibling.node
                    );
                    tasks.push(PlannedTask::Move {
                        name: vmd.name.clone(),
                        target: sibling.node,
                    });
                }
            }
        }
        tasks
    }

    /// True when this node is highly utilized and the host is under
    /// resource pressure
    pub async fn should_move(&self) -> bool {
        let Some(lb) = &self.node.load_balancer else {
            return false;
        };
        match lb.is_highly_utilized(self.node.node_id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!("Load balancer unavailable: {e}");
                return false;
            }
        }

        let scores = self.node.host.resource_scores();
        if scores.data_dir_bytes_free < DATA_DIR_FREE_CRITICAL {
            warn!(
                "Critically low free space on {}: {} bytes",
                self.node.name, scores.data_dir_bytes_free
            );
            return true;
        }
        scores.percent_cpu_time >= self.node.config.move_percent_cpu_time_threshold
            || scores.major_page_faults_per_sec > MAJOR_PAGE_FAULTS_THRESHOLD
            || scores.data_dir_bytes_free < DATA_DIR_FREE_THRESHOLD
    }

    /// Shed the most active small shards onto under-utilized nodes
    pub async fn choose_moves(&self) -> Vec<PlannedTask> {
        let config = &self.node.config;
        let mut tasks = Vec::new();
        let Some(lb) = &self.node.load_balancer else {
            return tasks;
        };
        if config.maximum_moves_per_target == 0 {
            return tasks;
        }
        let nactive = self.metadata.active_count();
        if nactive <= config.minimum_active_index_partitions {
            return tasks;
        }

        let targets = match lb
            .under_utilized_nodes(1, 0, Some(self.node.node_id))
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                warn!("Could not find under-utilized nodes: {e}");
                return tasks;
            }
        };
        if targets.is_empty() {
            return tasks;
        }
        let max_moves = config.maximum_moves.min(
            (nactive - config.minimum_active_index_partitions)
                .min(config.maximum_moves_per_target * targets.len()),
        );

        let mut candidates: Vec<(f64, &Arc<ShardViewMetadata>)> = Vec::new();
        for vmd in self.metadata.views() {
            if vmd.is_used()
                || vmd.is_move_in_progress()
                || self.node.stale.get(&vmd.name).is_some()
                || vmd.stats.percent_of_split > config.maximum_move_percent_of_split
            {
                continue;
            }
            let Some(score) = self.metadata.score(&vmd.name) else {
                continue;
            };
            if score.drank < MOVE_MIN_SCORE {
                continue;
            }
            let priority = if vmd.stats.tail_split {
                score.drank / MOVE_MIN_SCORE
            } else {
                score.drank / vmd.stats.percent_of_split
            };
            candidates.push((priority, vmd));
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.name.cmp(&b.1.name))
        });

        let mut nmove = 0;
        for (_, vmd) in candidates {
            if nmove >= max_moves {
                break;
            }
            let target = targets[nmove % targets.len()];
            let (action, task) = if vmd.stats.tail_split {
                (
                    OverflowAction::TailSplit,
                    PlannedTask::TailSplit {
                        name: vmd.name.clone(),
                        move_target: Some(target),
                    },
                )
            } else if vmd.stats.percent_of_split > SPLIT_BEFORE_MOVE_PERCENT {
                (
                    OverflowAction::Split,
                    PlannedTask::Split {
                        name: vmd.name.clone(),
                        move_target: Some(target),
                    },
                )
            } else {
                (
                    OverflowAction::Move,
                    PlannedTask::Move {
                        name: vmd.name.clone(),
                        target,
                    },
                )
            };
            if vmd.try_claim(action) {
                info!("Shedding {task}");
                tasks.push(task);
                nmove += 1;
            }
        }
        tasks
    }

    /// Split, build or merge every shard not claimed yet. Mandatory merges
    /// count toward the optional merge budget.
    pub fn choose_split_build_or_merge(&self, compacting_merge: bool) -> Vec<PlannedTask> {
        let config = &self.node.config;
        let mut tasks = Vec::new();
        let mut merge_queue: Vec<&Arc<ShardViewMetadata>> = Vec::new();
        let mut nmerge = 0;

        for vmd in self.metadata.views() {
            if vmd.is_used() {
                continue;
            }
            let name = vmd.name.clone();
            if compacting_merge || vmd.stats.mandatory_merge {
                if vmd.try_claim(OverflowAction::Merge) {
                    tasks.push(PlannedTask::Merge { name });
                    nmerge += 1;
                }
            } else if !vmd.is_move_in_progress() && vmd.stats.tail_split {
                if vmd.try_claim(OverflowAction::TailSplit) {
                    tasks.push(PlannedTask::TailSplit {
                        name,
                        move_target: None,
                    });
                }
            } else if !vmd.is_move_in_progress() && vmd.stats.percent_of_split > 1.0 {
                if vmd.try_claim(OverflowAction::Split) {
                    tasks.push(PlannedTask::Split {
                        name,
                        move_target: None,
                    });
                }
            } else {
                merge_queue.push(vmd);
            }
        }

        merge_queue.sort_by(|a, b| {
            b.stats
                .merge_priority
                .total_cmp(&a.stats.merge_priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        for vmd in merge_queue {
            let name = vmd.name.clone();
            if nmerge < config.maximum_optional_merges_per_overflow
                && vmd.stats.merge_priority > 0.0
            {
                if vmd.try_claim(OverflowAction::Merge) {
                    tasks.push(PlannedTask::Merge { name });
                    nmerge += 1;
                }
            } else if vmd.try_claim(OverflowAction::Build) {
                tasks.push(PlannedTask::Build { name });
            }
        }
        tasks
    }
}

/// Scatter split of `vmd` over this node and up to `data_service_count`
/// peers, or `None` when there is nowhere to scatter to
pub(crate) fn scatter_task(node: &DataNode, vmd: &ShardViewMetadata) -> Option<PlannedTask> {
    let mut targets: Vec<NodeId> = node
        .directory
        .nodes()
        .into_iter()
        .filter(|n| *n != node.node_id)
        .take(vmd.scatter.data_service_count)
        .collect();
    if targets.is_empty() {
        return None;
    }
    targets.push(node.node_id);
    let nsplits = if vmd.scatter.index_partition_count == 0 {
        2 * targets.len()
    } else {
        vmd.scatter.index_partition_count
    };
    Some(PlannedTask::ScatterSplit {
        name: vmd.name.clone(),
        nsplits,
        targets,
    })
}

/// Follow-up action for a shard whose compacting merge just committed
pub(crate) fn after_merge(
    node: &DataNode,
    metadata: &OverflowMetadata,
    vmd: &ShardViewMetadata,
) -> Option<PlannedTask> {
    if vmd.is_move_in_progress() {
        return None;
    }
    if node.config.scatter_split_enabled
        && vmd.scatter.enabled
        && vmd.stats.percent_of_split >= vmd.scatter.percent_of_split_threshold
        && metadata.partition_count(vmd.name.index()) == Some(1)
    {
        if let Some(task) = scatter_task(node, vmd) {
            return Some(task);
        }
    }
    if vmd.stats.tail_split {
        return Some(PlannedTask::TailSplit {
            name: vmd.name.clone(),
            move_target: None,
        });
    }
    if vmd.stats.percent_of_split > 1.0 {
        return Some(PlannedTask::Split {
            name: vmd.name.clone(),
            move_target: None,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::metadata::ShardStats;
    use crate::score::rank;
    use spanstore_client::MetadataIndex;
    use spanstore_common::{GB, KeyRange, PartitionLocator, ResourceScores};
    use spanstore_storage::WriteCounters;
    use std::collections::HashMap;

    fn shard(pid: u32, stats: ShardStats) -> ShardViewMetadata {
        ShardViewMetadata::new(ShardName::new("idx", pid), KeyRange::full(), None, stats)
    }

    fn metadata(views: Vec<ShardViewMetadata>) -> OverflowMetadata {
        OverflowMetadata::new(1, views, HashMap::new(), HashMap::new())
    }

    fn name(pid: u32) -> ShardName {
        ShardName::new("idx", pid)
    }

    #[tokio::test]
    async fn test_missing_view_fails_planning() {
        let cluster = LocalCluster::for_tests(1);
        let metadata = metadata(vec![shard(0, ShardStats::default())]);
        let err = ActionPlanner::new(cluster.node(0), &metadata)
            .choose_tasks(false)
            .await
            .unwrap_err();
        assert!(matches!(err, OverflowError::MissingView(_)));
    }

    #[tokio::test]
    async fn test_split_build_or_merge_precedence() {
        let cluster = LocalCluster::for_tests(1);
        let merge = |merge_priority| ShardStats {
            merge_priority,
            ..ShardStats::default()
        };
        let metadata = metadata(vec![
            shard(7, ShardStats {
                percent_of_split: 1.4,
                ..ShardStats::default()
            }),
            shard(8, ShardStats {
                mandatory_merge: true,
                ..ShardStats::default()
            }),
            shard(9, ShardStats {
                tail_split: true,
                percent_of_split: 0.95,
                ..ShardStats::default()
            }),
            shard(10, merge(3.0)),
            shard(11, merge(5.0)),
            shard(12, merge(4.0)),
            shard(13, ShardStats::default()),
            shard(14, ShardStats::default()).with_copied(true),
            shard(15, ShardStats {
                percent_of_split: 1.4,
                ..ShardStats::default()
            })
            .with_source_partition_id(Some(2)),
        ]);

        let tasks = ActionPlanner::new(cluster.node(0), &metadata).choose_split_build_or_merge(false);
        // the mandatory merge uses one of the two optional merge slots
        assert_eq!(
            tasks,
            vec![
                PlannedTask::Split {
                    name: name(7),
                    move_target: None
                },
                PlannedTask::Merge { name: name(8) },
                PlannedTask::TailSplit {
                    name: name(9),
                    move_target: None
                },
                PlannedTask::Merge { name: name(11) },
                PlannedTask::Build { name: name(12) },
                PlannedTask::Build { name: name(10) },
                PlannedTask::Build { name: name(13) },
                PlannedTask::Build { name: name(15) },
            ]
        );
        assert_eq!(metadata.get(&name(14)).unwrap().action(), Some(OverflowAction::Copy));
        assert_eq!(metadata.get(&name(7)).unwrap().action(), Some(OverflowAction::Split));
    }

    #[tokio::test]
    async fn test_forced_merges_merge_everything() {
        let cluster = LocalCluster::for_tests(1);
        let metadata = metadata(vec![
            shard(1, ShardStats {
                percent_of_split: 1.4,
                ..ShardStats::default()
            }),
            shard(2, ShardStats::default()),
        ]);
        let tasks = ActionPlanner::new(cluster.node(0), &metadata).choose_split_build_or_merge(true);
        assert!(tasks.iter().all(|t| t.action() == OverflowAction::Merge));
        assert_eq!(tasks.len(), 2);
    }

    async fn small_shards(cluster: &LocalCluster, n: usize) -> Vec<ShardName> {
        let separators: Vec<Bytes> = (1..n).map(|i| Bytes::from(format!("k{i}"))).collect();
        let names = cluster.create_index("idx", 0, &separators).await.unwrap();
        for (i, name) in names.iter().enumerate() {
            cluster
                .node(0)
                .write(name, Bytes::from(format!("k{i}-0")), Bytes::from_static(b"v"))
                .await
                .unwrap();
        }
        names
    }

    #[tokio::test]
    async fn test_local_sibling_is_joined() {
        let cluster = LocalCluster::for_tests(1);
        let names = small_shards(&cluster, 5).await;
        let metadata = cluster.snapshot(0).await;
        // the first three shards are already handled
        for name in &names[..3] {
            assert!(metadata.get(name).unwrap().try_claim(OverflowAction::Build));
        }

        let tasks = ActionPlanner::new(cluster.node(0), &metadata)
            .choose_joins()
            .await;
        assert_eq!(
            tasks,
            vec![PlannedTask::Join {
                names: vec![name(3), name(4)]
            }]
        );
        assert_eq!(metadata.get(&name(3)).unwrap().action(), Some(OverflowAction::Join));
        assert_eq!(metadata.get(&name(4)).unwrap().action(), Some(OverflowAction::Join));
    }

    #[tokio::test]
    async fn test_remote_sibling_attracts_a_move() {
        let cluster = LocalCluster::for_tests(2);
        let names = small_shards(&cluster, 2).await;
        let remote = cluster.node(1).id();
        let right = cluster.metadata_index.locators("idx")[1].clone();
        let elsewhere = PartitionLocator::new(9, remote, right.range.clone());
        cluster
            .metadata_index
            .move_shard("idx", &right, &elsewhere)
            .await
            .unwrap();
        let metadata = cluster.snapshot(0).await;

        let tasks = ActionPlanner::new(cluster.node(0), &metadata)
            .choose_joins()
            .await;
        assert_eq!(
            tasks,
            vec![PlannedTask::Move {
                name: names[0].clone(),
                target: remote
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_sibling_lookup_skips_joins() {
        let cluster = LocalCluster::for_tests(1);
        let names = small_shards(&cluster, 3).await;
        let metadata = cluster.snapshot(0).await;
        cluster.metadata_index.set_fail_lookups(true);

        let planner = ActionPlanner::new(cluster.node(0), &metadata);
        assert!(planner.choose_joins().await.is_empty());
        for name in &names {
            assert!(metadata.get(name).unwrap().action().is_none());
        }

        // the shards fall through to builds
        let tasks = planner.choose_tasks(false).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.action() == OverflowAction::Build));
    }

    #[tokio::test]
    async fn test_joins_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = spanstore_common::OverflowConfig {
            copy_index_threshold: 0,
            joins_enabled: false,
            ..spanstore_common::OverflowConfig::default()
        };
        let cluster = LocalCluster::new(1, config, dir.path(), 1 << 20).unwrap();
        small_shards(&cluster, 3).await;
        let metadata = cluster.snapshot(0).await;
        let planner = ActionPlanner::new(cluster.node(0), &metadata);
        assert!(planner.choose_joins().await.is_empty());
    }

    #[tokio::test]
    async fn test_move_gating() {
        let cluster = LocalCluster::for_tests(2);
        let metadata = metadata(Vec::new());
        let node = cluster.node(0);
        let planner = ActionPlanner::new(node, &metadata);
        assert!(!planner.should_move().await);

        // busy, but the host has headroom
        cluster.load_balancer.report(node.id(), 0.9);
        assert!(!planner.should_move().await);

        cluster.host(0).set_cpu(0.75);
        assert!(planner.should_move().await);

        let idle = ResourceScores {
            percent_cpu_time: 0.0,
            major_page_faults_per_sec: 0.0,
            data_dir_bytes_free: 100 * GB,
        };
        cluster.host(0).set(ResourceScores {
            major_page_faults_per_sec: 25.0,
            ..idle
        });
        assert!(planner.should_move().await);
        cluster.host(0).set(ResourceScores {
            data_dir_bytes_free: 4 * GB,
            ..idle
        });
        assert!(planner.should_move().await);
        cluster.host(0).set(ResourceScores {
            data_dir_bytes_free: GB / 4,
            ..idle
        });
        assert!(planner.should_move().await);

        cluster.load_balancer.set_unavailable(true);
        assert!(!planner.should_move().await);
    }

    #[tokio::test]
    async fn test_moves_favor_active_small_shards() {
        let cluster = LocalCluster::for_tests(2);
        let idle = cluster.node(1).id();
        cluster.load_balancer.report(idle, 0.1);

        let mut activity = HashMap::new();
        for (pid, inserts) in [(1, 1), (2, 10), (3, 100)] {
            activity.insert(
                name(pid),
                WriteCounters {
                    inserts,
                    ..WriteCounters::default()
                },
            );
        }
        let percent = |percent_of_split| ShardStats {
            percent_of_split,
            ..ShardStats::default()
        };
        let metadata = OverflowMetadata::new(
            1,
            vec![shard(1, percent(0.3)), shard(2, percent(0.3)), shard(3, percent(0.8))],
            rank(activity),
            HashMap::new(),
        );

        let tasks = ActionPlanner::new(cluster.node(0), &metadata)
            .choose_moves()
            .await;
        // the least active shard stays; at most nactive - 1 shards go
        assert_eq!(
            tasks,
            vec![
                PlannedTask::Move {
                    name: name(2),
                    target: idle
                },
                PlannedTask::Split {
                    name: name(3),
                    move_target: Some(idle)
                },
            ]
        );
    }

    fn busy_metadata(hot: ShardStats) -> OverflowMetadata {
        let mut activity = HashMap::new();
        for (pid, inserts) in [(1, 1), (2, 50)] {
            activity.insert(
                name(pid),
                WriteCounters {
                    inserts,
                    ..WriteCounters::default()
                },
            );
        }
        let cold = ShardStats {
            percent_of_split: 0.3,
            ..ShardStats::default()
        };
        OverflowMetadata::new(1, vec![shard(1, cold), shard(2, hot)], rank(activity), HashMap::new())
    }

    #[tokio::test]
    async fn test_low_disk_splits_and_moves() {
        let cluster = LocalCluster::for_tests(2);
        let node = cluster.node(0);
        let idle = cluster.node(1).id();
        cluster.load_balancer.report(node.id(), 0.9);
        cluster.load_balancer.report(idle, 0.1);
        cluster.host(0).set(ResourceScores {
            percent_cpu_time: 0.0,
            major_page_faults_per_sec: 0.0,
            data_dir_bytes_free: GB / 4,
        });

        let metadata = busy_metadata(ShardStats {
            percent_of_split: 0.9,
            ..ShardStats::default()
        });
        let planner = ActionPlanner::new(node, &metadata);
        assert!(planner.should_move().await);
        assert_eq!(
            planner.choose_moves().await,
            vec![PlannedTask::Split {
                name: name(2),
                move_target: Some(idle)
            }]
        );
        assert_eq!(metadata.get(&name(2)).unwrap().action(), Some(OverflowAction::Split));
        assert!(metadata.get(&name(1)).unwrap().action().is_none());
    }

    #[tokio::test]
    async fn test_appending_shard_sheds_its_tail() {
        let cluster = LocalCluster::for_tests(2);
        let idle = cluster.node(1).id();
        cluster.load_balancer.report(idle, 0.1);

        let metadata = busy_metadata(ShardStats {
            percent_of_split: 0.95,
            tail_split: true,
            ..ShardStats::default()
        });
        let tasks = ActionPlanner::new(cluster.node(0), &metadata)
            .choose_moves()
            .await;
        assert_eq!(
            tasks,
            vec![PlannedTask::TailSplit {
                name: name(2),
                move_target: Some(idle)
            }]
        );
    }

    #[tokio::test]
    async fn test_no_moves_without_enough_active_shards() {
        let cluster = LocalCluster::for_tests(2);
        cluster.load_balancer.report(cluster.node(1).id(), 0.1);
        let mut activity = HashMap::new();
        activity.insert(name(1), WriteCounters {
            inserts: 5,
            ..WriteCounters::default()
        });
        let metadata = OverflowMetadata::new(
            1,
            vec![shard(1, ShardStats::default())],
            rank(activity),
            HashMap::new(),
        );
        let tasks = ActionPlanner::new(cluster.node(0), &metadata)
            .choose_moves()
            .await;
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_scatter_split_needs_peers() {
        let scatter_stats = ShardStats {
            compact: true,
            percent_of_split: 0.3,
            ..ShardStats::default()
        };
        let mut counts = HashMap::new();
        counts.insert("idx".to_string(), 1);

        let lonely = LocalCluster::for_tests(1);
        let metadata = OverflowMetadata::new(
            1,
            vec![shard(0, scatter_stats.clone())],
            HashMap::new(),
            counts.clone(),
        );
        assert!(ActionPlanner::new(lonely.node(0), &metadata)
            .choose_scatter_splits()
            .is_empty());

        let cluster = LocalCluster::for_tests(3);
        let metadata =
            OverflowMetadata::new(1, vec![shard(0, scatter_stats)], HashMap::new(), counts);
        let tasks = ActionPlanner::new(cluster.node(0), &metadata).choose_scatter_splits();
        let [PlannedTask::ScatterSplit { nsplits, targets, .. }] = tasks.as_slice() else {
            panic!("expected one scatter split, got {tasks:?}");
        };
        assert_eq!(targets.len(), 3);
        assert_eq!(targets.last(), Some(&cluster.node(0).id()));
        assert_eq!(*nsplits, 6);
    }
}
