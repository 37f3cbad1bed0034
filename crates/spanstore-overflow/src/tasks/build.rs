//! Incremental builds and compacting merges
//!
//! A build turns the buffered writes on the view's journals into a new
//! segment and keeps the existing segments. A merge compacts every source
//! of the view into one segment and drops deleted markers. Either way the
//! atomic update replaces the historical sources in the live definition;
//! writes absorbed by the live journal since the snapshot stay in front.

use super::{TaskProgress, TaskState, build_held, discard, historical_view};
use crate::error::{OverflowError, OverflowResult};
use crate::metadata::ShardViewMetadata;
use crate::node::DataNode;
use spanstore_common::{ArtifactMetadata, ShardName};
use spanstore_storage::{ShardDefinition, SourceRef};
use tracing::{debug, info};

/// A committed build or merge
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub name: ShardName,
    pub compacting: bool,
    pub artifact: ArtifactMetadata,
    /// Historical sources replaced by the new segment
    pub replaced: Vec<SourceRef>,
}

pub(crate) async fn run(
    node: &DataNode,
    vmd: &ShardViewMetadata,
    compacting: bool,
    progress: &TaskProgress,
) -> OverflowResult<BuildResult> {
    let view = historical_view(vmd)?;
    let source = if compacting {
        (*view).clone()
    } else {
        view.journals_only()
    };

    let mut hold = node.retention.hold();
    let artifact = build_held(node, &mut hold, &source, compacting, view.range())?;
    let result = BuildResult {
        name: vmd.name.clone(),
        compacting,
        artifact,
        replaced: source.source_refs(),
    };
    progress.advance(TaskState::HistoricalReadDone);

    let _locks = node.locks.lock(std::slice::from_ref(&vmd.name)).await;
    if let Err(e) = progress.begin_commit() {
        discard(node, &[&result.artifact]);
        return Err(e.into());
    }

    let historical = view.source_refs();
    let committed = node
        .store
        .shard_definition(&vmd.name)
        .ok_or_else(|| OverflowError::from(node.stale.not_found_error(&vmd.name)))
        .and_then(|live| {
            let sources = updated_sources(&live, &historical, &result)
                .ok_or_else(|| OverflowError::ViewChanged(vmd.name.clone()))?;
            node.store
                .replace_definition(ShardDefinition { sources, ..live })
                .map_err(OverflowError::from)
        });
    if let Err(e) = committed {
        discard(node, &[&result.artifact]);
        return Err(e);
    }

    if compacting {
        info!(
            "Merged {} sources of {} into segment {} ({} tuples)",
            result.replaced.len(),
            vmd.name,
            result.artifact.id,
            result.artifact.entry_count
        );
    } else {
        debug!(
            "Built {} journal tuples of {} into segment {}",
            result.artifact.entry_count, vmd.name, result.artifact.id
        );
    }
    Ok(result)
}

/// Sources of the live definition once the historical sources are replaced
/// by the new segment. `None` when the live definition no longer derives
/// from the historical view.
fn updated_sources(
    live: &ShardDefinition,
    historical: &[SourceRef],
    result: &BuildResult,
) -> Option<Vec<SourceRef>> {
    let (front, tail) = live.sources.split_first()?;
    let derives = tail.iter().all(|s| historical.contains(s))
        && historical
            .iter()
            .filter(|s| !s.is_journal())
            .all(|s| tail.contains(s));
    if !derives {
        return None;
    }

    let mut sources = vec![*front, SourceRef::Segment(result.artifact.id)];
    if !result.compacting {
        sources.extend(tail.iter().filter(|s| !s.is_journal()).copied());
    }
    Some(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::tasks::{TaskProgress, TaskState};
    use bytes::Bytes;
    use spanstore_common::KeyRange;
    use spanstore_storage::ShardStore;

    async fn write_keys(cluster: &LocalCluster, name: &ShardName, keys: std::ops::Range<u32>) {
        let node = cluster.node(0);
        for i in keys {
            node.write(
                name,
                Bytes::from(format!("key{i:05}")),
                Bytes::from_static(b"value"),
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_incremental_build_keeps_segments() {
        let cluster = LocalCluster::for_tests(1);
        let name = cluster.create_index("idx", 0, &[]).await.unwrap()[0].clone();
        write_keys(&cluster, &name, 0..10).await;

        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();
        let progress = TaskProgress::new();
        let first = run(cluster.node(0), vmd, false, &progress).await.unwrap();
        assert_eq!(first.artifact.entry_count, 10);

        write_keys(&cluster, &name, 10..15).await;
        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();
        let second = run(cluster.node(0), vmd, false, &TaskProgress::new())
            .await
            .unwrap();
        assert_eq!(second.artifact.entry_count, 5);

        let live = cluster.store(0).shard_definition(&name).unwrap();
        assert_eq!(
            &live.sources[1..],
            &[
                SourceRef::Segment(second.artifact.id),
                SourceRef::Segment(first.artifact.id)
            ]
        );
        // nothing held once the tasks committed
        assert!(cluster.node(0).retention().is_empty());
    }

    #[tokio::test]
    async fn test_merge_compacts_and_keeps_new_writes() {
        let cluster = LocalCluster::for_tests(1);
        let name = cluster.create_index("idx", 0, &[]).await.unwrap()[0].clone();
        write_keys(&cluster, &name, 0..10).await;
        cluster
            .node(0)
            .delete(&name, Bytes::from_static(b"key00003"))
            .await
            .unwrap();

        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();

        // absorbed by the new live journal while the merge runs
        write_keys(&cluster, &name, 100..102).await;

        let progress = TaskProgress::new();
        let merged = run(cluster.node(0), vmd, true, &progress).await.unwrap();
        assert_eq!(merged.artifact.entry_count, 9);

        let live = cluster.store(0).shard_definition(&name).unwrap();
        assert_eq!(live.sources.len(), 2);
        let node = cluster.node(0);
        assert!(node.read(&name, b"key00003").unwrap().is_none());
        assert!(node.read(&name, b"key00100").unwrap().is_some());
        assert!(node.read(&name, b"key00009").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_build_leaves_view_unchanged() {
        let cluster = LocalCluster::for_tests(1);
        let name = cluster.create_index("idx", 0, &[]).await.unwrap()[0].clone();
        write_keys(&cluster, &name, 0..10).await;
        let metadata = cluster.snapshot(0).await;
        let before = cluster.store(0).shard_definition(&name).unwrap();

        cluster.store(0).set_fail_builds(true);
        let vmd = metadata.get(&name).unwrap();
        let err = run(cluster.node(0), vmd, true, &TaskProgress::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OverflowError::Common(spanstore_common::Error::DiskFull)
        ));
        assert_eq!(cluster.store(0).shard_definition(&name).unwrap(), before);
        assert_eq!(cluster.store(0).segment_count(), 0);
    }

    #[tokio::test]
    async fn test_view_changed_discards_segment() {
        let cluster = LocalCluster::for_tests(1);
        let name = cluster.create_index("idx", 0, &[]).await.unwrap()[0].clone();
        write_keys(&cluster, &name, 0..10).await;
        let metadata = cluster.snapshot(0).await;
        let vmd = metadata.get(&name).unwrap();

        // another build commits first
        run(cluster.node(0), vmd, true, &TaskProgress::new())
            .await
            .unwrap();
        let progress = TaskProgress::new();
        let err = run(cluster.node(0), vmd, true, &progress).await.unwrap_err();
        assert!(matches!(err, OverflowError::ViewChanged(_)));
        assert_eq!(cluster.store(0).segment_count(), 1);
        assert!(progress.state() >= TaskState::Committing);
    }

    #[tokio::test]
    async fn test_cancelled_build_discards_segment() {
        let cluster = LocalCluster::for_tests(1);
        let name = cluster.create_index("idx", 0, &[]).await.unwrap()[0].clone();
        write_keys(&cluster, &name, 0..10).await;
        let metadata = cluster.snapshot(0).await;
        let before = cluster.store(0).shard_definition(&name).unwrap();

        let progress = TaskProgress::new();
        assert!(progress.cancel());
        let vmd = metadata.get(&name).unwrap();
        let err = run(cluster.node(0), vmd, false, &progress).await.unwrap_err();
        assert!(matches!(
            err,
            OverflowError::Common(spanstore_common::Error::Cancelled)
        ));
        assert_eq!(cluster.store(0).segment_count(), 0);
        assert_eq!(cluster.store(0).shard_definition(&name).unwrap(), before);
    }

    #[test]
    fn test_updated_sources_rejects_foreign_segments() {
        let name = ShardName::new("idx", 0);
        let live_journal = SourceRef::Journal(spanstore_common::ArtifactId::new());
        let old_journal = SourceRef::Journal(spanstore_common::ArtifactId::new());
        let seg = SourceRef::Segment(spanstore_common::ArtifactId::new());
        let foreign = SourceRef::Segment(spanstore_common::ArtifactId::new());
        let result = BuildResult {
            name: name.clone(),
            compacting: false,
            artifact: ArtifactMetadata {
                id: spanstore_common::ArtifactId::new(),
                kind: spanstore_common::ArtifactKind::Segment,
                path: "/tmp/x.seg".into(),
                commit_time: 1,
                byte_len: 0,
                entry_count: 0,
            },
            replaced: vec![old_journal],
        };
        let mut live = ShardDefinition::on_journal(name, KeyRange::full(), live_journal.id());
        live.sources.extend([old_journal, seg]);

        let sources = updated_sources(&live, &[old_journal, seg], &result).unwrap();
        assert_eq!(
            sources,
            vec![live_journal, SourceRef::Segment(result.artifact.id), seg]
        );

        live.sources.push(foreign);
        assert!(updated_sources(&live, &[old_journal, seg], &result).is_none());
    }
}
