//! Per-shard activity scores
//!
//! Each cycle the cumulative write counters of every shard are diffed
//! against the mark taken by the previous cycle. The resulting activity is
//! normalized across the node and ranked; the move heuristics prefer shards
//! with a high normalized rank.

use parking_lot::Mutex;
use serde::Serialize;
use spanstore_common::ShardName;
use spanstore_storage::WriteCounters;
use std::collections::HashMap;

/// Activity score of one shard for one cycle
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Score {
    pub name: ShardName,
    /// Activity since the previous mark
    pub activity: WriteCounters,
    /// Tuple writes since the previous mark
    pub raw: u64,
    /// `raw` as a fraction of all writes on the node
    pub score: f64,
    /// Ascending position by score, ties broken by name
    pub rank: usize,
    /// `rank` normalized to [0, 1]
    pub drank: f64,
}

impl Score {
    /// Ratio of appends to new-key inserts, zero without new keys
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn append_ratio(&self) -> f64 {
        if self.activity.new_keys == 0 {
            0.0
        } else {
            self.activity.appends as f64 / self.activity.new_keys as f64
        }
    }
}

/// Rank shards by their activity
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rank(activity: HashMap<ShardName, WriteCounters>) -> HashMap<ShardName, Score> {
    let total: u64 = activity.values().map(WriteCounters::writes).sum();
    let mut scores: Vec<Score> = activity
        .into_iter()
        .map(|(name, activity)| {
            let raw = activity.writes();
            Score {
                name,
                activity,
                raw,
                score: if total == 0 {
                    0.0
                } else {
                    raw as f64 / total as f64
                },
                rank: 0,
                drank: 0.0,
            }
        })
        .collect();
    scores.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.name.cmp(&b.name)));

    let n = scores.len();
    scores
        .into_iter()
        .enumerate()
        .map(|(rank, mut score)| {
            score.rank = rank;
            score.drank = if n == 1 {
                1.0
            } else {
                rank as f64 / (n - 1) as f64
            };
            (score.name.clone(), score)
        })
        .collect()
}

/// Marks of the cumulative counters taken at each cycle
#[derive(Default)]
pub struct ScoreBoard {
    marks: Mutex<HashMap<ShardName, WriteCounters>>,
}

impl ScoreBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Score every shard by its activity since the previous mark and move
    /// the mark to `current`. Shards missing from `current` are forgotten.
    pub fn mark_and_score(
        &self,
        current: &HashMap<ShardName, WriteCounters>,
    ) -> HashMap<ShardName, Score> {
        let mut marks = self.marks.lock();
        let activity = current
            .iter()
            .map(|(name, now)| {
                let delta = marks.get(name).map_or(*now, |mark| now.since(mark));
                (name.clone(), delta)
            })
            .collect();
        marks.clone_from(current);
        rank(activity)
    }
}
