use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::shard::Shard;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CollectError {
    #[error("incomplete results: ranks {missing:?} of world size {world_size} never reported")]
    Incomplete {
        missing: Vec<usize>,
        world_size: usize,
    },
    #[error("rank {rank} reported more than once")]
    DuplicateRank { rank: usize },
    #[error("invalid rank {rank}: world size is {world_size}")]
    UnknownRank { rank: usize, world_size: usize },
    #[error("rank {rank} produced {actual} outputs for shard {shard}")]
    ShardSizeMismatch {
        rank: usize,
        shard: Shard,
        actual: usize,
    },
    #[error("rank {rank} shard {shard} overlaps the shard of a lower rank ending at {previous_end}")]
    OverlappingShard {
        rank: usize,
        shard: Shard,
        previous_end: usize,
    },
    #[error("rank {rank} shard {shard} leaves a gap: expected it to start at {expected_start}")]
    ShardGap {
        rank: usize,
        shard: Shard,
        expected_start: usize,
    },
    #[error("result collection already closed")]
    Closed,
}

/// Outputs of one rank, in shard order. Written once by its producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub rank: usize,
    pub shard: Shard,
    pub outputs: Vec<String>,
}

impl ResultEntry {
    pub fn new(rank: usize, shard: Shard, outputs: Vec<String>) -> Self {
        Self {
            rank,
            shard,
            outputs,
        }
    }
}

/// All rank outputs stitched back into dataset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResults {
    outputs: Vec<String>,
    covered: Option<Shard>,
}

impl CollectedResults {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }
    pub fn into_outputs(self) -> Vec<String> {
        self.outputs
    }
    /// Dataset range spanned by the reporting ranks, `None` when no rank
    /// reported anything.
    pub fn covered(&self) -> Option<Shard> {
        self.covered
    }
}

/// Producer side of a [`ResultCollector`]. Dropping every sender is what
/// opens the completion barrier.
#[derive(Clone)]
pub struct ResultSender {
    inner: mpsc::UnboundedSender<ResultEntry>,
}

impl ResultSender {
    pub fn submit(&self, entry: ResultEntry) -> Result<(), CollectError> {
        self.inner.send(entry).map_err(|_| CollectError::Closed)
    }
}

pub struct ResultCollector {
    world_size: usize,
    sender: ResultSender,
    receiver: mpsc::UnboundedReceiver<ResultEntry>,
}

impl ResultCollector {
    pub fn new(world_size: usize) -> Self {
        let (s, r) = mpsc::unbounded_channel();
        Self {
            world_size,
            sender: ResultSender { inner: s },
            receiver: r,
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn sender(&self) -> ResultSender {
        self.sender.clone()
    }

    /// Waits until every producer has dropped its sender, then assembles the
    /// received entries.
    pub async fn collect(self) -> Result<CollectedResults, CollectError> {
        let Self {
            world_size,
            sender,
            mut receiver,
        } = self;
        drop(sender);
        let mut snapshot = Vec::with_capacity(world_size);
        while let Some(entry) = receiver.recv().await {
            tracing::debug!(
                "received rank {} outputs:{} shard:{}",
                entry.rank,
                entry.outputs.len(),
                entry.shard
            );
            snapshot.push(entry);
        }
        assemble(snapshot, world_size)
    }
}

/// Sorts a post-barrier snapshot by rank, checks that every rank in
/// `0..world_size` reported exactly once with a full shard and that the
/// shards tile one range starting at 0, and concatenates the outputs.
pub fn assemble(
    mut entries: Vec<ResultEntry>,
    world_size: usize,
) -> Result<CollectedResults, CollectError> {
    entries.sort_by_key(|e| e.rank);

    let mut seen = vec![false; world_size];
    for entry in &entries {
        if entry.rank >= world_size {
            return Err(CollectError::UnknownRank {
                rank: entry.rank,
                world_size,
            });
        }
        if seen[entry.rank] {
            return Err(CollectError::DuplicateRank { rank: entry.rank });
        }
        seen[entry.rank] = true;
        if entry.outputs.len() != entry.shard.len() {
            return Err(CollectError::ShardSizeMismatch {
                rank: entry.rank,
                shard: entry.shard,
                actual: entry.outputs.len(),
            });
        }
    }
    let missing: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, seen)| !**seen)
        .map(|(rank, _)| rank)
        .collect();
    if !missing.is_empty() {
        return Err(CollectError::Incomplete {
            missing,
            world_size,
        });
    }

    // output i must stay dataset element i
    let mut expected_start = 0;
    for entry in &entries {
        if entry.shard.start < expected_start {
            return Err(CollectError::OverlappingShard {
                rank: entry.rank,
                shard: entry.shard,
                previous_end: expected_start,
            });
        }
        if entry.shard.start > expected_start {
            return Err(CollectError::ShardGap {
                rank: entry.rank,
                shard: entry.shard,
                expected_start,
            });
        }
        expected_start = entry.shard.end;
    }

    let covered = match (entries.first(), entries.last()) {
        (Some(first), Some(last)) => Some(Shard::new(first.shard.start, last.shard.end)),
        _ => None,
    };
    let total = entries.iter().map(|e| e.outputs.len()).sum();
    let mut outputs = Vec::with_capacity(total);
    for entry in entries {
        outputs.extend(entry.outputs);
    }
    Ok(CollectedResults { outputs, covered })
}

#[cfg(test)]
fn entry(rank: usize, start: usize, outputs: &[&str]) -> ResultEntry {
    ResultEntry::new(
        rank,
        Shard::new(start, start + outputs.len()),
        outputs.iter().map(|s| s.to_string()).collect(),
    )
}

#[test]
fn test_assemble_restores_rank_order() {
    let entries = vec![entry(2, 2, &["c"]), entry(0, 0, &["a"]), entry(1, 1, &["b"])];
    let collected = assemble(entries, 3).unwrap();
    assert_eq!(collected.outputs(), &["a", "b", "c"]);
    assert_eq!(collected.covered(), Some(Shard::new(0, 3)));
}

#[test]
fn test_assemble_is_idempotent_on_sorted_input() {
    let entries = vec![
        entry(0, 0, &["a", "b"]),
        entry(1, 2, &["c"]),
        entry(2, 3, &["d", "e"]),
    ];
    let first = assemble(entries.clone(), 3).unwrap();
    let second = assemble(entries, 3).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.into_outputs(), vec!["a", "b", "c", "d", "e"]);
}

#[test]
fn test_missing_rank_is_fatal() {
    let entries = vec![entry(0, 0, &["a"]), entry(2, 2, &["c"])];
    assert_eq!(
        assemble(entries, 3),
        Err(CollectError::Incomplete {
            missing: vec![1],
            world_size: 3
        })
    );
    assert_eq!(
        assemble(Vec::new(), 2),
        Err(CollectError::Incomplete {
            missing: vec![0, 1],
            world_size: 2
        })
    );
}

#[test]
fn test_duplicate_and_unknown_ranks() {
    let entries = vec![entry(0, 0, &["a"]), entry(0, 0, &["a"])];
    assert_eq!(
        assemble(entries, 2),
        Err(CollectError::DuplicateRank { rank: 0 })
    );
    let entries = vec![entry(0, 0, &["a"]), entry(3, 1, &["b"])];
    assert_eq!(
        assemble(entries, 2),
        Err(CollectError::UnknownRank {
            rank: 3,
            world_size: 2
        })
    );
}

#[test]
fn test_short_shard_is_rejected() {
    let mut short = entry(1, 2, &["c", "d"]);
    short.outputs.pop();
    let entries = vec![entry(0, 0, &["a", "b"]), short];
    assert!(matches!(
        assemble(entries, 2),
        Err(CollectError::ShardSizeMismatch {
            rank: 1,
            actual: 1,
            ..
        })
    ));
}

#[test]
fn test_overlapping_shards_are_rejected() {
    let entries = vec![entry(0, 0, &["a", "b"]), entry(1, 1, &["b", "c"])];
    assert!(matches!(
        assemble(entries, 2),
        Err(CollectError::OverlappingShard { rank: 1, .. })
    ));
}

#[test]
fn test_shard_gaps_are_rejected() {
    let entries = vec![entry(0, 0, &["a"]), entry(1, 5, &["f"])];
    assert_eq!(
        assemble(entries, 2),
        Err(CollectError::ShardGap {
            rank: 1,
            shard: Shard::new(5, 6),
            expected_start: 1,
        })
    );
    let entries = vec![entry(0, 2, &["c"]), entry(1, 3, &["d"])];
    assert!(matches!(
        assemble(entries, 2),
        Err(CollectError::ShardGap {
            rank: 0,
            expected_start: 0,
            ..
        })
    ));
    // empty shards are contiguous with their neighbours
    let entries = vec![entry(0, 0, &[]), entry(1, 0, &["a"]), entry(2, 1, &[])];
    assert_eq!(assemble(entries, 3).unwrap().covered(), Some(Shard::new(0, 1)));
}

#[tokio::test]
async fn test_collect_waits_for_all_producers() {
    let collector = ResultCollector::new(3);
    let mut handles = Vec::new();
    for (rank, text) in [(2, "c"), (0, "a"), (1, "b")] {
        let sender = collector.sender();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10 * rank as u64)).await;
            sender.submit(entry(rank, rank, &[text]))
        }));
    }
    let collected = collector.collect().await.unwrap();
    assert_eq!(collected.outputs(), &["a", "b", "c"]);
    for h in handles {
        h.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_collect_reports_failed_producer() {
    let collector = ResultCollector::new(2);
    let sender = collector.sender();
    sender.submit(entry(0, 0, &["a"])).unwrap();
    // rank 1 gives up without reporting
    drop(collector.sender());
    drop(sender);
    assert!(matches!(
        collector.collect().await,
        Err(CollectError::Incomplete { .. })
    ));
}
