use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShardError {
    #[error("world size must be positive")]
    ZeroWorldSize,
    #[error("invalid rank {rank}: world size is {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
}

/// Half-open index range `[start, end)` over the dataset owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub start: usize,
    pub end: usize,
}

impl Shard {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
    pub fn len(&self) -> usize {
        self.end - self.start
    }
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// How shard endpoints are derived from `total / world_size`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, clap::ValueEnum, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShardPolicy {
    /// Integer floor division; the last worker always ends at `total`.
    #[default]
    Exact,
    /// Floating point chunking, floored per endpoint, with the remainder only
    /// assigned to the out-of-band `rank == world_size` shard. The last
    /// worker may come up short when the float product rounds down.
    Literal,
}

/// Number of dataset elements taking part in the run. `None` means the whole
/// dataset; a bound larger than the dataset is clamped.
pub fn shorten(dataset_len: usize, top_n: Option<usize>) -> usize {
    match top_n {
        Some(n) => n.min(dataset_len),
        None => dataset_len,
    }
}

/// Computes the shard of `rank` over `total_size` elements.
///
/// `rank` may equal `world_size`, which addresses the remainder shard rather
/// than a worker. With a single worker the whole range is returned for any
/// rank.
pub fn plan_shard(
    total_size: usize,
    world_size: usize,
    rank: usize,
    policy: ShardPolicy,
) -> Result<Shard, ShardError> {
    if world_size == 0 {
        return Err(ShardError::ZeroWorldSize);
    }
    if world_size == 1 {
        return Ok(Shard::new(0, total_size));
    }
    if rank > world_size {
        return Err(ShardError::RankOutOfRange { rank, world_size });
    }
    let (start, end) = match policy {
        ShardPolicy::Literal => {
            let chunk_size = total_size as f64 / world_size as f64;
            let start = (rank as f64 * chunk_size) as usize;
            let end = if rank == world_size {
                total_size
            } else {
                ((rank + 1) as f64 * chunk_size) as usize
            };
            (start, end)
        }
        ShardPolicy::Exact => {
            let boundary =
                |r: usize| (r as u128 * total_size as u128 / world_size as u128) as usize;
            let start = boundary(rank);
            let end = if rank == world_size {
                total_size
            } else {
                boundary(rank + 1)
            };
            (start, end)
        }
    };
    let end = end.min(total_size);
    Ok(Shard::new(start.min(end), end))
}

/// Union of the shards of worker ranks `0..world_size`. Anything in
/// `[covered.end, total_size)` is never processed by a worker.
pub fn covered_range(
    total_size: usize,
    world_size: usize,
    policy: ShardPolicy,
) -> Result<Shard, ShardError> {
    let first = plan_shard(total_size, world_size, 0, policy)?;
    let last = plan_shard(total_size, world_size, world_size - 1, policy)?;
    Ok(Shard::new(first.start, last.end))
}

#[cfg(test)]
fn worker_shards(total: usize, world: usize, policy: ShardPolicy) -> Vec<Shard> {
    (0..world)
        .map(|r| plan_shard(total, world, r, policy).unwrap())
        .collect()
}

#[test]
fn test_four_way_split_of_ten() {
    let expected = vec![
        Shard::new(0, 2),
        Shard::new(2, 5),
        Shard::new(5, 7),
        Shard::new(7, 10),
    ];
    assert_eq!(worker_shards(10, 4, ShardPolicy::Literal), expected);
    assert_eq!(worker_shards(10, 4, ShardPolicy::Exact), expected);
}

#[test]
fn test_single_worker_gets_everything() {
    for policy in [ShardPolicy::Literal, ShardPolicy::Exact] {
        for rank in [0, 1, 7] {
            assert_eq!(plan_shard(13, 1, rank, policy), Ok(Shard::new(0, 13)));
        }
        assert_eq!(plan_shard(0, 1, 0, policy), Ok(Shard::new(0, 0)));
    }
}

#[test]
fn test_exact_policy_partitions_without_gaps() {
    for total in 0..64 {
        for world in 1..12 {
            let shards = worker_shards(total, world, ShardPolicy::Exact);
            let mut cursor = 0;
            for shard in &shards {
                assert_eq!(shard.start, cursor, "total={} world={}", total, world);
                cursor = shard.end;
            }
            assert_eq!(cursor, total, "total={} world={}", total, world);

            let min = shards.iter().map(Shard::len).min().unwrap();
            let max = shards.iter().map(Shard::len).max().unwrap();
            assert!(max - min <= 1, "total={} world={}", total, world);
        }
    }
}

#[test]
fn test_literal_policy_is_contiguous_and_remainder_closes_it() {
    for total in 0..64 {
        for world in 2..12 {
            let shards = worker_shards(total, world, ShardPolicy::Literal);
            let mut cursor = 0;
            for shard in &shards {
                assert_eq!(shard.start, cursor, "total={} world={}", total, world);
                cursor = shard.end;
            }
            assert!(cursor <= total);
            let remainder = plan_shard(total, world, world, ShardPolicy::Literal).unwrap();
            assert_eq!(remainder.start, cursor);
            assert_eq!(remainder.end, total);
        }
    }
}

#[test]
fn test_literal_policy_drops_trailing_element() {
    // 49 * (1.0 / 49.0) == 0.9999999999999999
    let covered = covered_range(1, 49, ShardPolicy::Literal).unwrap();
    assert_eq!(covered, Shard::new(0, 0));
    assert_eq!(
        plan_shard(1, 49, 48, ShardPolicy::Literal),
        Ok(Shard::new(0, 0))
    );
    assert_eq!(
        plan_shard(1, 49, 49, ShardPolicy::Literal),
        Ok(Shard::new(0, 1))
    );

    assert_eq!(
        plan_shard(1, 49, 48, ShardPolicy::Exact),
        Ok(Shard::new(0, 1))
    );
    assert_eq!(
        covered_range(1, 49, ShardPolicy::Exact).unwrap(),
        Shard::new(0, 1)
    );
    assert_eq!(
        plan_shard(1, 49, 49, ShardPolicy::Exact),
        Ok(Shard::new(1, 1))
    );
}

#[test]
fn test_invalid_arguments() {
    assert_eq!(
        plan_shard(10, 0, 0, ShardPolicy::Exact),
        Err(ShardError::ZeroWorldSize)
    );
    assert_eq!(
        plan_shard(10, 4, 5, ShardPolicy::Literal),
        Err(ShardError::RankOutOfRange {
            rank: 5,
            world_size: 4
        })
    );
}

#[test]
fn test_shorten() {
    assert_eq!(shorten(100, None), 100);
    assert_eq!(shorten(100, Some(64)), 64);
    assert_eq!(shorten(10, Some(64)), 10);
    assert_eq!(shorten(10, Some(0)), 0);
}

#[test]
fn test_policy_names() {
    use std::str::FromStr;
    assert_eq!(ShardPolicy::from_str("literal"), Ok(ShardPolicy::Literal));
    assert_eq!(ShardPolicy::Exact.to_string(), "exact");
}
