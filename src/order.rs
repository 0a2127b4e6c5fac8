//! Per-epoch iteration order.
//!
//! With shuffling in a multi-process run, every process seeds its permutation
//! with `epoch * world_size + rank`: restarts reproduce the same order while
//! replicas in the same epoch see different orders.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{info, warn};

/// Position of this process in a multi-process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedContext {
    pub world_size: usize,
    pub rank: usize,
}

impl DistributedContext {
    pub fn new(world_size: usize, rank: usize) -> Self {
        Self { world_size, rank }
    }

    /// Read `WORLD_SIZE` and `RANK` as exported by the process launcher.
    /// Returns `None` when either is missing or malformed.
    pub fn from_env() -> Option<Self> {
        Self::from_vars(
            std::env::var("WORLD_SIZE").ok().as_deref(),
            std::env::var("RANK").ok().as_deref(),
        )
    }

    fn from_vars(world_size: Option<&str>, rank: Option<&str>) -> Option<Self> {
        let (world_size, rank) = (world_size?, rank?);
        match (world_size.trim().parse::<usize>(), rank.trim().parse::<usize>()) {
            (Ok(world_size), Ok(rank)) if world_size > 0 && rank < world_size => {
                Some(Self::new(world_size, rank))
            }
            _ => {
                warn!("ignoring malformed WORLD_SIZE={world_size:?} RANK={rank:?}");
                None
            }
        }
    }

    /// Shuffle seed for `epoch`.
    pub fn seed(&self, epoch: i64) -> u64 {
        epoch
            .wrapping_mul(self.world_size as i64)
            .wrapping_add(self.rank as i64) as u64
    }
}

/// Produces the index order of each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingPolicy {
    pub shuffle: bool,
    pub distributed: Option<DistributedContext>,
}

impl OrderingPolicy {
    pub fn new(shuffle: bool, distributed: Option<DistributedContext>) -> Self {
        Self {
            shuffle,
            distributed,
        }
    }

    /// Policy for this process, detecting the distributed context from the
    /// environment.
    pub fn detect(shuffle: bool) -> Self {
        Self::new(shuffle, DistributedContext::from_env())
    }

    /// A permutation of `0..total` for `epoch`.
    pub fn order(&self, epoch: i64, total: usize) -> Vec<usize> {
        if !self.shuffle {
            return (0..total).collect();
        }

        let mut rng = match self.distributed {
            Some(ctx) => {
                info!(
                    "multi-process shuffle: epoch {epoch}, rank {} of {}",
                    ctx.rank, ctx.world_size
                );
                StdRng::seed_from_u64(ctx.seed(epoch))
            }
            None => {
                info!("single-process shuffle");
                StdRng::from_entropy()
            }
        };
        permutation(total, &mut rng)
    }
}

/// Shuffled `0..total` drawn from `rng`.
pub fn permutation<R: rand::Rng + ?Sized>(total: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(rng);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(world_size: usize, rank: usize) -> OrderingPolicy {
        OrderingPolicy::new(true, Some(DistributedContext::new(world_size, rank)))
    }

    #[test]
    fn test_identity_without_shuffle() {
        let policy = OrderingPolicy::new(false, Some(DistributedContext::new(4, 2)));
        assert_eq!(policy.order(5, 6), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_same_epoch_and_rank_is_reproducible() {
        let a = policy(4, 2).order(5, 100);
        let b = policy(4, 2).order(5, 100);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_ranks_and_epochs_differ() {
        let rank2 = policy(4, 2).order(5, 100);
        let rank3 = policy(4, 3).order(5, 100);
        assert_ne!(rank2, rank3);

        let next_epoch = policy(4, 2).order(6, 100);
        assert_ne!(rank2, next_epoch);
    }

    #[test]
    fn test_seed() {
        assert_eq!(DistributedContext::new(4, 2).seed(5), 22);
        // Before the first epoch is set the epoch is -1.
        assert_eq!(DistributedContext::new(4, 3).seed(-1), (-1i64) as u64);
    }

    #[test]
    fn test_single_process_shuffle_is_permutation() {
        let order = OrderingPolicy::new(true, None).order(0, 50);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_from_vars() {
        assert_eq!(
            DistributedContext::from_vars(Some("8"), Some("3")),
            Some(DistributedContext::new(8, 3))
        );
        assert_eq!(DistributedContext::from_vars(Some("8"), None), None);
        assert_eq!(DistributedContext::from_vars(Some("x"), Some("0")), None);
        assert_eq!(DistributedContext::from_vars(Some("2"), Some("2")), None);
    }
}
