//! Shared cache-domain vote aggregation
//!
//! Guarded by a spinlock distinct from the scaling lock so that idle-path
//! callers, which never take the scaling lock, can still vote.

use crate::table::DomainLevelId;
use spin::Mutex;

/// Per-core votes and the level the shared domain runs at
#[derive(Debug, Clone)]
pub struct SharedDomain {
    votes: Vec<DomainLevelId>,
    current: DomainLevelId,
}

impl SharedDomain {
    pub fn votes(&self) -> &[DomainLevelId] {
        &self.votes
    }

    pub fn current(&self) -> DomainLevelId {
        self.current
    }

    /// Highest-ranked vote; ties resolve to the first match
    pub fn maximum(&self) -> DomainLevelId {
        self.votes
            .iter()
            .copied()
            .fold(DomainLevelId(0), |max, vote| if vote > max { vote } else { max })
    }
}

/// Vote aggregator for the shared domain
pub struct DomainVoteAggregator {
    inner: Mutex<SharedDomain>,
}

impl DomainVoteAggregator {
    /// Every core starts out voting for `initial`, which is also the level
    /// the shared domain was brought up at.
    pub fn new(cores: usize, initial: DomainLevelId) -> Self {
        Self {
            inner: Mutex::new(SharedDomain {
                votes: vec![initial; cores],
                current: initial,
            }),
        }
    }

    /// Record `cpu`'s vote and move the shared domain to the new maximum.
    ///
    /// `apply(from, to)` runs under the vote lock, so the switch and the
    /// vote are one atomic unit; it is only called when the level changes.
    /// It must not block.
    pub fn record_vote<F>(&self, cpu: usize, vote: DomainLevelId, apply: F) -> DomainLevelId
    where
        F: FnOnce(DomainLevelId, DomainLevelId),
    {
        let mut shared = self.inner.lock();
        shared.votes[cpu] = vote;

        let target = shared.maximum();
        if target != shared.current {
            apply(shared.current, target);
            shared.current = target;
        }
        target
    }

    pub fn current(&self) -> DomainLevelId {
        self.inner.lock().current
    }

    pub fn vote_of(&self, cpu: usize) -> DomainLevelId {
        self.inner.lock().votes[cpu]
    }

    pub fn snapshot(&self) -> SharedDomain {
        self.inner.lock().clone()
    }
}
