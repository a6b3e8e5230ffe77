/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Static description of the replicas that take part in consensus.

use super::{
    crypto_primitives::VerifyingKey,
    data_types::{ReplicaID, ViewNumber},
};

/// Stores the identities of the `N = 3F + 2C + 1` replicas of a cluster, the identity of the local
/// replica, and the quorum sizes derived from `F` and `C`.
///
/// ## Ordering of replicas
///
/// Replica `i` is identified by `ReplicaID::new(i)` and by the `i`-th verifying key passed to
/// [`new`](Self::new).
///
/// ## Primaries
///
/// The primary of view `v` is the replica with id `v mod N`.
#[derive(Clone, PartialEq)]
pub struct ReplicaSet {
    fault_bound: u16,
    redundancy: u16,
    my_id: ReplicaID,
    verifying_keys: Vec<VerifyingKey>,
}

/// The kinds of quorums used by the view-change protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumKind {
    /// `F + 1` replicas: any set this large contains at least one correct replica.
    Correct,

    /// `2F + C + 1` replicas: any two sets this large intersect in at least one correct replica.
    Strong,
}

impl ReplicaSet {
    /// Create a `ReplicaSet` with fault bound `fault_bound` (F), redundancy parameter `redundancy` (C),
    /// local replica `my_id`, and one verifying key per replica.
    ///
    /// # Errors
    ///
    /// Fails if `verifying_keys.len() != 3F + 2C + 1`, or if `my_id` is not one of the replicas.
    pub fn new(
        fault_bound: u16,
        redundancy: u16,
        my_id: ReplicaID,
        verifying_keys: Vec<VerifyingKey>,
    ) -> Result<Self, ReplicaSetError> {
        let expected = 3 * fault_bound as usize + 2 * redundancy as usize + 1;
        if verifying_keys.len() != expected {
            return Err(ReplicaSetError::InvalidReplicaCount {
                expected,
                actual: verifying_keys.len(),
            });
        }
        if my_id.index() >= verifying_keys.len() {
            return Err(ReplicaSetError::UnknownLocalReplica { my_id });
        }

        Ok(Self {
            fault_bound,
            redundancy,
            my_id,
            verifying_keys,
        })
    }

    /// Get the number of replicas (N).
    pub fn replica_count(&self) -> usize {
        self.verifying_keys.len()
    }

    /// Get the maximum number of Byzantine replicas tolerated (F).
    pub fn fault_bound(&self) -> u16 {
        self.fault_bound
    }

    /// Get the auxiliary redundancy parameter (C).
    pub fn redundancy(&self) -> u16 {
        self.redundancy
    }

    /// Get the id of the local replica.
    pub fn my_id(&self) -> ReplicaID {
        self.my_id
    }

    /// Check whether `replica` is the local replica.
    pub fn is_self(&self, replica: ReplicaID) -> bool {
        replica == self.my_id
    }

    /// Check whether `replica` is a member of the replica set.
    pub fn contains(&self, replica: ReplicaID) -> bool {
        replica.index() < self.verifying_keys.len()
    }

    /// Get the verifying key of `replica`, if it is a member of the replica set.
    pub fn verifying_key(&self, replica: ReplicaID) -> Option<&VerifyingKey> {
        self.verifying_keys.get(replica.index())
    }

    /// Iterate through the ids of all replicas in ascending order.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaID> {
        (0..self.verifying_keys.len() as u16).map(ReplicaID::new)
    }

    /// Compute how many distinct replicas form a quorum of the given `kind`.
    pub fn quorum_size(&self, kind: QuorumKind) -> usize {
        let f = self.fault_bound as usize;
        let c = self.redundancy as usize;
        match kind {
            QuorumKind::Correct => f + 1,
            QuorumKind::Strong => 2 * f + c + 1,
        }
    }

    /// Get the primary of `view`.
    pub fn primary_of_view(&self, view: ViewNumber) -> ReplicaID {
        ReplicaID::new((view.int() % self.verifying_keys.len() as u64) as u16)
    }

    /// Check whether the local replica is the primary of `view`.
    pub fn is_primary_of_view(&self, view: ViewNumber) -> bool {
        self.primary_of_view(view) == self.my_id
    }
}

/// Enumerates the ways constructing a [`ReplicaSet`] can fail.
#[derive(Debug)]
pub enum ReplicaSetError {
    /// The number of verifying keys is not `3F + 2C + 1`.
    InvalidReplicaCount { expected: usize, actual: usize },

    /// The local replica is not one of the replicas.
    UnknownLocalReplica { my_id: ReplicaID },
}
