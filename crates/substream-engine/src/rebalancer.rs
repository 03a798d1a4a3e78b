//! Partition Rebalancer
//!
//! Computes the partition-to-session assignment of a subscription from the
//! current assignment, the live sessions and the partition set.
//!
//! ## Properties
//!
//! - **Deterministic**: the same inputs always produce the same assignment,
//!   whichever broker computes it. Sessions and partitions are sorted by id.
//! - **Complete**: every partition has exactly one owner when at least one
//!   session is live.
//! - **Balanced**: owned partition counts differ by at most one.
//! - **Sticky**: a session keeps the partitions it already owns as far as the
//!   balance bound allows.
//!
//! ## Algorithm
//!
//! ```text
//! quota(s)  = P / N, plus one for the first P % N sessions ordered by
//!             (currently owned desc, session id)
//! phase 1:  each session keeps min(owned, quota) of its current partitions
//! phase 2:  freed, new and orphaned partitions go to the least-loaded session
//!           still under quota (ties by session id)
//! ```
//!
//! The resulting record carries generation G+1 and is written by the
//! assignment manager through a conditional write.

use std::collections::{BTreeMap, BTreeSet};
use substream_coordination::{AssignmentRecord, PartitionOwner, SessionRecord};
use substream_core::{Partition, SessionId};
use tracing::debug;

/// A single partition changing owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMovement {
    pub partition: Partition,
    /// Previous owner, `None` when the partition was unowned
    pub from: Option<SessionId>,
    pub to: SessionId,
}

/// Result of a rebalance computation
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    /// The assignment to write (generation already bumped)
    pub record: AssignmentRecord,
    pub movements: Vec<PartitionMovement>,
    pub partitions_unchanged: usize,
}

impl RebalancePlan {
    pub fn movement_count(&self) -> usize {
        self.movements.len()
    }
}

pub struct Rebalancer;

impl Rebalancer {
    /// Whether `current` no longer fits the live sessions or the partition set.
    ///
    /// True when the membership differs, a partition is unowned or owned by a
    /// dead session, an owned partition no longer exists, or the counts are
    /// out of balance.
    pub fn needs_rebalance(
        current: &AssignmentRecord,
        live_sessions: &[SessionRecord],
        partitions: &[Partition],
    ) -> bool {
        let live: BTreeSet<SessionId> = live_sessions.iter().map(|s| s.session_id).collect();
        let members: BTreeSet<SessionId> = current.members.iter().copied().collect();
        if live != members {
            return true;
        }
        if live.is_empty() {
            return !current.owners.is_empty();
        }

        let expected: BTreeSet<&Partition> = partitions.iter().collect();
        if current.owners.len() != expected.len()
            || current.owners.keys().any(|p| !expected.contains(p))
        {
            return true;
        }
        if current
            .owners
            .values()
            .any(|owner| !live.contains(&owner.session_id))
        {
            return true;
        }

        let counts = current.partition_counts();
        let max = counts.values().copied().max().unwrap_or(0);
        let min = counts.values().copied().min().unwrap_or(0);
        max - min > 1
    }

    /// Compute the next assignment
    pub fn compute(
        current: &AssignmentRecord,
        live_sessions: &[SessionRecord],
        partitions: &[Partition],
    ) -> RebalancePlan {
        let mut sessions: Vec<&SessionRecord> = live_sessions.iter().collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions.dedup_by_key(|s| s.session_id);

        let mut partitions: Vec<Partition> = partitions.to_vec();
        partitions.sort();
        partitions.dedup();

        let members: Vec<SessionId> = sessions.iter().map(|s| s.session_id).collect();
        let brokers: BTreeMap<SessionId, &str> = sessions
            .iter()
            .map(|s| (s.session_id, s.broker_id.as_str()))
            .collect();

        if sessions.is_empty() {
            return RebalancePlan {
                record: AssignmentRecord {
                    generation: current.generation + 1,
                    members,
                    owners: BTreeMap::new(),
                },
                movements: Vec::new(),
                partitions_unchanged: 0,
            };
        }

        // Current ownership restricted to live sessions and existing partitions
        let mut owned: BTreeMap<SessionId, Vec<Partition>> =
            members.iter().map(|id| (*id, Vec::new())).collect();
        for partition in &partitions {
            if let Some(owner) = current.owner_of(partition) {
                if let Some(list) = owned.get_mut(&owner.session_id) {
                    list.push(partition.clone());
                }
            }
        }

        let quotas = Self::quotas(&owned, partitions.len());

        // Phase 1: keep existing ownership up to quota
        let mut assignment: BTreeMap<Partition, SessionId> = BTreeMap::new();
        let mut load: BTreeMap<SessionId, usize> = members.iter().map(|id| (*id, 0)).collect();
        for (session_id, list) in &owned {
            let quota = quotas.get(session_id).copied().unwrap_or(0);
            for partition in list.iter().take(quota) {
                assignment.insert(partition.clone(), *session_id);
                *load.entry(*session_id).or_default() += 1;
            }
        }

        // Phase 2: orphans to the least-loaded session under quota
        for partition in &partitions {
            if assignment.contains_key(partition) {
                continue;
            }
            let target = load
                .iter()
                .filter(|(id, count)| **count < quotas.get(*id).copied().unwrap_or(0))
                .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
                .map(|(id, _)| *id);

            if let Some(session_id) = target {
                *load.entry(session_id).or_default() += 1;
                assignment.insert(partition.clone(), session_id);
            }
        }

        let mut movements = Vec::new();
        let mut partitions_unchanged = 0;
        let mut owners = BTreeMap::new();
        for (partition, session_id) in assignment {
            let previous = current.owner_of(&partition).map(|o| o.session_id);
            if previous == Some(session_id) {
                partitions_unchanged += 1;
            } else {
                movements.push(PartitionMovement {
                    partition: partition.clone(),
                    from: previous,
                    to: session_id,
                });
            }
            owners.insert(
                partition,
                PartitionOwner {
                    session_id,
                    broker_id: brokers.get(&session_id).copied().unwrap_or_default().to_string(),
                },
            );
        }

        debug!(
            generation = current.generation + 1,
            sessions = members.len(),
            partitions = partitions.len(),
            movements = movements.len(),
            unchanged = partitions_unchanged,
            "Computed rebalance plan"
        );

        RebalancePlan {
            record: AssignmentRecord {
                generation: current.generation + 1,
                members,
                owners,
            },
            movements,
            partitions_unchanged,
        }
    }

    /// Target partition count per session
    fn quotas(
        owned: &BTreeMap<SessionId, Vec<Partition>>,
        partition_count: usize,
    ) -> BTreeMap<SessionId, usize> {
        let sessions = owned.len();
        let base = partition_count / sessions;
        let extra = partition_count % sessions;

        let mut order: Vec<(&SessionId, usize)> =
            owned.iter().map(|(id, list)| (id, list.len())).collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        order
            .into_iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, if i < extra { base + 1 } else { base }))
            .collect()
    }
}
