//! Coordination Record Types
//!
//! Records shared by every broker process through the coordination store.
//!
//! ## Types Overview
//!
//! ### SessionRecord
//! One live streaming session of a subscription, registered by the broker
//! process that owns the client connection and kept alive by heartbeats.
//!
//! ### AssignmentRecord
//! The partition-to-session ownership map of a subscription, stamped with the
//! rebalance generation that produced it. Stored as a `Versioned` value and
//! only replaced through conditional writes.
//!
//! ## Design Decisions
//!
//! - All types are Serialize/Deserialize so any consistent KV store can hold them
//! - Timestamps are i64 (milliseconds since epoch)
//! - `version` (store-level optimistic concurrency) and `generation`
//!   (rebalance fencing token) are separate counters: a version bumps on every
//!   write, a generation only when ownership or membership changes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use substream_core::{Partition, SessionId};

/// Registration of one live session.
///
/// # Lifecycle
///
/// 1. **Admission**: the streamer registers the session before its first rebalance
/// 2. **Heartbeat**: the streamer refreshes `last_heartbeat` periodically
/// 3. **Liveness**: sessions whose heartbeat is older than the store's TTL are not listed
/// 4. **Teardown**: the streamer deregisters the session when the stream ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier
    pub session_id: SessionId,

    /// Broker process that owns the client connection
    pub broker_id: String,

    /// Authenticated client identity
    pub client_id: String,

    /// Session creation timestamp (milliseconds since Unix epoch)
    pub created_at: i64,

    /// Last heartbeat timestamp (milliseconds since Unix epoch)
    pub last_heartbeat: i64,
}

/// Owner of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwner {
    pub session_id: SessionId,
    pub broker_id: String,
}

/// Partition ownership for a whole subscription.
///
/// # Generation
///
/// The generation increments on every rebalance that changes membership or
/// ownership. Sessions remember the generation they last acted on and ignore
/// any record with an older one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// Rebalance generation (fencing token)
    pub generation: u64,

    /// Live sessions the assignment was computed for, sorted
    pub members: Vec<SessionId>,

    /// partition -> owner
    #[serde(with = "owners_as_list")]
    pub owners: BTreeMap<Partition, PartitionOwner>,
}

impl AssignmentRecord {
    /// Current owner of a partition, if any
    pub fn owner_of(&self, partition: &Partition) -> Option<&PartitionOwner> {
        self.owners.get(partition)
    }

    /// Partitions owned by a session, sorted
    pub fn partitions_of(&self, session_id: &SessionId) -> Vec<Partition> {
        self.owners
            .iter()
            .filter(|(_, owner)| owner.session_id == *session_id)
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    /// Number of partitions held by each member (members without partitions count 0)
    pub fn partition_counts(&self) -> BTreeMap<SessionId, usize> {
        let mut counts: BTreeMap<SessionId, usize> =
            self.members.iter().map(|id| (*id, 0)).collect();
        for owner in self.owners.values() {
            *counts.entry(owner.session_id).or_insert(0) += 1;
        }
        counts
    }
}

/// A value together with the store version it was read at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Store version (0 = never written)
    pub version: u64,
    pub value: T,
}

// JSON maps need string keys; owners are stored as a list of pairs instead.
mod owners_as_list {
    use super::PartitionOwner;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use substream_core::Partition;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        partition: Partition,
        owner: PartitionOwner,
    }

    pub fn serialize<S: Serializer>(
        owners: &BTreeMap<Partition, PartitionOwner>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = owners
            .iter()
            .map(|(partition, owner)| Entry {
                partition: partition.clone(),
                owner: owner.clone(),
            })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Partition, PartitionOwner>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.partition, entry.owner))
            .collect())
    }
}
