//! Cursor Tracker
//!
//! Per-session bookkeeping of what was delivered and what was acknowledged on
//! each assigned partition.
//!
//! ## Cursors
//!
//! - **delivered**: offset of the last event pushed to the client
//! - **committed**: offset of the last event the client acknowledged
//!
//! `committed <= delivered` always holds: a commit above the delivered cursor
//! is rejected as `OffsetNotDelivered`.
//!
//! ## Backpressure Signal
//!
//! Every partition publishes its *acknowledged position* (the first offset not
//! yet committed) on a `watch` channel. The partition's puller compares it with
//! its own read position and suspends once the difference reaches
//! `max_uncommitted_events`; a commit moves the position and wakes it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use substream_core::Partition;
use tokio::sync::watch;

/// Why a commit cursor was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCursorReason {
    /// The session does not own the partition (anymore)
    PartitionNotAssigned,
    /// The offset is above what was delivered to the session
    OffsetNotDelivered,
}

impl InvalidCursorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidCursorReason::PartitionNotAssigned => "partition_not_assigned",
            InvalidCursorReason::OffsetNotDelivered => "offset_not_delivered",
        }
    }
}

/// Outcome of one commit cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// At or below the committed cursor; nothing changed
    Outdated,
    InvalidCursor(InvalidCursorReason),
}

struct PartitionCursor {
    delivered: Option<u64>,
    committed: Option<u64>,
    acked_tx: watch::Sender<u64>,
    uncommitted_since: Option<Instant>,
}

impl PartitionCursor {
    fn has_uncommitted(&self) -> bool {
        match (self.delivered, self.committed) {
            (Some(d), Some(c)) => d > c,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Default)]
pub struct CursorTracker {
    partitions: BTreeMap<Partition, PartitionCursor>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a partition.
    ///
    /// `committed` is the durable committed offset (if any) and `start` the
    /// first offset the puller will read.
    ///
    /// # Returns
    ///
    /// Receiver of the acknowledged position, for the partition's puller.
    pub fn assign(
        &mut self,
        partition: Partition,
        committed: Option<u64>,
        start: u64,
    ) -> watch::Receiver<u64> {
        let (acked_tx, acked_rx) = watch::channel(start);
        self.partitions.insert(
            partition,
            PartitionCursor {
                delivered: committed,
                committed,
                acked_tx,
                uncommitted_since: None,
            },
        );
        acked_rx
    }

    /// Stop tracking a partition, discarding its in-memory state
    pub fn release(&mut self, partition: &Partition) -> bool {
        self.partitions.remove(partition).is_some()
    }

    pub fn is_assigned(&self, partition: &Partition) -> bool {
        self.partitions.contains_key(partition)
    }

    pub fn assigned(&self) -> Vec<Partition> {
        self.partitions.keys().cloned().collect()
    }

    /// Record that events up to `offset` were pushed to the client
    pub fn mark_delivered(&mut self, partition: &Partition, offset: u64) {
        if let Some(cursor) = self.partitions.get_mut(partition) {
            cursor.delivered = Some(cursor.delivered.map_or(offset, |d| d.max(offset)));
            if cursor.uncommitted_since.is_none() && cursor.has_uncommitted() {
                cursor.uncommitted_since = Some(Instant::now());
            }
        }
    }

    /// Classify a commit cursor without changing anything.
    ///
    /// `Committed` here means the cursor is acceptable; the caller persists it
    /// and then calls `apply_commit`.
    pub fn check_commit(&self, partition: &Partition, offset: u64) -> CommitOutcome {
        let Some(cursor) = self.partitions.get(partition) else {
            return CommitOutcome::InvalidCursor(InvalidCursorReason::PartitionNotAssigned);
        };

        match cursor.delivered {
            Some(delivered) if offset <= delivered => {}
            _ => return CommitOutcome::InvalidCursor(InvalidCursorReason::OffsetNotDelivered),
        }

        match cursor.committed {
            Some(committed) if offset <= committed => CommitOutcome::Outdated,
            _ => CommitOutcome::Committed,
        }
    }

    /// Apply a durably stored commit. Never moves the committed cursor back.
    pub fn apply_commit(&mut self, partition: &Partition, offset: u64) {
        let Some(cursor) = self.partitions.get_mut(partition) else {
            return;
        };
        if cursor.committed.is_some_and(|c| c >= offset) {
            return;
        }

        cursor.committed = Some(offset);
        cursor.acked_tx.send_if_modified(|acked| {
            if offset + 1 > *acked {
                *acked = offset + 1;
                true
            } else {
                false
            }
        });
        cursor.uncommitted_since = if cursor.has_uncommitted() {
            Some(Instant::now())
        } else {
            None
        };
    }

    /// A partition whose delivered events stayed uncommitted for `timeout`
    pub fn commit_overdue(&self, timeout: Duration) -> Option<&Partition> {
        self.partitions.iter().find_map(|(partition, cursor)| {
            cursor
                .uncommitted_since
                .filter(|since| since.elapsed() >= timeout)
                .map(|_| partition)
        })
    }
}
