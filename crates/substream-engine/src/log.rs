//! Partitioned event log interface
//!
//! The engine reads events through [`EventLog`]; storage, retention and the
//! on-disk format live behind it. Offsets within a partition start at 0 and
//! are dense. Retention may drop a prefix, which moves `earliest_offset`
//! forward.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use substream_core::{Event, Partition};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(Partition),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Read up to `max` events starting at `from` (inclusive).
    ///
    /// Returns an empty vector when no event at or after `from` exists yet.
    async fn read(&self, partition: &Partition, from: u64, max: usize)
        -> Result<Vec<Event>, LogError>;

    /// Oldest offset still retained (the next offset to be written when empty)
    async fn earliest_offset(&self, partition: &Partition) -> Result<u64, LogError>;
}

#[derive(Default)]
struct PartitionLog {
    /// Offset of `events[0]`
    start: u64,
    events: Vec<Event>,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.start + self.events.len() as u64
    }
}

/// In-memory event log. Partitions are created on first append.
#[derive(Default)]
pub struct InMemoryEventLog {
    partitions: RwLock<HashMap<Partition, PartitionLog>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event, returning its offset
    pub async fn append(&self, partition: &Partition, payload: Bytes) -> u64 {
        let mut partitions = self.partitions.write().await;
        let log = partitions.entry(partition.clone()).or_default();
        let offset = log.next_offset();
        log.events
            .push(Event::new(offset, current_timestamp_ms(), payload));
        offset
    }

    /// Drop every event below `offset` (retention)
    pub async fn truncate_before(&self, partition: &Partition, offset: u64) {
        let mut partitions = self.partitions.write().await;
        let log = partitions.entry(partition.clone()).or_default();
        if offset <= log.start {
            return;
        }
        let drop = ((offset - log.start) as usize).min(log.events.len());
        log.events.drain(..drop);
        log.start += drop as u64;
        if log.events.is_empty() {
            log.start = log.start.max(offset);
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn read(
        &self,
        partition: &Partition,
        from: u64,
        max: usize,
    ) -> Result<Vec<Event>, LogError> {
        let partitions = self.partitions.read().await;
        let Some(log) = partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let from = from.max(log.start);
        let skip = (from - log.start) as usize;
        Ok(log.events.iter().skip(skip).take(max).cloned().collect())
    }

    async fn earliest_offset(&self, partition: &Partition) -> Result<u64, LogError> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition)
            .map(|log| log.start)
            .unwrap_or(0))
    }
}

/// Get current timestamp in milliseconds since epoch
fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
