//! Partitions and Cursors
//!
//! A **partition** is one independently ordered shard of an event type's log,
//! identified by the pair `(event_type, index)`. A **cursor** points at an
//! offset inside a partition and is used both for read progress (delivered
//! cursors) and acknowledgment progress (committed cursors).
//!
//! ## Ordering
//!
//! Partitions are totally ordered by event type name, then by index. The
//! rebalancer relies on this order to produce deterministic assignments on
//! every broker process.
//!
//! ## Example
//! ```ignore
//! let partition: Partition = "order.created:3".parse()?;
//! let cursor = Cursor::new(partition, 41);
//! assert_eq!(cursor.to_string(), "order.created:3@41");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An ordered shard of one event type's log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    /// Name of the event type this partition belongs to
    pub event_type: String,

    /// Partition index within the event type (0-indexed)
    #[serde(rename = "partition")]
    pub index: u32,
}

impl Partition {
    pub fn new(event_type: impl Into<String>, index: u32) -> Self {
        Self {
            event_type: event_type.into(),
            index,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.index)
    }
}

impl FromStr for Partition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (event_type, index) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidPartition(s.to_string()))?;

        if event_type.is_empty() {
            return Err(Error::InvalidPartition(s.to_string()));
        }

        let index = index
            .parse::<u32>()
            .map_err(|_| Error::InvalidPartition(s.to_string()))?;

        Ok(Self::new(event_type, index))
    }
}

/// A (partition, offset) pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(flatten)]
    pub partition: Partition,

    /// Offset of the event this cursor points at
    pub offset: u64,
}

impl Cursor {
    pub fn new(partition: Partition, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}
