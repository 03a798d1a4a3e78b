//! Substream Core
//!
//! Domain types shared by every Substream crate: partitions, cursors, events,
//! stream batches and the identifiers of subscriptions and sessions.

pub mod error;
pub mod event;
pub mod ids;
pub mod partition;

pub use error::{Error, Result};
pub use event::{Event, StreamBatch};
pub use ids::{SessionId, SubscriptionId};
pub use partition::{Cursor, Partition};
