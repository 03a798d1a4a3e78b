//! Substream Coordination Store
//!
//! This crate defines the contract of the consistent, watchable key/value store
//! shared by every broker process, plus an in-memory implementation.
//!
//! ## Purpose
//!
//! Several broker processes may hold sessions of the same subscription at the
//! same time. The coordination store is the only state they share:
//! - **Sessions**: which sessions are alive for a subscription (heartbeats)
//! - **Assignment**: which session owns which partition, and under which generation
//! - **Committed offsets**: the durable read checkpoint per partition
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌──────────┐   conditional write    ┌───────────────────┐
//! │ broker A │ ─────────────────────► │                   │
//! └──────────┘   (expected version)   │ Coordination Store│
//! ┌──────────┐                        │  sessions         │
//! │ broker B │ ─────────────────────► │  assignment (v)   │
//! └──────────┘   VersionConflict ◄─── │  offsets          │
//!                                     └───────────────────┘
//! ```
//!
//! Assignment writes are conditional on the version that was read. The loser of
//! a race receives `VersionConflict`, re-reads and recomputes; records are never
//! blindly overwritten.
//!
//! ## Usage Example
//!
//! ```ignore
//! use substream_coordination::{CoordinationStore, InMemoryCoordinationStore};
//!
//! let store = InMemoryCoordinationStore::new();
//! let current = store.get_assignment(&subscription_id).await?;
//! let next = compute(&current.value);
//! store.put_assignment(&subscription_id, current.version, next).await?;
//! ```

pub mod error;
pub mod memory;
pub mod retry;
pub mod types;

pub use error::{CoordinationError, Result};
pub use memory::InMemoryCoordinationStore;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use types::*;

use async_trait::async_trait;
use std::collections::BTreeMap;
use substream_core::{Partition, SessionId, SubscriptionId};
use tokio::sync::watch;

/// Coordination store trait - abstracts over consistent KV backends.
///
/// ## Thread Safety
///
/// Implementations must be Send + Sync, allowing shared use across async tasks
/// via `Arc<dyn CoordinationStore>`.
///
/// ## Error Handling
///
/// - `Unavailable`: transient; callers retry with `retry_with_backoff`
/// - `VersionConflict`: returned only by `put_assignment`
/// - `SessionNotFound`: returned only by `heartbeat_session`
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // ============================================================
    // SESSION MEMBERSHIP
    // ============================================================

    /// Register (or re-register) a session of a subscription.
    ///
    /// Bumps the subscription's topology version so watchers rebalance.
    async fn register_session(
        &self,
        subscription_id: &SubscriptionId,
        session: SessionRecord,
    ) -> Result<()>;

    /// Refresh a session's heartbeat timestamp.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound`: the session was never registered or was removed
    async fn heartbeat_session(
        &self,
        subscription_id: &SubscriptionId,
        session_id: &SessionId,
        now_ms: i64,
    ) -> Result<()>;

    /// Remove a session. Removing an unknown session is not an error.
    async fn deregister_session(
        &self,
        subscription_id: &SubscriptionId,
        session_id: &SessionId,
    ) -> Result<()>;

    /// List live sessions (heartbeat within the store's TTL), sorted by id.
    async fn list_sessions(&self, subscription_id: &SubscriptionId) -> Result<Vec<SessionRecord>>;

    // ============================================================
    // PARTITION ASSIGNMENT
    // ============================================================

    /// Read the current assignment with its version (version 0 = never written).
    async fn get_assignment(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Versioned<AssignmentRecord>>;

    /// Replace the assignment if the stored version still equals `expected_version`.
    ///
    /// # Returns
    ///
    /// The new version.
    ///
    /// # Errors
    ///
    /// - `VersionConflict`: someone else wrote first
    async fn put_assignment(
        &self,
        subscription_id: &SubscriptionId,
        expected_version: u64,
        record: AssignmentRecord,
    ) -> Result<u64>;

    // ============================================================
    // COMMITTED OFFSETS
    // ============================================================

    /// Read all committed offsets of a subscription.
    async fn get_committed_offsets(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<BTreeMap<Partition, u64>>;

    /// Store a committed offset. The stored value never decreases.
    ///
    /// # Returns
    ///
    /// The committed offset stored after the call.
    async fn commit_offset(
        &self,
        subscription_id: &SubscriptionId,
        partition: &Partition,
        offset: u64,
    ) -> Result<u64>;

    // ============================================================
    // CHANGE NOTIFICATION
    // ============================================================

    /// Watch a subscription's topology version.
    ///
    /// The value changes whenever sessions register/deregister or the
    /// assignment is replaced.
    async fn watch(&self, subscription_id: &SubscriptionId) -> Result<watch::Receiver<u64>>;
}
