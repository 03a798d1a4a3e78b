//! Substream Engine - subscription streaming sessions
//!
//! A subscription is a named, persistent read position over the partitions of
//! one or more event types. Several consumers stream the same subscription at
//! once; the engine divides its partitions among them and checkpoints what
//! each consumer acknowledged.
//!
//! ## Architecture
//!
//! Broker processes are interchangeable. All shared state (live sessions,
//! partition ownership, committed offsets) lives in the coordination store, and
//! every ownership change goes through a conditional write, so two brokers can
//! never both believe they own a partition under the same generation.
//!
//! ## Components
//!
//! - **SubscriptionStreamer**: entry point; opens, commits and closes sessions
//! - **AdmissionGate**: parameter, existence, authorization, blacklist and feature checks
//! - **Rebalancer**: pure, sticky partition distribution
//! - **AssignmentManager**: optimistic read-compute-write of the assignment record
//! - **Session**: batching, flow control and stream limits of one connection
//! - **CursorTracker**: delivered and committed cursors per owned partition
//! - **DisconnectMonitor**: detects clients that vanished without closing
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use substream_coordination::InMemoryCoordinationStore;
//! use substream_core::SubscriptionId;
//! use substream_engine::{
//!     Client, EngineConfig, InMemoryEventLog, InMemoryMetadata, ManualConnectionProbe,
//!     StreamParameters, SubscriptionStreamer,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let streamer = SubscriptionStreamer::builder()
//!     .config(EngineConfig::from_env())
//!     .metadata(Arc::new(InMemoryMetadata::new()))
//!     .coordination_store(Arc::new(InMemoryCoordinationStore::new()))
//!     .event_log(Arc::new(InMemoryEventLog::new()))
//!     .build()?;
//! streamer.start().await?;
//!
//! let mut handle = streamer
//!     .open_session(
//!         &SubscriptionId::new("orders-audit"),
//!         &Client::new("audit-service"),
//!         StreamParameters::default(),
//!         Arc::new(ManualConnectionProbe::new()),
//!     )
//!     .await?;
//!
//! while let Some(batch) = handle.next_batch().await {
//!     if let Some(cursor) = batch.cursor {
//!         streamer.commit_cursors(&handle.session_id(), vec![cursor]).await?;
//!     }
//! }
//!
//! streamer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod assignment;
pub mod config;
pub mod cursor_tracker;
pub mod disconnect;
pub mod error;
mod heartbeat;
pub mod log;
pub mod metadata;
pub mod rebalancer;
pub mod session;
pub mod streamer;

pub use admission::{
    AccessDenied, AdmissionGate, Authorizer, BlacklistService, Client, Feature, FeatureToggle,
    Permission, StaticAuthorizer, StaticBlacklist, StaticFeatureToggle,
};
pub use assignment::AssignmentManager;
pub use config::{EngineConfig, StreamParameters, MAX_STREAM_TIMEOUT};
pub use cursor_tracker::{CommitOutcome, InvalidCursorReason};
pub use disconnect::{ConnectionProbe, DisconnectMonitor, ManualConnectionProbe};
pub use error::{AdmissionError, AdmissionErrorKind, EngineError, Result};
pub use log::{EventLog, InMemoryEventLog, LogError};
pub use metadata::{
    EventType, EventTypeRepository, InMemoryMetadata, RepositoryError, Subscription,
    SubscriptionRepository,
};
pub use rebalancer::{PartitionMovement, RebalancePlan, Rebalancer};
pub use session::{CommitResult, SessionEnd, SessionHandle};
pub use streamer::{
    PartitionState, PartitionStats, SubscriptionStreamer, SubscriptionStreamerBuilder,
};
