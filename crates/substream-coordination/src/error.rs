//! Coordination Error Types
//!
//! ## Error Categories
//!
//! ### Availability Errors
//! - `Unavailable`: the store could not be reached; callers retry with backoff
//!
//! ### Concurrency Errors
//! - `VersionConflict`: a conditional write lost the race against another
//!   broker process; callers re-read and recompute
//!
//! ### Membership Errors
//! - `SessionNotFound`: heartbeat for a session the store does not know
//!
//! ## Usage
//!
//! ```ignore
//! match store.put_assignment(&sub, current.version, record).await {
//!     Ok(version) => version,
//!     Err(CoordinationError::VersionConflict { .. }) => continue, // fresh read
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use substream_core::SessionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
}

impl CoordinationError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Unavailable(_))
    }
}
