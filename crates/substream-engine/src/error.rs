//! Error types for the Substream engine
//!
//! ## Taxonomy
//!
//! - `AdmissionError`: terminal outcome of a stream request, surfaced to the
//!   client immediately and never retried. Carries a stable machine-readable
//!   kind and a human-readable reason.
//! - `EngineError::AssignmentConflict`: a rebalance kept losing conditional
//!   writes. Conflicts are normally recovered locally by recomputing; this is
//!   only returned once the conflict budget is spent.
//! - `EngineError::CoordinationUnavailable`: the coordination store stayed
//!   unreachable through every retry. Closes the affected session.
//!
//! Invalid commit cursors are not errors of the whole call; they are reported
//! per entry (see `cursor_tracker::CommitOutcome`). A lost connection is not an
//! error either; it ends the session with `SessionEnd::ConnectionLost`.

use crate::log::LogError;
use crate::metadata::RepositoryError;
use substream_coordination::CoordinationError;
use substream_core::SessionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Machine-readable admission failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionErrorKind {
    InvalidParameter,
    NotFound,
    AccessDenied,
    ConsumptionBlocked,
    FeatureDisabled,
}

impl AdmissionErrorKind {
    /// Stable identifier for API responses
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionErrorKind::InvalidParameter => "invalid_parameter",
            AdmissionErrorKind::NotFound => "not_found",
            AdmissionErrorKind::AccessDenied => "access_denied",
            AdmissionErrorKind::ConsumptionBlocked => "consumption_blocked",
            AdmissionErrorKind::FeatureDisabled => "feature_disabled",
        }
    }
}

/// Why a stream request was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    NotFound(String),

    /// `resource` is `<permission>:<resource name>`, e.g. `READ:order.created`
    #[error("Access on {resource} denied")]
    AccessDenied { resource: String },

    #[error("Consumption of subscription {subscription_id} is blocked for client {client_id}")]
    ConsumptionBlocked {
        client_id: String,
        subscription_id: String,
    },

    #[error("Feature {0} is disabled")]
    FeatureDisabled(String),
}

impl AdmissionError {
    pub fn kind(&self) -> AdmissionErrorKind {
        match self {
            AdmissionError::InvalidParameter(_) => AdmissionErrorKind::InvalidParameter,
            AdmissionError::NotFound(_) => AdmissionErrorKind::NotFound,
            AdmissionError::AccessDenied { .. } => AdmissionErrorKind::AccessDenied,
            AdmissionError::ConsumptionBlocked { .. } => AdmissionErrorKind::ConsumptionBlocked,
            AdmissionError::FeatureDisabled(_) => AdmissionErrorKind::FeatureDisabled,
        }
    }

    /// Human-readable reason
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Assignment conflict not resolved after {attempts} attempts")]
    AssignmentConflict { attempts: usize },

    #[error("Stale generation: expected {expected}, got {actual}")]
    StaleGeneration { expected: u64, actual: u64 },

    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination error: {0}")]
    Coordination(#[source] CoordinationError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] substream_core::Error),
}

impl From<CoordinationError> for EngineError {
    fn from(e: CoordinationError) -> Self {
        match e {
            CoordinationError::Unavailable(msg) => EngineError::CoordinationUnavailable(msg),
            other => EngineError::Coordination(other),
        }
    }
}
