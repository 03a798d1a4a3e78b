//! Engine and stream configuration
//!
//! Two layers of configuration exist:
//!
//! - [`StreamParameters`]: chosen by the client per stream request (flow
//!   control). Validated during admission.
//! - [`EngineConfig`]: chosen by the operator per broker process (timers,
//!   retry policy, identity). Loaded from the environment in binaries.
//!
//! ## Environment Variables
//!
//! | variable | default |
//! |---|---|
//! | `SUBSTREAM_BROKER_ID` | `broker-<uuid>` |
//! | `SUBSTREAM_HEARTBEAT_INTERVAL_MS` | 10000 |
//! | `SUBSTREAM_SESSION_TTL_MS` | 60000 |
//! | `SUBSTREAM_DISCONNECT_POLL_MS` | 1000 |
//! | `SUBSTREAM_LOG_POLL_MS` | 100 |
//! | `SUBSTREAM_STORE_MAX_RETRIES` | 5 |

use crate::error::AdmissionError;
use std::time::Duration;
use substream_coordination::RetryPolicy;

/// Upper bound of every client-chosen timeout
pub const MAX_STREAM_TIMEOUT: Duration = Duration::from_secs(4200);

/// Flow-control parameters of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParameters {
    /// Maximum events per batch. Must be at least 1.
    pub batch_limit: i32,

    /// Maximum events over the whole stream (0 = unlimited)
    pub stream_limit: u64,

    /// Maximum time a batch waits for more events after its first one
    pub batch_flush_timeout: Duration,

    /// Maximum stream lifetime (zero = unlimited)
    pub stream_timeout: Duration,

    /// Consecutive empty flush cycles before the stream closes (0 = unlimited)
    pub stream_keep_alive_limit: u32,

    /// Per-partition ceiling of delivered-but-uncommitted events
    pub max_uncommitted_events: u32,

    /// Maximum time delivered events may stay uncommitted
    pub commit_timeout: Duration,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            batch_limit: 1,
            stream_limit: 0,
            batch_flush_timeout: Duration::from_secs(30),
            stream_timeout: Duration::ZERO,
            stream_keep_alive_limit: 0,
            max_uncommitted_events: 10,
            commit_timeout: Duration::from_secs(60),
        }
    }
}

impl StreamParameters {
    /// Check the parameters, first failure wins
    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.batch_limit < 1 {
            return Err(AdmissionError::InvalidParameter(
                "batch_limit can't be lower than 1".to_string(),
            ));
        }
        if self.max_uncommitted_events < 1 {
            return Err(AdmissionError::InvalidParameter(
                "max_uncommitted_events can't be lower than 1".to_string(),
            ));
        }
        if self.stream_limit != 0 && self.stream_limit < self.batch_limit as u64 {
            return Err(AdmissionError::InvalidParameter(
                "stream_limit can't be lower than batch_limit".to_string(),
            ));
        }
        if self.batch_flush_timeout.is_zero() {
            return Err(AdmissionError::InvalidParameter(
                "batch_flush_timeout must be positive".to_string(),
            ));
        }
        for (name, timeout) in [
            ("batch_flush_timeout", self.batch_flush_timeout),
            ("stream_timeout", self.stream_timeout),
            ("commit_timeout", self.commit_timeout),
        ] {
            if timeout > MAX_STREAM_TIMEOUT {
                return Err(AdmissionError::InvalidParameter(format!(
                    "{} can't be greater than {} seconds",
                    name,
                    MAX_STREAM_TIMEOUT.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// `batch_limit` as a count; only meaningful after `validate`
    pub fn batch_size(&self) -> usize {
        self.batch_limit.max(1) as usize
    }
}

/// Per-process engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity of this broker process in assignment records
    pub broker_id: String,

    /// How often local sessions refresh their heartbeat
    pub heartbeat_interval: Duration,

    /// How long a session survives without heartbeat. Used for the
    /// periodic membership sweep; the store enforces its own TTL.
    pub session_ttl: Duration,

    /// How often the disconnect monitor polls each connection
    pub disconnect_poll_interval: Duration,

    /// How long a puller sleeps when its partition has no new events
    pub log_poll_interval: Duration,

    /// Retry policy for coordination store calls
    pub retry_policy: RetryPolicy,

    /// Maximum conditional-write conflicts tolerated per rebalance pass
    pub max_conflict_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker_id: format!("broker-{}", uuid::Uuid::new_v4()),
            heartbeat_interval: Duration::from_secs(10),
            session_ttl: Duration::from_secs(60),
            disconnect_poll_interval: Duration::from_secs(1),
            log_poll_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
            max_conflict_retries: 10,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `SUBSTREAM_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let broker_id = std::env::var("SUBSTREAM_BROKER_ID").unwrap_or(defaults.broker_id);
        let mut retry_policy = defaults.retry_policy;
        if let Some(max_retries) = env_u64("SUBSTREAM_STORE_MAX_RETRIES") {
            retry_policy.max_retries = max_retries as usize;
        }

        Self {
            broker_id,
            heartbeat_interval: env_millis("SUBSTREAM_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval),
            session_ttl: env_millis("SUBSTREAM_SESSION_TTL_MS").unwrap_or(defaults.session_ttl),
            disconnect_poll_interval: env_millis("SUBSTREAM_DISCONNECT_POLL_MS")
                .unwrap_or(defaults.disconnect_poll_interval),
            log_poll_interval: env_millis("SUBSTREAM_LOG_POLL_MS")
                .unwrap_or(defaults.log_poll_interval),
            retry_policy,
            max_conflict_retries: defaults.max_conflict_retries,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_millis)
}
