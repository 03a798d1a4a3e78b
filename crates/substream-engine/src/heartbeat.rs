//! Heartbeat Task - session liveness across broker processes
//!
//! Sessions are registered in the coordination store with a heartbeat
//! timestamp. The store only lists sessions whose heartbeat is younger than
//! its TTL, so if a broker process dies, its sessions stop being listed and the
//! next rebalance pass (on any broker) hands their partitions to live sessions.
//!
//! ## How It Works
//!
//! 1. Every `heartbeat_interval`, refresh every local session's heartbeat
//! 2. If the store no longer knows a session (it expired while this process
//!    was stalled), register it again, unless the session ended meanwhile
//! 3. Failures are logged and retried on the next tick; the session keeps
//!    streaming until its heartbeat actually expires
//! 4. Runs until the streamer's shutdown flag is raised

use crate::disconnect::raised;
use crate::session::{Session, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use substream_coordination::{CoordinationError, CoordinationStore, Result, SessionRecord};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Background task that refreshes the heartbeats of local sessions
pub(crate) struct SessionHeartbeatTask {
    broker_id: String,
    interval: Duration,
    store: Arc<dyn CoordinationStore>,
    sessions: SessionRegistry,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionHeartbeatTask {
    pub(crate) fn new(
        broker_id: String,
        interval: Duration,
        store: Arc<dyn CoordinationStore>,
        sessions: SessionRegistry,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker_id,
            interval,
            store,
            sessions,
            shutdown_rx,
        }
    }

    /// Run the heartbeat loop until shutdown
    pub(crate) async fn run(mut self) {
        info!(
            broker_id = %self.broker_id,
            interval_ms = self.interval.as_millis() as u64,
            "Heartbeat task started"
        );

        let mut heartbeat_count: u64 = 0;
        let mut failure_count: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = raised(&mut self.shutdown_rx) => break,
            }

            let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
            if sessions.is_empty() {
                continue;
            }

            let now = current_timestamp_ms();
            for session in sessions {
                let result = match self
                    .store
                    .heartbeat_session(&session.subscription_id, &session.id, now)
                    .await
                {
                    Err(CoordinationError::SessionNotFound(_)) => {
                        self.register_again(&session, now).await
                    }
                    other => other,
                };

                match result {
                    Ok(()) => {
                        heartbeat_count += 1;
                        failure_count = 0;
                    }
                    Err(e) => {
                        failure_count += 1;
                        error!(
                            broker_id = %self.broker_id,
                            session_id = %session.id,
                            error = %e,
                            failure_count,
                            "Heartbeat failed"
                        );
                    }
                }
            }

            debug!(
                broker_id = %self.broker_id,
                total_heartbeats = heartbeat_count,
                "Heartbeats sent"
            );
        }

        info!(
            broker_id = %self.broker_id,
            total_heartbeats = heartbeat_count,
            "Heartbeat task stopped"
        );
    }

    /// Register a session the store forgot. A session that has ended is left
    /// out; teardown records the end reason before it deregisters.
    async fn register_again(&self, session: &Session, now: i64) -> Result<()> {
        if session.end_reason().is_some()
            || !self.sessions.read().await.contains_key(&session.id)
        {
            debug!(
                broker_id = %self.broker_id,
                session_id = %session.id,
                "Session ended, not registering again"
            );
            return Ok(());
        }

        warn!(
            broker_id = %self.broker_id,
            session_id = %session.id,
            "Session missing from store, registering again"
        );
        self.store
            .register_session(
                &session.subscription_id,
                SessionRecord {
                    session_id: session.id,
                    broker_id: self.broker_id.clone(),
                    client_id: session.client_id.clone(),
                    created_at: session.created_at,
                    last_heartbeat: now,
                },
            )
            .await?;

        // closed while registering: undo
        if session.end_reason().is_some() {
            self.store
                .deregister_session(&session.subscription_id, &session.id)
                .await?;
        }
        Ok(())
    }
}

/// Get current timestamp in milliseconds since epoch
pub(crate) fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
