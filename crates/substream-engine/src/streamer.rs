//! Subscription Streamer - entry point of the engine
//!
//! Owns every session opened on this broker process and the background tasks
//! that keep them coordinated with sessions on other brokers.
//!
//! ## Lifecycle
//!
//! ```text
//! open_session ─► admission gates ─► register in store ─► start session
//!                                                      └► rebalance pass
//!
//! commit_cursors ─► per entry: validate ─► durable write ─► in-memory update
//!
//! close_session / stream end ─► stop pullers ─► deregister ─► rebalance pass
//! ```
//!
//! ## Background Tasks
//!
//! - **Subscription watcher** (one per subscription with local sessions):
//!   runs a rebalance pass whenever the store's topology version changes and
//!   on a periodic sweep, then hands the resulting assignment to every local
//!   session of that subscription.
//! - **Heartbeat**: refreshes the heartbeat of every local session.
//! - **Reaper**: tears down sessions whose stream ended on its own.
//!
//! ## Example
//!
//! ```ignore
//! let streamer = SubscriptionStreamer::builder()
//!     .config(EngineConfig::from_env())
//!     .metadata(metadata)
//!     .coordination_store(store)
//!     .event_log(log)
//!     .build()?;
//! streamer.start().await?;
//!
//! let mut handle = streamer
//!     .open_session(&subscription_id, &client, StreamParameters::default(), probe)
//!     .await?;
//! while let Some(batch) = handle.next_batch().await {
//!     transport.write_all(&batch.to_json_line()?).await?;
//! }
//! ```

use crate::admission::{
    AdmissionGate, Authorizer, BlacklistService, Client, FeatureToggle, StaticAuthorizer,
    StaticBlacklist, StaticFeatureToggle,
};
use crate::assignment::AssignmentManager;
use crate::config::{EngineConfig, StreamParameters};
use crate::disconnect::{raised, ConnectionProbe};
use crate::error::{AdmissionError, EngineError, Result};
use crate::heartbeat::{current_timestamp_ms, SessionHeartbeatTask};
use crate::log::EventLog;
use crate::metadata::{EventTypeRepository, SubscriptionRepository};
use crate::session::{
    CommitResult, Session, SessionContext, SessionEnd, SessionHandle, SessionRegistry,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use substream_coordination::{retry_with_backoff, CoordinationStore, SessionRecord};
use substream_core::{Cursor, Partition, SessionId, SubscriptionId};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ownership state of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    Assigned,
    Unassigned,
}

/// Per-partition view of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub partition: Partition,
    pub state: PartitionState,
    pub session_id: Option<SessionId>,
    pub committed_offset: Option<u64>,
}

pub struct SubscriptionStreamer {
    inner: Arc<StreamerInner>,
}

struct StreamerInner {
    config: EngineConfig,
    gate: AdmissionGate,
    ctx: SessionContext,
    sessions: SessionRegistry,
    watchers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    teardown_tx: mpsc::UnboundedSender<SessionId>,
    teardown_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SubscriptionStreamer {
    pub fn builder() -> SubscriptionStreamerBuilder {
        SubscriptionStreamerBuilder::new()
    }

    pub fn broker_id(&self) -> &str {
        &self.inner.config.broker_id
    }

    /// Start the heartbeat and reaper tasks. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.inner.background.lock().await;
        if !background.is_empty() {
            return Ok(());
        }
        let teardown_rx = self
            .inner
            .teardown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::Config("streamer was shut down".to_string()))?;

        let heartbeat = SessionHeartbeatTask::new(
            self.inner.config.broker_id.clone(),
            self.inner.config.heartbeat_interval,
            Arc::clone(&self.inner.ctx.store),
            Arc::clone(&self.inner.sessions),
            self.inner.shutdown_tx.subscribe(),
        );
        background.push(tokio::spawn(heartbeat.run()));
        background.push(tokio::spawn(reap_sessions(
            Arc::clone(&self.inner),
            teardown_rx,
            self.inner.shutdown_tx.subscribe(),
        )));

        info!(
            broker_id = %self.inner.config.broker_id,
            heartbeat_interval_ms = self.inner.config.heartbeat_interval.as_millis() as u64,
            "Subscription streamer started"
        );
        Ok(())
    }

    /// Stop every session and background task
    pub async fn shutdown(&self) -> Result<()> {
        let ids: Vec<SessionId> = self.inner.sessions.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.inner.teardown(id).await {
                warn!(session_id = %id, error = %e, "Session teardown failed during shutdown");
            }
        }

        self.inner.shutdown_tx.send_replace(true);
        for (_, handle) in self.inner.watchers.lock().await.drain() {
            handle.abort();
        }
        for handle in self.inner.background.lock().await.drain(..) {
            handle.abort();
            let _ = handle.await;
        }

        info!(broker_id = %self.inner.config.broker_id, "Subscription streamer stopped");
        Ok(())
    }

    /// Admit a stream request and start streaming.
    ///
    /// # Errors
    ///
    /// - `Admission`: a gate rejected the request; nothing was created
    /// - `CoordinationUnavailable`: the session could not be registered
    pub async fn open_session(
        &self,
        subscription_id: &SubscriptionId,
        client: &Client,
        params: StreamParameters,
        probe: Arc<dyn ConnectionProbe>,
    ) -> Result<SessionHandle> {
        if self.inner.background.lock().await.is_empty() {
            return Err(EngineError::Config("streamer not started".to_string()));
        }

        let admitted = self.inner.gate.admit(subscription_id, client, &params).await?;

        let session_id = SessionId::generate();
        let now = current_timestamp_ms();
        let record = SessionRecord {
            session_id,
            broker_id: self.inner.config.broker_id.clone(),
            client_id: client.client_id.clone(),
            created_at: now,
            last_heartbeat: now,
        };
        retry_with_backoff(&self.inner.config.retry_policy, || {
            self.inner
                .ctx
                .store
                .register_session(subscription_id, record.clone())
        })
        .await?;

        let parts = Session::new(
            self.inner.ctx.clone(),
            session_id,
            subscription_id.clone(),
            client.client_id.clone(),
            params,
            now,
            probe,
            self.inner.teardown_tx.clone(),
        );
        self.inner
            .sessions
            .write()
            .await
            .insert(session_id, Arc::clone(&parts.session));
        tokio::spawn(parts.monitor.run());
        parts.session_loop.spawn();

        info!(
            session_id = %session_id,
            subscription_id = %subscription_id,
            client_id = %client.client_id,
            partitions = admitted.partitions.len(),
            "Session opened"
        );

        let started = match self.inner.ensure_watcher(subscription_id).await {
            Ok(()) => self.inner.rebalance_pass(subscription_id).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(()) => {}
            Err(EngineError::AssignmentConflict { attempts }) => {
                // the watcher retries on the next topology change
                warn!(
                    session_id = %session_id,
                    attempts,
                    "Initial rebalance lost every race"
                );
            }
            Err(e) => {
                parts.session.stop(SessionEnd::CoordinationUnavailable);
                if let Err(teardown) = self.inner.teardown(session_id).await {
                    warn!(session_id = %session_id, error = %teardown, "Teardown after failed open");
                }
                return Err(e);
            }
        }

        Ok(parts.handle)
    }

    /// Acknowledge cursors for a session
    ///
    /// # Errors
    ///
    /// - `SessionNotFound`: the session is not streaming on this broker
    /// - `CoordinationUnavailable`: the store stayed unreachable; the session is closed
    pub async fn commit_cursors(
        &self,
        session_id: &SessionId,
        cursors: Vec<Cursor>,
    ) -> Result<Vec<CommitResult>> {
        let session = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(*session_id))?;

        session.commit(cursors).await
    }

    /// Close a session: stop it, deregister it and rebalance before returning.
    /// Closing an unknown or already closed session is a no-op.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        self.inner.teardown(*session_id).await
    }

    /// Partitions currently streamed by a local session
    pub async fn assigned_partitions(&self, session_id: &SessionId) -> Result<Vec<Partition>> {
        let session = self
            .inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(EngineError::SessionNotFound(*session_id))?;
        Ok(session.assigned_partitions().await)
    }

    /// Ids of the sessions streaming on this broker
    pub async fn local_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inner.sessions.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ownership and committed offset of every partition of a subscription
    pub async fn subscription_stats(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<PartitionStats>> {
        let admitted = self.inner.gate.resolve(subscription_id).await?;
        let policy = &self.inner.config.retry_policy;
        let store = &self.inner.ctx.store;

        let assignment =
            retry_with_backoff(policy, || store.get_assignment(subscription_id)).await?;
        let offsets =
            retry_with_backoff(policy, || store.get_committed_offsets(subscription_id)).await?;

        Ok(admitted
            .partitions
            .into_iter()
            .map(|partition| {
                let owner = assignment.value.owner_of(&partition).map(|o| o.session_id);
                PartitionStats {
                    state: if owner.is_some() {
                        PartitionState::Assigned
                    } else {
                        PartitionState::Unassigned
                    },
                    session_id: owner,
                    committed_offset: offsets.get(&partition).copied(),
                    partition,
                }
            })
            .collect())
    }
}

impl StreamerInner {
    /// Stop, deregister and rebalance. Idempotent.
    async fn teardown(&self, session_id: SessionId) -> Result<()> {
        let Some(session) = self.sessions.write().await.remove(&session_id) else {
            return Ok(());
        };
        let subscription_id = session.subscription_id.clone();

        session.stop(SessionEnd::Closed);
        session.release_all().await;

        retry_with_backoff(&self.config.retry_policy, || {
            self.ctx
                .store
                .deregister_session(&subscription_id, &session_id)
        })
        .await?;

        let remaining = self
            .sessions
            .read()
            .await
            .values()
            .any(|s| s.subscription_id == subscription_id);
        if !remaining {
            if let Some(handle) = self.watchers.lock().await.remove(&subscription_id) {
                handle.abort();
            }
        }

        let rebalanced = self.rebalance_pass(&subscription_id).await;

        info!(
            session_id = %session_id,
            subscription_id = %subscription_id,
            reason = ?session.end_reason(),
            "Session closed"
        );
        rebalanced
    }

    /// Rebalance a subscription and hand the result to its local sessions
    async fn rebalance_pass(&self, subscription_id: &SubscriptionId) -> Result<()> {
        let partitions = match self.gate.resolve(subscription_id).await {
            Ok(admitted) => admitted.partitions,
            Err(EngineError::Admission(AdmissionError::NotFound(reason))) => {
                debug!(subscription_id = %subscription_id, reason = %reason, "Subscription gone");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let assignment = self
            .ctx
            .assignments
            .rebalance(subscription_id, &partitions)
            .await?;

        let local: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| &s.subscription_id == subscription_id)
            .cloned()
            .collect();

        for session in local {
            match session.apply_assignment(&assignment.value).await {
                Ok(()) => {}
                Err(EngineError::CoordinationUnavailable(reason)) => {
                    warn!(
                        session_id = %session.id,
                        reason = %reason,
                        "Could not apply assignment, closing session"
                    );
                    session.stop(SessionEnd::CoordinationUnavailable);
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Could not apply assignment");
                }
            }
        }
        Ok(())
    }

    async fn ensure_watcher(self: &Arc<Self>, subscription_id: &SubscriptionId) -> Result<()> {
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(subscription_id) {
            return Ok(());
        }

        let topology = retry_with_backoff(&self.config.retry_policy, || {
            self.ctx.store.watch(subscription_id)
        })
        .await?;
        let handle = tokio::spawn(watch_subscription(
            Arc::clone(self),
            subscription_id.clone(),
            topology,
            self.shutdown_tx.subscribe(),
        ));
        watchers.insert(subscription_id.clone(), handle);

        debug!(subscription_id = %subscription_id, "Subscription watcher started");
        Ok(())
    }

    async fn stop_subscription(&self, subscription_id: &SubscriptionId, reason: SessionEnd) {
        for session in self.sessions.read().await.values() {
            if &session.subscription_id == subscription_id {
                session.stop(reason);
            }
        }
    }
}

/// Rebalance on every topology change and on a periodic sweep
async fn watch_subscription(
    inner: Arc<StreamerInner>,
    subscription_id: SubscriptionId,
    mut topology: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let sweep_interval = inner.config.heartbeat_interval;

    loop {
        tokio::select! {
            changed = topology.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(sweep_interval) => {}
            _ = raised(&mut shutdown_rx) => break,
        }

        match inner.rebalance_pass(&subscription_id).await {
            Ok(()) => {}
            Err(EngineError::CoordinationUnavailable(reason)) => {
                warn!(
                    subscription_id = %subscription_id,
                    reason = %reason,
                    "Coordination store unavailable, closing local sessions"
                );
                inner
                    .stop_subscription(&subscription_id, SessionEnd::CoordinationUnavailable)
                    .await;
            }
            Err(e) => {
                warn!(subscription_id = %subscription_id, error = %e, "Rebalance pass failed");
            }
        }
    }

    debug!(subscription_id = %subscription_id, "Subscription watcher stopped");
}

/// Tear down sessions whose stream ended on its own
async fn reap_sessions(
    inner: Arc<StreamerInner>,
    mut teardown_rx: mpsc::UnboundedReceiver<SessionId>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let session_id = tokio::select! {
            received = teardown_rx.recv() => match received {
                Some(id) => id,
                None => break,
            },
            _ = raised(&mut shutdown_rx) => break,
        };

        if let Err(e) = inner.teardown(session_id).await {
            warn!(session_id = %session_id, error = %e, "Session teardown failed");
        }
    }
}

/// Builder for [`SubscriptionStreamer`]
pub struct SubscriptionStreamerBuilder {
    config: EngineConfig,
    subscriptions: Option<Arc<dyn SubscriptionRepository>>,
    event_types: Option<Arc<dyn EventTypeRepository>>,
    authorizer: Arc<dyn Authorizer>,
    blacklist: Arc<dyn BlacklistService>,
    features: Arc<dyn FeatureToggle>,
    store: Option<Arc<dyn CoordinationStore>>,
    log: Option<Arc<dyn EventLog>>,
}

impl SubscriptionStreamerBuilder {
    /// Create a builder. Authorization allows everything, nothing is
    /// blacklisted and every feature is enabled until configured otherwise.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            subscriptions: None,
            event_types: None,
            authorizer: Arc::new(StaticAuthorizer::allow_all()),
            blacklist: Arc::new(StaticBlacklist::new()),
            features: Arc::new(StaticFeatureToggle::enabled()),
            store: None,
            log: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn broker_id(mut self, broker_id: impl Into<String>) -> Self {
        self.config.broker_id = broker_id.into();
        self
    }

    /// Use one object for both metadata repositories
    pub fn metadata<M>(mut self, metadata: Arc<M>) -> Self
    where
        M: SubscriptionRepository + EventTypeRepository + 'static,
    {
        let subscriptions: Arc<dyn SubscriptionRepository> = metadata.clone();
        let event_types: Arc<dyn EventTypeRepository> = metadata;
        self.subscriptions = Some(subscriptions);
        self.event_types = Some(event_types);
        self
    }

    pub fn subscription_repository(mut self, repository: Arc<dyn SubscriptionRepository>) -> Self {
        self.subscriptions = Some(repository);
        self
    }

    pub fn event_type_repository(mut self, repository: Arc<dyn EventTypeRepository>) -> Self {
        self.event_types = Some(repository);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn blacklist(mut self, blacklist: Arc<dyn BlacklistService>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn feature_toggle(mut self, features: Arc<dyn FeatureToggle>) -> Self {
        self.features = features;
        self
    }

    pub fn coordination_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Result<SubscriptionStreamer> {
        if self.config.broker_id.is_empty() {
            return Err(EngineError::Config("broker_id is required".to_string()));
        }
        let subscriptions = self
            .subscriptions
            .ok_or_else(|| EngineError::Config("subscription repository is required".to_string()))?;
        let event_types = self
            .event_types
            .ok_or_else(|| EngineError::Config("event type repository is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| EngineError::Config("coordination_store is required".to_string()))?;
        let log = self
            .log
            .ok_or_else(|| EngineError::Config("event_log is required".to_string()))?;

        let gate = AdmissionGate::new(
            subscriptions,
            event_types,
            self.authorizer,
            self.blacklist,
            self.features,
        );
        let assignments = AssignmentManager::new(
            self.config.broker_id.clone(),
            Arc::clone(&store),
            self.config.retry_policy.clone(),
            self.config.max_conflict_retries,
        );
        let ctx = SessionContext {
            store,
            log,
            assignments,
            retry_policy: self.config.retry_policy.clone(),
            log_poll_interval: self.config.log_poll_interval,
            disconnect_poll_interval: self.config.disconnect_poll_interval,
        };
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(SubscriptionStreamer {
            inner: Arc::new(StreamerInner {
                config: self.config,
                gate,
                ctx,
                sessions: Arc::new(RwLock::new(HashMap::new())),
                watchers: Mutex::new(HashMap::new()),
                teardown_tx,
                teardown_rx: Mutex::new(Some(teardown_rx)),
                background: Mutex::new(Vec::new()),
                shutdown_tx,
            }),
        })
    }
}

impl Default for SubscriptionStreamerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryEventLog;
    use crate::metadata::InMemoryMetadata;
    use substream_coordination::InMemoryCoordinationStore;

    #[test]
    fn test_build_requires_collaborators() {
        let result = SubscriptionStreamer::builder()
            .metadata(Arc::new(InMemoryMetadata::new()))
            .event_log(Arc::new(InMemoryEventLog::new()))
            .build();
        assert!(matches!(result, Err(EngineError::Config(_))));

        let result = SubscriptionStreamer::builder()
            .metadata(Arc::new(InMemoryMetadata::new()))
            .coordination_store(Arc::new(InMemoryCoordinationStore::new()))
            .event_log(Arc::new(InMemoryEventLog::new()))
            .broker_id("broker-a")
            .build();
        assert_eq!(result.unwrap().broker_id(), "broker-a");
    }

    #[tokio::test]
    async fn test_open_requires_start() {
        let streamer = SubscriptionStreamer::builder()
            .metadata(Arc::new(InMemoryMetadata::new()))
            .coordination_store(Arc::new(InMemoryCoordinationStore::new()))
            .event_log(Arc::new(InMemoryEventLog::new()))
            .build()
            .unwrap();

        let result = streamer
            .open_session(
                &SubscriptionId::new("sub"),
                &Client::new("c"),
                StreamParameters::default(),
                Arc::new(crate::disconnect::ManualConnectionProbe::new()),
            )
            .await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_partition_stats_json() {
        let stats = PartitionStats {
            partition: Partition::new("orders", 1),
            state: PartitionState::Unassigned,
            session_id: None,
            committed_offset: Some(4),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "unassigned");
        assert_eq!(json["partition"]["event_type"], "orders");
        assert_eq!(json["committed_offset"], 4);
    }
}
