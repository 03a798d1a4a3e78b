//! In-memory coordination store
//!
//! A single-process implementation of [`CoordinationStore`]. Several streamers
//! sharing one `Arc<InMemoryCoordinationStore>` behave like several broker
//! processes sharing a real consistent store, which is how the engine's
//! multi-process scenarios are tested.
//!
//! The store can be switched unavailable to exercise retry and degradation
//! paths.

use crate::error::{CoordinationError, Result};
use crate::types::{AssignmentRecord, SessionRecord, Versioned};
use crate::CoordinationStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use substream_core::{Partition, SessionId, SubscriptionId};
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Default session TTL (sessions without heartbeat for this long are dead)
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// In-memory coordination store
pub struct InMemoryCoordinationStore {
    subscriptions: RwLock<HashMap<SubscriptionId, SubscriptionEntry>>,
    session_ttl: Duration,
    available: AtomicBool,
}

struct SubscriptionEntry {
    sessions: BTreeMap<SessionId, SessionRecord>,
    assignment: Versioned<AssignmentRecord>,
    offsets: BTreeMap<Partition, u64>,
    topology_version: u64,
    topology_tx: watch::Sender<u64>,
}

impl SubscriptionEntry {
    fn new() -> Self {
        let (topology_tx, _) = watch::channel(0);
        Self {
            sessions: BTreeMap::new(),
            assignment: Versioned::default(),
            offsets: BTreeMap::new(),
            topology_version: 0,
            topology_tx,
        }
    }

    fn bump_topology(&mut self) {
        self.topology_version += 1;
        self.topology_tx.send_replace(self.topology_version);
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_session_ttl(DEFAULT_SESSION_TTL)
    }

    /// Create a store that considers sessions dead after `session_ttl` without heartbeat
    pub fn with_session_ttl(session_ttl: Duration) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            session_ttl,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming (un)reachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoordinationError::Unavailable(
                "in-memory store switched off".to_string(),
            ))
        }
    }

    fn is_live(&self, session: &SessionRecord, now_ms: i64) -> bool {
        now_ms - session.last_heartbeat < self.session_ttl.as_millis() as i64
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn register_session(
        &self,
        subscription_id: &SubscriptionId,
        session: SessionRecord,
    ) -> Result<()> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.write().await;
        let entry = subscriptions
            .entry(subscription_id.clone())
            .or_insert_with(SubscriptionEntry::new);

        debug!(
            subscription_id = %subscription_id,
            session_id = %session.session_id,
            broker_id = %session.broker_id,
            "Registering session"
        );

        entry.sessions.insert(session.session_id, session);
        entry.bump_topology();
        Ok(())
    }

    async fn heartbeat_session(
        &self,
        subscription_id: &SubscriptionId,
        session_id: &SessionId,
        now_ms: i64,
    ) -> Result<()> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.write().await;
        let session = subscriptions
            .get_mut(subscription_id)
            .and_then(|entry| entry.sessions.get_mut(session_id))
            .ok_or(CoordinationError::SessionNotFound(*session_id))?;

        session.last_heartbeat = now_ms;
        Ok(())
    }

    async fn deregister_session(
        &self,
        subscription_id: &SubscriptionId,
        session_id: &SessionId,
    ) -> Result<()> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(entry) = subscriptions.get_mut(subscription_id) {
            if entry.sessions.remove(session_id).is_some() {
                debug!(
                    subscription_id = %subscription_id,
                    session_id = %session_id,
                    "Deregistered session"
                );
                entry.bump_topology();
            }
        }
        Ok(())
    }

    async fn list_sessions(&self, subscription_id: &SubscriptionId) -> Result<Vec<SessionRecord>> {
        self.check_available()?;
        let now = current_timestamp_ms();
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .get(subscription_id)
            .map(|entry| {
                entry
                    .sessions
                    .values()
                    .filter(|session| self.is_live(session, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_assignment(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Versioned<AssignmentRecord>> {
        self.check_available()?;
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .get(subscription_id)
            .map(|entry| entry.assignment.clone())
            .unwrap_or_default())
    }

    async fn put_assignment(
        &self,
        subscription_id: &SubscriptionId,
        expected_version: u64,
        record: AssignmentRecord,
    ) -> Result<u64> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.write().await;
        let entry = subscriptions
            .entry(subscription_id.clone())
            .or_insert_with(SubscriptionEntry::new);

        let actual = entry.assignment.version;
        if actual != expected_version {
            return Err(CoordinationError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }

        let version = actual + 1;
        debug!(
            subscription_id = %subscription_id,
            version,
            generation = record.generation,
            "Stored assignment"
        );
        entry.assignment = Versioned {
            version,
            value: record,
        };
        entry.bump_topology();
        Ok(version)
    }

    async fn get_committed_offsets(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<BTreeMap<Partition, u64>> {
        self.check_available()?;
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .get(subscription_id)
            .map(|entry| entry.offsets.clone())
            .unwrap_or_default())
    }

    async fn commit_offset(
        &self,
        subscription_id: &SubscriptionId,
        partition: &Partition,
        offset: u64,
    ) -> Result<u64> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.write().await;
        let entry = subscriptions
            .entry(subscription_id.clone())
            .or_insert_with(SubscriptionEntry::new);

        let stored = entry.offsets.entry(partition.clone()).or_insert(offset);
        if offset > *stored {
            *stored = offset;
        }
        Ok(*stored)
    }

    async fn watch(&self, subscription_id: &SubscriptionId) -> Result<watch::Receiver<u64>> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.write().await;
        let entry = subscriptions
            .entry(subscription_id.clone())
            .or_insert_with(SubscriptionEntry::new);
        Ok(entry.topology_tx.subscribe())
    }
}

/// Get current timestamp in milliseconds since epoch
fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: SessionId, last_heartbeat: i64) -> SessionRecord {
        SessionRecord {
            session_id: id,
            broker_id: "broker-1".to_string(),
            client_id: "client".to_string(),
            created_at: last_heartbeat,
            last_heartbeat,
        }
    }

    #[tokio::test]
    async fn test_list_sessions_filters_expired() {
        let store = InMemoryCoordinationStore::with_session_ttl(Duration::from_secs(10));
        let sub = SubscriptionId::new("sub-1");
        let live = SessionId::generate();
        let dead = SessionId::generate();

        store
            .register_session(&sub, session(live, current_timestamp_ms()))
            .await
            .unwrap();
        store
            .register_session(&sub, session(dead, current_timestamp_ms() - 60_000))
            .await
            .unwrap();

        let sessions = store.list_sessions(&sub).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, live);
    }

    #[tokio::test]
    async fn test_heartbeat_revives_session() {
        let store = InMemoryCoordinationStore::with_session_ttl(Duration::from_secs(10));
        let sub = SubscriptionId::new("sub-1");
        let id = SessionId::generate();

        store
            .register_session(&sub, session(id, current_timestamp_ms() - 60_000))
            .await
            .unwrap();
        assert!(store.list_sessions(&sub).await.unwrap().is_empty());

        store
            .heartbeat_session(&sub, &id, current_timestamp_ms())
            .await
            .unwrap();
        assert_eq!(store.list_sessions(&sub).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_session() {
        let store = InMemoryCoordinationStore::new();
        let sub = SubscriptionId::new("sub-1");
        let id = SessionId::generate();

        let result = store.heartbeat_session(&sub, &id, 0).await;
        assert!(matches!(result, Err(CoordinationError::SessionNotFound(s)) if s == id));
    }

    #[tokio::test]
    async fn test_put_assignment_is_conditional() {
        let store = InMemoryCoordinationStore::new();
        let sub = SubscriptionId::new("sub-1");

        let current = store.get_assignment(&sub).await.unwrap();
        assert_eq!(current.version, 0);

        let record = AssignmentRecord {
            generation: 1,
            ..Default::default()
        };
        let v1 = store.put_assignment(&sub, 0, record.clone()).await.unwrap();
        assert_eq!(v1, 1);

        // A writer that read version 0 loses the race
        let stale = store.put_assignment(&sub, 0, record).await;
        match stale {
            Err(CoordinationError::VersionConflict { expected, actual }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected VersionConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_offset_never_decreases() {
        let store = InMemoryCoordinationStore::new();
        let sub = SubscriptionId::new("sub-1");
        let p = Partition::new("orders", 0);

        assert_eq!(store.commit_offset(&sub, &p, 10).await.unwrap(), 10);
        assert_eq!(store.commit_offset(&sub, &p, 4).await.unwrap(), 10);
        assert_eq!(store.commit_offset(&sub, &p, 12).await.unwrap(), 12);

        let offsets = store.get_committed_offsets(&sub).await.unwrap();
        assert_eq!(offsets[&p], 12);
    }

    #[tokio::test]
    async fn test_watch_sees_membership_changes() {
        let store = InMemoryCoordinationStore::new();
        let sub = SubscriptionId::new("sub-1");
        let mut rx = store.watch(&sub).await.unwrap();
        let initial = *rx.borrow_and_update();

        let id = SessionId::generate();
        store
            .register_session(&sub, session(id, current_timestamp_ms()))
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update() > initial);

        store.deregister_session(&sub, &id).await.unwrap();
        rx.changed().await.unwrap();

        // Deregistering twice is harmless and does not notify
        store.deregister_session(&sub, &id).await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = InMemoryCoordinationStore::new();
        let sub = SubscriptionId::new("sub-1");
        store.set_available(false);

        assert!(matches!(
            store.get_assignment(&sub).await,
            Err(CoordinationError::Unavailable(_))
        ));
        assert!(matches!(
            store
                .commit_offset(&sub, &Partition::new("orders", 0), 1)
                .await,
            Err(CoordinationError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.get_assignment(&sub).await.is_ok());
    }
}
