//! Subscription and event type metadata
//!
//! The engine only reads metadata; creation, deletion and persistence belong
//! to the API layer. Absence is typed: repositories return `Ok(None)` for an
//! unknown id and reserve `Err` for failures of the backend itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use substream_core::{Partition, SubscriptionId};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

/// A named consumer group reading one or more event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub event_types: BTreeSet<String>,
    pub consumer_group: String,
}

/// A named, partitioned event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub name: String,
    pub partition_count: u32,
}

impl EventType {
    pub fn new(name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            name: name.into(),
            partition_count,
        }
    }

    /// All partitions of this event type, in index order
    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        (0..self.partition_count).map(move |index| Partition::new(self.name.clone(), index))
    }
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, RepositoryError>;
}

#[async_trait]
pub trait EventTypeRepository: Send + Sync {
    async fn get_event_type(&self, name: &str) -> Result<Option<EventType>, RepositoryError>;
}

/// In-memory metadata, implementing both repositories
#[derive(Default)]
pub struct InMemoryMetadata {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    event_types: RwLock<HashMap<String, EventType>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_event_type(&self, event_type: EventType) {
        self.event_types
            .write()
            .await
            .insert(event_type.name.clone(), event_type);
    }

    pub async fn put_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn remove_subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().await.remove(id)
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryMetadata {
    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, RepositoryError> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }
}

#[async_trait]
impl EventTypeRepository for InMemoryMetadata {
    async fn get_event_type(&self, name: &str) -> Result<Option<EventType>, RepositoryError> {
        Ok(self.event_types.read().await.get(name).cloned())
    }
}
