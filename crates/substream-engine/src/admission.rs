//! Session Admission
//!
//! Every stream request passes a fixed sequence of gates before a session is
//! created. The first failing gate decides the rejection; nothing is
//! registered, assigned or persisted for a rejected request.
//!
//! ## Gate Order
//!
//! ```text
//! 1. stream parameters      → InvalidParameter
//! 2. subscription + types   → NotFound
//! 3. READ on every type     → AccessDenied (first denied type, sorted by name)
//! 4. client not blacklisted → ConsumptionBlocked
//! 5. high_level_api enabled → FeatureDisabled
//! ```
//!
//! Authorization, blacklisting and feature toggles are decided elsewhere; this
//! module only consumes their answers through the traits below.

use crate::config::StreamParameters;
use crate::error::{AdmissionError, Result};
use crate::metadata::{EventTypeRepository, Subscription, SubscriptionRepository};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use substream_core::{Partition, SubscriptionId};
use tracing::debug;

/// Authenticated caller of a stream request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Client {
    pub client_id: String,
}

impl Client {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => write!(f, "READ"),
        }
    }
}

/// A denied (permission, resource) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenied {
    pub permission: Permission,
    pub resource: String,
}

impl AccessDenied {
    /// `<permission>:<resource>`
    pub fn resource_name(&self) -> String {
        format!("{}:{}", self.permission, self.resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    HighLevelApi,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::HighLevelApi => "high_level_api",
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn authorize(
        &self,
        client: &Client,
        permission: Permission,
        resource: &str,
    ) -> std::result::Result<(), AccessDenied>;
}

pub trait BlacklistService: Send + Sync {
    fn is_blocked(&self, client_id: &str, subscription_id: &SubscriptionId) -> bool;
}

pub trait FeatureToggle: Send + Sync {
    fn is_enabled(&self, feature: Feature) -> bool;
}

// ============================================================
// STATIC IMPLEMENTATIONS
// ============================================================

/// Authorizer backed by an explicit deny list
#[derive(Default)]
pub struct StaticAuthorizer {
    denied: RwLock<HashSet<(String, String)>>,
}

impl StaticAuthorizer {
    /// Allow everything until `deny` is called
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny READ on `event_type` for `client_id`
    pub fn deny(&self, client_id: &str, event_type: &str) {
        if let Ok(mut denied) = self.denied.write() {
            denied.insert((client_id.to_string(), event_type.to_string()));
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(
        &self,
        client: &Client,
        permission: Permission,
        resource: &str,
    ) -> std::result::Result<(), AccessDenied> {
        let denied = self
            .denied
            .read()
            .map(|d| d.contains(&(client.client_id.clone(), resource.to_string())))
            .unwrap_or(true);
        if denied {
            Err(AccessDenied {
                permission,
                resource: resource.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct StaticBlacklist {
    blocked: RwLock<HashSet<(String, SubscriptionId)>>,
}

impl StaticBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, client_id: &str, subscription_id: &SubscriptionId) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.insert((client_id.to_string(), subscription_id.clone()));
        }
    }
}

impl BlacklistService for StaticBlacklist {
    fn is_blocked(&self, client_id: &str, subscription_id: &SubscriptionId) -> bool {
        self.blocked
            .read()
            .map(|b| b.contains(&(client_id.to_string(), subscription_id.clone())))
            .unwrap_or(false)
    }
}

pub struct StaticFeatureToggle {
    disabled: RwLock<HashSet<Feature>>,
}

impl StaticFeatureToggle {
    /// Every feature enabled
    pub fn enabled() -> Self {
        Self {
            disabled: RwLock::new(HashSet::new()),
        }
    }

    pub fn set(&self, feature: Feature, enabled: bool) {
        if let Ok(mut disabled) = self.disabled.write() {
            if enabled {
                disabled.remove(&feature);
            } else {
                disabled.insert(feature);
            }
        }
    }
}

impl FeatureToggle for StaticFeatureToggle {
    fn is_enabled(&self, feature: Feature) -> bool {
        self.disabled
            .read()
            .map(|d| !d.contains(&feature))
            .unwrap_or(false)
    }
}

// ============================================================
// GATE
// ============================================================

/// An admitted request: the subscription and its full partition set
#[derive(Debug, Clone)]
pub struct Admitted {
    pub subscription: Subscription,
    pub partitions: Vec<Partition>,
}

/// Runs the admission gates in order
#[derive(Clone)]
pub struct AdmissionGate {
    subscriptions: Arc<dyn SubscriptionRepository>,
    event_types: Arc<dyn EventTypeRepository>,
    authorizer: Arc<dyn Authorizer>,
    blacklist: Arc<dyn BlacklistService>,
    features: Arc<dyn FeatureToggle>,
}

impl AdmissionGate {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        event_types: Arc<dyn EventTypeRepository>,
        authorizer: Arc<dyn Authorizer>,
        blacklist: Arc<dyn BlacklistService>,
        features: Arc<dyn FeatureToggle>,
    ) -> Self {
        Self {
            subscriptions,
            event_types,
            authorizer,
            blacklist,
            features,
        }
    }

    /// Look up a subscription and the union of its event types' partitions
    ///
    /// # Errors
    ///
    /// - `NotFound`: the subscription or one of its event types does not exist
    pub async fn resolve(&self, subscription_id: &SubscriptionId) -> Result<Admitted> {
        let subscription = self
            .subscriptions
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                AdmissionError::NotFound(format!("Subscription not found: {}", subscription_id))
            })?;

        let mut partitions = Vec::new();
        for name in &subscription.event_types {
            let event_type = self.event_types.get_event_type(name).await?.ok_or_else(|| {
                AdmissionError::NotFound(format!("Event type not found: {}", name))
            })?;
            partitions.extend(event_type.partitions());
        }
        partitions.sort();

        Ok(Admitted {
            subscription,
            partitions,
        })
    }

    /// Admit or reject a stream request
    pub async fn admit(
        &self,
        subscription_id: &SubscriptionId,
        client: &Client,
        params: &StreamParameters,
    ) -> Result<Admitted> {
        params.validate()?;
        let admitted = self.resolve(subscription_id).await?;
        let subscription = &admitted.subscription;

        // BTreeSet iteration is already sorted by name
        for name in &subscription.event_types {
            if let Err(denied) = self.authorizer.authorize(client, Permission::Read, name) {
                return Err(AdmissionError::AccessDenied {
                    resource: denied.resource_name(),
                }
                .into());
            }
        }

        if self
            .blacklist
            .is_blocked(&client.client_id, subscription_id)
        {
            return Err(AdmissionError::ConsumptionBlocked {
                client_id: client.client_id.clone(),
                subscription_id: subscription_id.to_string(),
            }
            .into());
        }

        if !self.features.is_enabled(Feature::HighLevelApi) {
            return Err(
                AdmissionError::FeatureDisabled(Feature::HighLevelApi.as_str().to_string()).into(),
            );
        }

        debug!(
            subscription_id = %subscription_id,
            client_id = %client.client_id,
            partitions = admitted.partitions.len(),
            "Stream request admitted"
        );

        Ok(admitted)
    }
}
