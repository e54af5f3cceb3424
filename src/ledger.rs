//! Resource bookkeeping for proxy contexts.
//!
//! Every façade registration and every signal subscription a context creates
//! is recorded here under its identifier, so teardown can release all of
//! them without the context having to remember where they came from.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

/// Identifier of one façade interface registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

/// Identifier of one signal subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Counter shared by both identifier kinds; ids are never reused.
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl RegistrationId {
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl SubscriptionId {
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Registration(RegistrationId),
    Subscription(SubscriptionId),
}

/// Releases tracked resources on the buses they were created on.
#[async_trait]
pub trait ResourceRelease: Send + Sync {
    /// Unregister a façade interface from the target endpoint.
    ///
    /// Returns false if the registration was already gone.
    async fn unregister(&self, id: RegistrationId) -> bool;

    /// Drop a signal subscription on the source endpoint.
    ///
    /// Returns false if the subscription was already gone.
    async fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Outcome of one [`ResourceLedger::release_all`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub registrations: usize,
    pub subscriptions: usize,
    /// Resources the releaser reported as already gone.
    pub missing: usize,
}

/// Registrations and subscriptions owned by one proxy context.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    registrations: HashMap<RegistrationId, String>,
    subscriptions: HashMap<SubscriptionId, String>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource with a label used for diagnostics only.
    pub fn track(&mut self, resource: Resource, label: impl Into<String>) {
        let label = label.into();
        debug!(resource = ?resource, label = %label, "Tracking resource");
        match resource {
            Resource::Registration(id) => {
                self.registrations.insert(id, label);
            }
            Resource::Subscription(id) => {
                self.subscriptions.insert(id, label);
            }
        }
    }

    pub fn registrations(&self) -> usize {
        self.registrations.len()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.subscriptions.is_empty()
    }

    /// Label recorded for a resource.
    pub fn label(&self, resource: Resource) -> Option<&str> {
        match resource {
            Resource::Registration(id) => self.registrations.get(&id),
            Resource::Subscription(id) => self.subscriptions.get(&id),
        }
        .map(String::as_str)
    }

    /// Release every tracked resource and clear the ledger.
    ///
    /// Calling this again, or on an empty ledger, does nothing.
    pub async fn release_all<R: ResourceRelease + ?Sized>(&mut self, releaser: &R) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();

        for (id, label) in self.registrations.drain() {
            if releaser.unregister(id).await {
                debug!(id = %id, label = %label, "Unregistered façade interface");
            } else {
                warn!(id = %id, label = %label, "Registration was already gone");
                summary.missing += 1;
            }
            summary.registrations += 1;
        }

        for (id, label) in self.subscriptions.drain() {
            if releaser.unsubscribe(id).await {
                debug!(id = %id, label = %label, "Unsubscribed from source signal");
            } else {
                warn!(id = %id, label = %label, "Subscription was already gone");
                summary.missing += 1;
            }
            summary.subscriptions += 1;
        }

        summary
    }
}
