//! Signal relay.
//!
//! Every signal the source service declares is subscribed with a match rule
//! scoped to the service, interface, member and object path, and each one
//! received is re-emitted as a broadcast on the target bus with the same
//! path, interface and member. `PropertiesChanged` gets a single subscription
//! per context instead of one per interface.
//!
//! All of a context's signals arrive on one message stream and are relayed
//! one at a time, so the target sees them in the order the source sent them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tracing::{debug, trace, warn};
use zbus::{Message, MessageStream};

use crate::endpoint::{Endpoint, ServiceDescriptor};
use crate::error::{Result, SubscriptionError};
use crate::ledger::SubscriptionId;
use crate::message::{standard_interfaces, MessageExt, Payload};

/// Signal emitted by the properties interface on every change.
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Server-side filter selecting one signal of the source service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFilter {
    pub sender: String,
    pub interface: String,
    pub member: String,
    pub path: String,
}

impl SignalFilter {
    pub fn new(service: &ServiceDescriptor, interface: &str, member: &str) -> Self {
        Self {
            sender: service.name.clone(),
            interface: interface.to_string(),
            member: member.to_string(),
            path: service.object_path.clone(),
        }
    }

    /// Render the match rule installed on the source bus.
    pub fn rule(&self) -> String {
        format!(
            "type='signal',sender={},interface={},member={},path={}",
            quote(&self.sender),
            quote(&self.interface),
            quote(&self.member),
            quote(&self.path)
        )
    }

    /// Whether a received signal was selected by this filter.
    ///
    /// The sender is not compared: the bus resolves the well-known name in
    /// the rule, but stamps the owner's unique name on the message.
    pub fn matches(&self, msg: &Message) -> bool {
        msg.is_signal()
            && msg.interface_str().as_deref() == Some(self.interface.as_str())
            && msg.member_str().as_deref() == Some(self.member.as_str())
            && msg.path_str().as_deref() == Some(self.path.as_str())
    }

    fn key(&self) -> (String, String) {
        (self.interface.clone(), self.member.clone())
    }
}

/// Quote a match rule value. Apostrophes cannot appear inside quotes and are
/// written as `'\''`.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Lookup from received signals to the subscription that selected them.
#[derive(Debug, Default)]
pub struct SignalRoutes {
    by_id: HashMap<SubscriptionId, SignalFilter>,
    by_signal: HashMap<(String, String), SubscriptionId>,
}

impl SignalRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the interface/member pair already has a subscription.
    pub fn contains(&self, interface: &str, member: &str) -> bool {
        self.by_signal
            .contains_key(&(interface.to_string(), member.to_string()))
    }

    pub fn insert(&mut self, id: SubscriptionId, filter: SignalFilter) {
        self.by_signal.insert(filter.key(), id);
        self.by_id.insert(id, filter);
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<SignalFilter> {
        let filter = self.by_id.remove(&id)?;
        self.by_signal.remove(&filter.key());
        Some(filter)
    }

    /// Find the subscription a received message belongs to.
    pub fn route(&self, msg: &Message) -> Option<(SubscriptionId, &SignalFilter)> {
        let key = (msg.interface_str()?, msg.member_str()?);
        let id = *self.by_signal.get(&key)?;
        let filter = self.by_id.get(&id)?;
        filter.matches(msg).then_some((id, filter))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn ids(&self) -> Vec<SubscriptionId> {
        self.by_id.keys().copied().collect()
    }
}

/// Relays the source service's signals onto the target bus.
#[derive(Debug, Clone)]
pub struct SignalRelay {
    service: ServiceDescriptor,
    source: Endpoint,
    target: Endpoint,
    routes: Arc<Mutex<SignalRoutes>>,
}

impl SignalRelay {
    pub fn new(service: ServiceDescriptor, source: Endpoint, target: Endpoint) -> Self {
        Self {
            service,
            source,
            target,
            routes: Arc::new(Mutex::new(SignalRoutes::new())),
        }
    }

    fn routes(&self) -> MutexGuard<'_, SignalRoutes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the stream signals will be delivered on.
    ///
    /// Must be called before subscribing so no signal is missed.
    pub fn stream(&self) -> MessageStream {
        MessageStream::from(self.source.connection())
    }

    /// Subscribe to one signal of the source service.
    pub async fn subscribe(
        &self,
        interface: &str,
        member: &str,
    ) -> std::result::Result<SubscriptionId, SubscriptionError> {
        if self.routes().contains(interface, member) {
            return Err(SubscriptionError::Duplicate(format!("{}.{}", interface, member)));
        }

        let filter = SignalFilter::new(&self.service, interface, member);
        let rule = filter.rule();
        self.source
            .add_match(&rule)
            .await
            .map_err(|source| SubscriptionError::Rejected {
                rule: rule.clone(),
                source,
            })?;

        let id = SubscriptionId::next();
        debug!(id = %id, rule = %rule, "Subscribed to source signal");
        self.routes().insert(id, filter);
        Ok(id)
    }

    /// Subscribe to property change notifications for the whole object.
    pub async fn subscribe_properties_changed(
        &self,
    ) -> std::result::Result<SubscriptionId, SubscriptionError> {
        self.subscribe(standard_interfaces::PROPERTIES, PROPERTIES_CHANGED)
            .await
    }

    /// Drop one subscription. Returns false if it was not active.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(filter) = self.routes().remove(id) else {
            return false;
        };
        if let Err(e) = self.source.remove_match(&filter.rule()).await {
            debug!(id = %id, error = %e, "Failed to remove match rule");
        }
        true
    }

    /// Drop every subscription.
    pub async fn unsubscribe_all(&self) -> usize {
        let ids = self.routes().ids();
        let mut released = 0;
        for id in ids {
            if self.unsubscribe(id).await {
                released += 1;
            }
        }
        released
    }

    /// Number of active subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.routes().len()
    }

    /// Relay signals from `stream` until it ends.
    pub async fn serve(self, mut stream: MessageStream) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(msg) if msg.is_signal() => {
                    self.relay(&msg).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Error reading from source bus");
                }
            }
        }
        debug!(service = %self.service.name, "Source signal stream ended");
    }

    /// Re-emit one received signal. Returns false if it was not relayed.
    pub async fn relay(&self, msg: &Message) -> bool {
        let routed = self
            .routes()
            .route(msg)
            .map(|(id, filter)| (id, filter.clone()));
        let Some((id, filter)) = routed else {
            return false;
        };

        match self.emit(&filter, msg).await {
            Ok(()) => {
                trace!(
                    subscription = %id,
                    interface = %filter.interface,
                    member = %filter.member,
                    "Relayed signal"
                );
                true
            }
            Err(e) => {
                warn!(
                    subscription = %id,
                    interface = %filter.interface,
                    member = %filter.member,
                    error = %e,
                    "Failed to relay signal"
                );
                false
            }
        }
    }

    async fn emit(&self, filter: &SignalFilter, msg: &Message) -> Result<()> {
        let builder = Message::signal(
            filter.path.as_str(),
            filter.interface.as_str(),
            filter.member.as_str(),
        )?;
        let signal = Payload::of(msg).build(builder)?;
        self.target.send(&signal).await
    }
}
