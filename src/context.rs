//! Proxy contexts.
//!
//! A context binds one source service to one façade on the target bus and
//! owns everything created for it: both endpoints, the registrations, the
//! signal subscriptions and the tasks serving them.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::{BusSelector, Endpoint, Role, ServiceDescriptor};
use crate::error::Result;
use crate::facade::Facade;
use crate::forwarder::CallForwarder;
use crate::introspect::{introspect, InterfaceDescriptor};
use crate::ledger::{RegistrationId, Resource, ResourceLedger, ResourceRelease, SubscriptionId};
use crate::names::{self, NameOwnership};
use crate::properties::PropertyRelay;
use crate::signals::SignalRelay;

/// Everything needed to start one proxy context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyContextSpec {
    /// Name used in logs.
    pub label: String,
    pub service: ServiceDescriptor,
    /// Bus name the façade claims on the target bus.
    pub proxy_name: String,
    pub source: BusSelector,
    pub target: BusSelector,
    /// `None` waits for forwarded calls indefinitely.
    pub call_timeout: Option<Duration>,
}

/// Lifecycle of a proxy context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Connecting,
    Introspecting,
    Registering,
    NameAcquiring,
    Running,
    TearingDown,
    Closed,
}

impl ContextState {
    /// Whether `next` directly follows this state.
    pub fn can_advance_to(self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Uninitialized, Connecting)
                | (Connecting, Introspecting)
                | (Introspecting, Registering)
                | (Registering, NameAcquiring)
                | (NameAcquiring, Running)
                | (Connecting | Introspecting | Registering | NameAcquiring | Running, TearingDown)
                | (TearingDown, Closed)
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Connecting => "connecting",
            ContextState::Introspecting => "introspecting",
            ContextState::Registering => "registering",
            ContextState::NameAcquiring => "name-acquiring",
            ContextState::Running => "running",
            ContextState::TearingDown => "tearing-down",
            ContextState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Releases a context's registrations and subscriptions.
struct ContextResources {
    facade: Facade,
    signals: SignalRelay,
}

#[async_trait]
impl ResourceRelease for ContextResources {
    async fn unregister(&self, id: RegistrationId) -> bool {
        self.facade.unregister(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.signals.unsubscribe(id).await
    }
}

/// A running (or torn down) proxy context.
pub struct ProxyContext {
    spec: ProxyContextSpec,
    state: ContextState,
    source: Option<Endpoint>,
    target: Option<Endpoint>,
    interfaces: Vec<InterfaceDescriptor>,
    resources: Option<ContextResources>,
    ledger: ResourceLedger,
    ownership: Option<NameOwnership>,
    facade_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

impl ProxyContext {
    fn new(spec: ProxyContextSpec) -> Self {
        Self {
            spec,
            state: ContextState::Uninitialized,
            source: None,
            target: None,
            interfaces: Vec::new(),
            resources: None,
            ledger: ResourceLedger::new(),
            ownership: None,
            facade_task: None,
            signal_task: None,
        }
    }

    /// Bring a context up to [`ContextState::Running`].
    ///
    /// Connection and introspection failures are fatal: whatever was opened
    /// is closed again and the error is returned. Interfaces that cannot be
    /// registered, signals that cannot be subscribed and a name that cannot
    /// be acquired only degrade the context.
    pub async fn start(spec: ProxyContextSpec) -> Result<Self> {
        let mut context = Self::new(spec);
        match context.setup().await {
            Ok(()) => Ok(context),
            Err(e) => {
                error!(context = %context.spec.label, state = %context.state, error = %e, "Proxy context setup failed");
                context.shutdown().await;
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: ContextState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(context = %self.spec.label, from = %self.state, to = %next, "Context state change");
        self.state = next;
    }

    async fn setup(&mut self) -> Result<()> {
        let spec = self.spec.clone();

        self.transition(ContextState::Connecting);
        let source = Endpoint::connect(&spec.source, Role::Source).await?;
        self.source = Some(source.clone());
        let target = Endpoint::connect(&spec.target, Role::Target).await?;
        self.target = Some(target.clone());

        self.transition(ContextState::Introspecting);
        let interfaces = introspect(&source, &spec.service, spec.call_timeout).await?;

        self.transition(ContextState::Registering);
        let forwarder = CallForwarder::new(
            spec.service.clone(),
            source.connection().clone(),
            target.connection().clone(),
            spec.call_timeout,
        );
        let properties = PropertyRelay::new(
            spec.service.clone(),
            source.connection().clone(),
            spec.call_timeout,
        );
        let facade = Facade::new(target.clone(), spec.proxy_name.clone(), forwarder, properties);
        let relay = SignalRelay::new(spec.service.clone(), source.clone(), target.clone());
        let calls = facade.stream();
        let signals = relay.stream();

        let registrations = facade.register(&spec.service.object_path, &interfaces);
        for registration in &registrations {
            self.ledger.track(
                Resource::Registration(registration.id),
                registration.interface.clone(),
            );
        }
        if registrations.len() < interfaces.len() {
            warn!(
                context = %spec.label,
                registered = registrations.len(),
                discovered = interfaces.len(),
                "Some interfaces could not be registered"
            );
        }

        for interface in interfaces
            .iter()
            .filter(|i| registrations.iter().any(|r| r.interface == i.name))
        {
            for signal in &interface.signals {
                let label = format!("{}.{}", interface.name, signal.name);
                match relay.subscribe(&interface.name, &signal.name).await {
                    Ok(id) => self.ledger.track(Resource::Subscription(id), label),
                    Err(e) => warn!(context = %spec.label, signal = %label, error = %e, "Signal will not be relayed"),
                }
            }
        }
        if !registrations.is_empty() {
            match relay.subscribe_properties_changed().await {
                Ok(id) => self
                    .ledger
                    .track(Resource::Subscription(id), "PropertiesChanged"),
                Err(e) => warn!(context = %spec.label, error = %e, "Property changes will not be relayed"),
            }
        }

        self.facade_task = Some(tokio::spawn(facade.clone().serve(calls)));
        self.signal_task = Some(tokio::spawn(relay.clone().serve(signals)));
        self.resources = Some(ContextResources {
            facade,
            signals: relay,
        });
        self.interfaces = interfaces;

        self.transition(ContextState::NameAcquiring);
        match names::acquire(&target, &spec.proxy_name).await {
            Ok(ownership) => self.ownership = Some(ownership),
            Err(e) => warn!(context = %spec.label, error = %e, "Continuing without the façade name"),
        }

        self.transition(ContextState::Running);
        info!(
            context = %spec.label,
            service = %spec.service.name,
            path = %spec.service.object_path,
            proxy_name = %spec.proxy_name,
            source = %spec.source,
            target = %spec.target,
            registrations = self.ledger.registrations(),
            subscriptions = self.ledger.subscriptions(),
            "Proxy context running"
        );
        Ok(())
    }

    /// Wait until the façade or signal relay stops serving, which happens
    /// when its bus connection goes away.
    ///
    /// Returns the role of the endpoint that was lost. Never returns for a
    /// context that is not running.
    pub async fn closed(&mut self) -> Role {
        match (self.facade_task.as_mut(), self.signal_task.as_mut()) {
            (Some(facade), Some(signals)) => tokio::select! {
                _ = facade => Role::Target,
                _ = signals => Role::Source,
            },
            _ => std::future::pending().await,
        }
    }

    /// Release every resource and close both endpoints.
    ///
    /// Calling this on a closed context does nothing.
    pub async fn shutdown(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }
        if self.state != ContextState::Uninitialized {
            self.transition(ContextState::TearingDown);
        }

        if let (Some(target), Some(_)) = (&self.target, self.ownership) {
            if let Err(e) = names::release(target, &self.spec.proxy_name).await {
                debug!(context = %self.spec.label, error = %e, "Failed to release bus name");
            }
        }
        self.ownership = None;

        if let Some(resources) = self.resources.take() {
            let summary = self.ledger.release_all(&resources).await;
            debug!(
                context = %self.spec.label,
                registrations = summary.registrations,
                subscriptions = summary.subscriptions,
                missing = summary.missing,
                "Released context resources"
            );
        }

        for task in [self.facade_task.take(), self.signal_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        if let Some(target) = self.target.take() {
            target.close().await;
        }
        if let Some(source) = self.source.take() {
            source.close().await;
        }

        if self.state == ContextState::TearingDown {
            self.transition(ContextState::Closed);
        } else {
            self.state = ContextState::Closed;
        }
        info!(context = %self.spec.label, "Proxy context closed");
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn spec(&self) -> &ProxyContextSpec {
        &self.spec
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Interfaces discovered on the source service.
    pub fn interfaces(&self) -> &[InterfaceDescriptor] {
        &self.interfaces
    }

    /// Number of interfaces currently exported by the façade.
    pub fn registrations(&self) -> usize {
        self.ledger.registrations()
    }

    /// Number of signals currently relayed.
    pub fn subscriptions(&self) -> usize {
        self.ledger.subscriptions()
    }

    /// Forwarded calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.resources
            .as_ref()
            .map(|r| r.facade.pending_calls())
            .unwrap_or(0)
    }

    /// Standing of the façade name, if it was requested successfully.
    pub fn ownership(&self) -> Option<NameOwnership> {
        self.ownership
    }
}

impl fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyContext")
            .field("label", &self.spec.label)
            .field("state", &self.state)
            .field("registrations", &self.ledger.registrations())
            .field("subscriptions", &self.ledger.subscriptions())
            .finish()
    }
}
