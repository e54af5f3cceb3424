//! busbridge - cross-bus D-Bus proxy.
//!
//! This crate exposes a service that lives on one message bus as if it were
//! native to another. The service's interfaces are discovered at runtime by
//! introspection, mirrored by a façade object on the target bus, and every
//! method call, property access and signal is relayed between the two.

pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod facade;
pub mod forwarder;
pub mod introspect;
pub mod ledger;
pub mod message;
pub mod names;
pub mod properties;
pub mod proxy;
pub mod signals;

pub use config::{ConfigOverrides, ConfigWarning, ProxyConfig};
pub use context::{ContextState, ProxyContext, ProxyContextSpec};
pub use endpoint::{BusSelector, Endpoint, Role, ServiceDescriptor};
pub use error::{Error, Result};
pub use proxy::{Proxy, ShutdownHandle};
