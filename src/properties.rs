//! Property access relay.
//!
//! `Get`, `Set` and `GetAll` on the façade are answered by a round trip to
//! the source service's `org.freedesktop.DBus.Properties` interface.

use std::time::Duration;

use tracing::{debug, trace};
use zbus::zvariant::{OwnedValue, Value};
use zbus::{Connection, Message};

use crate::endpoint::ServiceDescriptor;
use crate::error::ForwardError;
use crate::forwarder::with_timeout;
use crate::message::standard_interfaces;

/// Relays property access to the source service.
#[derive(Debug, Clone)]
pub struct PropertyRelay {
    service: ServiceDescriptor,
    source: Connection,
    timeout: Option<Duration>,
}

impl PropertyRelay {
    pub fn new(service: ServiceDescriptor, source: Connection, timeout: Option<Duration>) -> Self {
        Self {
            service,
            source,
            timeout,
        }
    }

    /// Read a property, unwrapped from the variant the source returns.
    pub async fn get(&self, interface: &str, property: &str) -> Result<OwnedValue, ForwardError> {
        trace!(interface = %interface, property = %property, "Relaying property get");
        let reply = self.call("Get", &(interface, property)).await?;
        unwrap_variant(&reply)
    }

    /// Write a property; the value is forwarded as the variant it arrived in.
    pub async fn set(
        &self,
        interface: &str,
        property: &str,
        value: &Value<'_>,
    ) -> Result<(), ForwardError> {
        debug!(interface = %interface, property = %property, "Relaying property set");
        self.call("Set", &(interface, property, value)).await?;
        Ok(())
    }

    /// Read every property of an interface.
    ///
    /// The reply is returned whole so its `a{sv}` body can be relayed as-is.
    pub async fn get_all(&self, interface: &str) -> Result<Message, ForwardError> {
        trace!(interface = %interface, "Relaying property get-all");
        self.call("GetAll", &(interface,)).await
    }

    async fn call<B>(&self, method: &str, body: &B) -> Result<Message, ForwardError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        with_timeout(
            self.timeout,
            self.source.call_method(
                Some(self.service.name.as_str()),
                self.service.object_path.as_str(),
                Some(standard_interfaces::PROPERTIES),
                method,
                body,
            ),
        )
        .await
    }
}

/// Take the value out of a `Get` reply's variant.
pub fn unwrap_variant(reply: &Message) -> Result<OwnedValue, ForwardError> {
    reply
        .body()
        .deserialize::<OwnedValue>()
        .map_err(|e| ForwardError::Transport(e.into()))
}
