//! Bus endpoints.
//!
//! An endpoint wraps one private zbus connection to either the system bus,
//! the session bus, or an explicit transport address, and tags it with the
//! role it plays for a proxy context.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, trace};
use zbus::connection::Builder as ConnectionBuilder;
use zbus::{Connection, Message};

use crate::error::{Error, Result};

const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// Which bus to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusSelector {
    /// The system bus.
    System,
    /// The session bus of the current user.
    Session,
    /// An explicit D-Bus address, e.g. `unix:path=/run/foo/bus`.
    Address(String),
}

impl FromStr for BusSelector {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("bus selector cannot be empty".to_string()),
            "system" => Ok(BusSelector::System),
            "session" => Ok(BusSelector::Session),
            address => Ok(BusSelector::Address(address.to_string())),
        }
    }
}

impl fmt::Display for BusSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusSelector::System => write!(f, "system"),
            BusSelector::Session => write!(f, "session"),
            BusSelector::Address(address) => write!(f, "{}", address),
        }
    }
}

/// The role an endpoint plays for a proxy context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The bus the real service lives on.
    Source,
    /// The bus the façade is exported on.
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Target => write!(f, "target"),
        }
    }
}

/// The proxied service: its bus name and the object path being mirrored.
///
/// The endpoint it lives on is always the context's [`Role::Source`] endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Well-known or unique bus name of the service.
    pub name: String,
    /// Object path exposed by the service and mirrored by the façade.
    pub object_path: String,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, object_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_path: object_path.into(),
        }
    }
}

/// An open connection to a bus.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// The underlying zbus connection.
    connection: Connection,
    /// What this endpoint was opened from.
    selector: BusSelector,
    /// Source or target.
    role: Role,
}

impl Endpoint {
    /// Open a new private connection for the given selector.
    ///
    /// Every call opens a distinct connection, even for the same alias.
    pub async fn connect(selector: &BusSelector, role: Role) -> Result<Self> {
        info!(bus = %selector, role = %role, "Connecting to D-Bus");

        let connection = Self::open(selector).await.map_err(|source| Error::Connection {
            role,
            bus: selector.to_string(),
            source,
        })?;

        debug!(
            bus = %selector,
            role = %role,
            unique_name = ?connection.unique_name(),
            "Connected to D-Bus"
        );

        Ok(Self {
            connection,
            selector: selector.clone(),
            role,
        })
    }

    async fn open(selector: &BusSelector) -> zbus::Result<Connection> {
        let builder = match selector {
            BusSelector::System => ConnectionBuilder::system()?,
            BusSelector::Session => ConnectionBuilder::session()?,
            BusSelector::Address(address) => ConnectionBuilder::address(address.as_str())?,
        };
        builder.build().await
    }

    /// Get the connection's unique name on the bus.
    pub fn unique_name(&self) -> Option<&str> {
        self.connection.unique_name().map(|n| n.as_str())
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The selector this endpoint was opened from.
    pub fn selector(&self) -> &BusSelector {
        &self.selector
    }

    /// Source or target.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Call a method on the bus daemon itself.
    pub async fn call_bus<B>(&self, method: &str, body: &B) -> Result<Message>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        let reply = self
            .connection
            .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), method, body)
            .await?;
        Ok(reply)
    }

    /// Install a match rule on the bus.
    pub async fn add_match(&self, rule: &str) -> zbus::Result<()> {
        self.connection
            .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), "AddMatch", &(rule,))
            .await?;
        trace!(role = %self.role, rule = %rule, "Added match rule");
        Ok(())
    }

    /// Remove a previously installed match rule.
    pub async fn remove_match(&self, rule: &str) -> zbus::Result<()> {
        self.connection
            .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), "RemoveMatch", &(rule,))
            .await?;
        trace!(role = %self.role, rule = %rule, "Removed match rule");
        Ok(())
    }

    /// Send a message on this connection.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.connection.send(msg).await?;
        trace!(
            role = %self.role,
            serial = msg.primary_header().serial_num().get(),
            "Sent message"
        );
        Ok(())
    }

    /// Close the connection.
    pub async fn close(self) {
        let role = self.role;
        if let Err(e) = self.connection.close().await {
            debug!(role = %role, error = %e, "Error while closing connection");
        } else {
            debug!(role = %role, "Connection closed");
        }
    }
}
