//! D-Bus message utilities.
//!
//! Helper functions for inspecting inbound messages, building replies, and
//! relaying message bodies between buses without interpreting them.

use zbus::message::{Builder, Flags, Message, Type as MessageType};
use zbus::zvariant::{DynamicType, Structure};
use zbus::Connection;

use crate::error::Result;

/// Extension trait for working with D-Bus messages.
pub trait MessageExt {
    /// Get the sender of the message.
    fn sender_str(&self) -> Option<String>;

    /// Get the interface of the message.
    fn interface_str(&self) -> Option<String>;

    /// Get the member (method/signal name) of the message.
    fn member_str(&self) -> Option<String>;

    /// Get the path of the message.
    fn path_str(&self) -> Option<String>;

    /// Get the serial number of the message.
    fn serial(&self) -> u32;

    /// Check if this is a method call.
    fn is_method_call(&self) -> bool;

    /// Check if this is a signal.
    fn is_signal(&self) -> bool;

    /// Whether the caller waits for a reply.
    fn expects_reply(&self) -> bool;

    /// Check if this is a signal emitted by the bus daemon with the given member.
    fn is_bus_signal(&self, member: &str) -> bool;
}

impl MessageExt for Message {
    fn sender_str(&self) -> Option<String> {
        self.header().sender().map(|s| s.to_string())
    }

    fn interface_str(&self) -> Option<String> {
        self.header().interface().map(|i| i.to_string())
    }

    fn member_str(&self) -> Option<String> {
        self.header().member().map(|m| m.to_string())
    }

    fn path_str(&self) -> Option<String> {
        self.header().path().map(|p| p.to_string())
    }

    fn serial(&self) -> u32 {
        self.primary_header().serial_num().get()
    }

    fn is_method_call(&self) -> bool {
        self.primary_header().msg_type() == MessageType::MethodCall
    }

    fn is_signal(&self) -> bool {
        self.primary_header().msg_type() == MessageType::Signal
    }

    fn expects_reply(&self) -> bool {
        !self
            .primary_header()
            .flags()
            .contains(Flags::NoReplyExpected)
    }

    fn is_bus_signal(&self, member: &str) -> bool {
        self.is_signal()
            && self.interface_str().as_deref() == Some("org.freedesktop.DBus")
            && self.member_str().as_deref() == Some(member)
    }
}

/// A message body carried across buses untouched.
///
/// The body is only ever decoded into a dynamically typed structure and
/// re-encoded with the same signature; its values are never inspected.
#[derive(Debug, Clone)]
pub struct Payload {
    message: Message,
}

impl Payload {
    /// Take the body of `message`.
    pub fn of(message: &Message) -> Self {
        Self {
            message: message.clone(),
        }
    }

    /// The D-Bus signature of the body as zvariant renders it: a single
    /// argument keeps its own signature, several are wrapped in parentheses
    /// (`"(su)"`), and no arguments give an empty string.
    pub fn signature(&self) -> String {
        self.message.body().signature().to_string()
    }

    /// Whether the body carries no arguments.
    pub fn is_empty(&self) -> bool {
        self.signature().is_empty()
    }

    /// Finish `builder` with this body.
    pub fn build(&self, builder: Builder<'_>) -> Result<Message> {
        if self.is_empty() {
            return Ok(builder.build(&())?);
        }
        let body = self.message.body();
        let fields: Structure<'_> = body.deserialize()?;
        Ok(builder.build(&fields)?)
    }

    /// Issue a method call on `conn` carrying this body.
    pub async fn call(
        &self,
        conn: &Connection,
        destination: &str,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> zbus::Result<Message> {
        if self.is_empty() {
            return conn
                .call_method(Some(destination), path, interface, member, &())
                .await;
        }
        let body = self.message.body();
        let fields: Structure<'_> = body.deserialize()?;
        conn.call_method(Some(destination), path, interface, member, &fields)
            .await
    }
}

/// Builder for method return messages answering an invocation.
pub struct MethodReturnBuilder<'a> {
    invocation: &'a Message,
}

impl<'a> MethodReturnBuilder<'a> {
    /// Create a new method return builder for an invocation.
    pub fn new(invocation: &'a Message) -> Self {
        Self { invocation }
    }

    /// Build the reply message with the given body.
    pub fn build<B: serde::Serialize + DynamicType>(self, body: &B) -> Result<Message> {
        let msg = Message::method_return(&self.invocation.header())?.build(body)?;
        Ok(msg)
    }

    /// Build the reply message carrying a relayed body.
    pub fn build_payload(self, payload: &Payload) -> Result<Message> {
        payload.build(Message::method_return(&self.invocation.header())?)
    }

    /// Build an empty reply message.
    pub fn build_empty(self) -> Result<Message> {
        self.build(&())
    }
}

/// Builder for error messages answering an invocation.
pub struct ErrorBuilder<'a> {
    invocation: &'a Message,
    error_name: String,
}

impl<'a> ErrorBuilder<'a> {
    /// Create a new error builder for an invocation.
    pub fn new(invocation: &'a Message, error_name: impl Into<String>) -> Self {
        Self {
            invocation,
            error_name: error_name.into(),
        }
    }

    /// Build the error message with a human-readable description.
    pub fn build(self, message: &str) -> Result<Message> {
        let msg = Message::error(&self.invocation.header(), self.error_name.as_str())?
            .build(&(message,))?;
        Ok(msg)
    }

    /// Build the error message carrying a relayed error body.
    pub fn build_payload(self, payload: &Payload) -> Result<Message> {
        payload.build(Message::error(
            &self.invocation.header(),
            self.error_name.as_str(),
        )?)
    }
}

/// Common D-Bus error names.
pub mod error_names {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
}

/// Standard interface names the façade answers itself.
pub mod standard_interfaces {
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
    pub const PEER: &str = "org.freedesktop.DBus.Peer";

    /// Whether `interface` is one of the standard interfaces.
    pub fn is_standard(interface: &str) -> bool {
        matches!(interface, PROPERTIES | INTROSPECTABLE | PEER)
    }
}
