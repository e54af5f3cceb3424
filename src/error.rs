//! Error types for busbridge.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use zbus::Message;

use crate::endpoint::Role;

/// Result type alias for busbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging a service between buses.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// D-Bus error from zbus.
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// Could not open a connection to one of the buses.
    #[error("Failed to connect to {role} bus ({bus}): {source}")]
    Connection {
        role: Role,
        bus: String,
        #[source]
        source: zbus::Error,
    },

    /// The source service could not be introspected.
    #[error("Introspection error: {0}")]
    Introspection(#[from] IntrospectionError),

    /// The façade name could not be acquired on the target bus.
    #[error("Failed to acquire name {name}: {reason}")]
    NameAcquisition { name: String, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message body could not be (de)serialized.
    #[error("Message error: {0}")]
    Message(String),

    /// A bus connection went away while the proxy was running.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// No proxy context could be started.
    #[error("No proxy context reached the running state")]
    NoActiveContexts,
}

impl From<zbus::zvariant::Error> for Error {
    fn from(err: zbus::zvariant::Error) -> Self {
        Error::Message(err.to_string())
    }
}

/// Failures while discovering the source service's interfaces.
#[derive(Debug, Error)]
pub enum IntrospectionError {
    /// The Introspect call itself failed (service absent, timeout, ...).
    #[error("Introspect call to {service} at {path} failed: {source}")]
    Call {
        service: String,
        path: String,
        #[source]
        source: zbus::Error,
    },

    /// The Introspect call did not answer within the call timeout.
    #[error("Introspect call to {service} at {path} timed out after {timeout:?}")]
    Timeout {
        service: String,
        path: String,
        timeout: Duration,
    },

    /// The returned document was not valid introspection XML.
    #[error("Malformed introspection document: {0}")]
    Parse(String),

    /// The document did not describe any interface that can be proxied.
    #[error("{service} at {path} exposes no interfaces")]
    NoInterfaces { service: String, path: String },
}

/// Failures while registering one façade interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The interface is already exported at this path.
    #[error("Interface {interface} is already registered at {path}")]
    AlreadyRegistered { path: String, interface: String },

    /// The interface description cannot be exported as-is.
    #[error("Interface {interface} has an invalid shape: {reason}")]
    InvalidInterface { interface: String, reason: String },

    /// The object path is not a valid D-Bus object path.
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
}

/// Failures while subscribing to a source signal.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The bus rejected the AddMatch call.
    #[error("Match rule {rule} rejected: {source}")]
    Rejected {
        rule: String,
        #[source]
        source: zbus::Error,
    },

    /// The same interface/signal pair is already relayed.
    #[error("Signal {0} is already subscribed")]
    Duplicate(String),
}

/// Failures of a single relayed call, surfaced to the original caller.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The source service answered with an error reply.
    #[error("{name}: {}", description.as_deref().unwrap_or("(no message)"))]
    Remote {
        name: String,
        description: Option<String>,
        /// The source's error message, relayed as-is.
        reply: Message,
    },

    /// No reply arrived within the configured call timeout.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The call could not be issued or the reply could not be read.
    #[error("Forwarding failed: {0}")]
    Transport(#[source] zbus::Error),
}

impl From<zbus::Error> for ForwardError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, description, reply) => ForwardError::Remote {
                name: name.to_string(),
                description,
                reply,
            },
            other => ForwardError::Transport(other),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template could not be written.
    #[error("Cannot write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value could not be parsed.
    #[error("Invalid value for {key} on line {line}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    /// A required setting is empty.
    #[error("{0} cannot be empty")]
    Missing(&'static str),

    /// The object path is not a valid D-Bus object path.
    #[error("Invalid object path: {0}")]
    InvalidObjectPath(String),
}
