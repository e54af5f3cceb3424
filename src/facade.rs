//! The façade object on the target bus.
//!
//! zbus has no object server for interfaces that are only known at runtime,
//! so the façade reads method calls off the target connection itself. Each
//! call is resolved against the object table to an [`Action`]: standard
//! interfaces are answered locally, property access goes through the
//! [`PropertyRelay`], and every other registered member is handed to the
//! [`CallForwarder`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tracing::{debug, error, info, trace, warn};
use zbus::names::{InterfaceName, MemberName};
use zbus::zvariant::{ObjectPath, OwnedValue, Signature};
use zbus::{Message, MessageStream};

use crate::endpoint::Endpoint;
use crate::error::{RegistrationError, Result};
use crate::forwarder::{error_reply, CallForwarder};
use crate::introspect::{render_node, InterfaceDescriptor};
use crate::ledger::RegistrationId;
use crate::message::{
    error_names, standard_interfaces, ErrorBuilder, MessageExt, MethodReturnBuilder, Payload,
};
use crate::properties::PropertyRelay;

/// One interface exported at one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: RegistrationId,
    pub path: String,
    pub interface: String,
}

#[derive(Debug)]
struct Entry {
    id: RegistrationId,
    descriptor: InterfaceDescriptor,
}

/// Interfaces exported on a target connection, keyed by (path, interface).
#[derive(Debug, Default)]
pub struct ObjectTable {
    entries: BTreeMap<(String, String), Entry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `interface` at `path`.
    pub fn register(
        &mut self,
        path: &str,
        interface: &InterfaceDescriptor,
    ) -> std::result::Result<RegistrationId, RegistrationError> {
        ObjectPath::try_from(path).map_err(|_| RegistrationError::InvalidPath(path.to_string()))?;
        validate_interface(interface)?;

        let key = (path.to_string(), interface.name.clone());
        if self.entries.contains_key(&key) {
            return Err(RegistrationError::AlreadyRegistered {
                path: path.to_string(),
                interface: interface.name.clone(),
            });
        }

        let id = RegistrationId::next();
        self.entries.insert(
            key,
            Entry {
                id,
                descriptor: interface.clone(),
            },
        );
        Ok(id)
    }

    /// Remove a registration. Returns false if it was not present.
    pub fn unregister(&mut self, id: RegistrationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn lookup(&self, path: &str, interface: &str) -> Option<&InterfaceDescriptor> {
        self.entries
            .get(&(path.to_string(), interface.to_string()))
            .map(|entry| &entry.descriptor)
    }

    /// Whether any interface is exported at exactly `path`.
    pub fn has_path(&self, path: &str) -> bool {
        self.entries.keys().any(|(p, _)| p == path)
    }

    pub fn interfaces_at(&self, path: &str) -> Vec<&InterfaceDescriptor> {
        self.entries
            .iter()
            .filter(|((p, _), _)| p == path)
            .map(|(_, entry)| &entry.descriptor)
            .collect()
    }

    /// Names of the nodes directly below `path` that lead to exported objects.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut children: Vec<String> = self
            .entries
            .keys()
            .filter_map(|(p, _)| p.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect();
        children.sort();
        children.dedup();
        children
    }

    /// Find the registered interface at `path` declaring method `member`.
    fn find_method(&self, path: &str, member: &str) -> Option<&InterfaceDescriptor> {
        self.interfaces_at(path)
            .into_iter()
            .find(|iface| iface.method(member).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_interface(interface: &InterfaceDescriptor) -> std::result::Result<(), RegistrationError> {
    let invalid = |reason: String| RegistrationError::InvalidInterface {
        interface: interface.name.clone(),
        reason,
    };

    InterfaceName::try_from(interface.name.as_str()).map_err(|e| invalid(e.to_string()))?;
    if standard_interfaces::is_standard(&interface.name) {
        return Err(invalid("reserved for the façade itself".to_string()));
    }

    let members = interface
        .methods
        .iter()
        .map(|m| m.name.as_str())
        .chain(interface.signals.iter().map(|s| s.name.as_str()))
        .chain(interface.properties.iter().map(|p| p.name.as_str()));
    for member in members {
        MemberName::try_from(member).map_err(|e| invalid(format!("{}: {}", member, e)))?;
    }

    let signatures = interface
        .methods
        .iter()
        .flat_map(|m| m.inputs.iter().chain(m.outputs.iter()))
        .chain(interface.signals.iter().flat_map(|s| s.args.iter()))
        .map(|arg| arg.signature.as_str())
        .chain(interface.properties.iter().map(|p| p.signature.as_str()));
    for signature in signatures {
        Signature::try_from(signature).map_err(|e| invalid(format!("{}: {}", signature, e)))?;
    }

    Ok(())
}

/// Register each interface at `path`, skipping the ones that fail.
///
/// Failures are logged; the returned list holds only the successful
/// registrations, in input order.
pub fn register_interfaces(
    table: &mut ObjectTable,
    path: &str,
    interfaces: &[InterfaceDescriptor],
) -> Vec<Registration> {
    let mut registrations = Vec::with_capacity(interfaces.len());
    for interface in interfaces {
        match table.register(path, interface) {
            Ok(id) => {
                info!(id = %id, path = %path, interface = %interface.name, "Registered façade interface");
                registrations.push(Registration {
                    id,
                    path: path.to_string(),
                    interface: interface.name.clone(),
                });
            }
            Err(e) => {
                warn!(path = %path, interface = %interface.name, error = %e, "Skipping interface");
            }
        }
    }
    registrations
}

/// What to do with one inbound message.
#[derive(Debug)]
pub enum Action {
    Introspect { xml: String },
    Ping,
    GetMachineId,
    GetProperty { interface: String, property: String },
    SetProperty {
        interface: String,
        property: String,
        value: OwnedValue,
    },
    GetAllProperties { interface: String },
    Forward { interface: String, member: String },
    Reject { error_name: &'static str, message: String },
    /// Signals and replies, which the façade does not answer.
    Ignore,
}

impl Action {
    fn reject(error_name: &'static str, message: String) -> Self {
        Action::Reject {
            error_name,
            message,
        }
    }
}

/// Decide how to handle `msg` given the exported objects.
pub fn resolve(table: &ObjectTable, msg: &Message) -> Action {
    if !msg.is_method_call() {
        return Action::Ignore;
    }
    let (Some(path), Some(member)) = (msg.path_str(), msg.member_str()) else {
        return Action::Ignore;
    };

    let interface = match msg.interface_str() {
        Some(interface) => interface,
        None => match table.find_method(&path, &member) {
            Some(iface) => iface.name.clone(),
            None => match standard_interface_for(&member) {
                Some(standard) => standard.to_string(),
                None => {
                    return Action::reject(
                        error_names::UNKNOWN_METHOD,
                        format!("No method {} at {}", member, path),
                    )
                }
            },
        },
    };

    match interface.as_str() {
        standard_interfaces::PEER => match member.as_str() {
            "Ping" => Action::Ping,
            "GetMachineId" => Action::GetMachineId,
            _ => unknown_method(&interface, &member),
        },
        standard_interfaces::INTROSPECTABLE => match member.as_str() {
            "Introspect" => {
                let interfaces = table.interfaces_at(&path);
                let children = table.children_of(&path);
                if interfaces.is_empty() && children.is_empty() {
                    return unknown_object(&path);
                }
                Action::Introspect {
                    xml: render_node(&interfaces, &children),
                }
            }
            _ => unknown_method(&interface, &member),
        },
        standard_interfaces::PROPERTIES => {
            if !table.has_path(&path) {
                return unknown_object(&path);
            }
            resolve_properties(table, msg, &path, &member)
        }
        _ => match table.lookup(&path, &interface) {
            None if !table.has_path(&path) => unknown_object(&path),
            None => Action::reject(
                error_names::UNKNOWN_INTERFACE,
                format!("No interface {} at {}", interface, path),
            ),
            Some(iface) if iface.method(&member).is_none() => unknown_method(&interface, &member),
            Some(_) => Action::Forward { interface, member },
        },
    }
}

/// The standard interface answering `member` when a call names no interface.
fn standard_interface_for(member: &str) -> Option<&'static str> {
    match member {
        "Ping" | "GetMachineId" => Some(standard_interfaces::PEER),
        "Introspect" => Some(standard_interfaces::INTROSPECTABLE),
        "Get" | "Set" | "GetAll" => Some(standard_interfaces::PROPERTIES),
        _ => None,
    }
}

fn resolve_properties(table: &ObjectTable, msg: &Message, path: &str, member: &str) -> Action {
    let body = msg.body();
    match member {
        "Get" => {
            let Ok((interface, property)) = body.deserialize::<(String, String)>() else {
                return invalid_args("Get expects (ss)");
            };
            match find_property(table, path, &interface, &property) {
                Err(action) => action,
                Ok(access) if !access.readable() => Action::reject(
                    error_names::ACCESS_DENIED,
                    format!("Property {}.{} is write-only", interface, property),
                ),
                Ok(_) => Action::GetProperty {
                    interface,
                    property,
                },
            }
        }
        "Set" => {
            let Ok((interface, property, value)) = body.deserialize::<(String, String, OwnedValue)>()
            else {
                return invalid_args("Set expects (ssv)");
            };
            match find_property(table, path, &interface, &property) {
                Err(action) => action,
                Ok(access) if !access.writable() => Action::reject(
                    error_names::PROPERTY_READ_ONLY,
                    format!("Property {}.{} is read-only", interface, property),
                ),
                Ok(_) => Action::SetProperty {
                    interface,
                    property,
                    value,
                },
            }
        }
        "GetAll" => {
            let Ok(interface) = body.deserialize::<String>() else {
                return invalid_args("GetAll expects (s)");
            };
            if table.lookup(path, &interface).is_none() {
                return Action::reject(
                    error_names::UNKNOWN_INTERFACE,
                    format!("No interface {} at {}", interface, path),
                );
            }
            Action::GetAllProperties { interface }
        }
        _ => unknown_method(standard_interfaces::PROPERTIES, member),
    }
}

fn find_property(
    table: &ObjectTable,
    path: &str,
    interface: &str,
    property: &str,
) -> std::result::Result<crate::introspect::PropertyAccess, Action> {
    let iface = table.lookup(path, interface).ok_or_else(|| {
        Action::reject(
            error_names::UNKNOWN_INTERFACE,
            format!("No interface {} at {}", interface, path),
        )
    })?;
    iface
        .property(property)
        .map(|p| p.access)
        .ok_or_else(|| {
            Action::reject(
                error_names::UNKNOWN_PROPERTY,
                format!("No property {}.{}", interface, property),
            )
        })
}

fn unknown_object(path: &str) -> Action {
    Action::reject(error_names::UNKNOWN_OBJECT, format!("No object at {}", path))
}

fn unknown_method(interface: &str, member: &str) -> Action {
    Action::reject(
        error_names::UNKNOWN_METHOD,
        format!("No method {}.{}", interface, member),
    )
}

fn invalid_args(message: &str) -> Action {
    Action::reject(error_names::INVALID_ARGS, message.to_string())
}

/// Read the local machine id, as Peer.GetMachineId reports it.
fn machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .unwrap_or_else(|_| "00000000000000000000000000000000".to_string())
        .trim()
        .to_string()
}

/// The façade exported on the target bus for one proxy context.
#[derive(Debug, Clone)]
pub struct Facade {
    target: Endpoint,
    proxy_name: String,
    table: Arc<Mutex<ObjectTable>>,
    forwarder: CallForwarder,
    properties: PropertyRelay,
}

impl Facade {
    pub fn new(
        target: Endpoint,
        proxy_name: impl Into<String>,
        forwarder: CallForwarder,
        properties: PropertyRelay,
    ) -> Self {
        Self {
            target,
            proxy_name: proxy_name.into(),
            table: Arc::new(Mutex::new(ObjectTable::new())),
            forwarder,
            properties,
        }
    }

    fn table(&self) -> MutexGuard<'_, ObjectTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the stream inbound calls will be read from.
    pub fn stream(&self) -> MessageStream {
        MessageStream::from(self.target.connection())
    }

    /// Export `interfaces` at `path`. See [`register_interfaces`].
    pub fn register(&self, path: &str, interfaces: &[InterfaceDescriptor]) -> Vec<Registration> {
        register_interfaces(&mut self.table(), path, interfaces)
    }

    pub fn unregister(&self, id: RegistrationId) -> bool {
        self.table().unregister(id)
    }

    /// Number of exported interfaces.
    pub fn registrations(&self) -> usize {
        self.table().len()
    }

    /// Number of forwarded calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.forwarder.pending()
    }

    /// Serve inbound messages until the stream ends.
    pub async fn serve(self, mut stream: MessageStream) {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(msg) => self.dispatch(msg).await,
                Err(e) => warn!(error = %e, "Error reading from target bus"),
            }
        }
        debug!(name = %self.proxy_name, "Target message stream ended");
    }

    /// Handle one inbound message.
    pub async fn dispatch(&self, msg: Message) {
        if msg.is_signal() {
            self.observe_bus_signal(&msg);
            return;
        }

        let action = resolve(&self.table(), &msg);
        if !matches!(action, Action::Ignore) {
            trace!(
                serial = msg.serial(),
                sender = ?msg.sender_str(),
                interface = ?msg.interface_str(),
                member = ?msg.member_str(),
                path = ?msg.path_str(),
                "Received method call"
            );
        }

        match action {
            Action::Ignore => {}
            Action::Forward { interface, member } => {
                self.forwarder.forward(msg, interface, member);
            }
            Action::Introspect { xml } => {
                let reply = MethodReturnBuilder::new(&msg).build(&(xml,));
                self.send_reply(&msg, reply).await;
            }
            Action::Ping => {
                let reply = MethodReturnBuilder::new(&msg).build_empty();
                self.send_reply(&msg, reply).await;
            }
            Action::GetMachineId => {
                let reply = MethodReturnBuilder::new(&msg).build(&(machine_id(),));
                self.send_reply(&msg, reply).await;
            }
            Action::GetProperty {
                interface,
                property,
            } => {
                let reply = match self.properties.get(&interface, &property).await {
                    Ok(value) => MethodReturnBuilder::new(&msg).build(&(value,)),
                    Err(e) => {
                        debug!(interface = %interface, property = %property, error = %e, "Property get failed");
                        error_reply(&msg, &e)
                    }
                };
                self.send_reply(&msg, reply).await;
            }
            Action::SetProperty {
                interface,
                property,
                value,
            } => {
                let reply = match self.properties.set(&interface, &property, &value).await {
                    Ok(()) => MethodReturnBuilder::new(&msg).build_empty(),
                    Err(e) => {
                        debug!(interface = %interface, property = %property, error = %e, "Property set failed");
                        error_reply(&msg, &e)
                    }
                };
                self.send_reply(&msg, reply).await;
            }
            Action::GetAllProperties { interface } => {
                let reply = match self.properties.get_all(&interface).await {
                    Ok(all) => MethodReturnBuilder::new(&msg).build_payload(&Payload::of(&all)),
                    Err(e) => error_reply(&msg, &e),
                };
                self.send_reply(&msg, reply).await;
            }
            Action::Reject {
                error_name,
                message,
            } => {
                debug!(
                    serial = msg.serial(),
                    error_name = error_name,
                    error_message = %message,
                    "Rejecting method call"
                );
                let reply = ErrorBuilder::new(&msg, error_name).build(&message);
                self.send_reply(&msg, reply).await;
            }
        }
    }

    fn observe_bus_signal(&self, msg: &Message) {
        let lost = msg.is_bus_signal("NameLost");
        if !lost && !msg.is_bus_signal("NameAcquired") {
            return;
        }
        let Ok(name) = msg.body().deserialize::<String>() else {
            return;
        };
        if name != self.proxy_name {
            return;
        }
        if lost {
            warn!(name = %name, "Lost bus name");
        } else {
            info!(name = %name, "Bus name acquired");
        }
    }

    async fn send_reply(&self, invocation: &Message, reply: Result<Message>) {
        if !invocation.expects_reply() {
            return;
        }
        match reply {
            Ok(reply) => {
                if let Err(e) = self.target.send(&reply).await {
                    warn!(
                        reply_to_serial = invocation.serial(),
                        member = ?invocation.member_str(),
                        error = %e,
                        "Failed to send reply"
                    );
                }
            }
            Err(e) => {
                error!(
                    reply_to_serial = invocation.serial(),
                    member = ?invocation.member_str(),
                    error = %e,
                    "Failed to create reply"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Value;

    use super::*;
    use crate::introspect::{ArgDescriptor, MethodDescriptor, PropertyAccess, PropertyDescriptor};

    const PATH: &str = "/com/example/Demo";

    fn arg(signature: &str) -> ArgDescriptor {
        ArgDescriptor {
            name: None,
            signature: signature.to_string(),
        }
    }

    fn demo() -> InterfaceDescriptor {
        InterfaceDescriptor {
            name: "com.example.Demo".to_string(),
            methods: vec![MethodDescriptor {
                name: "Echo".to_string(),
                inputs: vec![arg("s")],
                outputs: vec![arg("s")],
            }],
            signals: vec![],
            properties: vec![
                PropertyDescriptor {
                    name: "Label".to_string(),
                    signature: "s".to_string(),
                    access: PropertyAccess::ReadWrite,
                },
                PropertyDescriptor {
                    name: "Count".to_string(),
                    signature: "u".to_string(),
                    access: PropertyAccess::Read,
                },
                PropertyDescriptor {
                    name: "Secret".to_string(),
                    signature: "s".to_string(),
                    access: PropertyAccess::Write,
                },
            ],
        }
    }

    fn extra() -> InterfaceDescriptor {
        InterfaceDescriptor {
            name: "com.example.Extra".to_string(),
            methods: vec![MethodDescriptor {
                name: "Add".to_string(),
                inputs: vec![arg("i"), arg("i")],
                outputs: vec![arg("i")],
            }],
            signals: vec![],
            properties: vec![],
        }
    }

    fn table() -> ObjectTable {
        let mut table = ObjectTable::new();
        table.register(PATH, &demo()).unwrap();
        table
    }

    fn call(
        path: &'static str,
        interface: Option<&'static str>,
        member: &'static str,
    ) -> zbus::message::Builder<'static> {
        let builder = Message::method_call(path, member).unwrap();
        match interface {
            Some(interface) => builder.interface(interface).unwrap(),
            None => builder,
        }
    }

    fn rejection(action: Action) -> &'static str {
        match action {
            Action::Reject { error_name, .. } => error_name,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    // ========================================================================
    // Object table
    // ========================================================================

    #[test]
    fn test_register_and_lookup() {
        let table = table();
        assert_eq!(table.len(), 1);
        assert!(table.has_path(PATH));
        assert!(table.lookup(PATH, "com.example.Demo").is_some());
        assert!(table.lookup(PATH, "com.example.Extra").is_none());
    }

    #[test]
    fn test_register_collision() {
        let mut table = table();
        let err = table.register(PATH, &demo()).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::AlreadyRegistered {
                path: PATH.to_string(),
                interface: "com.example.Demo".to_string(),
            }
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_register_rejects_invalid_shapes() {
        let mut table = ObjectTable::new();

        let mut bad_name = demo();
        bad_name.name = "not an interface".to_string();
        assert!(matches!(
            table.register(PATH, &bad_name),
            Err(RegistrationError::InvalidInterface { .. })
        ));

        let mut bad_member = demo();
        bad_member.methods[0].name = "Echo.Twice".to_string();
        assert!(matches!(
            table.register(PATH, &bad_member),
            Err(RegistrationError::InvalidInterface { .. })
        ));

        let mut bad_signature = demo();
        bad_signature.properties[0].signature = "a{".to_string();
        assert!(matches!(
            table.register(PATH, &bad_signature),
            Err(RegistrationError::InvalidInterface { .. })
        ));

        let mut reserved = demo();
        reserved.name = standard_interfaces::PROPERTIES.to_string();
        assert!(matches!(
            table.register(PATH, &reserved),
            Err(RegistrationError::InvalidInterface { .. })
        ));

        assert_eq!(
            table.register("relative/path", &demo()),
            Err(RegistrationError::InvalidPath("relative/path".to_string()))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_unregister() {
        let mut table = ObjectTable::new();
        let id = table.register(PATH, &demo()).unwrap();
        assert!(table.unregister(id));
        assert!(!table.unregister(id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_children_of_ancestors() {
        let table = table();
        assert_eq!(table.children_of("/"), vec!["com".to_string()]);
        assert_eq!(table.children_of("/com"), vec!["example".to_string()]);
        assert_eq!(table.children_of("/com/example"), vec!["Demo".to_string()]);
        assert!(table.children_of(PATH).is_empty());
    }

    #[test]
    fn test_partial_registration_keeps_first_interface() {
        let mut table = ObjectTable::new();
        table.register(PATH, &extra()).unwrap();

        let registrations = register_interfaces(&mut table, PATH, &[demo(), extra()]);
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].interface, "com.example.Demo");
        assert_eq!(table.len(), 2);

        let msg = call(PATH, Some("com.example.Demo"), "Echo")
            .build(&("hi",))
            .unwrap();
        assert!(matches!(resolve(&table, &msg), Action::Forward { .. }));
    }

    #[test]
    fn test_registrations_never_exceed_interfaces() {
        let mut table = ObjectTable::new();
        let mut broken = extra();
        broken.name = "broken".to_string();
        let interfaces = vec![demo(), broken, extra()];

        let registrations = register_interfaces(&mut table, PATH, &interfaces);
        assert_eq!(registrations.len(), 2);
        assert!(registrations.len() <= interfaces.len());
        assert_eq!(table.len(), registrations.len());
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    #[test]
    fn test_resolve_forwards_registered_method() {
        let msg = call(PATH, Some("com.example.Demo"), "Echo")
            .build(&("hi",))
            .unwrap();
        match resolve(&table(), &msg) {
            Action::Forward { interface, member } => {
                assert_eq!(interface, "com.example.Demo");
                assert_eq!(member, "Echo");
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_without_interface_header() {
        let msg = call(PATH, None, "Echo").build(&("hi",)).unwrap();
        assert!(matches!(
            resolve(&table(), &msg),
            Action::Forward { interface, .. } if interface == "com.example.Demo"
        ));

        let msg = call(PATH, None, "Missing").build(&()).unwrap();
        assert_eq!(rejection(resolve(&table(), &msg)), error_names::UNKNOWN_METHOD);
    }

    #[test]
    fn test_resolve_standard_members_without_interface_header() {
        let table = table();

        let ping = call(PATH, None, "Ping").build(&()).unwrap();
        assert!(matches!(resolve(&table, &ping), Action::Ping));

        let machine = call("/", None, "GetMachineId").build(&()).unwrap();
        assert!(matches!(resolve(&table, &machine), Action::GetMachineId));

        let introspect = call(PATH, None, "Introspect").build(&()).unwrap();
        assert!(matches!(resolve(&table, &introspect), Action::Introspect { .. }));

        let get = call(PATH, None, "Get")
            .build(&("com.example.Demo", "Label"))
            .unwrap();
        assert!(matches!(
            resolve(&table, &get),
            Action::GetProperty { property, .. } if property == "Label"
        ));
    }

    #[test]
    fn test_resolve_unknown_targets() {
        let table = table();

        let msg = call("/com/example/Other", Some("com.example.Demo"), "Echo")
            .build(&("hi",))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_OBJECT);

        let msg = call(PATH, Some("com.example.Extra"), "Add")
            .build(&(1i32, 2i32))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_INTERFACE);

        let msg = call(PATH, Some("com.example.Demo"), "Reset").build(&()).unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_METHOD);
    }

    #[test]
    fn test_resolve_peer_and_introspect() {
        let table = table();

        let ping = call(PATH, Some(standard_interfaces::PEER), "Ping").build(&()).unwrap();
        assert!(matches!(resolve(&table, &ping), Action::Ping));

        let machine = call("/", Some(standard_interfaces::PEER), "GetMachineId")
            .build(&())
            .unwrap();
        assert!(matches!(resolve(&table, &machine), Action::GetMachineId));

        let introspect = call(PATH, Some(standard_interfaces::INTROSPECTABLE), "Introspect")
            .build(&())
            .unwrap();
        match resolve(&table, &introspect) {
            Action::Introspect { xml } => {
                assert!(xml.contains("<interface name=\"com.example.Demo\">"));
                assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Properties\">"));
            }
            other => panic!("expected introspection, got {other:?}"),
        }

        let root = call("/", Some(standard_interfaces::INTROSPECTABLE), "Introspect")
            .build(&())
            .unwrap();
        match resolve(&table, &root) {
            Action::Introspect { xml } => {
                assert!(xml.contains("<node name=\"com\"/>"));
                assert!(!xml.contains("com.example.Demo"));
            }
            other => panic!("expected introspection, got {other:?}"),
        }

        let nowhere = call("/org/other", Some(standard_interfaces::INTROSPECTABLE), "Introspect")
            .build(&())
            .unwrap();
        assert_eq!(rejection(resolve(&table, &nowhere)), error_names::UNKNOWN_OBJECT);
    }

    #[test]
    fn test_resolve_property_get() {
        let table = table();
        let props = Some(standard_interfaces::PROPERTIES);

        let msg = call(PATH, props, "Get")
            .build(&("com.example.Demo", "Label"))
            .unwrap();
        assert!(matches!(
            resolve(&table, &msg),
            Action::GetProperty { property, .. } if property == "Label"
        ));

        let msg = call(PATH, props, "Get")
            .build(&("com.example.Demo", "Missing"))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_PROPERTY);

        let msg = call(PATH, props, "Get")
            .build(&("com.example.Demo", "Secret"))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::ACCESS_DENIED);

        let msg = call(PATH, props, "Get")
            .build(&("com.example.Extra", "Label"))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_INTERFACE);

        let msg = call(PATH, props, "Get").build(&(42u32,)).unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::INVALID_ARGS);
    }

    #[test]
    fn test_resolve_property_set() {
        let table = table();
        let props = Some(standard_interfaces::PROPERTIES);

        let msg = call(PATH, props, "Set")
            .build(&("com.example.Demo", "Label", Value::from("porch")))
            .unwrap();
        match resolve(&table, &msg) {
            Action::SetProperty { property, value, .. } => {
                assert_eq!(property, "Label");
                let text: String = value.try_into().unwrap();
                assert_eq!(text, "porch");
            }
            other => panic!("expected property set, got {other:?}"),
        }

        let msg = call(PATH, props, "Set")
            .build(&("com.example.Demo", "Count", Value::from(3u32)))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::PROPERTY_READ_ONLY);
    }

    #[test]
    fn test_resolve_property_get_all() {
        let table = table();
        let props = Some(standard_interfaces::PROPERTIES);

        let msg = call(PATH, props, "GetAll").build(&("com.example.Demo",)).unwrap();
        assert!(matches!(resolve(&table, &msg), Action::GetAllProperties { .. }));

        let msg = call(PATH, props, "GetAll").build(&("com.example.Extra",)).unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_INTERFACE);

        let msg = call("/elsewhere", props, "GetAll")
            .build(&("com.example.Demo",))
            .unwrap();
        assert_eq!(rejection(resolve(&table, &msg)), error_names::UNKNOWN_OBJECT);
    }

    #[test]
    fn test_resolve_ignores_signals() {
        let msg = Message::signal(PATH, "com.example.Demo", "Ping")
            .unwrap()
            .build(&())
            .unwrap();
        assert!(matches!(resolve(&table(), &msg), Action::Ignore));
    }
}
