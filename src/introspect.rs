//! Service introspection.
//!
//! Fetches the source service's introspection document and turns it into
//! owned interface descriptors that the façade is built from.

use std::time::Duration;

use tracing::{debug, info};
use zbus_xml::{ArgDirection, Node, PropertyAccess as XmlPropertyAccess};

use crate::endpoint::{Endpoint, ServiceDescriptor};
use crate::error::IntrospectionError;
use crate::message::standard_interfaces;

/// One argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDescriptor {
    pub name: Option<String>,
    pub signature: String,
}

/// A method: input and output arguments in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub inputs: Vec<ArgDescriptor>,
    pub outputs: Vec<ArgDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub name: String,
    pub args: Vec<ArgDescriptor>,
}

/// Read/write permissions of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    fn as_xml(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
}

/// A named interface as discovered on the source service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub signals: Vec<SignalDescriptor>,
    pub properties: Vec<PropertyDescriptor>,
}

impl InterfaceDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Fetch and parse the interfaces exported by `service` on `endpoint`.
///
/// The standard D-Bus interfaces are dropped; the façade answers those
/// itself. An empty result is an error.
pub async fn introspect(
    endpoint: &Endpoint,
    service: &ServiceDescriptor,
    timeout: Option<Duration>,
) -> Result<Vec<InterfaceDescriptor>, IntrospectionError> {
    info!(service = %service.name, path = %service.object_path, "Fetching introspection data");

    let call = endpoint.connection().call_method(
        Some(service.name.as_str()),
        service.object_path.as_str(),
        Some(standard_interfaces::INTROSPECTABLE),
        "Introspect",
        &(),
    );
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            IntrospectionError::Timeout {
                service: service.name.clone(),
                path: service.object_path.clone(),
                timeout: limit,
            }
        })?,
        None => call.await,
    };
    let reply = result.map_err(|source| IntrospectionError::Call {
        service: service.name.clone(),
        path: service.object_path.clone(),
        source,
    })?;
    let xml: String = reply
        .body()
        .deserialize()
        .map_err(|e| IntrospectionError::Parse(e.to_string()))?;

    debug!(bytes = xml.len(), "Introspection XML received");

    let interfaces = parse_interfaces(&xml)?;
    if interfaces.is_empty() {
        return Err(IntrospectionError::NoInterfaces {
            service: service.name.clone(),
            path: service.object_path.clone(),
        });
    }

    info!(
        service = %service.name,
        interfaces = ?interfaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
        "Introspection data parsed"
    );
    Ok(interfaces)
}

/// Parse an introspection document into descriptors for the non-standard
/// interfaces of the top-level node. Child nodes are ignored.
pub fn parse_interfaces(xml: &str) -> Result<Vec<InterfaceDescriptor>, IntrospectionError> {
    let node = Node::from_reader(xml.as_bytes())
        .map_err(|e| IntrospectionError::Parse(e.to_string()))?;

    let interfaces = node
        .interfaces()
        .iter()
        .filter(|iface| !standard_interfaces::is_standard(iface.name().as_str()))
        .map(|iface| InterfaceDescriptor {
            name: iface.name().to_string(),
            methods: iface
                .methods()
                .iter()
                .map(|method| {
                    let (outputs, inputs): (Vec<_>, Vec<_>) = method
                        .args()
                        .iter()
                        .partition(|arg| arg.direction() == Some(ArgDirection::Out));
                    MethodDescriptor {
                        name: method.name().to_string(),
                        inputs: inputs.into_iter().map(arg_descriptor).collect(),
                        outputs: outputs.into_iter().map(arg_descriptor).collect(),
                    }
                })
                .collect(),
            signals: iface
                .signals()
                .iter()
                .map(|signal| SignalDescriptor {
                    name: signal.name().to_string(),
                    args: signal.args().iter().map(arg_descriptor).collect(),
                })
                .collect(),
            properties: iface
                .properties()
                .iter()
                .map(|property| PropertyDescriptor {
                    name: property.name().to_string(),
                    signature: property.ty().to_string(),
                    access: match property.access() {
                        XmlPropertyAccess::Read => PropertyAccess::Read,
                        XmlPropertyAccess::Write => PropertyAccess::Write,
                        XmlPropertyAccess::ReadWrite => PropertyAccess::ReadWrite,
                    },
                })
                .collect(),
        })
        .collect();

    Ok(interfaces)
}

fn arg_descriptor(arg: &zbus_xml::Arg) -> ArgDescriptor {
    ArgDescriptor {
        name: arg.name().map(str::to_string),
        signature: arg.ty().to_string(),
    }
}

const DOCTYPE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">"#;

const STANDARD_XML: &str = r#"  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="out"/>
    </method>
    <method name="GetAll">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="properties" type="a{sv}" direction="out"/>
    </method>
    <method name="Set">
      <arg name="interface_name" type="s" direction="in"/>
      <arg name="property_name" type="s" direction="in"/>
      <arg name="value" type="v" direction="in"/>
    </method>
    <signal name="PropertiesChanged">
      <arg name="interface_name" type="s"/>
      <arg name="changed_properties" type="a{sv}"/>
      <arg name="invalidated_properties" type="as"/>
    </signal>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg name="machine_uuid" type="s" direction="out"/>
    </method>
  </interface>
"#;

/// Render the introspection document of a façade object.
///
/// `interfaces` is empty for intermediate nodes, which only list children.
pub fn render_node(interfaces: &[&InterfaceDescriptor], children: &[String]) -> String {
    let mut xml = String::from(DOCTYPE);
    xml.push_str("\n<node>\n");

    if !interfaces.is_empty() {
        xml.push_str(STANDARD_XML);
    }

    for iface in interfaces {
        xml.push_str(&format!("  <interface name=\"{}\">\n", escape(&iface.name)));
        for method in &iface.methods {
            if method.inputs.is_empty() && method.outputs.is_empty() {
                xml.push_str(&format!("    <method name=\"{}\"/>\n", escape(&method.name)));
                continue;
            }
            xml.push_str(&format!("    <method name=\"{}\">\n", escape(&method.name)));
            for arg in &method.inputs {
                xml.push_str(&render_arg(arg, Some("in")));
            }
            for arg in &method.outputs {
                xml.push_str(&render_arg(arg, Some("out")));
            }
            xml.push_str("    </method>\n");
        }
        for signal in &iface.signals {
            if signal.args.is_empty() {
                xml.push_str(&format!("    <signal name=\"{}\"/>\n", escape(&signal.name)));
                continue;
            }
            xml.push_str(&format!("    <signal name=\"{}\">\n", escape(&signal.name)));
            for arg in &signal.args {
                xml.push_str(&render_arg(arg, None));
            }
            xml.push_str("    </signal>\n");
        }
        for property in &iface.properties {
            xml.push_str(&format!(
                "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>\n",
                escape(&property.name),
                escape(&property.signature),
                property.access.as_xml()
            ));
        }
        xml.push_str("  </interface>\n");
    }

    for child in children {
        xml.push_str(&format!("  <node name=\"{}\"/>\n", escape(child)));
    }

    xml.push_str("</node>\n");
    xml
}

fn render_arg(arg: &ArgDescriptor, direction: Option<&str>) -> String {
    let mut line = String::from("      <arg");
    if let Some(name) = &arg.name {
        line.push_str(&format!(" name=\"{}\"", escape(name)));
    }
    line.push_str(&format!(" type=\"{}\"", escape(&arg.signature)));
    if let Some(direction) = direction {
        line.push_str(&format!(" direction=\"{}\"", direction));
    }
    line.push_str("/>\n");
    line
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
