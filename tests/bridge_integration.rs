//! End-to-end tests against a private bus daemon.
//!
//! Each test spawns its own `dbus-daemon`, serves a small demo service on it
//! and proxies that service under another name on the same bus. Tests are
//! skipped when `dbus-daemon` is not installed.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;
use tokio::time::timeout;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{Connection, MessageStream};

use busbridge::error::{Error, IntrospectionError};
use busbridge::{BusSelector, ContextState, Proxy, ProxyContext, ProxyContextSpec, ServiceDescriptor};

const SERVICE: &str = "com.example.Demo";
const PATH: &str = "/com/example/Demo";
const PROXY: &str = "com.example.Proxy";

const BUS_CONFIG: &str = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
<busconfig>
  <type>session</type>
  <listen>unix:path=SOCKET</listen>
  <policy context="default">
    <allow send_destination="*" eavesdrop="true"/>
    <allow eavesdrop="true"/>
    <allow own="*"/>
  </policy>
</busconfig>
"#;

/// A private bus daemon, killed on drop.
struct TestBus {
    child: Child,
    address: String,
    _dir: TempDir,
}

impl TestBus {
    fn spawn() -> Option<Self> {
        let dir = tempfile::tempdir().ok()?;
        let socket = dir.path().join("bus");
        let config = dir.path().join("bus.conf");
        std::fs::write(
            &config,
            BUS_CONFIG.replace("SOCKET", &socket.display().to_string()),
        )
        .ok()?;

        let mut child = Command::new("dbus-daemon")
            .arg(format!("--config-file={}", config.display()))
            .args(["--nofork", "--print-address"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;

        let mut line = String::new();
        let stdout = child.stdout.take()?;
        BufReader::new(stdout).read_line(&mut line).ok()?;
        let address = line.trim().to_string();
        if address.is_empty() {
            let _ = child.kill();
            return None;
        }

        Some(Self {
            child,
            address,
            _dir: dir,
        })
    }

    fn selector(&self) -> BusSelector {
        BusSelector::Address(self.address.clone())
    }

    async fn connect(&self) -> Connection {
        zbus::connection::Builder::address(self.address.as_str())
            .unwrap()
            .build()
            .await
            .unwrap()
    }
}

impl Drop for TestBus {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Demo {
    label: String,
}

#[zbus::interface(name = "com.example.Demo")]
impl Demo {
    fn echo(&self, text: String) -> String {
        text
    }

    async fn slow(&self) {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    fn fail(&self) -> zbus::fdo::Result<()> {
        Err(zbus::fdo::Error::AccessDenied("not for you".to_string()))
    }

    #[zbus(signal)]
    async fn ping(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn changed(emitter: &SignalEmitter<'_>, count: u32, name: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn label(&self) -> String {
        self.label.clone()
    }

    #[zbus(property)]
    fn set_label(&mut self, value: String) {
        self.label = value;
    }
}

async fn serve_demo(bus: &TestBus) -> Connection {
    zbus::connection::Builder::address(bus.address.as_str())
        .unwrap()
        .name(SERVICE)
        .unwrap()
        .serve_at(
            PATH,
            Demo {
                label: "front door".to_string(),
            },
        )
        .unwrap()
        .build()
        .await
        .unwrap()
}

fn spec(bus: &TestBus, service: &str, call_timeout: Option<Duration>) -> ProxyContextSpec {
    ProxyContextSpec {
        label: "demo".to_string(),
        service: ServiceDescriptor::new(service, PATH),
        proxy_name: PROXY.to_string(),
        source: bus.selector(),
        target: bus.selector(),
        call_timeout,
    }
}

/// Bus, demo service, running context and a client connection.
async fn setup(call_timeout: Option<Duration>) -> Option<(TestBus, Connection, ProxyContext, Connection)> {
    let Some(bus) = TestBus::spawn() else {
        eprintln!("dbus-daemon not available, skipping");
        return None;
    };
    let service = serve_demo(&bus).await;
    let context = ProxyContext::start(spec(&bus, SERVICE, call_timeout))
        .await
        .unwrap();
    let client = bus.connect().await;
    Some((bus, service, context, client))
}

async fn call_proxy<B>(client: &Connection, interface: &str, member: &str, body: &B) -> zbus::Result<zbus::Message>
where
    B: serde::Serialize + zbus::zvariant::DynamicType,
{
    client
        .call_method(Some(PROXY), PATH, Some(interface), member, body)
        .await
}

/// A message stream on `client` that receives `interface.member` signals
/// emitted under the proxy's name.
async fn watch_proxy_signal(client: &Connection, interface: &str, member: &str) -> MessageStream {
    let stream = MessageStream::from(client);
    client
        .call_method(
            Some("org.freedesktop.DBus"),
            "/org/freedesktop/DBus",
            Some("org.freedesktop.DBus"),
            "AddMatch",
            &(format!(
                "type='signal',sender='{PROXY}',interface='{interface}',member='{member}'"
            ),),
        )
        .await
        .unwrap();
    stream
}

async fn next_signal(stream: &mut MessageStream, interface: &str, member: &str) -> zbus::Message {
    timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = stream.next().await {
            let header = msg.header();
            if header.member().map(|m| m.as_str()) == Some(member)
                && header.interface().map(|i| i.as_str()) == Some(interface)
            {
                return Some(msg.clone());
            }
        }
        None
    })
    .await
    .unwrap()
    .unwrap()
}

fn error_name(err: &zbus::Error) -> Option<String> {
    match err {
        zbus::Error::MethodError(name, _, _) => Some(name.to_string()),
        _ => None,
    }
}

// ============================================================================
// Method calls
// ============================================================================

#[tokio::test]
async fn test_echo_through_proxy() {
    let Some((_bus, _service, mut context, client)) = setup(None).await else {
        return;
    };
    assert_eq!(context.state(), ContextState::Running);
    assert_eq!(context.registrations(), 1);
    // Ping, Changed and one PropertiesChanged.
    assert_eq!(context.subscriptions(), 3);

    let reply = call_proxy(&client, SERVICE, "Echo", &("hi",)).await.unwrap();
    let text: String = reply.body().deserialize().unwrap();
    assert_eq!(text, "hi");
    assert_eq!(context.pending_calls(), 0);

    context.shutdown().await;
    assert_eq!(context.state(), ContextState::Closed);
}

#[tokio::test]
async fn test_remote_error_is_relayed() {
    let Some((_bus, _service, mut context, client)) = setup(None).await else {
        return;
    };

    let err = call_proxy(&client, SERVICE, "Fail", &()).await.unwrap_err();
    assert_eq!(
        error_name(&err).as_deref(),
        Some("org.freedesktop.DBus.Error.AccessDenied")
    );

    context.shutdown().await;
}

#[tokio::test]
async fn test_unknown_method_is_rejected() {
    let Some((_bus, _service, mut context, client)) = setup(None).await else {
        return;
    };

    let err = call_proxy(&client, SERVICE, "Missing", &()).await.unwrap_err();
    assert_eq!(
        error_name(&err).as_deref(),
        Some("org.freedesktop.DBus.Error.UnknownMethod")
    );

    context.shutdown().await;
}

#[tokio::test]
async fn test_timeout_leaves_no_pending_call() {
    let Some((_bus, _service, mut context, client)) =
        setup(Some(Duration::from_millis(200))).await
    else {
        return;
    };

    let err = call_proxy(&client, SERVICE, "Slow", &()).await.unwrap_err();
    assert_eq!(
        error_name(&err).as_deref(),
        Some("org.freedesktop.DBus.Error.Timeout")
    );
    assert_eq!(context.pending_calls(), 0);

    context.shutdown().await;
}

// ============================================================================
// Properties and introspection
// ============================================================================

#[tokio::test]
async fn test_property_round_trip() {
    let Some((_bus, _service, mut context, client)) = setup(None).await else {
        return;
    };
    let props = "org.freedesktop.DBus.Properties";

    let reply = call_proxy(&client, props, "Get", &(SERVICE, "Label")).await.unwrap();
    let value: OwnedValue = reply.body().deserialize().unwrap();
    assert_eq!(String::try_from(value).unwrap(), "front door");

    call_proxy(&client, props, "Set", &(SERVICE, "Label", Value::from("porch")))
        .await
        .unwrap();

    let reply = call_proxy(&client, props, "Get", &(SERVICE, "Label")).await.unwrap();
    let value: OwnedValue = reply.body().deserialize().unwrap();
    assert_eq!(String::try_from(value).unwrap(), "porch");

    let reply = call_proxy(&client, props, "GetAll", &(SERVICE,)).await.unwrap();
    assert_eq!(reply.body().signature().to_string(), "a{sv}");

    context.shutdown().await;
}

#[tokio::test]
async fn test_facade_introspection() {
    let Some((_bus, _service, mut context, client)) = setup(None).await else {
        return;
    };

    let reply = call_proxy(&client, "org.freedesktop.DBus.Introspectable", "Introspect", &())
        .await
        .unwrap();
    let xml: String = reply.body().deserialize().unwrap();
    assert!(xml.contains("<interface name=\"com.example.Demo\">"));
    assert!(xml.contains("<method name=\"Echo\">"));
    assert!(xml.contains("<signal name=\"Ping\"/>"));
    assert!(xml.contains("<signal name=\"Changed\">"));

    context.shutdown().await;
}

// ============================================================================
// Signals
// ============================================================================

#[tokio::test]
async fn test_signal_is_relayed() {
    let Some((_bus, service, mut context, client)) = setup(None).await else {
        return;
    };

    let mut stream = watch_proxy_signal(&client, SERVICE, "Ping").await;
    service
        .emit_signal(None::<&str>, PATH, SERVICE, "Ping", &())
        .await
        .unwrap();

    let relayed = next_signal(&mut stream, SERVICE, "Ping").await;
    assert_eq!(relayed.header().path().map(|p| p.to_string()).as_deref(), Some(PATH));
    assert!(relayed.body().signature().to_string().is_empty());

    context.shutdown().await;
}

#[tokio::test]
async fn test_signal_arguments_are_relayed() {
    let Some((_bus, service, mut context, client)) = setup(None).await else {
        return;
    };

    let mut stream = watch_proxy_signal(&client, SERVICE, "Changed").await;
    service
        .emit_signal(None::<&str>, PATH, SERVICE, "Changed", &(7u32, "seven"))
        .await
        .unwrap();

    let relayed = next_signal(&mut stream, SERVICE, "Changed").await;
    let (count, name): (u32, String) = relayed.body().deserialize().unwrap();
    assert_eq!(count, 7);
    assert_eq!(name, "seven");

    context.shutdown().await;
}

#[tokio::test]
async fn test_properties_changed_is_relayed() {
    let Some((_bus, _service, mut context, client)) = setup(None).await else {
        return;
    };
    let props = "org.freedesktop.DBus.Properties";

    let mut stream = watch_proxy_signal(&client, props, "PropertiesChanged").await;
    client
        .call_method(
            Some(SERVICE),
            PATH,
            Some(props),
            "Set",
            &(SERVICE, "Label", Value::from("garden")),
        )
        .await
        .unwrap();

    let relayed = next_signal(&mut stream, props, "PropertiesChanged").await;
    assert_eq!(relayed.header().path().map(|p| p.to_string()).as_deref(), Some(PATH));
    let (interface, changed, invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        relayed.body().deserialize().unwrap();
    assert_eq!(interface, SERVICE);
    assert!(invalidated.is_empty());
    let label = changed.get("Label").unwrap().try_clone().unwrap();
    assert_eq!(String::try_from(label).unwrap(), "garden");

    context.shutdown().await;
}

// ============================================================================
// Setup failures and lifecycle
// ============================================================================

#[tokio::test]
async fn test_absent_service_fails_introspection() {
    let Some(bus) = TestBus::spawn() else {
        eprintln!("dbus-daemon not available, skipping");
        return;
    };

    let err = ProxyContext::start(spec(&bus, "com.example.Absent", None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Introspection(IntrospectionError::Call { .. })
    ));
}

#[tokio::test]
async fn test_proxy_runs_until_shutdown() {
    let Some(bus) = TestBus::spawn() else {
        eprintln!("dbus-daemon not available, skipping");
        return;
    };
    let _service = serve_demo(&bus).await;
    let client = bus.connect().await;

    let proxy = Proxy::new(vec![spec(&bus, SERVICE, None)]);
    let shutdown = proxy.shutdown_handle();
    let running = tokio::spawn(proxy.run());

    let mut owned = false;
    for _ in 0..50 {
        let reply = client
            .call_method(
                Some("org.freedesktop.DBus"),
                "/org/freedesktop/DBus",
                Some("org.freedesktop.DBus"),
                "NameHasOwner",
                &(PROXY,),
            )
            .await
            .unwrap();
        if reply.body().deserialize::<bool>().unwrap() {
            owned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(owned, "proxy never claimed its name");

    let reply = call_proxy(&client, SERVICE, "Echo", &("again",)).await.unwrap();
    assert_eq!(reply.body().deserialize::<String>().unwrap(), "again");

    shutdown.shutdown();
    let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(result.is_ok());
}
