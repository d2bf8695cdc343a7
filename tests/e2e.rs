//! End-to-end scenarios: two bus connections talking through the routing
//! harness in `support`.

mod support;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use async_dbus::fdo::{self, NameFlag, NameReply};
use async_dbus::{
    introspection, Bus, BusBuilder, MatchRule, Message, MessageType, PropertyAccess,
    ServiceInterface, Value, Variant,
};

use support::TestDaemon;

const SERVICE_NAME: &str = "com.example.Test";
const PATH: &str = "/com/example/Test";

async fn connect(daemon: &TestDaemon) -> Result<Bus> {
    Ok(BusBuilder::new().address(daemon.address()).connect().await?)
}

fn echo_interface() -> ServiceInterface {
    ServiceInterface::builder("com.example.Echo")
        .method("Echo", "s", "s", |args| Box::pin(async move { Ok(args) }))
        .unwrap()
        .build()
        .unwrap()
}

/// The client-side description of the service, as an introspection parser
/// would produce it.
fn echo_node() -> introspection::Node {
    introspection::Node {
        interfaces: vec![introspection::Interface {
            name: "com.example.Echo".into(),
            methods: vec![introspection::Method {
                name: "Echo".into(),
                in_args: vec![introspection::Arg::new("s")],
                out_args: vec![introspection::Arg::new("s")],
            }],
            ..introspection::Interface::default()
        }],
        ..introspection::Node::default()
    }
}

async fn serve_echo(daemon: &TestDaemon) -> Result<Bus> {
    let service = connect(daemon).await?;
    service.export(PATH, echo_interface())?;

    let reply = service.request_name(SERVICE_NAME, NameFlag::NONE).await?;
    assert_eq!(reply, NameReply::PrimaryOwner);
    Ok(service)
}

#[tokio::test]
async fn hello_assigns_unique_name() -> Result<()> {
    let daemon = TestDaemon::spawn()?;

    let bus = connect(&daemon).await?;
    let name = bus.unique_name().expect("unique name after Hello");
    assert!(name.starts_with(":1."));
    assert_eq!(bus.guid(), support::GUID);

    let second = connect(&daemon).await?;
    assert_ne!(second.unique_name(), bus.unique_name());
    Ok(())
}

#[tokio::test]
async fn guid_verification() -> Result<()> {
    let daemon = TestDaemon::spawn()?;

    let bus = BusBuilder::new()
        .address(daemon.address_with_guid(support::GUID))
        .connect()
        .await?;
    assert_eq!(bus.guid(), support::GUID);

    let error = BusBuilder::new()
        .address(daemon.address_with_guid("0000000000"))
        .connect()
        .await
        .unwrap_err();
    assert!(error.to_string().contains("GUID"));
    Ok(())
}

#[tokio::test]
async fn echo_round_trip() -> Result<()> {
    let daemon = TestDaemon::spawn()?;
    let _service = serve_echo(&daemon).await?;

    let client = connect(&daemon).await?;
    let proxy = client.proxy_object(SERVICE_NAME, PATH, echo_node())?;
    let echo = proxy.interface("com.example.Echo")?;

    let reply = echo
        .call("Echo", vec![Value::String("hello".into())])
        .await?;
    assert_eq!(reply, vec![Value::String("hello".into())]);
    Ok(())
}

#[tokio::test]
async fn mistyped_arguments_fail_before_send() -> Result<()> {
    let daemon = TestDaemon::spawn()?;
    let _service = serve_echo(&daemon).await?;

    let client = connect(&daemon).await?;
    let proxy = client.proxy_object(SERVICE_NAME, PATH, echo_node())?;
    let echo = proxy.interface("com.example.Echo")?;

    // Declared `(s) -> s`, called with an u32: refused locally.
    let error = echo.call("Echo", vec![Value::Uint32(5)]).await.unwrap_err();
    assert!(error.to_string().contains("signature"));
    Ok(())
}

#[tokio::test]
async fn unknown_member_is_rejected_remotely() -> Result<()> {
    let daemon = TestDaemon::spawn()?;
    let _service = serve_echo(&daemon).await?;

    let client = connect(&daemon).await?;

    let error = client
        .call(
            Message::method_call(PATH, "Absent")
                .with_interface("com.example.Echo")
                .with_destination(SERVICE_NAME),
        )
        .await
        .unwrap_err();

    assert_eq!(error.error_name(), Some(fdo::ERROR_UNKNOWN_METHOD));
    Ok(())
}

#[tokio::test]
async fn introspection_over_the_wire() -> Result<()> {
    let daemon = TestDaemon::spawn()?;
    let _service = serve_echo(&daemon).await?;

    let client = connect(&daemon).await?;
    let xml = client
        .introspect(SERVICE_NAME, PATH, Duration::from_secs(5))
        .await?;

    assert!(xml.contains("com.example.Echo"));
    assert!(xml.contains("<method name=\"Echo\">"));
    Ok(())
}

#[tokio::test]
async fn property_change_notification() -> Result<()> {
    let daemon = TestDaemon::spawn()?;

    let service = connect(&daemon).await?;
    let bar = Arc::new(Mutex::new(105u8));

    {
        let get_bar = bar.clone();
        let set_bar = bar.clone();

        let interface = ServiceInterface::builder("com.example.Bar")
            .property(
                "Bar",
                "y",
                PropertyAccess::ReadWrite,
                Some(Box::new(move || Ok(Value::Byte(*get_bar.lock().unwrap())))),
                Some(Box::new(move |value| {
                    let bar = set_bar.clone();
                    Box::pin(async move {
                        if let Value::Byte(b) = value {
                            *bar.lock().unwrap() = b;
                        }

                        Ok(())
                    })
                })),
            )
            .unwrap()
            .build()
            .unwrap();

        service.export(PATH, interface)?;
    }

    service.request_name(SERVICE_NAME, NameFlag::NONE).await?;

    let client = connect(&daemon).await?;

    // Subscribe to PropertiesChanged on the service path.
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let rule = MatchRule::new()
        .with_signal()
        .with_path(PATH)
        .with_interface(fdo::PROPERTIES)
        .with_member("PropertiesChanged");
    client.add_match(&rule)?;
    client.add_message_handler(rule, move |message| {
        let _ = signal_tx.send(message.clone());
        None
    });

    let node = introspection::Node {
        interfaces: vec![introspection::Interface {
            name: "com.example.Bar".into(),
            properties: vec![introspection::Property {
                name: "Bar".into(),
                signature: "y".into(),
                access: PropertyAccess::ReadWrite,
            }],
            ..introspection::Interface::default()
        }],
        ..introspection::Node::default()
    };

    let proxy = client.proxy_object(SERVICE_NAME, PATH, node)?;
    let iface = proxy.interface("com.example.Bar")?;

    let initial = iface.get_property("Bar").await?;
    assert_eq!(*initial.value(), Value::Byte(105));

    // First write emits PropertiesChanged exactly once.
    iface.set_property("Bar", Value::Byte(42)).await?;
    assert_eq!(*bar.lock().unwrap(), 42);

    let signal = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv())
        .await?
        .expect("a PropertiesChanged signal");
    assert_eq!(signal.message_type, MessageType::Signal);
    assert_eq!(signal.body[0], Value::String("com.example.Bar".into()));
    assert_eq!(
        signal.body[1],
        Value::Dict(vec![(
            Value::String("Bar".into()),
            Value::Variant(Box::new(Variant::new("y", Value::Byte(42))?)),
        )])
    );

    // Writing the same value again emits nothing.
    iface.set_property("Bar", Value::Byte(42)).await?;

    let silence =
        tokio::time::timeout(Duration::from_millis(300), signal_rx.recv()).await;
    assert!(silence.is_err(), "unexpected second PropertiesChanged");
    Ok(())
}

#[tokio::test]
async fn unix_fd_passthrough() -> Result<()> {
    let daemon = TestDaemon::spawn()?;

    let service = BusBuilder::new()
        .address(daemon.address())
        .negotiate_unix_fd(true)
        .connect()
        .await?;
    assert!(service.negotiated_unix_fd());

    // Claim the call through a message handler so the full message,
    // descriptors included, is visible.
    let received = Arc::new(Mutex::new(None));

    {
        let received = received.clone();
        service.add_message_handler(
            MatchRule::new().with_member("TakeFd"),
            move |message| {
                *received.lock().unwrap() = Some((message.signature.clone(), message.unix_fds.len()));

                // The receiver owns the descriptors.
                for &fd in &message.unix_fds {
                    drop(unsafe { OwnedFd::from_raw_fd(fd) });
                }

                Some(Message::method_return(message))
            },
        );
    }

    service.export(PATH, echo_interface())?;
    service.request_name(SERVICE_NAME, NameFlag::NONE).await?;

    let client = BusBuilder::new()
        .address(daemon.address())
        .negotiate_unix_fd(true)
        .connect()
        .await?;

    let file = std::fs::File::open("/dev/null")?;

    let mut call = Message::method_call(PATH, "TakeFd")
        .with_interface("com.example.Echo")
        .with_destination(SERVICE_NAME)
        .with_body("h", vec![Value::UnixFd(0)]);
    call.unix_fds = vec![file.as_raw_fd()];

    client.call(call).await?;

    let received = received.lock().unwrap().take().expect("the service saw the call");
    assert_eq!(received, ("h".to_owned(), 1));
    Ok(())
}

#[tokio::test]
async fn signal_subscription_via_proxy() -> Result<()> {
    let daemon = TestDaemon::spawn()?;

    let service = connect(&daemon).await?;
    let interface = ServiceInterface::builder("com.example.Sig")
        .signal("Pulse", "u")
        .unwrap()
        .build()
        .unwrap();
    service.export(PATH, interface)?;
    service.request_name(SERVICE_NAME, NameFlag::NONE).await?;

    let client = connect(&daemon).await?;

    let node = introspection::Node {
        interfaces: vec![introspection::Interface {
            name: "com.example.Sig".into(),
            signals: vec![introspection::Signal {
                name: "Pulse".into(),
                args: vec![introspection::Arg::new("u")],
            }],
            ..introspection::Interface::default()
        }],
        ..introspection::Node::default()
    };

    let proxy = client.proxy_object(SERVICE_NAME, PATH, node)?;
    let iface = proxy.interface("com.example.Sig")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = iface.subscribe("Pulse", move |message| {
        let _ = tx.send(message.body.clone());
    })?;

    // Give the AddMatch a moment to reach the daemon, then emit.
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.emit_signal(PATH, "com.example.Sig", "Pulse", "u", vec![Value::Uint32(7)])?;

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("the subscribed signal");
    assert_eq!(body, vec![Value::Uint32(7)]);

    iface.unsubscribe(subscription)?;
    Ok(())
}

#[tokio::test]
async fn disconnect_propagation() -> Result<()> {
    let daemon = TestDaemon::spawn()?;

    let bus = connect(&daemon).await?;

    let hooked = Arc::new(Mutex::new(false));
    {
        let hooked = hooked.clone();
        bus.on_disconnect(move || *hooked.lock().unwrap() = true);
    }

    bus.disconnect();
    bus.wait_for_disconnect().await;
    assert!(*hooked.lock().unwrap());

    let error = bus
        .call(
            Message::method_call(PATH, "Echo")
                .with_interface("com.example.Echo")
                .with_destination(SERVICE_NAME),
        )
        .await
        .unwrap_err();
    assert!(error.is_disconnected());

    // A second disconnect is a no-op.
    bus.disconnect();
    Ok(())
}
