use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{dispatch, fdo, teardown, Bus, BusInner, Command, MatchRule};
use crate::message::Message;
use crate::protocol::{Flags, MessageType};
use crate::service::{PropertyAccess, ServiceInterface};
use crate::value::{Value, Variant};
use crate::wire::Unmarshaller;

fn test_bus() -> (Bus, mpsc::UnboundedReceiver<Command>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let inner = BusInner::new("test-guid".into(), false, cmd_tx);
    (Bus::from_inner(inner), cmd_rx)
}

/// Pop the next enqueued wire message and decode it.
async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Command>) -> Message {
    match rx.recv().await {
        Some(Command::Send(bytes, fds)) => {
            let mut unmarshaller = Unmarshaller::new();
            unmarshaller.extend(&bytes);
            unmarshaller.push_fds(fds);
            unmarshaller
                .next_message()
                .unwrap()
                .expect("a complete message")
        }
        _ => panic!("expected an outgoing message"),
    }
}

fn incoming_call(path: &str, interface: &str, member: &str) -> Message {
    let mut m = Message::method_call(path, member).with_interface(interface);
    m.serial = 7000;
    m.sender = Some(":1.99".into());
    m
}

fn echo_interface() -> ServiceInterface {
    ServiceInterface::builder("com.example.Echo")
        .method("Echo", "s", "s", |args| Box::pin(async move { Ok(args) }))
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
async fn serials_are_monotone_and_nonzero() {
    let (bus, _rx) = test_bus();

    let mut serials = Vec::new();

    for _ in 0..3 {
        let m = Message::signal("/a", "com.example.Iface", "S");
        serials.push(bus.send(m).unwrap());
    }

    assert_eq!(serials, vec![1, 2, 3]);
    assert!(serials.iter().all(|&s| s != 0));
}

#[tokio::test]
async fn no_reply_expected_creates_no_pending_reply() {
    let (bus, _rx) = test_bus();

    let call = Message::method_call("/a", "M")
        .with_destination(":1.2")
        .with_flags(Flags::NO_REPLY_EXPECTED);
    bus.send(call).unwrap();
    assert!(bus.inner.lock_state().pending.is_empty());

    let call = Message::method_call("/a", "M").with_destination(":1.2");
    bus.send(call).unwrap();
    assert_eq!(bus.inner.lock_state().pending.len(), 1);
}

#[tokio::test]
async fn call_resolves_on_reply() {
    let (bus, mut rx) = test_bus();

    let caller = bus.clone();
    let handle = tokio::spawn(async move {
        caller
            .call(Message::method_call("/remote", "M").with_destination(":1.5"))
            .await
    });

    let sent = next_sent(&mut rx).await;
    assert_eq!(sent.message_type, MessageType::MethodCall);

    let mut reply = Message::method_return(&sent).with_body("u", vec![Value::Uint32(11)]);
    reply.serial = 900;
    dispatch(&bus.inner, reply);

    let reply = handle.await.unwrap().unwrap();
    assert_eq!(reply.body, vec![Value::Uint32(11)]);
    assert!(bus.inner.lock_state().pending.is_empty());
}

#[tokio::test]
async fn error_reply_becomes_remote_error() {
    let (bus, mut rx) = test_bus();

    let caller = bus.clone();
    let handle = tokio::spawn(async move {
        caller
            .call(Message::method_call("/remote", "M").with_destination(":1.5"))
            .await
    });

    let sent = next_sent(&mut rx).await;

    let mut reply = Message::error_reply(&sent, "org.example.Error.Nope", "not today");
    reply.serial = 901;
    dispatch(&bus.inner, reply);

    let error = handle.await.unwrap().unwrap_err();
    assert_eq!(error.error_name(), Some("org.example.Error.Nope"));
    assert_eq!(error.error_message(), Some("not today"));
}

#[tokio::test]
async fn disconnect_fails_pending_and_later_calls() {
    let (bus, mut rx) = test_bus();

    let caller = bus.clone();
    let handle = tokio::spawn(async move {
        caller
            .call(Message::method_call("/remote", "M").with_destination(":1.5"))
            .await
    });

    // The call reaches the queue, then the connection dies.
    let _ = next_sent(&mut rx).await;
    teardown(&bus.inner);

    let error = handle.await.unwrap().unwrap_err();
    assert!(error.is_disconnected());

    // Subsequent calls fail synchronously, before anything is enqueued.
    let error = bus
        .send(Message::method_call("/remote", "M").with_destination(":1.5"))
        .unwrap_err();
    assert!(error.is_disconnected());
    assert!(rx.try_recv().is_err());

    // Idempotent teardown.
    bus.disconnect();
    bus.wait_for_disconnect().await;
}

#[tokio::test]
async fn echo_round_trip_through_dispatch() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();

    let call = incoming_call("/com/example", "com.example.Echo", "Echo")
        .with_body("s", vec![Value::String("hello".into())]);
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert_eq!(reply.reply_serial, Some(7000));
    assert_eq!(reply.destination.as_deref(), Some(":1.99"));
    assert_eq!(reply.body, vec![Value::String("hello".into())]);
}

#[tokio::test]
async fn unknown_member_replies_unknown_method() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();

    let call = incoming_call("/com/example", "com.example.Echo", "Nope");
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert_eq!(reply.error_name.as_deref(), Some(fdo::ERROR_UNKNOWN_METHOD));
}

#[tokio::test]
async fn missing_object_interface_and_signature_mismatches() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();

    let call = incoming_call("/elsewhere", "com.example.Echo", "Echo");
    dispatch(&bus.inner, call);
    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.error_name.as_deref(), Some(fdo::ERROR_UNKNOWN_OBJECT));

    let call = incoming_call("/com/example", "com.example.Other", "Echo");
    dispatch(&bus.inner, call);
    let reply = next_sent(&mut rx).await;
    assert_eq!(
        reply.error_name.as_deref(),
        Some(fdo::ERROR_UNKNOWN_INTERFACE)
    );

    let call = incoming_call("/com/example", "com.example.Echo", "Echo")
        .with_body("u", vec![Value::Uint32(1)]);
    dispatch(&bus.inner, call);
    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.error_name.as_deref(), Some(fdo::ERROR_INVALID_ARGS));
}

#[tokio::test]
async fn call_without_interface_searches_members() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();

    let mut call = Message::method_call("/com/example", "Echo")
        .with_body("s", vec![Value::String("x".into())]);
    call.serial = 7001;
    call.sender = Some(":1.99".into());
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert_eq!(reply.body, vec![Value::String("x".into())]);
}

#[tokio::test]
async fn introspect_lists_interfaces_and_children() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();
    bus.export("/com/example/child/deeper", echo_interface())
        .unwrap();

    let call = incoming_call("/com/example", fdo::INTROSPECTABLE, "Introspect");
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    let Some(Value::String(xml)) = reply.body.first() else {
        panic!("no xml in reply");
    };

    assert!(xml.contains("com.example.Echo"));
    assert!(xml.contains(fdo::PROPERTIES));
    assert!(xml.contains("<method name=\"Echo\">"));
    assert!(xml.contains("<node name=\"child\"/>"));
    assert!(!xml.contains("deeper"));
}

#[tokio::test]
async fn peer_ping() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();

    let call = incoming_call("/com/example", fdo::PEER, "Ping");
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert!(reply.body.is_empty());
}

fn bar_interface(value: Arc<Mutex<u8>>) -> ServiceInterface {
    let get_value = value.clone();

    ServiceInterface::builder("com.example.Bar")
        .property(
            "Bar",
            "y",
            PropertyAccess::ReadWrite,
            Some(Box::new(move || {
                Ok(Value::Byte(*get_value.lock().unwrap()))
            })),
            Some(Box::new(move |new| {
                let value = value.clone();
                Box::pin(async move {
                    if let Value::Byte(b) = new {
                        *value.lock().unwrap() = b;
                    }

                    Ok(())
                })
            })),
        )
        .unwrap()
        .build()
        .unwrap()
}

fn set_bar(serial: u32) -> Message {
    let mut call = incoming_call("/com/example", fdo::PROPERTIES, "Set").with_body(
        "ssv",
        vec![
            Value::String("com.example.Bar".into()),
            Value::String("Bar".into()),
            Value::Variant(Box::new(Variant::new("y", Value::Byte(42)).unwrap())),
        ],
    );
    call.serial = serial;
    call
}

#[tokio::test]
async fn property_get_and_set_with_change_notification() {
    let value = Arc::new(Mutex::new(105u8));
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", bar_interface(value.clone()))
        .unwrap();

    // Get returns the starting value boxed in a variant.
    let call = incoming_call("/com/example", fdo::PROPERTIES, "Get").with_body(
        "ss",
        vec![
            Value::String("com.example.Bar".into()),
            Value::String("Bar".into()),
        ],
    );
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    assert_eq!(
        reply.body,
        vec![Value::Variant(Box::new(
            Variant::new("y", Value::Byte(105)).unwrap()
        ))]
    );

    // First Set(42) emits PropertiesChanged exactly once, then replies.
    dispatch(&bus.inner, set_bar(7100));

    let signal = next_sent(&mut rx).await;
    assert_eq!(signal.message_type, MessageType::Signal);
    assert_eq!(signal.member.as_deref(), Some("PropertiesChanged"));
    assert_eq!(signal.signature, "sa{sv}as");
    assert_eq!(
        signal.body[1],
        Value::Dict(vec![(
            Value::String("Bar".into()),
            Value::Variant(Box::new(Variant::new("y", Value::Byte(42)).unwrap())),
        )])
    );

    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert_eq!(*value.lock().unwrap(), 42);

    // Setting the same value again emits nothing.
    dispatch(&bus.inner, set_bar(7101));
    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn property_set_rejects_read_only_and_bad_types() {
    let value = Arc::new(Mutex::new(1u8));
    let read_only = ServiceInterface::builder("com.example.Bar")
        .property(
            "Bar",
            "y",
            PropertyAccess::Read,
            Some(Box::new(move || Ok(Value::Byte(*value.lock().unwrap())))),
            None,
        )
        .unwrap()
        .build()
        .unwrap();

    let (bus, mut rx) = test_bus();
    bus.export("/com/example", read_only).unwrap();

    dispatch(&bus.inner, set_bar(7200));
    let reply = next_sent(&mut rx).await;
    assert_eq!(
        reply.error_name.as_deref(),
        Some(fdo::ERROR_PROPERTY_READ_ONLY)
    );

    let unknown = incoming_call("/com/example", fdo::PROPERTIES, "Get").with_body(
        "ss",
        vec![
            Value::String("com.example.Bar".into()),
            Value::String("Missing".into()),
        ],
    );
    dispatch(&bus.inner, unknown);
    let reply = next_sent(&mut rx).await;
    assert_eq!(
        reply.error_name.as_deref(),
        Some(fdo::ERROR_UNKNOWN_PROPERTY)
    );
}

#[tokio::test]
async fn match_rule_refcount_sends_at_transitions() {
    let (bus, mut rx) = test_bus();

    let rule = MatchRule::new()
        .with_signal()
        .with_interface("com.example.Iface");

    bus.add_match(&rule).unwrap();
    bus.add_match(&rule).unwrap();
    bus.add_match(&rule).unwrap();

    let sent = next_sent(&mut rx).await;
    assert_eq!(sent.member.as_deref(), Some("AddMatch"));
    assert_eq!(
        sent.body,
        vec![Value::String(rule.canonical())],
    );
    assert!(sent.flags & Flags::NO_REPLY_EXPECTED);
    assert!(rx.try_recv().is_err());

    bus.remove_match(&rule).unwrap();
    bus.remove_match(&rule).unwrap();
    assert!(rx.try_recv().is_err());

    bus.remove_match(&rule).unwrap();
    let sent = next_sent(&mut rx).await;
    assert_eq!(sent.member.as_deref(), Some("RemoveMatch"));

    // Over-removal is ignored.
    bus.remove_match(&rule).unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn signal_handlers_fire_in_registration_order() {
    let (bus, _rx) = test_bus();

    let seen = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let seen = seen.clone();
        bus.add_message_handler(
            MatchRule::new().with_member("Pulse"),
            move |_message| {
                seen.lock().unwrap().push(tag);
                None
            },
        );
    }

    let mut signal = Message::signal("/a", "com.example.Iface", "Pulse");
    signal.serial = 1;
    dispatch(&bus.inner, signal);

    assert_eq!(*seen.lock().unwrap(), ["first", "second"]);
}

#[tokio::test]
async fn message_handler_claims_method_call() {
    let (bus, mut rx) = test_bus();
    bus.export("/com/example", echo_interface()).unwrap();

    bus.add_message_handler(MatchRule::new().with_member("Echo"), |message| {
        Some(Message::method_return(message).with_body("s", vec![Value::String("claimed".into())]))
    });

    let call = incoming_call("/com/example", "com.example.Echo", "Echo")
        .with_body("s", vec![Value::String("hello".into())]);
    dispatch(&bus.inner, call);

    let reply = next_sent(&mut rx).await;
    assert_eq!(reply.body, vec![Value::String("claimed".into())]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn emit_signal_validates_declaration() {
    let (bus, mut rx) = test_bus();

    let interface = ServiceInterface::builder("com.example.Sig")
        .signal("Ok", "u")
        .unwrap()
        .disabled_signal("Off", "")
        .unwrap()
        .build()
        .unwrap();
    bus.export("/com/example", interface).unwrap();

    bus.emit_signal("/com/example", "com.example.Sig", "Ok", "u", vec![Value::Uint32(1)])
        .unwrap();
    let sent = next_sent(&mut rx).await;
    assert_eq!(sent.message_type, MessageType::Signal);

    let error = bus
        .emit_signal("/com/example", "com.example.Sig", "Off", "", vec![])
        .unwrap_err();
    assert!(error.to_string().contains("disabled"));

    assert!(bus
        .emit_signal("/com/example", "com.example.Sig", "Ok", "s", vec![
            Value::String("wrong".into())
        ])
        .is_err());

    // Signals on unexported interfaces pass through unvalidated.
    bus.emit_signal("/other", "com.example.Loose", "Free", "", vec![])
        .unwrap();
}
