//! Client-side proxies built from introspection data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{fdo, Bus, HandlerId, MatchRule};
use crate::error::{Error, ErrorKind, Result};
use crate::introspection;
use crate::message::Message;
use crate::names;
use crate::signature::{parse_signature, parse_single, SignatureNode};
use crate::value::{Value, Variant};

/// A remote object: a bag of per-interface proxies.
///
/// Built by [`Bus::proxy_object`] from an introspection description; no I/O
/// happens at construction time.
pub struct ProxyObject {
    bus: Bus,
    destination: String,
    path: String,
    node: introspection::Node,
}

impl ProxyObject {
    pub(crate) fn new(
        bus: Bus,
        destination: String,
        path: String,
        node: introspection::Node,
    ) -> Result<Self> {
        if !names::is_bus_name(&destination) {
            return Err(Error::new(ErrorKind::InvalidBusName));
        }

        if !names::is_object_path(&path) {
            return Err(Error::new(ErrorKind::InvalidObjectPath));
        }

        Ok(Self {
            bus,
            destination,
            path,
            node,
        })
    }

    /// The names of the interfaces the introspection data describes.
    pub fn interface_names(&self) -> impl Iterator<Item = &str> {
        self.node.interfaces.iter().map(|i| i.name.as_str())
    }

    /// Build the typed handle for one interface.
    pub fn interface(&self, name: &str) -> Result<ProxyInterface> {
        let description = self
            .node
            .interfaces
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::new(ErrorKind::InterfaceNotFound(name.into())))?;

        ProxyInterface::new(
            self.bus.clone(),
            self.destination.clone(),
            self.path.clone(),
            description,
        )
    }
}

struct ProxyMethod {
    input_signature: String,
    input_nodes: Arc<[SignatureNode]>,
    output_signature: String,
}

struct ProxyProperty {
    signature: String,
    node: SignatureNode,
}

/// One interface of a remote object.
///
/// Member signatures are resolved once at construction; calls marshal,
/// await the reply and check it against the declared output.
pub struct ProxyInterface {
    bus: Bus,
    destination: String,
    path: String,
    name: String,
    methods: HashMap<String, ProxyMethod>,
    properties: HashMap<String, ProxyProperty>,
    signals: Vec<String>,
}

impl ProxyInterface {
    fn new(
        bus: Bus,
        destination: String,
        path: String,
        description: &introspection::Interface,
    ) -> Result<Self> {
        let mut methods = HashMap::new();

        for method in &description.methods {
            let input_signature = concat_signatures(&method.in_args);
            let output_signature = concat_signatures(&method.out_args);
            let input_nodes = parse_signature(&input_signature)?;
            parse_signature(&output_signature)?;

            methods.insert(
                method.name.clone(),
                ProxyMethod {
                    input_signature,
                    input_nodes,
                    output_signature,
                },
            );
        }

        let mut properties = HashMap::new();

        for property in &description.properties {
            properties.insert(
                property.name.clone(),
                ProxyProperty {
                    signature: property.signature.clone(),
                    node: parse_single(&property.signature)?,
                },
            );
        }

        Ok(Self {
            bus,
            destination,
            path,
            name: description.name.clone(),
            methods,
            properties,
            signals: description.signals.iter().map(|s| s.name.clone()).collect(),
        })
    }

    /// The interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call a method with the given arguments and return the reply body.
    ///
    /// Arguments are checked against the declared input signature before
    /// anything is sent.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let reply = self.bus.call(self.call_message(member, args)?).await?;
        self.check_call_reply(member, reply)
    }

    /// Like [`call`], with a timeout on the reply.
    ///
    /// [`call`]: ProxyInterface::call
    pub async fn call_with_timeout(
        &self,
        member: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let reply = self
            .bus
            .call_with_timeout(self.call_message(member, args)?, timeout)
            .await?;
        self.check_call_reply(member, reply)
    }

    fn call_message(&self, member: &str, args: Vec<Value>) -> Result<Message> {
        let method = self.method(member)?;

        let conforms = args.len() == method.input_nodes.len()
            && args
                .iter()
                .zip(method.input_nodes.iter())
                .all(|(value, node)| value.conforms_to(node));

        if !conforms {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch {
                signature: method.input_signature.clone().into(),
                reason: "arguments do not match the method input signature",
            }));
        }

        Ok(Message::method_call(self.path.clone(), member)
            .with_interface(self.name.clone())
            .with_destination(self.destination.clone())
            .with_body(method.input_signature.clone(), args))
    }

    fn check_call_reply(&self, member: &str, reply: Message) -> Result<Vec<Value>> {
        let method = self.method(member)?;

        if reply.signature != method.output_signature {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch {
                signature: method.output_signature.clone().into(),
                reason: "reply does not match the method output signature",
            }));
        }

        Ok(reply.body)
    }

    fn method(&self, member: &str) -> Result<&ProxyMethod> {
        self.methods
            .get(member)
            .ok_or_else(|| Error::new(ErrorKind::UnknownMember(member.into())))
    }

    /// Read a property through `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(&self, name: &str) -> Result<Variant> {
        let property = self.property(name)?;

        let reply = self
            .bus
            .call(
                Message::method_call(self.path.clone(), "Get")
                    .with_interface(fdo::PROPERTIES)
                    .with_destination(self.destination.clone())
                    .with_body(
                        "ss",
                        vec![
                            Value::String(self.name.clone()),
                            Value::String(name.to_owned()),
                        ],
                    ),
            )
            .await?;

        let variant = match reply.body.first() {
            Some(Value::Variant(variant)) => (**variant).clone(),
            _ => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "Get reply does not carry a variant",
                )))
            }
        };

        if variant.signature() != property.signature {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch {
                signature: property.signature.clone().into(),
                reason: "property value does not match its declared type",
            }));
        }

        Ok(variant)
    }

    /// Write a property through `org.freedesktop.DBus.Properties.Set`.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let property = self.property(name)?;

        if !value.conforms_to(&property.node) {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch {
                signature: property.signature.clone().into(),
                reason: "value does not match the declared property type",
            }));
        }

        let variant = Variant::new(property.signature.clone(), value)?;

        self.bus
            .call(
                Message::method_call(self.path.clone(), "Set")
                    .with_interface(fdo::PROPERTIES)
                    .with_destination(self.destination.clone())
                    .with_body(
                        "ssv",
                        vec![
                            Value::String(self.name.clone()),
                            Value::String(name.to_owned()),
                            Value::Variant(Box::new(variant)),
                        ],
                    ),
            )
            .await?;

        Ok(())
    }

    fn property(&self, name: &str) -> Result<&ProxyProperty> {
        self.properties
            .get(name)
            .ok_or_else(|| Error::new(ErrorKind::UnknownProperty(name.into())))
    }

    /// Subscribe to a signal of this interface.
    ///
    /// Atomically registers the refcounted match rule with the daemon and a
    /// local handler; `AddMatch` hits the wire only on the first
    /// subscription for the rule.
    pub fn subscribe(
        &self,
        member: &str,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SignalSubscription> {
        if !self.signals.iter().any(|s| s == member) {
            return Err(Error::new(ErrorKind::UnknownMember(member.into())));
        }

        let rule = MatchRule::new()
            .with_signal()
            .with_sender(self.destination.clone())
            .with_path(self.path.clone())
            .with_interface(self.name.clone())
            .with_member(member);

        // Broadcast signals carry the emitter's unique name as sender;
        // filtering locally on a well-known sender would drop everything
        // the daemon already routed here.
        let local_rule = if self.destination.starts_with(':') {
            rule.clone()
        } else {
            rule.clone().without_sender()
        };

        self.bus.add_match(&rule)?;

        let handler_id = self.bus.add_message_handler(local_rule, move |message| {
            handler(message);
            None
        });

        Ok(SignalSubscription { rule, handler_id })
    }

    /// Drop a signal subscription: the handler is removed and the match
    /// rule released, reaching the daemon only on the last release.
    pub fn unsubscribe(&self, subscription: SignalSubscription) -> Result<()> {
        self.bus.remove_message_handler(subscription.handler_id);
        self.bus.remove_match(&subscription.rule)
    }
}

/// Token returned by [`ProxyInterface::subscribe`].
pub struct SignalSubscription {
    rule: MatchRule,
    handler_id: HandlerId,
}

fn concat_signatures(args: &[introspection::Arg]) -> String {
    let mut out = String::new();

    for arg in args {
        out.push_str(&arg.signature);
    }

    out
}
