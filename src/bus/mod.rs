//! The message bus core: one logical connection to a D-Bus daemon.

pub use self::builder::BusBuilder;
mod builder;

pub use self::match_rule::MatchRule;
mod match_rule;

pub mod fdo;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::Transport;
use crate::error::{Error, ErrorKind, Result};
use crate::introspection;
use crate::message::Message;
use crate::names;
use crate::protocol::{Flags, MessageType};
use crate::proxy::ProxyObject;
use crate::service::ServiceInterface;
use crate::value::{Value, Variant};
use crate::wire::{marshal_message, Unmarshaller};

/// A registered message handler: called for incoming method calls and
/// signals matching its rule. Returning a reply claims a method call.
type MessageHandler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

/// Identifies a registered message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// A handle to one connection to a message bus.
///
/// The handle is cheap to clone; all clones share the connection. One
/// background task drives the socket, resolves replies and dispatches
/// incoming calls and signals.
///
/// # Examples
///
/// ```no_run
/// use async_dbus::Bus;
///
/// # async fn example() -> async_dbus::Result<()> {
/// let bus = Bus::session().await?;
/// println!("connected as {:?}", bus.unique_name());
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

pub(crate) struct BusInner {
    serial: AtomicU32,
    guid: String,
    unix_fd: bool,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Mutex<BusState>,
    disconnect_tx: watch::Sender<bool>,
    disconnect_rx: watch::Receiver<bool>,
    disconnect_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

#[derive(Default)]
struct BusState {
    unique_name: Option<String>,
    pending: HashMap<u32, oneshot::Sender<Message>>,
    handlers: Vec<HandlerEntry>,
    next_handler_id: u64,
    matches: HashMap<String, usize>,
    objects: BTreeMap<String, HashMap<String, Arc<ServiceInterface>>>,
    closed: bool,
}

struct HandlerEntry {
    id: u64,
    rule: MatchRule,
    handler: MessageHandler,
}

pub(crate) enum Command {
    Send(Vec<u8>, Vec<RawFd>),
    Disconnect,
}

impl Bus {
    /// Connect to the session bus.
    pub async fn session() -> Result<Self> {
        BusBuilder::new().connect().await
    }

    /// Connect to the system bus.
    pub async fn system() -> Result<Self> {
        BusBuilder::new().system_bus().connect().await
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    /// The unique name the daemon assigned at `Hello` time.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.lock_state().unique_name.clone()
    }

    /// The GUID of the server, from the authentication handshake.
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// Whether file descriptor passing was negotiated.
    pub fn negotiated_unix_fd(&self) -> bool {
        self.inner.unix_fd
    }

    /// Send a message, assigning a serial if it does not carry one.
    ///
    /// Marshalling problems fail here synchronously without touching the
    /// transport. A method call that expects a reply registers a pending
    /// reply slot; use [`call`] to await it.
    ///
    /// [`call`]: Bus::call
    pub fn send(&self, mut message: Message) -> Result<u32> {
        self.inner.send_message(&mut message)?;
        Ok(message.serial)
    }

    /// Send a method call and await its reply.
    ///
    /// An `ERROR` reply resolves to [`Error::remote`] with the error name
    /// and message.
    pub async fn call(&self, mut message: Message) -> Result<Message> {
        let Some(rx) = self.inner.send_message(&mut message)? else {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "message does not expect a reply",
            )));
        };

        let reply = rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))?;
        check_reply(reply)
    }

    /// Like [`call`], failing with a timeout error if no reply arrives in
    /// time. The pending reply slot is removed on expiry; a late reply is
    /// dropped.
    ///
    /// [`call`]: Bus::call
    pub async fn call_with_timeout(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let Some(rx) = self.inner.send_message(&mut message)? else {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "message does not expect a reply",
            )));
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => check_reply(reply),
            Ok(Err(..)) => Err(Error::new(ErrorKind::Disconnected)),
            Err(..) => {
                self.inner.lock_state().pending.remove(&message.serial);
                Err(Error::new(ErrorKind::TimedOut))
            }
        }
    }

    /// Ask the daemon for ownership of a well-known name.
    pub async fn request_name(&self, name: &str, flags: fdo::NameFlag) -> Result<fdo::NameReply> {
        if !names::is_bus_name(name) || name.starts_with(':') {
            return Err(Error::new(ErrorKind::InvalidBusName));
        }

        let reply = self
            .call(
                Message::method_call(fdo::DBUS_PATH, "RequestName")
                    .with_interface(fdo::DBUS_INTERFACE)
                    .with_destination(fdo::DBUS_SERVICE)
                    .with_body(
                        "su",
                        vec![Value::String(name.to_owned()), Value::Uint32(flags.0)],
                    ),
            )
            .await?;

        reply
            .body
            .first()
            .and_then(Value::as_u32)
            .and_then(fdo::NameReply::from_u32)
            .ok_or_else(|| Error::new(ErrorKind::InvalidMessage("unexpected RequestName reply")))
    }

    /// Release a well-known name owned by this connection.
    pub async fn release_name(&self, name: &str) -> Result<fdo::ReleaseNameReply> {
        if !names::is_bus_name(name) || name.starts_with(':') {
            return Err(Error::new(ErrorKind::InvalidBusName));
        }

        let reply = self
            .call(
                Message::method_call(fdo::DBUS_PATH, "ReleaseName")
                    .with_interface(fdo::DBUS_INTERFACE)
                    .with_destination(fdo::DBUS_SERVICE)
                    .with_body("s", vec![Value::String(name.to_owned())]),
            )
            .await?;

        reply
            .body
            .first()
            .and_then(Value::as_u32)
            .and_then(fdo::ReleaseNameReply::from_u32)
            .ok_or_else(|| Error::new(ErrorKind::InvalidMessage("unexpected ReleaseName reply")))
    }

    /// Export an interface at an object path.
    ///
    /// A path may carry many interfaces and the same interface instance may
    /// be exported at many paths. The standard `Introspectable`,
    /// `Properties` and `Peer` interfaces become available on the path
    /// automatically.
    pub fn export(
        &self,
        path: impl Into<String>,
        interface: impl Into<Arc<ServiceInterface>>,
    ) -> Result<()> {
        let path = path.into();

        if !names::is_object_path(&path) {
            return Err(Error::new(ErrorKind::InvalidObjectPath));
        }

        let interface = interface.into();
        let mut state = self.inner.lock_state();
        state
            .objects
            .entry(path)
            .or_default()
            .insert(interface.name().to_owned(), interface);
        Ok(())
    }

    /// Detach an interface from a path, or every interface when `interface`
    /// is `None`.
    pub fn unexport(&self, path: &str, interface: Option<&str>) -> Result<()> {
        let mut state = self.inner.lock_state();

        match interface {
            None => {
                state.objects.remove(path);
            }
            Some(name) => {
                if let Some(interfaces) = state.objects.get_mut(path) {
                    interfaces.remove(name);

                    if interfaces.is_empty() {
                        state.objects.remove(path);
                    }
                }
            }
        }

        Ok(())
    }

    /// Build client-side proxies for a remote object from its introspection
    /// description. Performs no I/O.
    pub fn proxy_object(
        &self,
        destination: impl Into<String>,
        path: impl Into<String>,
        node: introspection::Node,
    ) -> Result<ProxyObject> {
        ProxyObject::new(self.clone(), destination.into(), path.into(), node)
    }

    /// Fetch the introspection XML of a remote object.
    pub async fn introspect(
        &self,
        destination: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<String> {
        let reply = self
            .call_with_timeout(
                Message::method_call(path, "Introspect")
                    .with_interface(fdo::INTROSPECTABLE)
                    .with_destination(destination),
                timeout,
            )
            .await?;

        match reply.body.first() {
            Some(Value::String(xml)) => Ok(xml.clone()),
            _ => Err(Error::new(ErrorKind::InvalidMessage(
                "Introspect reply does not carry a string",
            ))),
        }
    }

    /// Register a match rule with the daemon, refcounted by its canonical
    /// string: `AddMatch` is sent only on the 0 to 1 transition.
    pub fn add_match(&self, rule: &MatchRule) -> Result<()> {
        let canonical = rule.canonical();

        let first = {
            let mut state = self.inner.lock_state();

            if state.closed {
                return Err(Error::new(ErrorKind::Disconnected));
            }

            let count = state.matches.entry(canonical.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            self.send(
                Message::method_call(fdo::DBUS_PATH, "AddMatch")
                    .with_interface(fdo::DBUS_INTERFACE)
                    .with_destination(fdo::DBUS_SERVICE)
                    .with_flags(Flags::NO_REPLY_EXPECTED)
                    .with_body("s", vec![Value::String(canonical)]),
            )?;
        }

        Ok(())
    }

    /// Drop one reference to a match rule; `RemoveMatch` is sent on the
    /// 1 to 0 transition.
    pub fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        let canonical = rule.canonical();

        let last = {
            let mut state = self.inner.lock_state();

            let Some(count) = state.matches.get_mut(&canonical) else {
                return Ok(());
            };

            *count -= 1;

            if *count == 0 {
                state.matches.remove(&canonical);
                true
            } else {
                false
            }
        };

        if last {
            self.send(
                Message::method_call(fdo::DBUS_PATH, "RemoveMatch")
                    .with_interface(fdo::DBUS_INTERFACE)
                    .with_destination(fdo::DBUS_SERVICE)
                    .with_flags(Flags::NO_REPLY_EXPECTED)
                    .with_body("s", vec![Value::String(canonical)]),
            )?;
        }

        Ok(())
    }

    /// Register a handler for incoming method calls and signals matching a
    /// rule. Handlers fire in registration order; returning a reply from a
    /// handler claims a method call.
    pub fn add_message_handler(
        &self,
        rule: MatchRule,
        handler: impl Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    ) -> HandlerId {
        let mut state = self.inner.lock_state();
        state.next_handler_id += 1;
        let id = state.next_handler_id;

        state.handlers.push(HandlerEntry {
            id,
            rule,
            handler: Arc::new(handler),
        });

        HandlerId(id)
    }

    /// Remove a registered message handler.
    pub fn remove_message_handler(&self, id: HandlerId) {
        let mut state = self.inner.lock_state();
        state.handlers.retain(|entry| entry.id != id.0);
    }

    /// Emit a signal from an object path.
    ///
    /// When the interface is exported at the path the signal is validated
    /// against its declared descriptor.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        {
            let state = self.inner.lock_state();

            if let Some(exported) = state.objects.get(path).and_then(|i| i.get(interface)) {
                match exported.signal(member) {
                    Some(descriptor) => {
                        if descriptor.disabled {
                            return Err(Error::new(ErrorKind::SignalDisabled(member.into())));
                        }

                        let conforms = descriptor.signature == signature
                            && body.len() == descriptor.nodes.len()
                            && body
                                .iter()
                                .zip(descriptor.nodes.iter())
                                .all(|(value, node)| value.conforms_to(node));

                        if !conforms {
                            return Err(Error::new(ErrorKind::SignatureBodyMismatch {
                                signature: descriptor.signature.clone().into(),
                                reason: "signal body does not match its declaration",
                            }));
                        }
                    }
                    None => {
                        return Err(Error::new(ErrorKind::InvalidMessage(
                            "signal is not declared on the exported interface",
                        )))
                    }
                }
            }
        }

        self.send(Message::signal(path, interface, member).with_body(signature, body))?;
        Ok(())
    }

    /// Set a hook invoked once when the connection is torn down.
    pub fn on_disconnect(&self, hook: impl FnOnce() + Send + 'static) {
        let mut guard = self
            .inner
            .disconnect_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Box::new(hook));
    }

    /// Tear the connection down. Idempotent: every outstanding pending
    /// reply fails with a disconnect error and the socket is closed once.
    /// Subsequent sends fail with a disconnect error without touching the
    /// transport.
    pub fn disconnect(&self) {
        let already = {
            let mut state = self.inner.lock_state();
            std::mem::replace(&mut state.closed, true)
        };

        if !already {
            let _ = self.inner.cmd_tx.send(Command::Disconnect);
        }
    }

    /// Wait until the connection has been torn down, by [`disconnect`] or
    /// by a transport failure.
    ///
    /// [`disconnect`]: Bus::disconnect
    pub async fn wait_for_disconnect(&self) {
        let mut rx = self.inner.disconnect_rx.clone();

        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

fn check_reply(reply: Message) -> Result<Message> {
    if reply.message_type != MessageType::Error {
        return Ok(reply);
    }

    let name = reply.error_name.clone().unwrap_or_default();

    let text = match reply.body.first() {
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    };

    Err(Error::remote(name, text))
}

impl BusInner {
    pub(crate) fn new(
        guid: String,
        unix_fd: bool,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Arc<Self> {
        let (disconnect_tx, disconnect_rx) = watch::channel(false);

        Arc::new(Self {
            serial: AtomicU32::new(1),
            guid,
            unix_fd,
            cmd_tx,
            state: Mutex::new(BusState::default()),
            disconnect_tx,
            disconnect_rx,
            disconnect_hook: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_serial(&self) -> u32 {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);

        if serial == 0 {
            // The counter wrapped; skip the forbidden zero.
            self.serial.fetch_add(1, Ordering::Relaxed)
        } else {
            serial
        }
    }

    /// Marshal and enqueue a message, registering a pending-reply slot for
    /// method calls that expect one.
    fn send_message(&self, message: &mut Message) -> Result<Option<oneshot::Receiver<Message>>> {
        if message.serial == 0 {
            message.serial = self.next_serial();
        }

        let (bytes, fds) = marshal_message(message)?;

        let rx = {
            let mut state = self.lock_state();

            if state.closed {
                return Err(Error::new(ErrorKind::Disconnected));
            }

            if message.wants_reply() {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(message.serial, tx);
                Some(rx)
            } else {
                None
            }
        };

        if self.cmd_tx.send(Command::Send(bytes, fds)).is_err() {
            self.lock_state().pending.remove(&message.serial);
            return Err(Error::new(ErrorKind::Disconnected));
        }

        Ok(rx)
    }

    /// Assign a serial and enqueue a locally generated reply or signal,
    /// logging instead of propagating failures.
    fn send_from_dispatch(&self, mut message: Message) {
        if let Err(error) = self.send_message(&mut message) {
            tracing::warn!("failed to send reply: {error}");
        }
    }
}

/// Outbound bytes with the descriptors that must accompany their first
/// byte.
struct OutMessage {
    bytes: Vec<u8>,
    offset: usize,
    fds: Vec<RawFd>,
}

/// Drive the connection: socket readiness, the outbound queue and incoming
/// dispatch, until disconnect or a terminal transport error.
pub(crate) async fn drive(
    inner: Arc<BusInner>,
    mut fd: AsyncFd<Transport>,
    mut unmarshaller: Unmarshaller,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    if let Err(error) = io_loop(&inner, &mut fd, &mut unmarshaller, &mut cmd_rx).await {
        tracing::debug!("connection terminated: {error}");
    }

    teardown(&inner);
}

async fn io_loop(
    inner: &Arc<BusInner>,
    fd: &mut AsyncFd<Transport>,
    unmarshaller: &mut Unmarshaller,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    let mut out = VecDeque::<OutMessage>::new();

    loop {
        while let Some(message) = unmarshaller.next_message()? {
            dispatch(inner, message);
        }

        let interest = if out.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Send(bytes, fds)) => {
                    out.push_back(OutMessage { bytes, offset: 0, fds });
                }
                Some(Command::Disconnect) | None => return Ok(()),
            },
            guard = fd.ready_mut(interest) => {
                let mut guard = guard?;

                if guard.ready().is_readable() {
                    let mut chunk = [0u8; 4096];
                    let mut fds = Vec::new();

                    match guard.get_inner_mut().recv(&mut chunk, &mut fds) {
                        Ok(0) => return Err(Error::new(ErrorKind::Disconnected)),
                        Ok(n) => {
                            unmarshaller.push_fds(fds);
                            unmarshaller.extend(&chunk[..n]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            guard.clear_ready_matching(Ready::READABLE);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                if guard.ready().is_writable() {
                    loop {
                        let Some(front) = out.front_mut() else {
                            break;
                        };

                        let fds = if front.offset == 0 {
                            front.fds.clone()
                        } else {
                            Vec::new()
                        };

                        match guard.get_inner_mut().send(&front.bytes[front.offset..], &fds) {
                            Ok(n) => {
                                front.offset += n;

                                if front.offset == front.bytes.len() {
                                    out.pop_front();
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                guard.clear_ready_matching(Ready::WRITABLE);
                                break;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
    }
}

fn teardown(inner: &Arc<BusInner>) {
    let hook = {
        let mut state = inner.lock_state();
        state.closed = true;
        // Dropping the senders fails every in-flight call with a
        // disconnect error in one sweep.
        state.pending.clear();

        let mut hook_guard = inner
            .disconnect_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        hook_guard.take()
    };

    let _ = inner.disconnect_tx.send(true);

    if let Some(hook) = hook {
        hook();
    }
}

/// Route one incoming message.
fn dispatch(inner: &Arc<BusInner>, message: Message) {
    tracing::trace!(
        "incoming {:?} serial={} member={:?}",
        message.message_type,
        message.serial,
        message.member
    );

    match message.message_type {
        MessageType::MethodReturn | MessageType::Error => {
            if let Some(reply_serial) = message.reply_serial {
                let tx = inner.lock_state().pending.remove(&reply_serial);

                match tx {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    // A cancelled or timed out call; the reply is dropped.
                    None => tracing::trace!("no pending reply for serial {reply_serial}"),
                }
            }
        }
        MessageType::MethodCall => {
            for entry in matching_handlers(inner, &message) {
                if let Some(reply) = (entry)(&message) {
                    if message.wants_reply() {
                        inner.send_from_dispatch(reply);
                    }

                    return;
                }
            }

            handle_method_call(inner, message);
        }
        MessageType::Signal => {
            for entry in matching_handlers(inner, &message) {
                let _ = (entry)(&message);
            }
        }
    }
}

fn matching_handlers(inner: &Arc<BusInner>, message: &Message) -> Vec<MessageHandler> {
    inner
        .lock_state()
        .handlers
        .iter()
        .filter(|entry| entry.rule.matches(message))
        .map(|entry| entry.handler.clone())
        .collect()
}

/// Resolve and invoke a method call against the object tree in its own
/// task; handlers and property setters may suspend.
fn handle_method_call(inner: &Arc<BusInner>, message: Message) {
    let inner = inner.clone();

    tokio::spawn(async move {
        let result = method_call_reply(&inner, &message).await;

        if !message.wants_reply() {
            return;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                let (name, text) = match error.error_name() {
                    Some(name) => (
                        name.to_owned(),
                        error.error_message().unwrap_or("").to_owned(),
                    ),
                    None => (fdo::ERROR_FAILED.to_owned(), error.to_string()),
                };

                Message::error_reply(&message, name, text)
            }
        };

        inner.send_from_dispatch(reply);
    });
}

async fn method_call_reply(inner: &Arc<BusInner>, message: &Message) -> Result<Message> {
    let Some(path) = message.path.as_deref() else {
        return Err(Error::remote(fdo::ERROR_INVALID_ARGS, "missing path"));
    };

    let Some(member) = message.member.as_deref() else {
        return Err(Error::remote(fdo::ERROR_INVALID_ARGS, "missing member"));
    };

    let (interfaces, children) = {
        let state = inner.lock_state();
        (
            state.objects.get(path).cloned(),
            child_names(&state.objects, path),
        )
    };

    if interfaces.is_none() && children.is_empty() {
        return Err(Error::remote(
            fdo::ERROR_UNKNOWN_OBJECT,
            format!("no object at path {path}"),
        ));
    }

    match message.interface.as_deref() {
        Some(fdo::INTROSPECTABLE) => {
            introspect_reply(message, member, interfaces.as_ref(), children)
        }
        Some(fdo::PEER) => peer_reply(message, member),
        Some(fdo::PROPERTIES) => {
            let Some(interfaces) = interfaces else {
                return Err(Error::remote(
                    fdo::ERROR_UNKNOWN_INTERFACE,
                    "path exports no interfaces",
                ));
            };

            properties_reply(inner, message, member, &interfaces).await
        }
        _ => {
            let Some(interfaces) = interfaces else {
                return Err(Error::remote(
                    fdo::ERROR_UNKNOWN_INTERFACE,
                    "path exports no interfaces",
                ));
            };

            user_method_reply(message, member, &interfaces).await
        }
    }
}

async fn user_method_reply(
    message: &Message,
    member: &str,
    interfaces: &HashMap<String, Arc<ServiceInterface>>,
) -> Result<Message> {
    let interface = match message.interface.as_deref() {
        Some(name) => match interfaces.get(name) {
            Some(interface) => interface.clone(),
            None => {
                return Err(Error::remote(
                    fdo::ERROR_UNKNOWN_INTERFACE,
                    format!("unknown interface {name}"),
                ))
            }
        },
        // Without an interface, search the member across every interface
        // on the path.
        None => match interfaces.values().find(|i| i.method(member).is_some()) {
            Some(interface) => interface.clone(),
            None => {
                return Err(Error::remote(
                    fdo::ERROR_UNKNOWN_METHOD,
                    format!("unknown method {member}"),
                ))
            }
        },
    };

    let Some(descriptor) = interface.method(member) else {
        return Err(Error::remote(
            fdo::ERROR_UNKNOWN_METHOD,
            format!("unknown method {member}"),
        ));
    };

    if descriptor.input_signature != message.signature {
        return Err(Error::remote(
            fdo::ERROR_INVALID_ARGS,
            format!(
                "expected signature {:?}, got {:?}",
                descriptor.input_signature, message.signature
            ),
        ));
    }

    let values = (descriptor.handler)(message.body.clone()).await?;

    let conforms = values.len() == descriptor.output_nodes.len()
        && values
            .iter()
            .zip(descriptor.output_nodes.iter())
            .all(|(value, node)| value.conforms_to(node));

    if !conforms {
        return Err(Error::remote(
            fdo::ERROR_FAILED,
            "method returned values not matching its output signature",
        ));
    }

    Ok(Message::method_return(message)
        .with_body(descriptor.output_signature.clone(), values))
}

fn introspect_reply(
    message: &Message,
    member: &str,
    interfaces: Option<&HashMap<String, Arc<ServiceInterface>>>,
    children: Vec<String>,
) -> Result<Message> {
    if member != "Introspect" {
        return Err(Error::remote(
            fdo::ERROR_UNKNOWN_METHOD,
            format!("unknown method {member}"),
        ));
    }

    if !message.signature.is_empty() {
        return Err(Error::remote(
            fdo::ERROR_INVALID_ARGS,
            "Introspect takes no arguments",
        ));
    }

    let mut node = introspection::Node::default();

    if let Some(interfaces) = interfaces {
        node.interfaces = standard_interface_descriptions();

        // Sorted for a stable document.
        let mut exported: Vec<_> = interfaces.values().collect();
        exported.sort_by_key(|i| i.name().to_owned());
        node.interfaces
            .extend(exported.into_iter().map(|i| introspection::Interface::from(i.as_ref())));
    }

    node.children = children
        .into_iter()
        .map(|name| introspection::Node {
            name: Some(name),
            ..introspection::Node::default()
        })
        .collect();

    Ok(Message::method_return(message)
        .with_body("s", vec![Value::String(node.to_xml())]))
}

fn peer_reply(message: &Message, member: &str) -> Result<Message> {
    match member {
        "Ping" => Ok(Message::method_return(message)),
        "GetMachineId" => match fdo::machine_id() {
            Some(id) => {
                Ok(Message::method_return(message).with_body("s", vec![Value::String(id)]))
            }
            None => Err(Error::remote(
                fdo::ERROR_FAILED,
                "no machine id available on this system",
            )),
        },
        _ => Err(Error::remote(
            fdo::ERROR_UNKNOWN_METHOD,
            format!("unknown method {member}"),
        )),
    }
}

async fn properties_reply(
    inner: &Arc<BusInner>,
    message: &Message,
    member: &str,
    interfaces: &HashMap<String, Arc<ServiceInterface>>,
) -> Result<Message> {
    let invalid_args = |reason: &str| Error::remote(fdo::ERROR_INVALID_ARGS, reason);

    let interface_for = |name: &Value| -> Result<Arc<ServiceInterface>> {
        let Value::String(name) = name else {
            return Err(invalid_args("interface name must be a string"));
        };

        interfaces.get(name).cloned().ok_or_else(|| {
            Error::remote(
                fdo::ERROR_UNKNOWN_INTERFACE,
                format!("unknown interface {name}"),
            )
        })
    };

    match member {
        "Get" => {
            if message.signature != "ss" {
                return Err(invalid_args("Get takes an interface and a property name"));
            }

            let interface = interface_for(&message.body[0])?;

            let Some(Value::String(name)) = message.body.get(1) else {
                return Err(invalid_args("property name must be a string"));
            };

            let Some(property) = interface.property(name) else {
                return Err(Error::remote(
                    fdo::ERROR_UNKNOWN_PROPERTY,
                    format!("unknown property {name}"),
                ));
            };

            if !property.access.readable() {
                return Err(Error::remote(
                    fdo::ERROR_ACCESS_DENIED,
                    format!("property {name} is write-only"),
                ));
            }

            let value = read_property(&interface, name)?;
            Ok(Message::method_return(message)
                .with_body("v", vec![Value::Variant(Box::new(value))]))
        }
        "GetAll" => {
            if message.signature != "s" {
                return Err(invalid_args("GetAll takes an interface name"));
            }

            let interface = interface_for(&message.body[0])?;
            let mut entries = Vec::new();

            for property in interface.properties() {
                if !property.access.readable() {
                    continue;
                }

                let value = read_property(&interface, &property.name)?;
                entries.push((
                    Value::String(property.name.clone()),
                    Value::Variant(Box::new(value)),
                ));
            }

            Ok(Message::method_return(message).with_body("a{sv}", vec![Value::Dict(entries)]))
        }
        "Set" => {
            if message.signature != "ssv" {
                return Err(invalid_args(
                    "Set takes an interface, a property name and a value",
                ));
            }

            let interface = interface_for(&message.body[0])?;

            let Some(Value::String(name)) = message.body.get(1) else {
                return Err(invalid_args("property name must be a string"));
            };

            let Some(Value::Variant(variant)) = message.body.get(2) else {
                return Err(invalid_args("property value must be a variant"));
            };

            let Some(property) = interface.property(name) else {
                return Err(Error::remote(
                    fdo::ERROR_UNKNOWN_PROPERTY,
                    format!("unknown property {name}"),
                ));
            };

            if !property.access.writable() {
                return Err(Error::remote(
                    fdo::ERROR_PROPERTY_READ_ONLY,
                    format!("property {name} is read-only"),
                ));
            }

            if variant.signature() != property.signature {
                return Err(invalid_args("value does not match the property type"));
            }

            let old = if property.emits_changed && property.access.readable() {
                Some(read_property(&interface, name)?.into_value())
            } else {
                None
            };

            let Some(setter) = &property.setter else {
                return Err(Error::remote(
                    fdo::ERROR_FAILED,
                    format!("property {name} has no setter"),
                ));
            };

            setter(variant.value().clone()).await?;

            let changed = property.emits_changed
                && old.map_or(true, |old| old != *variant.value());

            if changed {
                // PropertiesChanged on the interface whose property moved.
                let Some(Value::String(interface_name)) = message.body.first() else {
                    unreachable!()
                };

                let Some(path) = message.path.clone() else {
                    unreachable!()
                };

                inner.send_from_dispatch(
                    Message::signal(path, fdo::PROPERTIES, "PropertiesChanged").with_body(
                        "sa{sv}as",
                        vec![
                            Value::String(interface_name.clone()),
                            Value::Dict(vec![(
                                Value::String(name.clone()),
                                Value::Variant(variant.clone()),
                            )]),
                            Value::Array(Vec::new()),
                        ],
                    ),
                );
            }

            Ok(Message::method_return(message))
        }
        _ => Err(Error::remote(
            fdo::ERROR_UNKNOWN_METHOD,
            format!("unknown method {member}"),
        )),
    }
}

fn read_property(interface: &Arc<ServiceInterface>, name: &str) -> Result<Variant> {
    let Some(property) = interface.property(name) else {
        return Err(Error::remote(
            fdo::ERROR_UNKNOWN_PROPERTY,
            format!("unknown property {name}"),
        ));
    };

    let Some(getter) = &property.getter else {
        return Err(Error::remote(
            fdo::ERROR_FAILED,
            format!("property {name} has no getter"),
        ));
    };

    let value = getter()?;

    Variant::new(property.signature.clone(), value).map_err(|_| {
        Error::remote(
            fdo::ERROR_FAILED,
            format!("property {name} produced a value not matching its type"),
        )
    })
}

/// The immediate child segments of exported paths strictly below `path`.
fn child_names(
    objects: &BTreeMap<String, HashMap<String, Arc<ServiceInterface>>>,
    path: &str,
) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_owned()
    } else {
        format!("{path}/")
    };

    let mut out = Vec::new();

    for key in objects.keys() {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };

        let Some(segment) = rest.split('/').next().filter(|s| !s.is_empty()) else {
            continue;
        };

        if out.last().map(String::as_str) != Some(segment) {
            out.push(segment.to_owned());
        }
    }

    out
}

/// Descriptions of the standard interfaces every exported path answers.
fn standard_interface_descriptions() -> Vec<introspection::Interface> {
    use introspection::{Arg, Interface, Method, Signal};

    let named = |name: &str, signature: &str| Arg {
        name: Some(name.to_owned()),
        signature: signature.to_owned(),
    };

    vec![
        Interface {
            name: fdo::INTROSPECTABLE.to_owned(),
            methods: vec![Method {
                name: "Introspect".to_owned(),
                in_args: Vec::new(),
                out_args: vec![named("xml", "s")],
            }],
            ..Interface::default()
        },
        Interface {
            name: fdo::PROPERTIES.to_owned(),
            methods: vec![
                Method {
                    name: "Get".to_owned(),
                    in_args: vec![named("interface_name", "s"), named("property_name", "s")],
                    out_args: vec![named("value", "v")],
                },
                Method {
                    name: "Set".to_owned(),
                    in_args: vec![
                        named("interface_name", "s"),
                        named("property_name", "s"),
                        named("value", "v"),
                    ],
                    out_args: Vec::new(),
                },
                Method {
                    name: "GetAll".to_owned(),
                    in_args: vec![named("interface_name", "s")],
                    out_args: vec![named("properties", "a{sv}")],
                },
            ],
            signals: vec![Signal {
                name: "PropertiesChanged".to_owned(),
                args: vec![
                    named("interface_name", "s"),
                    named("changed_properties", "a{sv}"),
                    named("invalidated_properties", "as"),
                ],
            }],
            ..Interface::default()
        },
        Interface {
            name: fdo::PEER.to_owned(),
            methods: vec![
                Method {
                    name: "Ping".to_owned(),
                    in_args: Vec::new(),
                    out_args: Vec::new(),
                },
                Method {
                    name: "GetMachineId".to_owned(),
                    in_args: Vec::new(),
                    out_args: vec![named("machine_uuid", "s")],
                },
            ],
            ..Interface::default()
        },
    ]
}
