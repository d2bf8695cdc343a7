use std::io;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::address::{self, parse_address_list};
use crate::bus::{drive, fdo, Bus, BusInner};
use crate::connection::Transport;
use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::sasl::{AuthMechanism, AuthStep, Authenticator};
use crate::value::Value;
use crate::wire::Unmarshaller;

enum BusKind {
    Session,
    System,
    Address(String),
}

/// Builder of a [`Bus`] connection.
///
/// # Examples
///
/// ```no_run
/// use async_dbus::BusBuilder;
///
/// # async fn example() -> async_dbus::Result<()> {
/// let bus = BusBuilder::new()
///     .system_bus()
///     .negotiate_unix_fd(true)
///     .connect()
///     .await?;
/// # Ok(()) }
/// ```
pub struct BusBuilder {
    kind: BusKind,
    mechanisms: Vec<AuthMechanism>,
    negotiate_unix_fd: bool,
    hello: bool,
}

impl BusBuilder {
    /// Construct a new builder targeting the session bus.
    pub fn new() -> Self {
        Self {
            kind: BusKind::Session,
            mechanisms: AuthMechanism::defaults(),
            negotiate_unix_fd: false,
            hello: true,
        }
    }

    /// Connect to the session bus (the default).
    ///
    /// The address is taken from `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session_bus(mut self) -> Self {
        self.kind = BusKind::Session;
        self
    }

    /// Connect to the system bus.
    ///
    /// The address is taken from `DBUS_SYSTEM_BUS_ADDRESS`, falling back to
    /// the well-known system socket.
    pub fn system_bus(mut self) -> Self {
        self.kind = BusKind::System;
        self
    }

    /// Connect to an explicit server address list.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.kind = BusKind::Address(address.into());
        self
    }

    /// Override the SASL mechanisms offered, in order.
    pub fn auth_mechanisms(mut self, mechanisms: Vec<AuthMechanism>) -> Self {
        self.mechanisms = mechanisms;
        self
    }

    /// Negotiate file descriptor passing during authentication. Only
    /// effective on unix transports.
    pub fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Whether to perform the mandatory `Hello` exchange after
    /// authenticating. Disable for peer-to-peer connections that do not
    /// talk to a message bus daemon.
    pub fn hello(mut self, hello: bool) -> Self {
        self.hello = hello;
        self
    }

    /// Dial, authenticate and start the connection.
    ///
    /// On a daemon connection this returns only after `Hello` resolved and
    /// the unique name is known.
    pub async fn connect(self) -> Result<Bus> {
        let addresses = match &self.kind {
            BusKind::Session => address::session_bus_address()?,
            BusKind::System => address::system_bus_address(),
            BusKind::Address(address) => address.clone(),
        };

        let mut last_error = None;
        let mut dialled = None;

        for parsed in parse_address_list(&addresses)? {
            match Transport::connect(&parsed) {
                Ok(transport) => {
                    dialled = Some((transport, parsed.guid));
                    break;
                }
                Err(error) => last_error = Some(error),
            }
        }

        let Some((transport, expected_guid)) = dialled else {
            return Err(last_error.unwrap_or_else(|| Error::new(ErrorKind::InvalidAddress)));
        };

        transport.set_nonblocking(true)?;

        let negotiate = self.negotiate_unix_fd && transport.supports_unix_fd();
        let mut fd = AsyncFd::new(transport)?;

        let mut authenticator = Authenticator::new(self.mechanisms, negotiate, expected_guid);
        let initial = authenticator.initial_send()?;
        write_all(&mut fd, &initial).await?;

        let mut line_buf = Vec::new();

        let outcome = loop {
            let line = read_line(&mut fd, &mut line_buf).await?;

            match authenticator.feed_line(&line)? {
                AuthStep::Send(bytes) => write_all(&mut fd, &bytes).await?,
                AuthStep::Done { send, outcome } => {
                    write_all(&mut fd, &send).await?;
                    break outcome;
                }
            }
        };

        tracing::debug!(
            "authenticated with guid {} (unix_fd: {})",
            outcome.guid,
            outcome.unix_fd
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = BusInner::new(outcome.guid, outcome.unix_fd, cmd_tx);

        let mut unmarshaller = Unmarshaller::new();

        // Bytes past the final handshake line already belong to the
        // message stream.
        if !line_buf.is_empty() {
            unmarshaller.extend(&line_buf);
        }

        tokio::spawn(drive(inner.clone(), fd, unmarshaller, cmd_rx));

        let bus = Bus::from_inner(inner);

        if self.hello {
            let reply = bus
                .call(
                    Message::method_call(fdo::DBUS_PATH, "Hello")
                        .with_interface(fdo::DBUS_INTERFACE)
                        .with_destination(fdo::DBUS_SERVICE),
                )
                .await?;

            let name = match reply.body.first() {
                Some(Value::String(name)) => name.clone(),
                _ => {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "Hello reply does not carry the unique name",
                    )))
                }
            };

            tracing::debug!("connected as {name}");
            bus.inner.lock_state().unique_name = Some(name);
        }

        Ok(bus)
    }
}

impl Default for BusBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Write every byte, parking on writability in between.
async fn write_all(fd: &mut AsyncFd<Transport>, bytes: &[u8]) -> Result<()> {
    let mut offset = 0;

    while offset < bytes.len() {
        let mut guard = fd.writable_mut().await?;

        match guard.get_inner_mut().send(&bytes[offset..], &[]) {
            Ok(n) => offset += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                guard.clear_ready();
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Read one `\n` terminated line, leaving any surplus bytes in `buf`.
async fn read_line(fd: &mut AsyncFd<Transport>, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
    loop {
        if let Some(at) = buf.iter().position(|&b| b == b'\n') {
            let rest = buf.split_off(at + 1);
            let line = std::mem::replace(buf, rest);
            return Ok(line);
        }

        let mut guard = fd.readable_mut().await?;
        let mut chunk = [0u8; 256];
        let mut fds = Vec::new();

        match guard.get_inner_mut().recv(&mut chunk, &mut fds) {
            Ok(0) => {
                return Err(Error::new(ErrorKind::AuthFailed(
                    "connection closed during authentication".into(),
                )))
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                guard.clear_ready();
            }
            Err(e) => return Err(e.into()),
        }
    }
}
