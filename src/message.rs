use std::os::fd::RawFd;

use crate::error::{Error, ErrorKind, Result};
use crate::names;
use crate::protocol::{Flags, MessageType};
use crate::signature::parse_signature;
use crate::value::Value;

/// An owned D-Bus message.
///
/// A message is the unit of exchange on a connection: a fixed header, a set
/// of header fields, a typed body and any file descriptors referenced by
/// body values of type `h`.
///
/// A freshly constructed message has serial `0`; the bus assigns the real
/// serial when the message is sent. The receiver of a message owns its file
/// descriptors and is responsible for closing them.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The type of the message.
    pub message_type: MessageType,
    /// Flags of the message.
    pub flags: Flags,
    /// Serial of the message. Zero until assigned by the bus.
    pub serial: u32,
    /// The object path this message is sent to, or emitted from.
    pub path: Option<String>,
    /// The interface of the member being addressed.
    pub interface: Option<String>,
    /// The method or signal name.
    pub member: Option<String>,
    /// The error name, for error replies.
    pub error_name: Option<String>,
    /// The serial of the message this message replies to.
    pub reply_serial: Option<u32>,
    /// The connection this message is intended for.
    pub destination: Option<String>,
    /// Unique name of the sending connection. Filled in by the daemon.
    pub sender: Option<String>,
    /// Signature of the body.
    pub signature: String,
    /// Body values, matching `signature`.
    pub body: Vec<Value>,
    /// File descriptors referenced by `h` values in the body.
    pub unix_fds: Vec<RawFd>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: Flags::EMPTY,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
            unix_fds: Vec::new(),
        }
    }

    /// Construct a method call addressed to `path` and `member`.
    ///
    /// # Examples
    ///
    /// ```
    /// use async_dbus::Message;
    ///
    /// let m = Message::method_call("/org/freedesktop/DBus", "Hello")
    ///     .with_interface("org.freedesktop.DBus")
    ///     .with_destination("org.freedesktop.DBus");
    ///
    /// assert!(m.validate().is_ok());
    /// ```
    pub fn method_call(path: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            member: Some(member.into()),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    /// Construct a method return replying to `call`.
    ///
    /// The destination is the caller's sender and the reply serial is the
    /// call's serial.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// Construct an error reply to `call` with the given error name.
    ///
    /// The human readable `message` becomes the conventional single `s` body
    /// argument.
    pub fn error_reply(
        call: &Message,
        error_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_name: Some(error_name.into()),
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            signature: "s".into(),
            body: vec![Value::String(message.into())],
            ..Self::empty(MessageType::Error)
        }
    }

    /// Construct a signal emitted from `path` on `interface`.
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageType::Signal)
        }
    }

    /// Set the interface of the message.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Set the destination of the message.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the flags of the message.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the body and its signature.
    #[must_use]
    pub fn with_body(mut self, signature: impl Into<String>, body: Vec<Value>) -> Self {
        self.signature = signature.into();
        self.body = body;
        self
    }

    /// Set the file descriptor array of the message.
    #[must_use]
    pub fn with_unix_fds(mut self, unix_fds: Vec<RawFd>) -> Self {
        self.unix_fds = unix_fds;
        self
    }

    /// Marshal this message into its little-endian wire bytes plus the file
    /// descriptors that must accompany them.
    ///
    /// The message must carry a non-zero serial.
    pub fn marshal(&self) -> Result<(Vec<u8>, Vec<RawFd>)> {
        crate::wire::marshal_message(self)
    }

    /// Test whether this message expects a reply.
    pub fn wants_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && !(self.flags & Flags::NO_REPLY_EXPECTED)
    }

    /// Validate the required header fields for the message type, the
    /// validity of every name carried in a field, and that the body
    /// signature parses.
    ///
    /// Method calls require a path and a member; returns require a reply
    /// serial; errors require an error name and a reply serial; signals
    /// require a path, an interface and a member.
    pub fn validate(&self) -> Result<()> {
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "method call is missing PATH",
                    )));
                }

                if self.member.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "method call is missing MEMBER",
                    )));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "method return is missing REPLY_SERIAL",
                    )));
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "error is missing ERROR_NAME",
                    )));
                }

                if self.reply_serial.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "error is missing REPLY_SERIAL",
                    )));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "signal is missing PATH",
                    )));
                }

                if self.interface.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "signal is missing INTERFACE",
                    )));
                }

                if self.member.is_none() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "signal is missing MEMBER",
                    )));
                }
            }
        }

        if let Some(path) = &self.path {
            if !names::is_object_path(path) {
                return Err(Error::new(ErrorKind::InvalidObjectPath));
            }
        }

        if let Some(interface) = &self.interface {
            if !names::is_interface_name(interface) {
                return Err(Error::new(ErrorKind::InvalidInterfaceName));
            }
        }

        if let Some(member) = &self.member {
            if !names::is_member_name(member) {
                return Err(Error::new(ErrorKind::InvalidMemberName));
            }
        }

        if let Some(error_name) = &self.error_name {
            if !names::is_error_name(error_name) {
                return Err(Error::new(ErrorKind::InvalidInterfaceName));
            }
        }

        for name in [&self.destination, &self.sender].into_iter().flatten() {
            if !names::is_bus_name(name) {
                return Err(Error::new(ErrorKind::InvalidBusName));
            }
        }

        parse_signature(&self.signature)?;
        Ok(())
    }
}
