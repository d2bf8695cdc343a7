use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::signature::SignatureError;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Construct an error carrying a D-Bus error name and a human readable
    /// message.
    ///
    /// This is the error a method handler raises to produce an `ERROR` reply
    /// with a specific error name, and the error a failed [`Bus::call`]
    /// resolves to when the remote side replies with an `ERROR` message.
    ///
    /// [`Bus::call`]: crate::Bus::call
    pub fn remote(name: impl Into<Box<str>>, message: impl Into<Box<str>>) -> Self {
        Self::new(ErrorKind::Remote {
            name: name.into(),
            message: message.into(),
        })
    }

    /// The D-Bus error name carried by this error, if any.
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The human readable message of a remote error, if any.
    pub fn error_message(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Remote { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Test if the error indicates that the connection to the message bus has
    /// been lost.
    pub fn is_disconnected(&self) -> bool {
        matches!(self.kind, ErrorKind::Disconnected)
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Signature(error) => error.fmt(f),
            ErrorKind::Utf8Error(error) => error.fmt(f),
            ErrorKind::SignatureBodyMismatch { signature, reason } => {
                write!(f, "Body does not match signature `{signature}`: {reason}")
            }
            ErrorKind::InvalidAddress => write!(f, "Invalid d-bus address"),
            ErrorKind::AuthFailed(reason) => write!(f, "Authentication failed: {reason}"),
            ErrorKind::InvalidMessage(reason) => write!(f, "Invalid message: {reason}"),
            ErrorKind::InvalidBusName => write!(f, "Invalid bus name"),
            ErrorKind::InvalidObjectPath => write!(f, "Invalid object path"),
            ErrorKind::InvalidInterfaceName => write!(f, "Invalid interface name"),
            ErrorKind::InvalidMemberName => write!(f, "Invalid member name"),
            ErrorKind::InterfaceNotFound(name) => {
                write!(f, "Interface `{name}` not found in introspection data")
            }
            ErrorKind::UnknownMember(name) => {
                write!(f, "Member `{name}` not found in introspection data")
            }
            ErrorKind::UnknownProperty(name) => write!(f, "Unknown property `{name}`"),
            ErrorKind::SignalDisabled(name) => write!(f, "Signal `{name}` is disabled"),
            ErrorKind::MessageTooLong(length) => {
                write!(f, "Message of length {length} is too long (max is 134217728)")
            }
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::MissingBus => write!(f, "Missing session bus"),
            ErrorKind::Disconnected => write!(f, "Connection to the message bus was lost"),
            ErrorKind::TimedOut => write!(f, "Timed out waiting for a reply"),
            ErrorKind::Remote { name, message } => write!(f, "{name}: {message}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    Utf8Error(Utf8Error),
    SignatureBodyMismatch {
        signature: Box<str>,
        reason: &'static str,
    },
    InvalidAddress,
    AuthFailed(Box<str>),
    InvalidMessage(&'static str),
    InvalidBusName,
    InvalidObjectPath,
    InvalidInterfaceName,
    InvalidMemberName,
    InterfaceNotFound(Box<str>),
    UnknownMember(Box<str>),
    UnknownProperty(Box<str>),
    SignalDisabled(Box<str>),
    MessageTooLong(usize),
    ArrayTooLong(u32),
    MissingBus,
    Disconnected,
    TimedOut,
    Remote {
        name: Box<str>,
        message: Box<str>,
    },
}
