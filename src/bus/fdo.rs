//! Names and constants of the `org.freedesktop.DBus` world: the daemon's
//! own interface, the standard per-object interfaces and the error names the
//! bus core emits.

use std::fmt;
use std::fs;
use std::ops::{BitAnd, BitOr};

/// Well known destination name of the message bus daemon.
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";

/// The daemon's own interface.
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Well known D-Bus path of the message bus daemon.
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// Interface answering `Introspect` on every exported path.
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// Interface exposing properties on every exported path.
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// Interface answering `Ping` and `GetMachineId` on every exported path.
pub const PEER: &str = "org.freedesktop.DBus.Peer";

pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
pub const ERROR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";

/// The flags to a `RequestName` call.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NameFlag(pub(crate) u32);

impl NameFlag {
    /// Request without any flag set.
    pub const NONE: Self = Self(0);
    /// Allow another connection requesting the name with
    /// [`NameFlag::REPLACE_EXISTING`] to take it over.
    pub const ALLOW_REPLACEMENT: Self = Self(1);
    /// Try to replace the current owner if there is one.
    pub const REPLACE_EXISTING: Self = Self(2);
    /// Fail the request instead of queueing when the name is taken.
    pub const DO_NOT_QUEUE: Self = Self(4);
}

impl BitOr<NameFlag> for NameFlag {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: NameFlag) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd<NameFlag> for NameFlag {
    type Output = bool;

    #[inline]
    fn bitand(self, rhs: NameFlag) -> Self::Output {
        self.0 & rhs.0 != 0
    }
}

impl fmt::Debug for NameFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameFlag({:b})", self.0)
    }
}

/// The reply to a `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NameReply {
    /// The caller is now the primary owner of the name.
    PrimaryOwner = 1,
    /// The name already had an owner and the caller is queued for it.
    InQueue = 2,
    /// The name already has an owner and the request specified
    /// [`NameFlag::DO_NOT_QUEUE`].
    Exists = 3,
    /// The caller already owns the name.
    AlreadyOwner = 4,
}

impl NameReply {
    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }
}

/// The reply to a `ReleaseName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    /// The name was owned and has been released.
    Released = 1,
    /// The name does not exist on the bus.
    NonExistent = 2,
    /// The caller was not the owner and not in the queue.
    NotOwner = 3,
}

impl ReleaseNameReply {
    pub(crate) fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            3 => Some(Self::NotOwner),
            _ => None,
        }
    }
}

/// The machine id served by `Peer.GetMachineId`.
pub(crate) fn machine_id() -> Option<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = fs::read_to_string(path) {
            let id = contents.trim();

            if !id.is_empty() {
                return Some(id.to_owned());
            }
        }
    }

    None
}
