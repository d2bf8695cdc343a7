//! Low level constants of the D-Bus wire protocol.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor};

/// The protocol version spoken and accepted by this crate.
pub(crate) const PROTOCOL_VERSION: u8 = 1;

/// Maximum length in bytes of a single marshalled array.
pub(crate) const MAX_ARRAY_LENGTH: u32 = 1 << 26;

/// Maximum length in bytes of a complete marshalled message.
pub(crate) const MAX_MESSAGE_LENGTH: usize = 1 << 27;

/// The fixed part of a message header: endianness byte, message type, flags,
/// protocol version, body length and serial.
pub(crate) const FIXED_HEADER_LENGTH: usize = 12;

/// The endianness of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Endianness {
    /// Little endian, marked `l` on the wire.
    Little = b'l',
    /// Big endian, marked `B` on the wire.
    Big = b'B',
}

impl Endianness {
    /// Decode an endianness marker byte.
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'l' => Some(Self::Little),
            b'B' => Some(Self::Big),
            _ => None,
        }
    }
}

/// The type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Method call. This message type may prompt a reply.
    MethodCall = 1,
    /// Method reply with returned data.
    MethodReturn = 2,
    /// Error reply. If the first argument exists and is a string, it is an
    /// error message.
    Error = 3,
    /// Signal emission.
    Signal = 4,
}

impl MessageType {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }
}

/// Flags inside of a D-Bus message.
///
/// # Examples
///
/// ```
/// use async_dbus::Flags;
///
/// let flags = Flags::EMPTY;
/// assert!(!(flags & Flags::NO_REPLY_EXPECTED));
///
/// let flags = Flags::EMPTY | Flags::NO_REPLY_EXPECTED;
/// assert!(flags & Flags::NO_REPLY_EXPECTED);
/// assert!(!(flags & Flags::NO_AUTO_START));
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Flags(pub(crate) u8);

impl Flags {
    /// An empty set of flags.
    pub const EMPTY: Self = Self(0);
    /// This message does not expect method return replies or error replies,
    /// even if it is of a type that can have a reply; the reply should be
    /// omitted.
    pub const NO_REPLY_EXPECTED: Self = Self(1);
    /// The bus must not launch an owner for the destination name in response
    /// to this message.
    pub const NO_AUTO_START: Self = Self(2);
    /// This flag may be set on a method call message to inform the receiving
    /// side that the caller is prepared to wait for interactive
    /// authorization, which might take a considerable time to complete.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Self = Self(4);
}

impl BitOr<Flags> for Flags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Flags) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd<Flags> for Flags {
    type Output = bool;

    #[inline]
    fn bitand(self, rhs: Flags) -> Self::Output {
        self.0 & rhs.0 != 0
    }
}

impl BitXor<Flags> for Flags {
    type Output = Self;

    #[inline]
    fn bitxor(self, rhs: Flags) -> Self::Output {
        Self(self.0 ^ rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        let mut bits = self.0;

        for (flag, name) in [
            (Self::NO_REPLY_EXPECTED, "NO_REPLY_EXPECTED"),
            (Self::NO_AUTO_START, "NO_AUTO_START"),
            (
                Self::ALLOW_INTERACTIVE_AUTHORIZATION,
                "ALLOW_INTERACTIVE_AUTHORIZATION",
            ),
        ] {
            if bits & flag.0 != 0 {
                set.entry(&format_args!("{name}"));
                bits ^= flag.0;
            }
        }

        if bits != 0 {
            set.entry(&format_args!("{bits:b}"));
        }

        set.finish()
    }
}

/// Header field codes of the `a(yv)` field array in a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum HeaderField {
    /// The object to send a call to, or the object a signal is emitted from.
    Path = 1,
    /// The interface to invoke a method call on, or that a signal is emitted
    /// from. Optional for method calls, required for signals.
    Interface = 2,
    /// The member, either the method name or signal name.
    Member = 3,
    /// The name of the error that occurred, for errors.
    ErrorName = 4,
    /// The serial number of the message this message is a reply to.
    ReplySerial = 5,
    /// The name of the connection this message is intended for.
    Destination = 6,
    /// Unique name of the sending connection.
    Sender = 7,
    /// The signature of the message body. If omitted, the body is 0-length.
    Signature = 8,
    /// The number of Unix file descriptors that accompany the message.
    UnixFds = 9,
}

impl HeaderField {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Path),
            2 => Some(Self::Interface),
            3 => Some(Self::Member),
            4 => Some(Self::ErrorName),
            5 => Some(Self::ReplySerial),
            6 => Some(Self::Destination),
            7 => Some(Self::Sender),
            8 => Some(Self::Signature),
            9 => Some(Self::UnixFds),
            _ => None,
        }
    }
}

/// Round `offset` up to the next multiple of `alignment` and return the
/// number of padding bytes required.
///
/// `alignment` must be a power of two.
#[inline]
pub(crate) fn padding_to(offset: usize, alignment: usize) -> usize {
    offset.wrapping_neg() & (alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::padding_to;

    #[test]
    fn padding() {
        assert_eq!(padding_to(0, 8), 0);
        assert_eq!(padding_to(1, 8), 7);
        assert_eq!(padding_to(8, 8), 0);
        assert_eq!(padding_to(13, 4), 3);
        assert_eq!(padding_to(2, 1), 0);
    }
}
