//! Host values carried in message bodies.

use crate::error::{Error, ErrorKind, Result};
use crate::signature::{parse_single, SignatureNode, TypeCode};

/// A dynamically typed D-Bus value.
///
/// Values do not carry their own type: a list of values is interpreted
/// against a signature when marshalled, and a value must conform to the
/// corresponding [`SignatureNode`].
///
/// Equality is structural. `Dict` preserves insertion order and compares by
/// it, matching the wire encoding of `a{..}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Bool(bool),
    /// `n`
    Int16(i16),
    /// `q`
    Uint16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    Uint32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    Uint64(u64),
    /// `d`
    Double(f64),
    /// `s`
    String(String),
    /// `o`
    ObjectPath(String),
    /// `g`
    Signature(String),
    /// `a…` for any element type except a dict entry.
    Array(Vec<Value>),
    /// `(…)`
    Struct(Vec<Value>),
    /// `a{kv}`, insertion ordered.
    Dict(Vec<(Value, Value)>),
    /// `v`
    Variant(Box<Variant>),
    /// `h`: an index into the message's out-of-band descriptor array.
    ///
    /// The descriptors themselves travel in [`Message::unix_fds`]; the
    /// receiver of a message owns them and is responsible for closing them.
    ///
    /// [`Message::unix_fds`]: crate::Message::unix_fds
    UnixFd(u32),
}

impl Value {
    /// Test whether this value conforms to a signature node.
    pub fn conforms_to(&self, node: &SignatureNode) -> bool {
        match (self, node.code()) {
            (Value::Byte(..), TypeCode::Byte)
            | (Value::Bool(..), TypeCode::Boolean)
            | (Value::Int16(..), TypeCode::Int16)
            | (Value::Uint16(..), TypeCode::Uint16)
            | (Value::Int32(..), TypeCode::Int32)
            | (Value::Uint32(..), TypeCode::Uint32)
            | (Value::Int64(..), TypeCode::Int64)
            | (Value::Uint64(..), TypeCode::Uint64)
            | (Value::Double(..), TypeCode::Double)
            | (Value::String(..), TypeCode::String)
            | (Value::ObjectPath(..), TypeCode::ObjectPath)
            | (Value::Signature(..), TypeCode::Signature)
            | (Value::Variant(..), TypeCode::Variant)
            | (Value::UnixFd(..), TypeCode::UnixFd) => true,
            (Value::Array(values), TypeCode::Array) => {
                let element = node.element();

                element.code() != TypeCode::DictEntry
                    && values.iter().all(|v| v.conforms_to(element))
            }
            (Value::Dict(entries), TypeCode::Array) => {
                let element = node.element();

                if element.code() != TypeCode::DictEntry {
                    return false;
                }

                let [key, value] = element.children() else {
                    return false;
                };

                entries
                    .iter()
                    .all(|(k, v)| k.conforms_to(key) && v.conforms_to(value))
            }
            (Value::Struct(values), TypeCode::Struct) => {
                values.len() == node.children().len()
                    && values
                        .iter()
                        .zip(node.children())
                        .all(|(v, n)| v.conforms_to(n))
            }
            _ => false,
        }
    }

    /// Borrow the value as a string slice if it carries string data.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the value as a `u32` if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the inner variant if the value is one.
    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }
}

/// A value boxed together with its own signature: the universal type of
/// D-Bus.
///
/// Variants are immutable after construction, and construction type-checks
/// the payload against the signature.
///
/// # Examples
///
/// ```
/// use async_dbus::{Value, Variant};
///
/// let v = Variant::new("as", Value::Array(vec![Value::String("hi".into())]))?;
/// assert_eq!(v.signature(), "as");
///
/// assert!(Variant::new("i", Value::String("mismatch".into())).is_err());
/// # Ok::<_, async_dbus::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Variant {
    signature: Box<str>,
    node: SignatureNode,
    value: Value,
}

impl Variant {
    /// Construct a new variant from a signature holding exactly one complete
    /// type and a conforming value.
    pub fn new(signature: impl Into<Box<str>>, value: Value) -> Result<Self> {
        let signature = signature.into();
        let node = parse_single(&signature)?;

        if !value.conforms_to(&node) {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch {
                signature,
                reason: "variant value does not match its signature",
            }));
        }

        Ok(Self {
            signature,
            node,
            value,
        })
    }

    /// Assemble a variant from parts already known to agree; used by the
    /// unmarshaller, which type-checks by construction.
    pub(crate) fn from_parts(
        signature: impl Into<Box<str>>,
        node: SignatureNode,
        value: Value,
    ) -> Self {
        Self {
            signature: signature.into(),
            node,
            value,
        }
    }

    /// Shorthand for a `u32` variant.
    pub fn u32(value: u32) -> Self {
        Self {
            signature: "u".into(),
            node: SignatureNode::basic(TypeCode::Uint32),
            value: Value::Uint32(value),
        }
    }

    /// Shorthand for a string variant.
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            signature: "s".into(),
            node: SignatureNode::basic(TypeCode::String),
            value: Value::String(value.into()),
        }
    }

    /// The signature string of the payload.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The parsed signature of the payload.
    pub fn node(&self) -> &SignatureNode {
        &self.node
    }

    /// The payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Unwrap the payload.
    pub fn into_value(self) -> Value {
        self.value
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature && self.value == other.value
    }
}
