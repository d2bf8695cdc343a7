//! Pure Rust D-Bus client and service runtime for Tokio.
//!
//! One [`Bus`] is one authenticated connection to a message bus daemon: it
//! assigns serials, tracks pending replies, dispatches incoming calls to
//! exported [`ServiceInterface`] tables and routes broadcast signals through
//! refcounted match rules. Bodies are dynamically typed [`Value`] lists
//! interpreted against D-Bus signature strings.

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::protocol::{Endianness, Flags, MessageType};
pub mod protocol;

pub mod names;

pub use self::signature::{SignatureError, SignatureNode, TypeCode};
pub mod signature;

#[doc(inline)]
pub use self::value::{Value, Variant};
mod value;

#[doc(inline)]
pub use self::message::Message;
mod message;

#[doc(inline)]
pub use self::wire::Unmarshaller;
pub mod wire;

pub use self::sasl::AuthMechanism;
pub mod sasl;

mod address;

mod connection;

#[doc(inline)]
pub use self::bus::{fdo, Bus, BusBuilder, HandlerId, MatchRule};
mod bus;

#[doc(inline)]
pub use self::service::{
    MethodFuture, PropertyAccess, PropertyGetter, PropertySetter, ServiceInterface,
    ServiceInterfaceBuilder, SetPropertyFuture,
};
mod service;

#[doc(inline)]
pub use self::proxy::{ProxyInterface, ProxyObject, SignalSubscription};
mod proxy;

pub mod introspection;
