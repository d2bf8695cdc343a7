//! Server-side interface descriptors.
//!
//! A [`ServiceInterface`] is an immutable table of method, property and
//! signal descriptors built once and exported at one or more object paths.
//! No reflection happens at dispatch time: incoming calls are resolved
//! against these tables by `(name, input signature)`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::names;
use crate::signature::{parse_signature, parse_single, SignatureNode};
use crate::value::Value;

/// Future returned by a method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'static>>;

/// Future returned by a property setter.
pub type SetPropertyFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Handler invoked for an incoming method call, with the body values as
/// arguments.
///
/// Returning an error constructed with [`Error::remote`] produces an `ERROR`
/// reply with that error name; any other error is mapped to
/// `org.freedesktop.DBus.Error.Failed`.
pub type MethodHandler = Box<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Reads the current value of a property.
pub type PropertyGetter = Box<dyn Fn() -> Result<Value> + Send + Sync>;

/// Writes a property; awaited before the reply is sent.
pub type PropertySetter = Box<dyn Fn(Value) -> SetPropertyFuture + Send + Sync>;

/// Access declared for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub(crate) fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub(crate) fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// The spelling used in introspection data.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "readwrite",
        }
    }
}

pub struct MethodDescriptor {
    pub(crate) name: String,
    pub(crate) input_signature: String,
    pub(crate) output_signature: String,
    pub(crate) output_nodes: Arc<[SignatureNode]>,
    pub(crate) handler: MethodHandler,
}

pub struct PropertyDescriptor {
    pub(crate) name: String,
    pub(crate) signature: String,
    pub(crate) access: PropertyAccess,
    pub(crate) getter: Option<PropertyGetter>,
    pub(crate) setter: Option<PropertySetter>,
    /// Whether effective writes through `Properties.Set` emit
    /// `PropertiesChanged`.
    pub(crate) emits_changed: bool,
}

pub struct SignalDescriptor {
    pub(crate) name: String,
    pub(crate) signature: String,
    pub(crate) nodes: Arc<[SignatureNode]>,
    pub(crate) disabled: bool,
}

/// An interface exported on the bus: a name plus descriptor tables.
///
/// The same instance may be exported at any number of paths; share it
/// through an [`Arc`].
pub struct ServiceInterface {
    name: String,
    methods: Vec<MethodDescriptor>,
    properties: Vec<PropertyDescriptor>,
    signals: Vec<SignalDescriptor>,
}

impl ServiceInterface {
    /// Start building an interface with the given name.
    pub fn builder(name: impl Into<String>) -> ServiceInterfaceBuilder {
        ServiceInterfaceBuilder {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// The interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub(crate) fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub(crate) fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub(crate) fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub(crate) fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub(crate) fn signals(&self) -> &[SignalDescriptor] {
        &self.signals
    }
}

/// Collects descriptors for a [`ServiceInterface`].
///
/// # Examples
///
/// ```
/// use async_dbus::ServiceInterface;
///
/// let interface = ServiceInterface::builder("com.example.Echo")
///     .method("Echo", "s", "s", |args| {
///         Box::pin(async move { Ok(args) })
///     })?
///     .signal("Echoed", "s")?
///     .build()?;
///
/// assert_eq!(interface.name(), "com.example.Echo");
/// # Ok::<_, async_dbus::Error>(())
/// ```
pub struct ServiceInterfaceBuilder {
    name: String,
    methods: Vec<MethodDescriptor>,
    properties: Vec<PropertyDescriptor>,
    signals: Vec<SignalDescriptor>,
}

impl ServiceInterfaceBuilder {
    /// Add a method with the given input and output signatures.
    pub fn method(
        mut self,
        name: impl Into<String>,
        input_signature: impl Into<String>,
        output_signature: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> MethodFuture + Send + Sync + 'static,
    ) -> Result<Self> {
        let name = name.into();

        if !names::is_member_name(&name) {
            return Err(Error::new(ErrorKind::InvalidMemberName));
        }

        let input_signature = input_signature.into();
        let output_signature = output_signature.into();
        parse_signature(&input_signature)?;
        let output_nodes = parse_signature(&output_signature)?;

        self.methods.push(MethodDescriptor {
            name,
            input_signature,
            output_signature,
            output_nodes,
            handler: Box::new(handler),
        });

        Ok(self)
    }

    /// Add a property.
    ///
    /// A readable property needs a getter and a writable one a setter; the
    /// setter is awaited before `Properties.Set` replies.
    pub fn property(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        access: PropertyAccess,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
    ) -> Result<Self> {
        let name = name.into();

        if !names::is_member_name(&name) {
            return Err(Error::new(ErrorKind::InvalidMemberName));
        }

        if access.readable() && getter.is_none() || access.writable() && setter.is_none() {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "property accessors do not match the declared access",
            )));
        }

        let signature = signature.into();
        parse_single(&signature)?;

        self.properties.push(PropertyDescriptor {
            name,
            signature,
            access,
            getter,
            setter,
            emits_changed: true,
        });

        Ok(self)
    }

    /// Mark the most recently added property as not emitting
    /// `PropertiesChanged`.
    pub fn last_property_emits_no_change(mut self) -> Self {
        if let Some(property) = self.properties.last_mut() {
            property.emits_changed = false;
        }

        self
    }

    /// Add a signal with the given body signature.
    pub fn signal(
        self,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Result<Self> {
        self.signal_inner(name.into(), signature.into(), false)
    }

    /// Add a signal that is declared but refuses emission.
    pub fn disabled_signal(
        self,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Result<Self> {
        self.signal_inner(name.into(), signature.into(), true)
    }

    fn signal_inner(mut self, name: String, signature: String, disabled: bool) -> Result<Self> {
        if !names::is_member_name(&name) {
            return Err(Error::new(ErrorKind::InvalidMemberName));
        }

        let nodes = parse_signature(&signature)?;

        self.signals.push(SignalDescriptor {
            name,
            signature,
            nodes,
            disabled,
        });

        Ok(self)
    }

    /// Finish the interface.
    pub fn build(self) -> Result<ServiceInterface> {
        if !names::is_interface_name(&self.name) {
            return Err(Error::new(ErrorKind::InvalidInterfaceName));
        }

        Ok(ServiceInterface {
            name: self.name,
            methods: self.methods,
            properties: self.properties,
            signals: self.signals,
        })
    }
}
