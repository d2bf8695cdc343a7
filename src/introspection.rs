//! The introspection data model and XML generation.
//!
//! This crate generates the XML served by
//! `org.freedesktop.DBus.Introspectable.Introspect` from these structures
//! and builds client proxies from them. Parsing foreign XML into a [`Node`]
//! is left to the caller.

use std::fmt::Write;

use crate::service::{PropertyAccess, ServiceInterface};
use crate::signature::parse_signature;

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// A D-Bus node: the description of one object path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// The path of the node, absolute or relative to its parent.
    pub name: Option<String>,
    /// Interfaces available on the node.
    pub interfaces: Vec<Interface>,
    /// Child nodes, usually bare names.
    pub children: Vec<Node>,
}

/// A single interface of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    /// The name of the interface.
    pub name: String,
    /// Methods of the interface.
    pub methods: Vec<Method>,
    /// Properties of the interface.
    pub properties: Vec<Property>,
    /// Signals of the interface.
    pub signals: Vec<Signal>,
}

/// A method of an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Method {
    /// The name of the method.
    pub name: String,
    /// Input arguments, one per complete type.
    pub in_args: Vec<Arg>,
    /// Output arguments, one per complete type.
    pub out_args: Vec<Arg>,
}

/// A property of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// The name of the property.
    pub name: String,
    /// The signature of the property value.
    pub signature: String,
    /// Declared access.
    pub access: PropertyAccess,
}

/// A signal of an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signal {
    /// The name of the signal.
    pub name: String,
    /// Body arguments, one per complete type.
    pub args: Vec<Arg>,
}

/// A single argument of a method or signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arg {
    /// Optional argument name.
    pub name: Option<String>,
    /// The signature of the argument, one complete type.
    pub signature: String,
}

impl Arg {
    /// An unnamed argument.
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            name: None,
            signature: signature.into(),
        }
    }
}

impl Node {
    /// Serialize the node into introspection XML.
    pub fn to_xml(&self) -> String {
        let mut out = String::from(DOCTYPE);

        match &self.name {
            Some(name) => {
                let _ = writeln!(out, "<node name=\"{}\">", escape(name));
            }
            None => out.push_str("<node>\n"),
        }

        for interface in &self.interfaces {
            interface.write_xml(&mut out);
        }

        for child in &self.children {
            match &child.name {
                Some(name) => {
                    let _ = writeln!(out, "  <node name=\"{}\"/>", escape(name));
                }
                None => out.push_str("  <node/>\n"),
            }
        }

        out.push_str("</node>\n");
        out
    }
}

impl Interface {
    fn write_xml(&self, out: &mut String) {
        let _ = writeln!(out, "  <interface name=\"{}\">", escape(&self.name));

        for method in &self.methods {
            let _ = writeln!(out, "    <method name=\"{}\">", escape(&method.name));

            for arg in &method.in_args {
                arg.write_xml(out, Some("in"));
            }

            for arg in &method.out_args {
                arg.write_xml(out, Some("out"));
            }

            out.push_str("    </method>\n");
        }

        for signal in &self.signals {
            let _ = writeln!(out, "    <signal name=\"{}\">", escape(&signal.name));

            for arg in &signal.args {
                arg.write_xml(out, None);
            }

            out.push_str("    </signal>\n");
        }

        for property in &self.properties {
            let _ = writeln!(
                out,
                "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>",
                escape(&property.name),
                escape(&property.signature),
                property.access.as_str(),
            );
        }

        out.push_str("  </interface>\n");
    }
}

impl Arg {
    fn write_xml(&self, out: &mut String, direction: Option<&str>) {
        out.push_str("      <arg ");

        if let Some(name) = &self.name {
            let _ = write!(out, "name=\"{}\" ", escape(name));
        }

        let _ = write!(out, "type=\"{}\"", escape(&self.signature));

        if let Some(direction) = direction {
            let _ = write!(out, " direction=\"{direction}\"");
        }

        out.push_str("/>\n");
    }
}

impl From<&ServiceInterface> for Interface {
    fn from(interface: &ServiceInterface) -> Self {
        Self {
            name: interface.name().to_owned(),
            methods: interface
                .methods()
                .iter()
                .map(|m| Method {
                    name: m.name.clone(),
                    in_args: split_args(&m.input_signature),
                    out_args: split_args(&m.output_signature),
                })
                .collect(),
            properties: interface
                .properties()
                .iter()
                .map(|p| Property {
                    name: p.name.clone(),
                    signature: p.signature.clone(),
                    access: p.access,
                })
                .collect(),
            signals: interface
                .signals()
                .iter()
                .map(|s| Signal {
                    name: s.name.clone(),
                    args: split_args(&s.signature),
                })
                .collect(),
        }
    }
}

/// Split a signature into one [`Arg`] per complete type.
fn split_args(signature: &str) -> Vec<Arg> {
    match parse_signature(signature) {
        Ok(nodes) => nodes.iter().map(|n| Arg::new(n.text())).collect(),
        Err(..) => Vec::new(),
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }

    out
}
