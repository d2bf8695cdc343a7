use std::fmt::Write;

use crate::message::Message;
use crate::protocol::MessageType;
use crate::value::Value;

/// A match rule: a set of predicates over messages.
///
/// The daemon-facing form is the canonical string produced by
/// [`canonical`]; the bus also evaluates rules client-side to route
/// broadcast signals to registered handlers.
///
/// [`canonical`]: MatchRule::canonical
///
/// # Examples
///
/// ```
/// use async_dbus::MatchRule;
///
/// let rule = MatchRule::new()
///     .with_signal()
///     .with_sender("org.freedesktop.DBus")
///     .with_interface("org.freedesktop.DBus")
///     .with_member("NameOwnerChanged");
///
/// assert_eq!(
///     rule.canonical(),
///     "type='signal',sender='org.freedesktop.DBus',\
///      interface='org.freedesktop.DBus',member='NameOwnerChanged'"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    /// `(index, value)` pairs for `argN` predicates, kept sorted by index.
    args: Vec<(u8, String)>,
    arg0namespace: Option<String>,
}

impl MatchRule {
    /// An empty rule, matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the rule to signals.
    #[must_use]
    pub fn with_signal(mut self) -> Self {
        self.message_type = Some(MessageType::Signal);
        self
    }

    /// Restrict the rule to a message type.
    #[must_use]
    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    #[must_use]
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Match any path equal to or below the given namespace.
    #[must_use]
    pub fn with_path_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Match a string-typed body argument by position.
    #[must_use]
    pub fn with_arg(mut self, index: u8, value: impl Into<String>) -> Self {
        self.args.retain(|(i, _)| *i != index);
        self.args.push((index, value.into()));
        self.args.sort_by_key(|(i, _)| *i);
        self
    }

    /// Match a first argument equal to or inside a dotted namespace.
    #[must_use]
    pub fn with_arg0namespace(mut self, namespace: impl Into<String>) -> Self {
        self.arg0namespace = Some(namespace.into());
        self
    }

    /// Drop the sender predicate, keeping the rest of the rule.
    #[must_use]
    pub(crate) fn without_sender(mut self) -> Self {
        self.sender = None;
        self
    }

    /// The canonical string form sent to the daemon.
    ///
    /// Deterministic: equal rules produce equal strings, making the string
    /// usable as a refcount key.
    pub fn canonical(&self) -> String {
        let mut out = String::new();

        let mut push = |key: &str, value: &str| {
            if !out.is_empty() {
                out.push(',');
            }

            let _ = write!(out, "{key}='{value}'");
        };

        if let Some(message_type) = self.message_type {
            push(
                "type",
                match message_type {
                    MessageType::MethodCall => "method_call",
                    MessageType::MethodReturn => "method_return",
                    MessageType::Error => "error",
                    MessageType::Signal => "signal",
                },
            );
        }

        if let Some(sender) = &self.sender {
            push("sender", sender);
        }

        if let Some(interface) = &self.interface {
            push("interface", interface);
        }

        if let Some(member) = &self.member {
            push("member", member);
        }

        if let Some(path) = &self.path {
            push("path", path);
        }

        if let Some(path_namespace) = &self.path_namespace {
            push("path_namespace", path_namespace);
        }

        if let Some(destination) = &self.destination {
            push("destination", destination);
        }

        for (index, value) in &self.args {
            push(&format!("arg{index}"), value);
        }

        if let Some(arg0namespace) = &self.arg0namespace {
            push("arg0namespace", arg0namespace);
        }

        out
    }

    /// Evaluate the rule against a message.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(message_type) = self.message_type {
            if message.message_type != message_type {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            if message.sender.as_deref() != Some(sender) {
                return false;
            }
        }

        if let Some(interface) = &self.interface {
            if message.interface.as_deref() != Some(interface) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if message.member.as_deref() != Some(member) {
                return false;
            }
        }

        if let Some(path) = &self.path {
            if message.path.as_deref() != Some(path) {
                return false;
            }
        }

        if let Some(namespace) = &self.path_namespace {
            let Some(path) = message.path.as_deref() else {
                return false;
            };

            if !path_in_namespace(path, namespace) {
                return false;
            }
        }

        if let Some(destination) = &self.destination {
            if message.destination.as_deref() != Some(destination) {
                return false;
            }
        }

        for (index, value) in &self.args {
            match message.body.get(*index as usize) {
                Some(Value::String(arg)) if arg == value => {}
                _ => return false,
            }
        }

        if let Some(namespace) = &self.arg0namespace {
            let Some(Value::String(arg0)) = message.body.first() else {
                return false;
            };

            if arg0 != namespace && !arg0.starts_with(&format!("{namespace}.")) {
                return false;
            }
        }

        true
    }
}

fn path_in_namespace(path: &str, namespace: &str) -> bool {
    if namespace == "/" {
        return true;
    }

    match path.strip_prefix(namespace) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn signal() -> Message {
        let mut m = Message::signal("/com/example/a/b", "com.example.Iface", "Changed")
            .with_body("s", vec![Value::String("com.example.app".into())]);
        m.sender = Some(":1.5".into());
        m
    }

    #[test]
    fn canonical_is_deterministic() {
        let rule = MatchRule::new()
            .with_arg(2, "two")
            .with_arg(0, "zero")
            .with_signal()
            .with_path("/a");

        assert_eq!(
            rule.canonical(),
            "type='signal',path='/a',arg0='zero',arg2='two'"
        );

        // Re-setting an arg replaces it.
        let rule = rule.with_arg(2, "deux");
        assert!(rule.canonical().contains("arg2='deux'"));
        assert!(!rule.canonical().contains("arg2='two'"));
    }

    #[test]
    fn matching() {
        let m = signal();

        assert!(MatchRule::new().matches(&m));
        assert!(MatchRule::new().with_signal().matches(&m));
        assert!(!MatchRule::new()
            .with_type(MessageType::MethodCall)
            .matches(&m));

        assert!(MatchRule::new().with_sender(":1.5").matches(&m));
        assert!(!MatchRule::new().with_sender(":1.6").matches(&m));

        assert!(MatchRule::new()
            .with_interface("com.example.Iface")
            .with_member("Changed")
            .matches(&m));

        assert!(MatchRule::new().with_path("/com/example/a/b").matches(&m));
        assert!(!MatchRule::new().with_path("/com/example/a").matches(&m));
    }

    #[test]
    fn path_namespace_matching() {
        let m = signal();

        assert!(MatchRule::new().with_path_namespace("/").matches(&m));
        assert!(MatchRule::new()
            .with_path_namespace("/com/example")
            .matches(&m));
        assert!(MatchRule::new()
            .with_path_namespace("/com/example/a/b")
            .matches(&m));
        assert!(!MatchRule::new()
            .with_path_namespace("/com/exam")
            .matches(&m));
    }

    #[test]
    fn arg_matching() {
        let m = signal();

        assert!(MatchRule::new().with_arg(0, "com.example.app").matches(&m));
        assert!(!MatchRule::new().with_arg(0, "other").matches(&m));
        assert!(!MatchRule::new().with_arg(1, "missing").matches(&m));

        assert!(MatchRule::new()
            .with_arg0namespace("com.example")
            .matches(&m));
        assert!(MatchRule::new()
            .with_arg0namespace("com.example.app")
            .matches(&m));
        assert!(!MatchRule::new().with_arg0namespace("com.exam").matches(&m));
    }
}
