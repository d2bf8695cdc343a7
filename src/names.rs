//! Validators for the names appearing in D-Bus messages.

/// Maximum length in bytes of any name on the bus.
const MAX_NAME_LENGTH: usize = 255;

/// Validate an object path.
///
/// # Examples
///
/// ```
/// use async_dbus::names;
///
/// assert!(names::is_object_path("/"));
/// assert!(names::is_object_path("/org/freedesktop/DBus"));
/// assert!(!names::is_object_path("/org//freedesktop"));
/// assert!(!names::is_object_path("/org/freedesktop/"));
/// assert!(!names::is_object_path("org/freedesktop"));
/// ```
pub fn is_object_path(path: &str) -> bool {
    let [b'/', bytes @ ..] = path.as_bytes() else {
        return false;
    };

    // Special case: "/" is a valid path.
    if bytes.is_empty() {
        return true;
    }

    let mut bytes = bytes;
    let mut component = false;

    while let [b, rest @ ..] = bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => {
                component = true;
            }
            b'/' => {
                if !component {
                    return false;
                }

                component = false;
            }
            _ => {
                return false;
            }
        }

        bytes = rest;
    }

    component
}

/// Validate an interface name.
///
/// Interface names are composed of two or more dot-separated elements, each
/// starting with `[A-Za-z_]` and continuing with `[A-Za-z0-9_]`.
///
/// # Examples
///
/// ```
/// use async_dbus::names;
///
/// assert!(names::is_interface_name("org.freedesktop.DBus"));
/// assert!(!names::is_interface_name("org"));
/// assert!(!names::is_interface_name("org..DBus"));
/// assert!(!names::is_interface_name("org.3DBus"));
/// ```
pub fn is_interface_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let mut elements = 0;

    for element in name.split('.') {
        if !is_name_element(element.as_bytes(), false) {
            return false;
        }

        elements += 1;
    }

    elements >= 2
}

/// Validate an error name.
///
/// Error names follow the same rules as interface names.
#[inline]
pub fn is_error_name(name: &str) -> bool {
    is_interface_name(name)
}

/// Validate a member (method or signal) name.
///
/// # Examples
///
/// ```
/// use async_dbus::names;
///
/// assert!(names::is_member_name("Hello"));
/// assert!(names::is_member_name("_private2"));
/// assert!(!names::is_member_name("2Fast"));
/// assert!(!names::is_member_name("Not.Allowed"));
/// assert!(!names::is_member_name(""));
/// ```
pub fn is_member_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }

    is_name_element(name.as_bytes(), false)
}

/// Validate a bus name, either unique (`:1.42`) or well-known
/// (`org.freedesktop.DBus`).
///
/// # Examples
///
/// ```
/// use async_dbus::names;
///
/// assert!(names::is_bus_name(":1.42"));
/// assert!(names::is_bus_name("org.freedesktop.DBus"));
/// assert!(names::is_bus_name("com.example.backup-agent"));
/// assert!(!names::is_bus_name("org"));
/// assert!(!names::is_bus_name(":"));
/// assert!(!names::is_bus_name("org.4you"));
/// ```
pub fn is_bus_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }

    let (name, unique) = match name.strip_prefix(':') {
        Some(rest) => (rest, true),
        None => (name, false),
    };

    let mut elements = 0;

    for element in name.split('.') {
        if !is_bus_name_element(element.as_bytes(), unique) {
            return false;
        }

        elements += 1;
    }

    elements >= 2
}

/// A single element of an interface or member name.
fn is_name_element(bytes: &[u8], digits_first: bool) -> bool {
    let [first, rest @ ..] = bytes else {
        return false;
    };

    if !matches!(first, b'A'..=b'Z' | b'a'..=b'z' | b'_') && !(digits_first && first.is_ascii_digit())
    {
        return false;
    }

    rest.iter()
        .all(|b| matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_'))
}

/// A single element of a bus name. Well-known names additionally permit `-`,
/// unique names permit elements starting with a digit.
fn is_bus_name_element(bytes: &[u8], unique: bool) -> bool {
    let [first, rest @ ..] = bytes else {
        return false;
    };

    let leading = matches!(first, b'A'..=b'Z' | b'a'..=b'z' | b'_' | b'-')
        || (unique && first.is_ascii_digit());

    if !leading {
        return false;
    }

    rest.iter()
        .all(|b| matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}
