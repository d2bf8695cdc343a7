//! Parsing of D-Bus server addresses.
//!
//! An address is a semicolon separated list of `transport:key=value,...`
//! entries, tried in order until one can be dialled. Values may contain
//! `%HH` escapes.

use std::env;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, ErrorKind, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// A single parsed server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Address {
    pub(crate) transport: Transport,
    /// Server GUID to verify against the authenticator's `OK` line.
    pub(crate) guid: Option<String>,
}

/// The transport of a server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transport {
    /// `unix:path=`
    Unix { path: String },
    /// `unix:abstract=`, Linux only.
    UnixAbstract { name: String },
    /// `tcp:host=,port=[,family=]`
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpFamily {
    Ipv4,
    Ipv6,
}

/// Resolve the session bus address from the environment.
pub(crate) fn session_bus_address() -> Result<String> {
    env::var(ENV_SESSION_BUS).map_err(|_| Error::new(ErrorKind::MissingBus))
}

/// Resolve the system bus address from the environment, falling back to the
/// well-known socket path.
pub(crate) fn system_bus_address() -> String {
    env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.to_owned())
}

/// Parse a semicolon separated address list.
///
/// Entries using transports this crate cannot dial are skipped; the list is
/// invalid only if nothing usable remains.
pub(crate) fn parse_address_list(addresses: &str) -> Result<Vec<Address>> {
    let mut out = Vec::new();
    let mut any = false;

    for entry in addresses.split(';') {
        if entry.is_empty() {
            continue;
        }

        any = true;

        if let Some(address) = parse_address(entry)? {
            out.push(address);
        }
    }

    if !any || out.is_empty() {
        return Err(Error::new(ErrorKind::InvalidAddress));
    }

    Ok(out)
}

/// Parse one address entry, or `None` for a recognized but undialable
/// transport.
fn parse_address(entry: &str) -> Result<Option<Address>> {
    let Some((transport, options)) = entry.split_once(':') else {
        return Err(Error::new(ErrorKind::InvalidAddress));
    };

    let mut guid = None;
    let mut pairs = Vec::new();

    for option in options.split(',') {
        if option.is_empty() {
            continue;
        }

        let Some((key, value)) = option.split_once('=') else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        let value = unescape(value)?;

        if key == "guid" {
            guid = Some(value);
        } else {
            pairs.push((key, value));
        }
    }

    let find = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    };

    let transport = match transport {
        "unix" => match (find("path"), find("abstract"), find("tmpdir")) {
            (Some(path), None, None) => Transport::Unix { path },
            (None, Some(name), None) => Transport::UnixAbstract { name },
            (None, None, Some(tmpdir)) => {
                // A tmpdir entry names a directory: rewrite it to a random
                // abstract socket underneath it.
                let suffix: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(10)
                    .map(char::from)
                    .collect();

                Transport::UnixAbstract {
                    name: format!("{tmpdir}/dbus-{suffix}"),
                }
            }
            _ => return Err(Error::new(ErrorKind::InvalidAddress)),
        },
        "tcp" => {
            let Some(host) = find("host") else {
                return Err(Error::new(ErrorKind::InvalidAddress));
            };

            let Some(port) = find("port").and_then(|p| p.parse().ok()) else {
                return Err(Error::new(ErrorKind::InvalidAddress));
            };

            let family = match find("family").as_deref() {
                None => None,
                Some("ipv4") => Some(TcpFamily::Ipv4),
                Some("ipv6") => Some(TcpFamily::Ipv6),
                Some(_) => return Err(Error::new(ErrorKind::InvalidAddress)),
            };

            Transport::Tcp { host, port, family }
        }
        "launchd" => {
            let Some(env_name) = find("env") else {
                return Err(Error::new(ErrorKind::InvalidAddress));
            };

            match launchd_socket_path(&env_name) {
                Some(path) => Transport::Unix { path },
                None => return Ok(None),
            }
        }
        // Transports we know of but cannot dial fall through to the next
        // list entry.
        "unixexec" | "systemd" | "autolaunch" | "nonce-tcp" | "vsock" => return Ok(None),
        _ => return Err(Error::new(ErrorKind::InvalidAddress)),
    };

    Ok(Some(Address { transport, guid }))
}

/// Ask launchd for the socket path stored in the named environment variable.
fn launchd_socket_path(env_name: &str) -> Option<String> {
    let output = std::process::Command::new("launchctl")
        .args(["getenv", env_name])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let path = String::from_utf8(output.stdout).ok()?;
    let path = path.trim();

    if path.is_empty() {
        return None;
    }

    Some(path.to_owned())
}

/// Decode `%HH` escapes in an address value.
fn unescape(value: &str) -> Result<String> {
    if !value.contains('%') {
        return Ok(value.to_owned());
    }

    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }

        let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        let mut decoded = [0u8];
        hex::decode_to_slice([hi, lo], &mut decoded)
            .map_err(|_| Error::new(ErrorKind::InvalidAddress))?;
        out.push(decoded[0]);
    }

    String::from_utf8(out).map_err(|_| Error::new(ErrorKind::InvalidAddress))
}
