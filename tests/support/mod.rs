//! An in-process message bus stand-in for end-to-end tests.
//!
//! Speaks the server side of the SASL handshake, assigns `:1.N` unique
//! names, answers the daemon calls the crate issues (`Hello`,
//! `RequestName`, `ReleaseName`, `AddMatch`, `RemoveMatch`) and routes
//! everything else by destination, forwarding file descriptors along.

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use async_dbus::{Message, MessageType, Unmarshaller, Value};

pub const GUID: &str = "74657374206775696420666f722074";

static DAEMON_COUNTER: AtomicU32 = AtomicU32::new(0);

type Registry = Arc<Mutex<HashMap<String, Sender<(Vec<u8>, Vec<RawFd>)>>>>;

/// A routing daemon listening on a private socket.
pub struct TestDaemon {
    address: String,
}

impl TestDaemon {
    pub fn spawn() -> Result<Self> {
        let id = DAEMON_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "async-dbus-test-{}-{id}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).context("binding daemon socket")?;
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let serials = Arc::new(AtomicU32::new(1));

        thread::spawn(move || {
            let mut next_unique = 1u32;

            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };

                let unique = format!(":1.{next_unique}");
                next_unique += 1;
                let registry = registry.clone();
                let serials = serials.clone();

                thread::spawn(move || {
                    let _ = serve_client(stream, unique, registry, serials);
                });
            }
        });

        Ok(Self {
            address: format!("unix:path={}", path.display()),
        })
    }

    /// The address clients connect to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The same address carrying a guid for verification.
    pub fn address_with_guid(&self, guid: &str) -> String {
        format!("{},guid={guid}", self.address)
    }
}

fn serve_client(
    mut stream: UnixStream,
    unique: String,
    registry: Registry,
    serials: Arc<AtomicU32>,
) -> Result<()> {
    let mut leftover = sasl_server(&mut stream)?;

    let (tx, rx) = channel::<(Vec<u8>, Vec<RawFd>)>();
    registry.lock().unwrap().insert(unique.clone(), tx.clone());

    let writer_stream = stream.try_clone()?;
    thread::spawn(move || {
        for (bytes, fds) in rx {
            if send_with_fds(&writer_stream, &bytes, &fds).is_err() {
                break;
            }
        }
    });

    let mut owned_names = Vec::new();
    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.extend(&leftover);
    leftover.clear();

    let result = (|| -> Result<()> {
        loop {
            let mut chunk = [0u8; 4096];
            let mut fds = Vec::new();
            let n = recv_with_fds(&stream, &mut chunk, &mut fds)?;

            if n == 0 {
                return Ok(());
            }

            unmarshaller.push_fds(fds);
            unmarshaller.extend(&chunk[..n]);

            while let Some(mut message) = unmarshaller.next_message()? {
                message.sender = Some(unique.clone());

                match message.destination.as_deref() {
                    Some("org.freedesktop.DBus") => {
                        daemon_call(&message, &unique, &registry, &serials, &tx, &mut owned_names)?;
                    }
                    Some(destination) => {
                        let target = registry.lock().unwrap().get(destination).cloned();

                        if let Some(target) = target {
                            let (bytes, fds) = message.marshal()?;
                            let _ = target.send((bytes, fds));
                        }
                    }
                    None if message.message_type == MessageType::Signal => {
                        // Broadcast to everyone else.
                        let others: Vec<_> = {
                            let registry = registry.lock().unwrap();
                            registry
                                .iter()
                                .filter(|(name, _)| **name != unique)
                                .map(|(_, tx)| tx.clone())
                                .collect()
                        };

                        let (bytes, fds) = message.marshal()?;

                        for other in others {
                            let _ = other.send((bytes.clone(), fds.clone()));
                        }
                    }
                    None => {}
                }
            }
        }
    })();

    let mut registry = registry.lock().unwrap();
    registry.remove(&unique);

    for name in owned_names {
        registry.remove(&name);
    }

    result
}

/// Answer one daemon method call addressed to `org.freedesktop.DBus`.
fn daemon_call(
    message: &Message,
    unique: &str,
    registry: &Registry,
    serials: &Arc<AtomicU32>,
    tx: &Sender<(Vec<u8>, Vec<RawFd>)>,
    owned_names: &mut Vec<String>,
) -> Result<()> {
    let mut reply = match message.member.as_deref() {
        Some("Hello") => {
            Message::method_return(message).with_body("s", vec![Value::String(unique.to_owned())])
        }
        Some("RequestName") => {
            let Some(Value::String(name)) = message.body.first() else {
                bail!("RequestName without a name");
            };

            registry
                .lock()
                .unwrap()
                .insert(name.clone(), tx.clone());
            owned_names.push(name.clone());

            Message::method_return(message).with_body("u", vec![Value::Uint32(1)])
        }
        Some("ReleaseName") => {
            let Some(Value::String(name)) = message.body.first() else {
                bail!("ReleaseName without a name");
            };

            registry.lock().unwrap().remove(name);
            owned_names.retain(|n| n != name);

            Message::method_return(message).with_body("u", vec![Value::Uint32(1)])
        }
        Some("AddMatch") | Some("RemoveMatch") => {
            if !message.wants_reply() {
                return Ok(());
            }

            Message::method_return(message)
        }
        other => bail!("unsupported daemon call {other:?}"),
    };

    if !message.wants_reply() {
        return Ok(());
    }

    reply.serial = serials.fetch_add(1, Ordering::Relaxed);
    reply.sender = Some("org.freedesktop.DBus".to_owned());
    let (bytes, fds) = reply.marshal()?;
    let _ = tx.send((bytes, fds));
    Ok(())
}

/// Server side of the SASL handshake. Returns any bytes read past the
/// `BEGIN` line, which already belong to the message stream.
fn sasl_server(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut nul_seen = false;

    loop {
        let line = match read_line(&mut buf) {
            Some(line) => line,
            None => {
                let mut chunk = [0u8; 256];
                let mut fds = Vec::new();
                let n = recv_with_fds(stream, &mut chunk, &mut fds)?;

                if n == 0 {
                    bail!("client hung up during handshake");
                }

                let mut bytes = &chunk[..n];

                if !nul_seen {
                    let [0, rest @ ..] = bytes else {
                        bail!("client did not lead with a nul byte");
                    };

                    nul_seen = true;
                    bytes = rest;
                }

                buf.extend_from_slice(bytes);
                continue;
            }
        };

        let line = String::from_utf8(line)?;
        let line = line.trim_end();

        if line.starts_with("AUTH ") {
            send_all(stream, format!("OK {GUID}\r\n").as_bytes())?;
        } else if line == "NEGOTIATE_UNIX_FD" {
            send_all(stream, b"AGREE_UNIX_FD\r\n")?;
        } else if line == "BEGIN" {
            return Ok(buf);
        } else {
            send_all(stream, b"ERROR unsupported\r\n")?;
        }
    }
}

fn read_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let at = buf.iter().position(|&b| b == b'\n')?;
    let rest = buf.split_off(at + 1);
    Some(std::mem::replace(buf, rest))
}

fn send_all(stream: &UnixStream, bytes: &[u8]) -> Result<()> {
    send_with_fds(stream, bytes, &[])
}

fn send_with_fds(stream: &UnixStream, bytes: &[u8], fds: &[RawFd]) -> Result<()> {
    let fd = std::os::fd::AsRawFd::as_raw_fd(stream);
    let mut offset = 0;

    while offset < bytes.len() {
        let iov = [IoSlice::new(&bytes[offset..])];

        let cmsgs = if offset == 0 && !fds.is_empty() {
            vec![ControlMessage::ScmRights(fds)]
        } else {
            Vec::new()
        };

        let n = sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)?;
        offset += n;
    }

    Ok(())
}

fn recv_with_fds(stream: &UnixStream, buf: &mut [u8], fds: &mut Vec<RawFd>) -> Result<usize> {
    let fd = std::os::fd::AsRawFd::as_raw_fd(stream);
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 16]);

    let msg = recvmsg::<()>(
        fd,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let bytes = msg.bytes;

    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }

    Ok(bytes)
}
