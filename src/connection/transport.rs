use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::address::{Address, TcpFamily, Transport as AddressTransport};
use crate::error::Result;

/// The stream socket under a bus connection.
///
/// The transport is owned exclusively by the connection driver; reads on
/// unix sockets collect `SCM_RIGHTS` file descriptors and writes can attach
/// them.
pub(crate) struct Transport {
    stream: Stream,
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    /// Dial the socket a parsed address points at.
    pub(crate) fn connect(address: &Address) -> Result<Self> {
        let stream = match &address.transport {
            AddressTransport::Unix { path } => Stream::Unix(UnixStream::connect(path)?),
            AddressTransport::UnixAbstract { name } => {
                use std::os::linux::net::SocketAddrExt;

                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                Stream::Unix(UnixStream::connect_addr(&addr)?)
            }
            AddressTransport::Tcp { host, port, family } => {
                let addrs = (host.as_str(), *port).to_socket_addrs()?;
                let mut last_error =
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address");
                let mut stream = None;

                for addr in addrs {
                    let usable = match family {
                        None => true,
                        Some(TcpFamily::Ipv4) => matches!(addr, SocketAddr::V4(..)),
                        Some(TcpFamily::Ipv6) => matches!(addr, SocketAddr::V6(..)),
                    };

                    if !usable {
                        continue;
                    }

                    match TcpStream::connect(addr) {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last_error = e,
                    }
                }

                match stream {
                    Some(stream) => Stream::Tcp(stream),
                    None => return Err(last_error.into()),
                }
            }
        };

        Ok(Self { stream })
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.stream {
            Stream::Unix(stream) => stream.set_nonblocking(nonblocking),
            Stream::Tcp(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    /// Whether this transport can carry file descriptors.
    pub(crate) fn supports_unix_fd(&self) -> bool {
        matches!(self.stream, Stream::Unix(..))
    }

    /// Read a chunk of bytes, collecting any file descriptors that arrived
    /// as ancillary data. Returns the number of bytes read; 0 is end of
    /// stream.
    pub(crate) fn recv(&mut self, buf: &mut [u8], fds: &mut Vec<RawFd>) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Unix(stream) => {
                let fd = stream.as_raw_fd();
                let mut iov = [IoSliceMut::new(buf)];
                let mut cmsg_buffer = nix::cmsg_space!([RawFd; 16]);

                let msg = recvmsg::<()>(
                    fd,
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let bytes = msg.bytes;

                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }

                Ok(bytes)
            }
        }
    }

    /// Write a chunk of bytes, attaching file descriptors as ancillary data
    /// on unix sockets. Returns the number of bytes written.
    pub(crate) fn send(&mut self, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Tcp(stream) => stream.write(bytes),
            Stream::Unix(stream) => {
                let fd = stream.as_raw_fd();
                let iov = [IoSlice::new(bytes)];

                let cmsgs = if fds.is_empty() {
                    Vec::new()
                } else {
                    vec![ControlMessage::ScmRights(fds)]
                };

                sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
            }
        }
    }
}

impl AsRawFd for Transport {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        match &self.stream {
            Stream::Unix(stream) => stream.as_raw_fd(),
            Stream::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}
