use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::str;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::names;
use crate::protocol::{
    padding_to, Endianness, Flags, HeaderField, MessageType, MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH,
    PROTOCOL_VERSION,
};
use crate::signature::{parse_signature, parse_single, SignatureNode, TypeCode};
use crate::value::{Value, Variant};

/// Combined nesting depth a reader will recurse into, bounding variants
/// nested inside variants.
const MAX_READ_DEPTH: usize = 128;

/// A resumable message parser.
///
/// Byte chunks and received file descriptors are appended as the transport
/// produces them; [`next_message`] yields a complete [`Message`] once enough
/// data has accumulated and `Ok(None)` while more bytes are needed.
///
/// [`next_message`]: Unmarshaller::next_message
#[derive(Default)]
pub struct Unmarshaller {
    buf: Vec<u8>,
    fds: VecDeque<RawFd>,
}

impl Unmarshaller {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            fds: VecDeque::new(),
        }
    }

    /// Append a chunk of stream bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append file descriptors received as ancillary data.
    pub fn push_fds(&mut self, fds: impl IntoIterator<Item = RawFd>) {
        self.fds.extend(fds);
    }

    /// Parse one complete message out of the accumulated bytes.
    ///
    /// Returns `Ok(None)` if more bytes are needed. Errors are protocol
    /// violations and poison the stream; the caller is expected to tear the
    /// connection down.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        // Fixed header plus the header-field array length prefix.
        if self.buf.len() < 16 {
            return Ok(None);
        }

        let Some(endianness) = Endianness::from_byte(self.buf[0]) else {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "unknown endianness marker",
            )));
        };

        let Some(message_type) = MessageType::from_byte(self.buf[1]) else {
            return Err(Error::new(ErrorKind::InvalidMessage("unknown message type")));
        };

        let flags = Flags(self.buf[2]);

        if self.buf[3] != PROTOCOL_VERSION {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "unsupported protocol version",
            )));
        }

        let load_u32 = |bytes: &[u8]| -> u32 {
            let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];

            match endianness {
                Endianness::Little => u32::from_le_bytes(bytes),
                Endianness::Big => u32::from_be_bytes(bytes),
            }
        };

        let body_length = load_u32(&self.buf[4..8]) as usize;
        let serial = load_u32(&self.buf[8..12]);
        let fields_length = load_u32(&self.buf[12..16]) as usize;

        if serial == 0 {
            return Err(Error::new(ErrorKind::InvalidMessage("zero serial")));
        }

        if fields_length > MAX_ARRAY_LENGTH as usize {
            return Err(Error::new(ErrorKind::ArrayTooLong(fields_length as u32)));
        }

        let fields_end = 16 + fields_length;
        let total = fields_end + padding_to(fields_end, 8) + body_length;

        if total > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::MessageTooLong(total)));
        }

        if self.buf.len() < total {
            return Ok(None);
        }

        let mut message = Message {
            message_type,
            flags,
            serial,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
            unix_fds: Vec::new(),
        };

        let mut fd_count = 0usize;

        {
            let mut reader = Reader {
                data: &self.buf[..total],
                pos: 16,
                endianness,
                fds: &[],
                depth: 0,
            };

            while reader.pos < fields_end {
                reader.align(8)?;

                if reader.pos >= fields_end {
                    break;
                }

                let code = reader.load_u8()?;
                let signature = reader.read_signature_text()?;
                let node = parse_single(&signature)?;
                let value = reader.read_value(&node)?;

                store_field(&mut message, &mut fd_count, code, value)?;
            }

            if reader.pos != fields_end {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "header field array overruns its length",
                )));
            }
        }

        // Ancillary descriptors announced by UNIX_FDS travel with the
        // message bytes, so they must all have arrived by now.
        if fd_count > self.fds.len() {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "message announces more file descriptors than were received",
            )));
        }

        let unix_fds: Vec<RawFd> = self.fds.drain(..fd_count).collect();

        {
            let mut reader = Reader {
                data: &self.buf[..total],
                pos: fields_end + padding_to(fields_end, 8),
                endianness,
                fds: &unix_fds,
                depth: 0,
            };

            let nodes = parse_signature(&message.signature)?;

            for node in nodes.iter() {
                message.body.push(reader.read_value(node)?);
            }

            if reader.pos != total {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "body does not match its announced length",
                )));
            }
        }

        message.unix_fds = unix_fds;
        message.validate()?;

        self.buf.drain(..total);
        Ok(Some(message))
    }
}

/// Assign a decoded header field, enforcing the value type each field code
/// demands. Unknown field codes are skipped.
fn store_field(
    message: &mut Message,
    fd_count: &mut usize,
    code: u8,
    value: Value,
) -> Result<()> {
    let wrong = || Error::new(ErrorKind::InvalidMessage("header field has wrong type"));

    match HeaderField::from_byte(code) {
        Some(HeaderField::Path) => match value {
            Value::ObjectPath(path) => message.path = Some(path),
            _ => return Err(wrong()),
        },
        Some(HeaderField::Interface) => match value {
            Value::String(interface) => message.interface = Some(interface),
            _ => return Err(wrong()),
        },
        Some(HeaderField::Member) => match value {
            Value::String(member) => message.member = Some(member),
            _ => return Err(wrong()),
        },
        Some(HeaderField::ErrorName) => match value {
            Value::String(error_name) => message.error_name = Some(error_name),
            _ => return Err(wrong()),
        },
        Some(HeaderField::ReplySerial) => match value {
            Value::Uint32(serial) => message.reply_serial = Some(serial),
            _ => return Err(wrong()),
        },
        Some(HeaderField::Destination) => match value {
            Value::String(destination) => message.destination = Some(destination),
            _ => return Err(wrong()),
        },
        Some(HeaderField::Sender) => match value {
            Value::String(sender) => message.sender = Some(sender),
            _ => return Err(wrong()),
        },
        Some(HeaderField::Signature) => match value {
            Value::Signature(signature) => message.signature = signature,
            _ => return Err(wrong()),
        },
        Some(HeaderField::UnixFds) => match value {
            Value::Uint32(count) => *fd_count = count as usize,
            _ => return Err(wrong()),
        },
        None => {}
    }

    Ok(())
}

/// A cursor over one complete message; offsets are absolute so alignment
/// falls out of the position.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endianness: Endianness,
    fds: &'a [RawFd],
    depth: usize,
}

impl<'a> Reader<'a> {
    fn underflow() -> Error {
        Error::new(ErrorKind::InvalidMessage("unexpected end of message data"))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(Self::underflow)?;

        if end > self.data.len() {
            return Err(Self::underflow());
        }

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = padding_to(self.pos, alignment);
        self.take(padding)?;
        Ok(())
    }

    fn load_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn load_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let bytes = self.take(2)?;
        let bytes = [bytes[0], bytes[1]];

        Ok(match self.endianness {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        })
    }

    fn load_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.take(4)?;
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];

        Ok(match self.endianness {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    fn load_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let bytes = self.take(8)?;
        let bytes = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ];

        Ok(match self.endianness {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }

    /// A `u32` length-prefixed, nul-terminated string.
    fn read_string_text(&mut self) -> Result<String> {
        let length = self.load_u32()? as usize;
        self.read_text(length)
    }

    /// A single-byte length-prefixed, nul-terminated signature.
    fn read_signature_text(&mut self) -> Result<String> {
        let length = self.load_u8()? as usize;
        self.read_text(length)
    }

    fn read_text(&mut self, length: usize) -> Result<String> {
        let bytes = self.take(length)?;

        if self.take(1)?[0] != 0 {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "string is not nul terminated",
            )));
        }

        if bytes.contains(&0) {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "string contains interior nul byte",
            )));
        }

        Ok(str::from_utf8(bytes)?.to_owned())
    }

    fn read_value(&mut self, node: &SignatureNode) -> Result<Value> {
        if self.depth == MAX_READ_DEPTH {
            return Err(Error::new(ErrorKind::InvalidMessage(
                "maximum nesting depth exceeded",
            )));
        }

        self.depth += 1;
        let value = self.read_value_inner(node);
        self.depth -= 1;
        value
    }

    fn read_value_inner(&mut self, node: &SignatureNode) -> Result<Value> {
        Ok(match node.code() {
            TypeCode::Byte => Value::Byte(self.load_u8()?),
            TypeCode::Boolean => match self.load_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "boolean is neither 0 nor 1",
                    )))
                }
            },
            TypeCode::Int16 => Value::Int16(self.load_u16()? as i16),
            TypeCode::Uint16 => Value::Uint16(self.load_u16()?),
            TypeCode::Int32 => Value::Int32(self.load_u32()? as i32),
            TypeCode::Uint32 => Value::Uint32(self.load_u32()?),
            TypeCode::Int64 => Value::Int64(self.load_u64()? as i64),
            TypeCode::Uint64 => Value::Uint64(self.load_u64()?),
            TypeCode::Double => Value::Double(f64::from_bits(self.load_u64()?)),
            TypeCode::String => Value::String(self.read_string_text()?),
            TypeCode::ObjectPath => {
                let path = self.read_string_text()?;

                if !names::is_object_path(&path) {
                    return Err(Error::new(ErrorKind::InvalidMessage("invalid object path")));
                }

                Value::ObjectPath(path)
            }
            TypeCode::Signature => {
                let signature = self.read_signature_text()?;
                parse_signature(&signature)?;
                Value::Signature(signature)
            }
            TypeCode::UnixFd => {
                let index = self.load_u32()?;

                if index as usize >= self.fds.len() {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "file descriptor index out of range",
                    )));
                }

                Value::UnixFd(index)
            }
            TypeCode::Array => {
                let length = self.load_u32()?;

                if length > MAX_ARRAY_LENGTH {
                    return Err(Error::new(ErrorKind::ArrayTooLong(length)));
                }

                let element = node.element();
                self.align(element.alignment())?;
                let end = self
                    .pos
                    .checked_add(length as usize)
                    .ok_or_else(Self::underflow)?;

                if element.code() == TypeCode::DictEntry {
                    let mut entries = Vec::new();

                    while self.pos < end {
                        self.align(8)?;
                        let key = self.read_value(&element.children()[0])?;
                        let value = self.read_value(&element.children()[1])?;
                        entries.push((key, value));
                    }

                    if self.pos != end {
                        return Err(Error::new(ErrorKind::InvalidMessage(
                            "array contents overrun the array length",
                        )));
                    }

                    Value::Dict(entries)
                } else {
                    let mut values = Vec::new();

                    while self.pos < end {
                        values.push(self.read_value(element)?);
                    }

                    if self.pos != end {
                        return Err(Error::new(ErrorKind::InvalidMessage(
                            "array contents overrun the array length",
                        )));
                    }

                    Value::Array(values)
                }
            }
            TypeCode::Struct => {
                self.align(8)?;
                let mut values = Vec::with_capacity(node.children().len());

                for child in node.children() {
                    values.push(self.read_value(child)?);
                }

                Value::Struct(values)
            }
            TypeCode::DictEntry => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "dict entry outside of array",
                )))
            }
            TypeCode::Variant => {
                let signature = self.read_signature_text()?;
                let node = parse_single(&signature)?;
                let value = self.read_value(&node)?;
                Value::Variant(Box::new(Variant::from_parts(signature, node, value)))
            }
        })
    }
}
