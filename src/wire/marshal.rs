use std::os::fd::RawFd;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::names;
use crate::protocol::{
    padding_to, Endianness, HeaderField, FIXED_HEADER_LENGTH, MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH,
    PROTOCOL_VERSION,
};
use crate::signature::{parse_signature, SignatureNode, TypeCode};
use crate::value::Value;

/// A growable byte buffer writing values in the D-Bus encoding.
///
/// Every write pads the buffer to the alignment of the written type with
/// zero bytes first. Alignment is relative to the start of the buffer, which
/// for a full message coincides with the start of the wire message.
pub(crate) struct Marshaller {
    buf: Vec<u8>,
    endianness: Endianness,
    /// Number of descriptors attached to the message, bounding `h` indices.
    fd_count: usize,
}

impl Marshaller {
    pub(crate) fn new(endianness: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            endianness,
            fd_count: 0,
        }
    }

    pub(crate) fn with_fd_count(endianness: Endianness, fd_count: usize) -> Self {
        Self {
            buf: Vec::new(),
            endianness,
            fd_count,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    fn align(&mut self, alignment: usize) {
        let padding = padding_to(self.buf.len(), alignment);
        self.buf.resize(self.buf.len() + padding, 0);
    }

    fn store_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn store_u16(&mut self, value: u16) {
        self.align(2);

        match self.endianness {
            Endianness::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
            Endianness::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn store_u32(&mut self, value: u32) {
        self.align(4);

        match self.endianness {
            Endianness::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
            Endianness::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
        }
    }

    fn store_u64(&mut self, value: u64) {
        self.align(8);

        match self.endianness {
            Endianness::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
            Endianness::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Reserve an aligned `u32` slot to be backfilled later.
    fn reserve_u32(&mut self) -> usize {
        self.align(4);
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        at
    }

    fn store_u32_at(&mut self, at: usize, value: u32) {
        let bytes = match self.endianness {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };

        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    /// `s` and `o`: length-prefixed, nul-terminated UTF-8.
    fn store_string(&mut self, value: &str) {
        self.store_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    /// `g`: single-byte length prefix, nul-terminated.
    fn store_signature(&mut self, value: &str) {
        self.store_u8(value.len() as u8);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
    }

    fn mismatch(node: &SignatureNode, reason: &'static str) -> Error {
        Error::new(ErrorKind::SignatureBodyMismatch {
            signature: node.text().into(),
            reason,
        })
    }

    /// Write a single value of the type described by `node`.
    pub(crate) fn write_value(&mut self, node: &SignatureNode, value: &Value) -> Result<()> {
        match (node.code(), value) {
            (TypeCode::Byte, Value::Byte(v)) => self.store_u8(*v),
            (TypeCode::Boolean, Value::Bool(v)) => self.store_u32(u32::from(*v)),
            (TypeCode::Int16, Value::Int16(v)) => self.store_u16(*v as u16),
            (TypeCode::Uint16, Value::Uint16(v)) => self.store_u16(*v),
            (TypeCode::Int32, Value::Int32(v)) => self.store_u32(*v as u32),
            (TypeCode::Uint32, Value::Uint32(v)) => self.store_u32(*v),
            (TypeCode::Int64, Value::Int64(v)) => self.store_u64(*v as u64),
            (TypeCode::Uint64, Value::Uint64(v)) => self.store_u64(*v),
            (TypeCode::Double, Value::Double(v)) => self.store_u64(v.to_bits()),
            (TypeCode::String, Value::String(v)) => self.store_string(v),
            (TypeCode::ObjectPath, Value::ObjectPath(v)) => {
                if !names::is_object_path(v) {
                    return Err(Error::new(ErrorKind::InvalidObjectPath));
                }

                self.store_string(v);
            }
            (TypeCode::Signature, Value::Signature(v)) => {
                parse_signature(v)?;
                self.store_signature(v);
            }
            (TypeCode::UnixFd, Value::UnixFd(index)) => {
                if *index as usize >= self.fd_count {
                    return Err(Error::new(ErrorKind::InvalidMessage(
                        "body references a file descriptor not attached to the message",
                    )));
                }

                self.store_u32(*index);
            }
            (TypeCode::Array, Value::Array(values)) => {
                let element = node.element();

                if element.code() == TypeCode::DictEntry {
                    return Err(Self::mismatch(node, "dict expected, array provided"));
                }

                self.write_array(node, |m| {
                    for value in values {
                        m.write_value(element, value)?;
                    }

                    Ok(())
                })?;
            }
            (TypeCode::Array, Value::Dict(entries)) => {
                let element = node.element();

                if element.code() != TypeCode::DictEntry {
                    return Err(Self::mismatch(node, "array expected, dict provided"));
                }

                self.write_array(node, |m| {
                    for (key, value) in entries {
                        m.align(8);
                        m.write_value(&element.children()[0], key)?;
                        m.write_value(&element.children()[1], value)?;
                    }

                    Ok(())
                })?;
            }
            (TypeCode::Struct, Value::Struct(values)) => {
                if values.len() != node.children().len() {
                    return Err(Self::mismatch(node, "wrong number of struct fields"));
                }

                self.align(8);

                for (field, value) in node.children().iter().zip(values) {
                    self.write_value(field, value)?;
                }
            }
            (TypeCode::Variant, Value::Variant(variant)) => {
                self.store_signature(variant.signature());
                self.write_value(variant.node(), variant.value())?;
            }
            _ => return Err(Self::mismatch(node, "value does not match type code")),
        }

        Ok(())
    }

    /// Array framing: a 4-aligned length slot, padding to the element
    /// alignment (emitted even for empty arrays), the elements, and a
    /// backfilled length covering the element bytes only.
    fn write_array(
        &mut self,
        node: &SignatureNode,
        contents: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let slot = self.reserve_u32();
        self.align(node.element().alignment());
        let start = self.buf.len();

        contents(self)?;

        let length = self.buf.len() - start;

        if length > MAX_ARRAY_LENGTH as usize {
            return Err(Error::new(ErrorKind::ArrayTooLong(length as u32)));
        }

        self.store_u32_at(slot, length as u32);
        Ok(())
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Marshal a complete message: fixed header, header-field array, padding to
/// 8 and the body.
///
/// The message must carry a serial; outgoing messages are little endian.
pub(crate) fn marshal_message(message: &Message) -> Result<(Vec<u8>, Vec<RawFd>)> {
    message.validate()?;

    if message.serial == 0 {
        return Err(Error::new(ErrorKind::InvalidMessage(
            "message has no serial",
        )));
    }

    let nodes = parse_signature(&message.signature)?;

    if nodes.len() != message.body.len() {
        return Err(Error::new(ErrorKind::SignatureBodyMismatch {
            signature: message.signature.clone().into(),
            reason: "wrong number of body values",
        }));
    }

    // The body is marshalled first: the fixed header wants its length.
    let mut body = Marshaller::with_fd_count(Endianness::Little, message.unix_fds.len());

    for (node, value) in nodes.iter().zip(&message.body) {
        body.write_value(node, value)?;
    }

    let body_bytes = body.into_bytes();

    let mut m = Marshaller::new(Endianness::Little);
    m.store_u8(Endianness::Little as u8);
    m.store_u8(message.message_type as u8);
    m.store_u8(message.flags.0);
    m.store_u8(PROTOCOL_VERSION);
    m.store_u32(body_bytes.len() as u32);
    m.store_u32(message.serial);

    debug_assert_eq!(m.len(), FIXED_HEADER_LENGTH);

    let fields_slot = m.reserve_u32();
    m.align(8);
    let fields_start = m.len();

    let field = |m: &mut Marshaller, code: HeaderField, signature: &str, write: &dyn Fn(&mut Marshaller)| {
        m.align(8);
        m.store_u8(code as u8);
        m.store_signature(signature);
        write(m);
    };

    if let Some(path) = &message.path {
        field(&mut m, HeaderField::Path, "o", &|m| m.store_string(path));
    }

    if let Some(interface) = &message.interface {
        field(&mut m, HeaderField::Interface, "s", &|m| {
            m.store_string(interface)
        });
    }

    if let Some(member) = &message.member {
        field(&mut m, HeaderField::Member, "s", &|m| m.store_string(member));
    }

    if let Some(error_name) = &message.error_name {
        field(&mut m, HeaderField::ErrorName, "s", &|m| {
            m.store_string(error_name)
        });
    }

    if let Some(reply_serial) = message.reply_serial {
        field(&mut m, HeaderField::ReplySerial, "u", &|m| {
            m.store_u32(reply_serial)
        });
    }

    if let Some(destination) = &message.destination {
        field(&mut m, HeaderField::Destination, "s", &|m| {
            m.store_string(destination)
        });
    }

    if let Some(sender) = &message.sender {
        field(&mut m, HeaderField::Sender, "s", &|m| m.store_string(sender));
    }

    if !message.signature.is_empty() {
        field(&mut m, HeaderField::Signature, "g", &|m| {
            m.store_signature(&message.signature)
        });
    }

    if !message.unix_fds.is_empty() {
        let count = message.unix_fds.len() as u32;
        field(&mut m, HeaderField::UnixFds, "u", &|m| m.store_u32(count));
    }

    let fields_length = m.len() - fields_start;
    m.store_u32_at(fields_slot, fields_length as u32);

    m.align(8);

    let mut bytes = m.into_bytes();
    bytes.extend_from_slice(&body_bytes);

    if bytes.len() > MAX_MESSAGE_LENGTH {
        return Err(Error::new(ErrorKind::MessageTooLong(bytes.len())));
    }

    Ok((bytes, message.unix_fds.clone()))
}
