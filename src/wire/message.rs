//! The framed D-Bus message: fixed header, header-field array, aligned body.
//!
//! Framing is pure: `encode_message` and `decode_message` own no buffers and
//! perform no I/O.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};

use crate::names;
use crate::wire::codec::{
    self, decode_values, encode_values, DecodeError, EncodeError,
};
use crate::wire::{Endian, Type, Value};

/// Hard cap on one message, taken from the reference implementation.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header length: endianness, type, flags, version, body length, serial.
const FIXED_HEADER_LEN: usize = 12;

// Header field codes.
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFlag {
    NoReplyExpected = 0x1,
    NoAutoStart = 0x2,
    AllowInteractiveAuth = 0x4,
}

/// One D-Bus message, with any file descriptors carried out-of-band.
///
/// Descriptors are shared so that a signal fanned out to several peers writes
/// the same underlying descriptors; the last drop closes them.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub kind: MessageType,
    pub serial: u32,
    pub flags: BitFlags<HeaderFlag>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Vec<Type>,
    pub body: Vec<Value>,
    pub unix_fds: u32,
    pub fds: Vec<Arc<OwnedFd>>,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::MethodCall
    }
}

impl Message {
    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Self {
        Self {
            kind: MessageType::MethodCall,
            path: Some(path.to_string()),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
            destination: destination.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self {
            kind: MessageType::Signal,
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Default::default()
        }
    }

    /// A reply addressed back at the sender of `reply_to`.
    pub fn method_return(reply_to: &Message) -> Self {
        Self {
            kind: MessageType::MethodReturn,
            reply_serial: Some(reply_to.serial),
            destination: reply_to.sender.clone(),
            ..Default::default()
        }
    }

    /// An error reply carrying a human-readable description as its body.
    pub fn method_error(reply_to: &Message, error_name: &str, text: &str) -> Self {
        Self {
            kind: MessageType::Error,
            error_name: Some(error_name.to_string()),
            reply_serial: Some(reply_to.serial),
            destination: reply_to.sender.clone(),
            signature: vec![Type::String],
            body: vec![Value::String(text.to_string())],
            ..Default::default()
        }
    }

    pub fn with_body(mut self, signature: Vec<Type>, body: Vec<Value>) -> Self {
        self.signature = signature;
        self.body = body;
        self
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn with_flags(mut self, flags: BitFlags<HeaderFlag>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_fds(mut self, fds: Vec<Arc<OwnedFd>>) -> Self {
        self.unix_fds = fds.len() as u32;
        self.fds = fds;
        self
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::MethodReturn | MessageType::Error)
    }

    fn check_required_fields(&self) -> Result<(), &'static str> {
        match self.kind {
            MessageType::MethodCall | MessageType::Signal => {
                if self.path.is_none() {
                    return Err("path");
                }
                if self.member.is_none() {
                    return Err("member");
                }
                if self.kind == MessageType::Signal && self.interface.is_none() {
                    return Err("interface");
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err("reply_serial");
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return Err("error_name");
                }
                if self.reply_serial.is_none() {
                    return Err("reply_serial");
                }
            }
        }
        Ok(())
    }

    fn header_fields(&self) -> Vec<Value> {
        let mut fields = Vec::new();
        let mut push = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![
                Value::Byte(code),
                Value::Variant(Box::new(value)),
            ]));
        };
        if let Some(path) = &self.path {
            push(FIELD_PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(FIELD_INTERFACE, Value::String(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(FIELD_MEMBER, Value::String(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            push(FIELD_ERROR_NAME, Value::String(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(FIELD_REPLY_SERIAL, Value::Uint32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(FIELD_DESTINATION, Value::String(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(FIELD_SENDER, Value::String(sender.clone()));
        }
        if !self.signature.is_empty() {
            push(
                FIELD_SIGNATURE,
                Value::Signature(Type::signature_of(&self.signature)),
            );
        }
        if self.unix_fds > 0 {
            push(FIELD_UNIX_FDS, Value::Uint32(self.unix_fds));
        }
        fields
    }
}

fn field_entry_type() -> Type {
    Type::Struct(vec![Type::Byte, Type::Variant])
}

/// Serializes a message to wire bytes.
pub fn encode_message(msg: &Message, endian: Endian) -> Result<Vec<u8>, EncodeError> {
    msg.check_required_fields()
        .map_err(EncodeError::MissingRequiredField)?;
    if msg.serial == 0 {
        return Err(EncodeError::SerialZero);
    }

    // The body starts at an 8-aligned offset, so encoding it from offset zero
    // of its own region yields the same padding.
    let mut body = Vec::new();
    encode_values(&mut body, endian, &msg.signature, &msg.body)?;

    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + 64 + body.len());
    buf.push(endian.code());
    buf.push(msg.kind as u8);
    buf.push(msg.flags.bits());
    buf.push(PROTOCOL_VERSION);
    let mut raw = [0; 4];
    endian.write_u32(&mut raw, body.len() as u32);
    buf.extend_from_slice(&raw);
    endian.write_u32(&mut raw, msg.serial);
    buf.extend_from_slice(&raw);

    let fields = Value::Array(field_entry_type(), msg.header_fields());
    codec::encode_value(&mut buf, endian, &fields)?;
    codec::pad_to(&mut buf, 8);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Deframes one message from the front of `buf`.
///
/// Returns `Ok(None)` while the buffer holds less than one whole frame; the
/// caller is expected to read more and retry. Once the declared frame is
/// fully buffered any shortfall inside it is corruption, reported as an
/// error.
pub fn decode_message(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
    if buf.len() < FIXED_HEADER_LEN + 4 {
        return Ok(None);
    }
    let endian = Endian::from_code(buf[0]).ok_or(DecodeError::InvalidEndianness(buf[0]))?;
    let kind = MessageType::from_u8(buf[1]).ok_or(DecodeError::InvalidMessageType(buf[1]))?;
    let flags = BitFlags::from_bits_truncate(buf[2]);
    if buf[3] != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedProtocolVersion(buf[3]));
    }
    let body_len = endian.read_u32(&buf[4..8]) as usize;
    let serial = endian.read_u32(&buf[8..12]);
    let fields_len = endian.read_u32(&buf[12..16]) as usize;

    let fields_end = FIXED_HEADER_LEN + 4 + fields_len;
    let body_start = fields_end + codec::padding_for(fields_end, 8);
    let total = body_start + body_len;
    if total > MAX_MESSAGE_SIZE {
        return Err(DecodeError::MessageTooLarge(total));
    }
    if buf.len() < total {
        return Ok(None);
    }
    if serial == 0 {
        return Err(DecodeError::SerialZero);
    }

    let mut msg = Message {
        kind,
        serial,
        flags,
        ..Default::default()
    };

    // Header fields, decoded at their absolute offset.
    let mut cursor = FIXED_HEADER_LEN;
    let entry_ty = field_entry_type();
    let fields = codec::decode_value(
        &buf[..body_start],
        &mut cursor,
        endian,
        &Type::Array(Box::new(entry_ty)),
    )?;
    let Value::Array(_, entries) = fields else {
        unreachable!("array type decodes to an array value");
    };
    for entry in entries {
        let Value::Struct(mut parts) = entry else {
            unreachable!("struct type decodes to a struct value");
        };
        let inner = match parts.pop() {
            Some(Value::Variant(inner)) => *inner,
            _ => return Err(DecodeError::InvalidHeaderField(0)),
        };
        let code = match parts.pop() {
            Some(Value::Byte(code)) => code,
            _ => return Err(DecodeError::InvalidHeaderField(0)),
        };
        set_field(&mut msg, code, inner)?;
    }

    // The body begins at the next 8-byte boundary.
    if codec::padding_for(cursor, 8) + cursor != body_start {
        return Err(DecodeError::InvalidHeaderField(0));
    }
    let mut cursor = body_start;
    if body_len > 0 && msg.signature.is_empty() {
        return Err(DecodeError::MissingSignature);
    }
    msg.body = decode_values(&buf[..total], &mut cursor, endian, &msg.signature)?;
    if cursor != total {
        return Err(DecodeError::TrailingBodyBytes);
    }

    msg.check_required_fields()
        .map_err(DecodeError::MissingRequiredField)?;
    Ok(Some((msg, total)))
}

fn set_field(msg: &mut Message, code: u8, value: Value) -> Result<(), DecodeError> {
    let invalid = DecodeError::InvalidHeaderField(code);
    match code {
        FIELD_PATH => match value {
            Value::ObjectPath(path) => msg.path = Some(path),
            _ => return Err(invalid),
        },
        FIELD_INTERFACE => match value {
            Value::String(name) if names::is_valid_interface_name(&name) => {
                msg.interface = Some(name)
            }
            _ => return Err(invalid),
        },
        FIELD_MEMBER => match value {
            Value::String(name) if names::is_valid_member_name(&name) => msg.member = Some(name),
            _ => return Err(invalid),
        },
        FIELD_ERROR_NAME => match value {
            Value::String(name) if names::is_valid_interface_name(&name) => {
                msg.error_name = Some(name)
            }
            _ => return Err(invalid),
        },
        FIELD_REPLY_SERIAL => match value {
            Value::Uint32(serial) if serial != 0 => msg.reply_serial = Some(serial),
            _ => return Err(invalid),
        },
        FIELD_DESTINATION => match value {
            Value::String(name) if names::is_valid_bus_name(&name) => {
                msg.destination = Some(name)
            }
            _ => return Err(invalid),
        },
        FIELD_SENDER => match value {
            Value::String(name) if names::is_valid_bus_name(&name) => msg.sender = Some(name),
            _ => return Err(invalid),
        },
        FIELD_SIGNATURE => match value {
            Value::Signature(sig) => msg.signature = Type::parse_types(&sig)?,
            _ => return Err(invalid),
        },
        FIELD_UNIX_FDS => match value {
            Value::Uint32(count) => msg.unix_fds = count,
            _ => return Err(invalid),
        },
        // Unknown header fields are ignored for forward compatibility.
        _ => {}
    }
    Ok(())
}
