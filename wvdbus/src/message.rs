//! The message envelope and its framing.
//!
//! A message on the wire is the 16-byte prefix
//! `(endian, type, flags, version, body_length, serial, fields_length)`,
//! the header field array `a(yv)`, zero padding to a multiple of 8, and the
//! body. The body is kept as bytes and decoded only when [`Message::body`]
//! is called.

use std::fmt;

use crate::codec::{self, Reader, Writer};
use crate::error::{ErrorKind, Result};
use crate::protocol::{
    padded, Endian, Field, Flags, MessageType, MAX_ARRAY_LENGTH, MAX_MESSAGE_LENGTH, MAX_VERSION,
    MIN_VERSION, PREFIX_LENGTH, VERSION,
};
use crate::signature::Signature;
use crate::value::{Array, ObjectPath, Value};

#[derive(Clone, PartialEq, Debug)]
pub struct Message {
    endian: Endian,
    msg_type: MessageType,
    pub flags: Flags,
    version: u8,
    serial: u32,
    pub reply_serial: Option<u32>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    signature: Signature,
    body: Vec<u8>,
}

impl Message {
    fn new(msg_type: MessageType) -> Self {
        Message {
            endian: Endian::NATIVE,
            msg_type,
            flags: Flags::empty(),
            version: VERSION,
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Self> {
        let mut m = Message::new(MessageType::MethodCall);
        m.destination = destination.map(str::to_owned);
        m.path = Some(ObjectPath::new(path)?);
        m.interface = interface.map(str::to_owned);
        m.member = Some(member.to_owned());
        Ok(m)
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
        let mut m = Message::new(MessageType::Signal);
        m.path = Some(ObjectPath::new(path)?);
        m.interface = Some(interface.to_owned());
        m.member = Some(member.to_owned());
        Ok(m)
    }

    /// An empty method return answering `self`.
    pub fn method_return(&self) -> Self {
        let mut m = Message::new(MessageType::MethodReturn);
        m.endian = self.endian;
        m.reply_serial = Some(self.serial);
        m.destination = self.sender.clone();
        m
    }

    /// A method return answering `self` with `args` as its body.
    pub fn reply<I>(&self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        self.method_return().with_args(args)
    }

    /// An error answering `self`, carrying `text` as its only argument.
    pub fn error_reply(&self, name: &str, text: &str) -> Self {
        let mut m = Message::new(MessageType::Error);
        m.endian = self.endian;
        m.reply_serial = Some(self.serial);
        m.destination = self.sender.clone();
        m.error_name = Some(name.to_owned());
        m.signature = Signature::from_validated("s".into());
        let mut w = Writer::new(m.endian);
        // Strings only fail past u32::MAX bytes; fall back to an empty body.
        if w.write_str(text).is_ok() {
            m.body = w.into_bytes();
        } else {
            m.signature = Signature::empty();
        }
        m
    }

    /// Use `endian` for the header and any body written from now on.
    ///
    /// Must be called before arguments are appended.
    pub fn with_endian(mut self, endian: Endian) -> Self {
        if self.body.is_empty() {
            self.endian = endian;
        }
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_owned());
        self
    }

    /// Append one argument to the body.
    pub fn append<V: Into<Value>>(&mut self, value: V) -> Result<()> {
        let value = value.into();
        let mut signature = self.signature.as_str().to_owned();
        signature.push_str(value.signature().as_str());
        let signature = Signature::new(signature)?;

        let mut w = Writer::from_vec(std::mem::take(&mut self.body), self.endian);
        let start = w.position();
        let written = w.write_value(&value);
        let mut body = w.into_bytes();
        if let Err(e) = written {
            body.truncate(start);
            self.body = body;
            return Err(e);
        }
        if body.len() > MAX_MESSAGE_LENGTH {
            let length = body.len();
            body.truncate(start);
            self.body = body;
            return Err(ErrorKind::LengthExceeded {
                what: "Message body",
                length,
                max: MAX_MESSAGE_LENGTH,
            }
            .into());
        }
        self.body = body;
        self.signature = signature;
        Ok(())
    }

    pub fn with_args<I>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        for arg in args {
            self.append(arg)?;
        }
        Ok(self)
    }

    #[inline]
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Zero until the message has been sent.
    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_ref().map(ObjectPath::as_str)
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The raw body bytes.
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// True for a method call that wants an answer.
    pub fn expects_reply(&self) -> bool {
        self.msg_type == MessageType::MethodCall && !self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    /// Decode the body against the message signature.
    pub fn body(&self) -> Result<Vec<Value>> {
        codec::decode(&self.body, &self.signature, self.endian)
    }

    /// Turn an error message into [`ErrorKind::DBusError`], then decode the
    /// body, which must have signature `sig`.
    pub fn check(&self, sig: &str) -> Result<Vec<Value>> {
        self.error_result()?;
        if self.signature.as_str() != sig {
            return Err(ErrorKind::TypeMismatch {
                expected: sig.into(),
                got: self.signature.as_str().into(),
            }
            .into());
        }
        self.body()
    }

    /// `Err(DBusError)` for an error message, `Ok` for anything else.
    pub fn error_result(&self) -> Result<()> {
        if self.msg_type != MessageType::Error {
            return Ok(());
        }
        let message = self
            .body()
            .ok()
            .and_then(|args| args.into_iter().next())
            .and_then(|first| String::try_from(first).ok())
            .unwrap_or_default();
        Err(ErrorKind::DBusError {
            name: self.error_name.clone().unwrap_or_default(),
            message,
        }
        .into())
    }

    fn header_fields(&self) -> Result<Value> {
        fn field(f: Field, v: Value) -> Value {
            Value::Struct(vec![Value::Byte(f.code()), Value::Variant(Box::new(v))])
        }

        let mut fields = Vec::new();
        if let Some(p) = &self.path {
            fields.push(field(Field::Path, Value::ObjectPath(p.clone())));
        }
        for (f, v) in [
            (Field::Interface, &self.interface),
            (Field::Member, &self.member),
            (Field::ErrorName, &self.error_name),
        ] {
            if let Some(v) = v {
                fields.push(field(f, Value::from(v.as_str())));
            }
        }
        if let Some(r) = self.reply_serial {
            fields.push(field(Field::ReplySerial, Value::UInt32(r)));
        }
        for (f, v) in [
            (Field::Destination, &self.destination),
            (Field::Sender, &self.sender),
        ] {
            if let Some(v) = v {
                fields.push(field(f, Value::from(v.as_str())));
            }
        }
        if !self.signature.is_empty() {
            fields.push(field(
                Field::Signature,
                Value::Signature(self.signature.clone()),
            ));
        }

        Ok(Value::Array(Array::from_values(
            Signature::single("(yv)")?,
            fields,
        )?))
    }

    /// Encode the prefix and header fields, padded to 8.
    pub fn header_bytes(&self) -> Result<Vec<u8>> {
        let body_len = u32::try_from(self.body.len()).map_err(|_| ErrorKind::LengthExceeded {
            what: "Message body",
            length: self.body.len(),
            max: MAX_MESSAGE_LENGTH,
        })?;

        let mut w = Writer::new(self.endian);
        w.write_u8(self.endian.as_byte());
        w.write_u8(self.msg_type.as_byte());
        w.write_u8(self.flags.bits());
        w.write_u8(self.version);
        w.write_u32(body_len);
        w.write_u32(self.serial);
        w.write_value(&self.header_fields()?)?;
        w.pad(8);

        let total = w.position() + self.body.len();
        if total > MAX_MESSAGE_LENGTH {
            return Err(ErrorKind::LengthExceeded {
                what: "Message",
                length: total,
                max: MAX_MESSAGE_LENGTH,
            }
            .into());
        }
        Ok(w.into_bytes())
    }

    /// The complete wire encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = self.header_bytes()?;
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// How many bytes the message starting with `prefix` occupies in total.
    ///
    /// Only the first [`PREFIX_LENGTH`] bytes are looked at.
    pub fn bytes_needed(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < PREFIX_LENGTH {
            return Err(ErrorKind::Truncated {
                pos: 0,
                needed: PREFIX_LENGTH,
                available: prefix.len(),
            }
            .into());
        }
        let endian = Endian::from_byte(prefix[0])?;
        let version = prefix[3];
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(ErrorKind::UnsupportedVersion(version).into());
        }
        let word = |at: usize| {
            endian.read_u32([prefix[at], prefix[at + 1], prefix[at + 2], prefix[at + 3]]) as usize
        };
        let body_len = word(4);
        let fields_len = word(12);
        if fields_len > MAX_ARRAY_LENGTH {
            return Err(ErrorKind::LengthExceeded {
                what: "Header field array",
                length: fields_len,
                max: MAX_ARRAY_LENGTH,
            }
            .into());
        }

        let total = padded(PREFIX_LENGTH + fields_len, 8) + body_len;
        if total > MAX_MESSAGE_LENGTH {
            return Err(ErrorKind::LengthExceeded {
                what: "Message",
                length: total,
                max: MAX_MESSAGE_LENGTH,
            }
            .into());
        }
        Ok(total)
    }

    /// Decode exactly one complete message.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let total = Message::bytes_needed(data)?;
        if data.len() != total {
            return Err(if data.len() < total {
                ErrorKind::Truncated {
                    pos: 0,
                    needed: total,
                    available: data.len(),
                }
            } else {
                ErrorKind::InvalidHeader(format!(
                    "{} bytes after the end of the message",
                    data.len() - total
                ))
            }
            .into());
        }

        let endian = Endian::from_byte(data[0])?;
        let msg_type = MessageType::from_byte(data[1]);
        if msg_type == MessageType::Invalid {
            return Err(ErrorKind::InvalidHeader(format!("message type {}", data[1])).into());
        }

        let mut m = Message::new(msg_type);
        m.endian = endian;
        m.flags = Flags::from_bits_retain(data[2]);
        m.version = data[3];

        let mut r = Reader::at(data, 4, endian);
        let body_len = r.read_u32()? as usize;
        m.serial = r.read_u32()?;
        if m.serial == 0 {
            return Err(ErrorKind::InvalidHeader("serial must not be zero".into()).into());
        }

        let fields = r.read_one("a(yv)")?;
        r.align(8)?;
        let body_start = r.position();
        if body_start + body_len != data.len() {
            return Err(ErrorKind::InvalidHeader("header length mismatch".into()).into());
        }

        if let Value::Array(fields) = fields {
            for field in fields.into_items() {
                m.set_field(field)?;
            }
        }
        m.validate()?;
        m.body = data[body_start..].to_vec();
        Ok(m)
    }

    fn set_field(&mut self, field: Value) -> Result<()> {
        let Value::Struct(mut parts) = field else {
            return Ok(());
        };
        let (Some(Value::Variant(value)), Some(Value::Byte(code))) = (parts.pop(), parts.pop())
        else {
            return Ok(());
        };
        // Unknown codes are skipped.
        let Some(f) = Field::from_code(code) else {
            return Ok(());
        };

        let got = value.signature();
        if got.as_bytes() != [f.type_code()].as_slice() {
            return Err(ErrorKind::InvalidHeader(format!(
                "header field {} has type '{}', expected '{}'",
                code,
                got,
                f.type_code() as char
            ))
            .into());
        }

        match (f, *value) {
            (Field::Path, Value::ObjectPath(p)) => self.path = Some(p),
            (Field::Interface, Value::String(s)) => self.interface = Some(s),
            (Field::Member, Value::String(s)) => self.member = Some(s),
            (Field::ErrorName, Value::String(s)) => self.error_name = Some(s),
            (Field::ReplySerial, Value::UInt32(r)) => self.reply_serial = Some(r),
            (Field::Destination, Value::String(s)) => self.destination = Some(s),
            (Field::Sender, Value::String(s)) => self.sender = Some(s),
            (Field::Signature, Value::Signature(s)) => self.signature = s,
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let missing = |what: &str| -> Result<()> {
            Err(ErrorKind::InvalidHeader(format!(
                "{} message without {}",
                self.msg_type.as_str(),
                what
            ))
            .into())
        };
        match self.msg_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return missing("path");
                }
                if self.member.is_none() {
                    return missing("member");
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return missing("path");
                }
                if self.interface.is_none() {
                    return missing("interface");
                }
                if self.member.is_none() {
                    return missing("member");
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() {
                    return missing("error name");
                }
                if self.reply_serial.is_none() {
                    return missing("reply serial");
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return missing("reply serial");
                }
            }
            MessageType::Invalid => {}
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} #{}", self.msg_type.as_str(), self.serial)?;
        if let Some(r) = self.reply_serial {
            write!(f, " (reply to #{})", r)?;
        }
        if let Some(iface) = &self.interface {
            write!(f, " {}.", iface)?;
        } else if self.member.is_some() {
            f.write_str(" ")?;
        }
        if let Some(member) = &self.member {
            f.write_str(member)?;
        }
        if let Some(e) = &self.error_name {
            write!(f, " {}", e)?;
        }
        if let Some(p) = &self.path {
            write!(f, " on {}", p)?;
        }
        if !self.signature.is_empty() {
            write!(f, " ({})", self.signature)?;
        }
        Ok(())
    }
}

/// Render bytes as lines of 16 hex pairs with an ASCII column.
pub(crate) fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(16).enumerate() {
        out.push_str(&format!("\n{:08x}  ", i * 16));
        for (j, b) in line.iter().enumerate() {
            out.push_str(&format!("{:02x}", b));
            out.push(if j == 7 { '-' } else { ' ' });
        }
        for _ in line.len()..16 {
            out.push_str("   ");
        }
        out.push(' ');
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
    }
    out
}
