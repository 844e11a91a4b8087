//! Protocol constants and the small enums that appear in every message header.

use crate::error::{ErrorKind, Result};

/// Lowest protocol version accepted on receive.
pub const MIN_VERSION: u8 = 1;
/// Protocol version written on send.
pub const VERSION: u8 = 1;
/// Highest protocol version accepted on receive.
pub const MAX_VERSION: u8 = VERSION;

/// 2^27 bytes.
pub const MAX_MESSAGE_LENGTH: usize = 134_217_728;
/// 2^26 bytes.
pub const MAX_ARRAY_LENGTH: usize = 67_108_864;
pub const MAX_SIGNATURE_LENGTH: usize = 255;
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;
pub const MAX_TOTAL_DEPTH: usize = MAX_ARRAY_DEPTH + MAX_STRUCT_DEPTH;

/// Length of the fixed message prefix, including the header field array length.
pub const PREFIX_LENGTH: usize = 16;

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    #[cfg(target_endian = "little")]
    pub const NATIVE: Endian = Endian::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: Endian = Endian::Big;

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'l' => Ok(Endian::Little),
            b'B' => Ok(Endian::Big),
            other => Err(ErrorKind::InvalidHeader(format!(
                "endianness byte {:#x} must be 'l' or 'B'",
                other
            ))
            .into()),
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub(crate) fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn u64_bytes(self, v: u64) -> [u8; 8] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    pub(crate) fn read_u16(self, b: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        }
    }

    pub(crate) fn read_u32(self, b: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        }
    }

    pub(crate) fn read_u64(self, b: [u8; 8]) -> u64 {
        match self {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum MessageType {
    Invalid,
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            _ => MessageType::Invalid,
        }
    }

    pub const fn as_byte(self) -> u8 {
        match self {
            MessageType::Invalid => 0,
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    /// The name used for this type in match rules.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Invalid => "invalid",
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "method_call" => Some(MessageType::MethodCall),
            "method_return" => Some(MessageType::MethodReturn),
            "error" => Some(MessageType::Error),
            "signal" => Some(MessageType::Signal),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Message header flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default)]
    pub struct Flags: u8 {
        const NO_REPLY_EXPECTED = 0x01;
        const NO_AUTO_START = 0x02;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x04;
    }
}

/// Header field codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Field {
    Path,
    Interface,
    Member,
    ErrorName,
    ReplySerial,
    Destination,
    Sender,
    Signature,
}

impl Field {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Field::Path,
            2 => Field::Interface,
            3 => Field::Member,
            4 => Field::ErrorName,
            5 => Field::ReplySerial,
            6 => Field::Destination,
            7 => Field::Sender,
            8 => Field::Signature,
            _ => return None,
        })
    }

    pub const fn code(self) -> u8 {
        match self {
            Field::Path => 1,
            Field::Interface => 2,
            Field::Member => 3,
            Field::ErrorName => 4,
            Field::ReplySerial => 5,
            Field::Destination => 6,
            Field::Sender => 7,
            Field::Signature => 8,
        }
    }

    /// The only type code a field's variant may carry.
    pub const fn type_code(self) -> u8 {
        match self {
            Field::Path => b'o',
            Field::ReplySerial => b'u',
            Field::Signature => b'g',
            _ => b's',
        }
    }
}

/// Alignment of a type, by its leading type code.
pub fn alignment(code: u8) -> Result<usize> {
    Ok(match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' | b'r' | b'e' => 8,
        other => return Err(ErrorKind::UnknownType(other as char).into()),
    })
}

/// Bytes of padding needed to bring `pos` to a multiple of `align`.
#[inline]
pub const fn pad_needed(pos: usize, align: usize) -> usize {
    (align - (pos % align)) % align
}

/// `pos` rounded up to a multiple of `align`.
#[inline]
pub const fn padded(pos: usize, align: usize) -> usize {
    pos + pad_needed(pos, align)
}
