//! Signature-directed marshalling of [`Value`]s.

use crate::error::{ErrorKind, Result};
use crate::protocol::{alignment, pad_needed, Endian, MAX_ARRAY_LENGTH, MAX_TOTAL_DEPTH};
use crate::signature::{self, Signature};
use crate::value::Value;

/// Appends the wire encoding of values to a growable buffer.
///
/// Alignment is computed from the start of the buffer, so a writer used for
/// a message body must start at an 8-aligned message offset, which the
/// header layout guarantees.
#[derive(Debug, Clone)]
pub struct Writer {
    buf: Vec<u8>,
    endian: Endian,
    variants: usize,
}

impl Writer {
    pub fn new(endian: Endian) -> Self {
        Writer {
            buf: Vec::new(),
            endian,
            variants: 0,
        }
    }

    /// Continue writing after the bytes already in `buf`.
    pub fn from_vec(buf: Vec<u8>, endian: Endian) -> Self {
        Writer {
            buf,
            endian,
            variants: 0,
        }
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The current write offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Append zero bytes up to the next multiple of `align`.
    pub fn pad(&mut self, align: usize) {
        let n = pad_needed(self.buf.len(), align);
        self.buf.resize(self.buf.len() + n, 0);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.pad(2);
        let b = self.endian.u16_bytes(v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.pad(4);
        let b = self.endian.u32_bytes(v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.pad(8);
        let b = self.endian.u64_bytes(v);
        self.buf.extend_from_slice(&b);
    }

    /// A string or object path: u32 length, bytes, NUL.
    pub fn write_str(&mut self, s: &str) -> Result<()> {
        let len = u32::try_from(s.len()).map_err(|_| ErrorKind::LengthExceeded {
            what: "String",
            length: s.len(),
            max: u32::MAX as usize,
        })?;
        self.write_u32(len);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// A signature: u8 length, bytes, NUL.
    pub fn write_signature(&mut self, sig: &str) -> Result<()> {
        signature::validate(sig)?;
        // validate() caps the length at 255
        self.buf.push(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// Write one value, padding before it as its type requires.
    ///
    /// The value's type is checked first: it must be one complete type
    /// within the nesting limits, with dict entries only inside arrays.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        Signature::single(value.signature().as_str())?;
        self.write_checked(value)
    }

    fn write_checked(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.write_u8(*v),
            Value::Bool(v) => self.write_u32(u32::from(*v)),
            Value::Int16(v) => self.write_u16(*v as u16),
            Value::UInt16(v) => self.write_u16(*v),
            Value::Int32(v) => self.write_u32(*v as u32),
            Value::UInt32(v) => self.write_u32(*v),
            Value::Int64(v) => self.write_u64(*v as u64),
            Value::UInt64(v) => self.write_u64(*v),
            Value::Double(v) => self.write_u64(v.to_bits()),
            Value::String(s) => self.write_str(s)?,
            Value::ObjectPath(p) => self.write_str(p.as_str())?,
            Value::Signature(s) => self.write_signature(s.as_str())?,
            Value::Variant(inner) => {
                if self.variants >= MAX_TOTAL_DEPTH {
                    return Err(ErrorKind::LengthExceeded {
                        what: "Variant nesting",
                        length: self.variants + 1,
                        max: MAX_TOTAL_DEPTH,
                    }
                    .into());
                }
                let sig = Signature::single(inner.signature().as_str())?;
                self.write_signature(sig.as_str())?;
                self.variants += 1;
                let result = self.write_checked(inner);
                self.variants -= 1;
                result?;
            }
            Value::Array(array) => {
                let element = array.element_signature();
                let first = *element
                    .as_bytes()
                    .first()
                    .ok_or(ErrorKind::MalformedSignature {
                        signature: String::new(),
                        reason: "array has no element type",
                    })?;
                self.write_u32(0);
                let len_pos = self.buf.len() - 4;
                // The padding to the first element is emitted even for an
                // empty array and is not counted in the length.
                self.pad(alignment(first)?);
                let start = self.buf.len();
                for item in array.iter() {
                    self.write_checked(item)?;
                }
                let len = self.buf.len() - start;
                if len > MAX_ARRAY_LENGTH {
                    return Err(ErrorKind::LengthExceeded {
                        what: "Array",
                        length: len,
                        max: MAX_ARRAY_LENGTH,
                    }
                    .into());
                }
                let b = self.endian.u32_bytes(len as u32);
                self.buf[len_pos..len_pos + 4].copy_from_slice(&b);
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(ErrorKind::MalformedSignature {
                        signature: "()".into(),
                        reason: "empty struct",
                    }
                    .into());
                }
                self.pad(8);
                for f in fields {
                    self.write_checked(f)?;
                }
            }
            Value::DictEntry(kv) => {
                self.pad(8);
                self.write_checked(&kv.0)?;
                self.write_checked(&kv.1)?;
            }
        }
        Ok(())
    }

    /// Write `values` after checking that together they have signature `sig`.
    pub fn write_typed(&mut self, values: &[Value], sig: &Signature) -> Result<()> {
        let got: String = values
            .iter()
            .map(|v| v.signature().as_str().to_owned())
            .collect();
        if got != sig.as_str() {
            return Err(ErrorKind::TypeMismatch {
                expected: sig.as_str().into(),
                got,
            }
            .into());
        }
        for v in values {
            self.write_value(v)?;
        }
        Ok(())
    }
}
