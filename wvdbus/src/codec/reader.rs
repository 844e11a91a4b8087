//! Signature-directed unmarshalling into [`Value`]s.

use crate::error::{ErrorKind, Result};
use crate::protocol::{alignment, pad_needed, Endian, MAX_ARRAY_LENGTH, MAX_TOTAL_DEPTH};
use crate::signature::{subsignature, Signature};
use crate::value::{Array, ObjectPath, Value};

/// Reads values out of a byte slice.
///
/// Every decode error is fatal for the slice: after one, the reader's
/// position is unspecified.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    variants: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self::at(data, 0, endian)
    }

    /// Start reading at `pos`; alignment is still relative to `data[0]`.
    pub fn at(data: &'a [u8], pos: usize, endian: Endian) -> Self {
        Reader {
            data,
            pos,
            endian,
            variants: 0,
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Read all complete types of `sig`, in order.
    pub fn read(&mut self, sig: &Signature) -> Result<Vec<Value>> {
        sig.iter().map(|single| self.read_value(single)).collect()
    }

    /// Skip padding up to the next multiple of `align`, which must be zero.
    pub fn align(&mut self, align: usize) -> Result<()> {
        let n = pad_needed(self.pos, align);
        let padding = self.take(n)?;
        if let Some(i) = padding.iter().position(|&b| b != 0) {
            return Err(ErrorKind::NonZeroPadding(self.pos - n + i).into());
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ErrorKind::Truncated {
                pos: self.pos,
                needed: n,
                available: self.remaining(),
            }
            .into());
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b = self.take_array::<2>()?;
        Ok(self.endian.read_u16(b))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take_array::<4>()?;
        Ok(self.endian.read_u32(b))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let b = self.take_array::<8>()?;
        Ok(self.endian.read_u64(b))
    }

    /// Read `len` bytes of text followed by a NUL.
    fn read_text(&mut self, len: usize) -> Result<&'a str> {
        let start = self.pos;
        let bytes = self.take(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| ErrorKind::InvalidUtf8(start))?;
        if self.read_u8()? != 0 || bytes.contains(&0) {
            return Err(ErrorKind::UnterminatedString(start).into());
        }
        Ok(text)
    }

    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        self.read_text(len)
    }

    pub fn read_signature(&mut self) -> Result<Signature> {
        let len = self.read_u8()? as usize;
        let text = self.read_text(len)?;
        Signature::new(text)
    }

    /// Read one value of the single complete type `sig`.
    pub fn read_one(&mut self, sig: &str) -> Result<Value> {
        let sig = Signature::single(sig)?;
        self.read_value(sig.as_str())
    }

    /// `sig` must already be a validated single complete type.
    fn read_value(&mut self, sig: &str) -> Result<Value> {
        let code = *sig.as_bytes().first().ok_or(ErrorKind::MalformedSignature {
            signature: String::new(),
            reason: "missing type",
        })?;

        Ok(match code {
            b'y' => Value::Byte(self.read_u8()?),
            b'b' => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(ErrorKind::MalformedBoolean(other).into()),
            },
            b'n' => Value::Int16(self.read_u16()? as i16),
            b'q' => Value::UInt16(self.read_u16()?),
            b'i' => Value::Int32(self.read_u32()? as i32),
            b'u' => Value::UInt32(self.read_u32()?),
            b'x' => Value::Int64(self.read_u64()? as i64),
            b't' => Value::UInt64(self.read_u64()?),
            b'd' => Value::Double(f64::from_bits(self.read_u64()?)),
            b's' => Value::String(self.read_str()?.to_owned()),
            b'o' => Value::ObjectPath(ObjectPath::new(self.read_str()?)?),
            b'g' => Value::Signature(self.read_signature()?),
            b'v' => self.read_variant()?,
            b'a' => self.read_array(&sig[1..])?,
            b'(' => {
                self.align(8)?;
                let inner = &sig[1..sig.len() - 1];
                let mut fields = Vec::new();
                let mut offset = 0;
                while offset < inner.len() {
                    let field = subsignature(inner, offset)?;
                    fields.push(self.read_value(field)?);
                    offset += field.len();
                }
                Value::Struct(fields)
            }
            b'{' => {
                self.align(8)?;
                let key = self.read_value(&sig[1..2])?;
                let value = self.read_value(&sig[2..sig.len() - 1])?;
                Value::DictEntry(Box::new((key, value)))
            }
            other => return Err(ErrorKind::UnknownType(other as char).into()),
        })
    }

    fn read_variant(&mut self) -> Result<Value> {
        let sig = self.read_signature()?;
        if !sig.is_single() {
            return Err(ErrorKind::MalformedSignature {
                signature: sig.as_str().into(),
                reason: "variant must hold a single complete type",
            }
            .into());
        }
        if self.variants >= MAX_TOTAL_DEPTH {
            return Err(ErrorKind::LengthExceeded {
                what: "Variant nesting",
                length: self.variants + 1,
                max: MAX_TOTAL_DEPTH,
            }
            .into());
        }
        self.variants += 1;
        let inner = self.read_value(sig.as_str());
        self.variants -= 1;
        Ok(Value::Variant(Box::new(inner?)))
    }

    fn read_array(&mut self, element: &str) -> Result<Value> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LENGTH {
            return Err(ErrorKind::LengthExceeded {
                what: "Array",
                length: len,
                max: MAX_ARRAY_LENGTH,
            }
            .into());
        }
        let first = *element.as_bytes().first().ok_or(ErrorKind::MalformedSignature {
            signature: "a".into(),
            reason: "array has no element type",
        })?;
        self.align(alignment(first)?)?;

        let start = self.pos;
        if self.remaining() < len {
            return Err(ErrorKind::Truncated {
                pos: start,
                needed: len,
                available: self.remaining(),
            }
            .into());
        }
        let end = start + len;

        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.read_value(element)?);
        }
        if self.pos != end {
            return Err(ErrorKind::LengthExceeded {
                what: "Array element data",
                length: self.pos - start,
                max: len,
            }
            .into());
        }

        Ok(Value::Array(Array::from_parts(
            Signature::from_validated(element.to_owned()),
            items,
        )))
    }
}
