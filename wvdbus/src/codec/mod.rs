//! The binary codec.
//!
//! [`Writer`] appends the wire encoding of [`Value`]s to a buffer and
//! [`Reader`] decodes a buffer back into values, both driven by type
//! signatures and honoring the per-type alignment rules:
//!
//! | types             | alignment |
//! |-------------------|-----------|
//! | `y` `g` `v`       | 1         |
//! | `n` `q`           | 2         |
//! | `b` `i` `u` `s` `o` `a` | 4   |
//! | `x` `t` `d` `(` `{`     | 8   |
//!
//! # Example
//!
//! ```
//! use wvdbus::codec::{Reader, Writer};
//! use wvdbus::{Endian, Signature, Value};
//!
//! let values = vec![Value::from("SELECT 1"), Value::from(42u32)];
//! let mut w = Writer::new(Endian::Little);
//! for v in &values {
//!     w.write_value(v).unwrap();
//! }
//! let bytes = w.into_bytes();
//!
//! let sig = Signature::new("su").unwrap();
//! let decoded = Reader::new(&bytes, Endian::Little).read(&sig).unwrap();
//! assert_eq!(decoded, values);
//! ```
//!
//! [`Value`]: crate::Value

mod reader;
mod writer;

pub use self::reader::Reader;
pub use self::writer::Writer;

/// Encode `values` into a fresh buffer.
pub fn encode(values: &[crate::Value], endian: crate::Endian) -> crate::Result<Vec<u8>> {
    let mut w = Writer::new(endian);
    for v in values {
        w.write_value(v)?;
    }
    Ok(w.into_bytes())
}

/// Decode `data` as `sig`, requiring every byte to be consumed.
pub fn decode(
    data: &[u8],
    sig: &crate::Signature,
    endian: crate::Endian,
) -> crate::Result<Vec<crate::Value>> {
    let mut r = Reader::new(data, endian);
    let values = r.read(sig)?;
    if r.remaining() != 0 {
        return Err(crate::ErrorKind::InvalidHeader(format!(
            "{} trailing bytes after '{}'",
            r.remaining(),
            sig
        ))
        .into());
    }
    Ok(values)
}
