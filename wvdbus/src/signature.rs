//! Type signatures: the D-Bus type-code grammar.
//!
//! A signature is a string of type codes. Basic codes are single characters;
//! `a` prefixes an element type, `(...)` encloses a struct and `{kv}` a dict
//! entry, which may only appear as an array element.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{MAX_ARRAY_DEPTH, MAX_SIGNATURE_LENGTH, MAX_STRUCT_DEPTH};

/// True for the codes that may be used as dict keys.
pub fn is_basic(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
    )
}

fn malformed(sig: &[u8], reason: &'static str) -> Error {
    Error::new(ErrorKind::MalformedSignature {
        signature: String::from_utf8_lossy(sig).into_owned(),
        reason,
    })
}

/// Parse one complete type starting at `pos`; returns the offset just past it.
fn parse_single(sig: &[u8], pos: usize, arrays: usize, structs: usize) -> Result<usize> {
    let Some(&code) = sig.get(pos) else {
        return Err(malformed(sig, "missing type"));
    };

    match code {
        c if is_basic(c) || c == b'v' => Ok(pos + 1),
        b'a' => {
            if arrays + 1 > MAX_ARRAY_DEPTH {
                return Err(malformed(sig, "arrays nested too deeply"));
            }
            match sig.get(pos + 1) {
                None => Err(malformed(sig, "array has no element type")),
                Some(b'{') => parse_dict_entry(sig, pos + 1, arrays + 1, structs),
                Some(_) => parse_single(sig, pos + 1, arrays + 1, structs),
            }
        }
        b'(' => {
            if structs + 1 > MAX_STRUCT_DEPTH {
                return Err(malformed(sig, "structs nested too deeply"));
            }
            let mut p = pos + 1;
            if sig.get(p) == Some(&b')') {
                return Err(malformed(sig, "empty struct"));
            }
            loop {
                match sig.get(p) {
                    None => return Err(malformed(sig, "missing ')'")),
                    Some(b')') => return Ok(p + 1),
                    Some(_) => p = parse_single(sig, p, arrays, structs + 1)?,
                }
            }
        }
        b'{' => Err(malformed(sig, "dict entry outside of an array")),
        b')' => Err(malformed(sig, "unbalanced ')'")),
        b'}' => Err(malformed(sig, "unbalanced '}'")),
        _ => Err(malformed(sig, "unknown type code")),
    }
}

fn parse_dict_entry(sig: &[u8], pos: usize, arrays: usize, structs: usize) -> Result<usize> {
    if structs + 1 > MAX_STRUCT_DEPTH {
        return Err(malformed(sig, "structs nested too deeply"));
    }
    match sig.get(pos + 1) {
        Some(&k) if is_basic(k) => {}
        Some(b'}') | None => return Err(malformed(sig, "dict entry needs two types")),
        Some(_) => return Err(malformed(sig, "dict key must be a basic type")),
    }
    if sig.get(pos + 2) == Some(&b'}') {
        return Err(malformed(sig, "dict entry needs two types"));
    }
    let end = parse_single(sig, pos + 2, arrays, structs + 1)?;
    match sig.get(end) {
        Some(b'}') => Ok(end + 1),
        None => Err(malformed(sig, "missing '}'")),
        Some(_) => Err(malformed(sig, "dict entry has more than two types")),
    }
}

/// Validate a (possibly empty) sequence of complete types.
pub fn validate(sig: &str) -> Result<()> {
    let bytes = sig.as_bytes();
    if bytes.len() > MAX_SIGNATURE_LENGTH {
        return Err(Error::new(ErrorKind::LengthExceeded {
            what: "Signature",
            length: bytes.len(),
            max: MAX_SIGNATURE_LENGTH,
        }));
    }
    let mut pos = 0;
    while pos < bytes.len() {
        pos = parse_single(bytes, pos, 0, 0)?;
    }
    Ok(())
}

/// The single complete type starting at `offset` in `sig`.
///
/// An array token includes its element type; a struct or dict entry token
/// runs up to its matching close bracket.
pub fn subsignature(sig: &str, offset: usize) -> Result<&str> {
    let end = parse_single(sig.as_bytes(), offset, 0, 0)?;
    Ok(&sig[offset..end])
}

/// A validated type signature.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn new<S: Into<String>>(sig: S) -> Result<Self> {
        let sig = sig.into();
        validate(&sig)?;
        Ok(Signature(sig))
    }

    /// A signature holding exactly one complete type.
    pub fn single<S: Into<String>>(sig: S) -> Result<Self> {
        let sig = Signature::new(sig)?;
        if !sig.is_single() {
            return Err(malformed(
                sig.0.as_bytes(),
                "expected exactly one complete type",
            ));
        }
        Ok(sig)
    }

    /// An array element type: one complete type or a dict entry.
    pub fn element<S: Into<String>>(sig: S) -> Result<Self> {
        let sig = sig.into();
        Signature::single(format!("a{}", sig))?;
        Ok(Signature(sig))
    }

    /// Trusts the caller that `sig` has been validated.
    pub(crate) fn from_validated(sig: String) -> Self {
        Signature(sig)
    }

    pub fn empty() -> Self {
        Signature(String::new())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_single(&self) -> bool {
        let mut it = self.iter();
        it.next().is_some() && it.next().is_none()
    }

    /// Iterate over the complete types in this signature.
    pub fn iter(&self) -> SignatureIter<'_> {
        SignatureIter {
            sig: &self.0,
            pos: 0,
        }
    }
}

pub struct SignatureIter<'a> {
    sig: &'a str,
    pos: usize,
}

impl<'a> Iterator for SignatureIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.pos >= self.sig.len() {
            return None;
        }
        let sub = subsignature(self.sig, self.pos).ok()?;
        self.pos += sub.len();
        Some(sub)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Signature({:?})", self.0)
    }
}

impl AsRef<str> for Signature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Signature::new(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Signature::new(s)
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(sig: &str) -> &'static str {
        match validate(sig).unwrap_err().into_kind() {
            ErrorKind::MalformedSignature { reason, .. } => reason,
            kind => panic!("unexpected error {:?}", kind),
        }
    }

    #[test]
    fn accepts_well_formed() {
        for sig in [
            "",
            "y",
            "yisaxaxva(s)",
            "a{sv}",
            "a{s(ia{ov})}",
            "(ii(s(d)))",
            "aai",
            "a(yv)",
        ] {
            assert!(validate(sig).is_ok(), "{}", sig);
        }
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(reason("(ii"), "missing ')'");
        assert_eq!(reason("ii)"), "unbalanced ')'");
        assert_eq!(reason("a{si"), "missing '}'");
        assert_eq!(reason("{si}"), "dict entry outside of an array");
        assert_eq!(reason("a{vs}"), "dict key must be a basic type");
        assert_eq!(reason("a{sss}"), "dict entry has more than two types");
        assert_eq!(reason("a{s}"), "dict entry needs two types");
        assert_eq!(reason("a"), "array has no element type");
        assert_eq!(reason("()"), "empty struct");
        assert_eq!(reason("iz"), "unknown type code");
    }

    #[test]
    fn depth_limits() {
        let arrays_ok = format!("{}y", "a".repeat(MAX_ARRAY_DEPTH));
        assert!(validate(&arrays_ok).is_ok());
        let arrays_bad = format!("{}y", "a".repeat(MAX_ARRAY_DEPTH + 1));
        assert_eq!(reason(&arrays_bad), "arrays nested too deeply");

        let structs_ok = format!(
            "{}y{}",
            "(".repeat(MAX_STRUCT_DEPTH),
            ")".repeat(MAX_STRUCT_DEPTH)
        );
        assert!(validate(&structs_ok).is_ok());
        let structs_bad = format!(
            "{}y{}",
            "(".repeat(MAX_STRUCT_DEPTH + 1),
            ")".repeat(MAX_STRUCT_DEPTH + 1)
        );
        assert_eq!(reason(&structs_bad), "structs nested too deeply");
    }

    #[test]
    fn signature_too_long() {
        let long = "y".repeat(MAX_SIGNATURE_LENGTH + 1);
        assert!(matches!(
            validate(&long).unwrap_err().kind(),
            ErrorKind::LengthExceeded { .. }
        ));
    }

    #[test]
    fn subsignatures() {
        let sig = "ia(si)a{sv}(y(d))v";
        assert_eq!(subsignature(sig, 0).unwrap(), "i");
        assert_eq!(subsignature(sig, 1).unwrap(), "a(si)");
        assert_eq!(subsignature(sig, 2).unwrap(), "(si)");
        assert_eq!(subsignature(sig, 6).unwrap(), "a{sv}");
        assert_eq!(subsignature(sig, 11).unwrap(), "(y(d))");

        let parsed = Signature::new(sig).unwrap();
        let parts: Vec<&str> = parsed.iter().collect();
        assert_eq!(parts, vec!["i", "a(si)", "a{sv}", "(y(d))", "v"]);
        assert!(!parsed.is_single());
        assert!(Signature::single("a{sv}").is_ok());
        assert!(Signature::single("ii").is_err());
        assert!(Signature::single("").is_err());

        assert_eq!(Signature::element("{sv}").unwrap().as_str(), "{sv}");
        assert!(Signature::element("{vs}").is_err());
        assert!(Signature::element("s{").is_err());
    }
}
