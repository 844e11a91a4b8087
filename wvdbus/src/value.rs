//! The value model: one closed enum covering every D-Bus type.

use std::fmt;

use crate::error::{Error, ErrorKind, Result};
use crate::signature::{is_basic, Signature};

/// A validated object path such as `/org/freedesktop/DBus`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new<S: Into<String>>(path: S) -> Result<Self> {
        let path = path.into();
        if !Self::is_valid(&path) {
            return Err(ErrorKind::InvalidObjectPath(path).into());
        }
        Ok(ObjectPath(path))
    }

    pub fn root() -> Self {
        ObjectPath("/".into())
    }

    pub fn is_valid(path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };
        if rest.is_empty() {
            return true;
        }
        rest.split('/').all(|element| {
            !element.is_empty()
                && element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        ObjectPath::new(s)
    }
}

/// An array: homogeneous items plus the element signature, which keeps
/// empty arrays encodable.
#[derive(Clone, PartialEq, Debug)]
pub struct Array {
    element: Signature,
    items: Vec<Value>,
}

impl Array {
    /// An empty array of `element`, which must be one complete type or a
    /// dict entry, within the nesting limits.
    pub fn new(element: Signature) -> Result<Self> {
        let element = Signature::element(element.as_str())?;
        Ok(Array {
            element,
            items: Vec::new(),
        })
    }

    /// Build an array, checking that every item has the element type.
    pub fn from_values(element: Signature, items: Vec<Value>) -> Result<Self> {
        let mut array = Array::new(element)?;
        for item in items {
            array.push(item)?;
        }
        Ok(array)
    }

    pub fn push(&mut self, item: Value) -> Result<()> {
        let got = item.signature();
        if got != self.element {
            return Err(ErrorKind::TypeMismatch {
                expected: self.element.as_str().into(),
                got: got.as_str().into(),
            }
            .into());
        }
        self.items.push(item);
        Ok(())
    }

    pub fn element_signature(&self) -> &Signature {
        &self.element
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    /// Build an array without re-checking item types.
    pub(crate) fn from_parts(element: Signature, items: Vec<Value>) -> Self {
        Array { element, items }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Variant(Box<Value>),
    Array(Array),
    Struct(Vec<Value>),
    DictEntry(Box<(Value, Value)>),
}

impl Value {
    /// The full type signature of this value.
    pub fn signature(&self) -> Signature {
        let mut s = String::new();
        self.push_signature(&mut s);
        Signature::from_validated(s)
    }

    fn push_signature(&self, out: &mut String) {
        match self {
            Value::Byte(_) => out.push('y'),
            Value::Bool(_) => out.push('b'),
            Value::Int16(_) => out.push('n'),
            Value::UInt16(_) => out.push('q'),
            Value::Int32(_) => out.push('i'),
            Value::UInt32(_) => out.push('u'),
            Value::Int64(_) => out.push('x'),
            Value::UInt64(_) => out.push('t'),
            Value::Double(_) => out.push('d'),
            Value::String(_) => out.push('s'),
            Value::ObjectPath(_) => out.push('o'),
            Value::Signature(_) => out.push('g'),
            Value::Variant(_) => out.push('v'),
            Value::Array(a) => {
                out.push('a');
                out.push_str(a.element.as_str());
            }
            Value::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.push_signature(out);
                }
                out.push(')');
            }
            Value::DictEntry(kv) => {
                out.push('{');
                kv.0.push_signature(out);
                kv.1.push_signature(out);
                out.push('}');
            }
        }
    }

    pub fn variant<V: Into<Value>>(v: V) -> Value {
        Value::Variant(Box::new(v.into()))
    }

    /// An array of dict entries, i.e. a D-Bus map `a{kv}`.
    pub fn dict<I>(key: &str, value: &str, pairs: I) -> Result<Value>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        if key.len() != 1 || !is_basic(key.as_bytes()[0]) {
            return Err(ErrorKind::MalformedSignature {
                signature: format!("a{{{}{}}}", key, value),
                reason: "dict key must be a basic type",
            }
            .into());
        }
        let element = Signature::element(format!("{{{}{}}}", key, value))?;
        let items = pairs
            .into_iter()
            .map(|(k, v)| Value::DictEntry(Box::new((k, v))))
            .collect();
        Ok(Value::Array(Array::from_values(element, items)?))
    }

    /// An array whose element type is taken from `element`.
    pub fn array<I>(element: &str, items: I) -> Result<Value>
    where
        I: IntoIterator<Item = Value>,
    {
        Ok(Value::Array(Array::from_values(
            Signature::element(element)?,
            items.into_iter().collect(),
        )?))
    }

    pub fn as_byte(&self) -> Option<u8> {
        match *self {
            Value::Byte(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::UInt32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::UInt64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    /// The text of a string, object path or signature.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Value> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict_entry(&self) -> Option<(&Value, &Value)> {
        match self {
            Value::DictEntry(kv) => Some((&kv.0, &kv.1)),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &str) -> Error {
        ErrorKind::TypeMismatch {
            expected: expected.into(),
            got: self.signature().as_str().into(),
        }
        .into()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::ObjectPath(v) => f.write_str(v.as_str()),
            Value::Signature(v) => f.write_str(v.as_str()),
            Value::Variant(v) => write!(f, "<{}>", v),
            Value::Array(a) => {
                f.write_str("[")?;
                for (i, item) in a.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Struct(fields) => {
                f.write_str("(")?;
                for (i, item) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Value::DictEntry(kv) => write!(f, "{}: {}", kv.0, kv.1),
        }
    }
}

macro_rules! impl_value_conversions {
    ($($ty:ty => $variant:ident, $code:literal;)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(v: Value) -> Result<Self> {
                    match v {
                        Value::$variant(inner) => Ok(inner),
                        other => Err(other.mismatch($code)),
                    }
                }
            }
        )*
    };
}

impl_value_conversions! {
    u8 => Byte, "y";
    bool => Bool, "b";
    i16 => Int16, "n";
    u16 => UInt16, "q";
    i32 => Int32, "i";
    u32 => UInt32, "u";
    i64 => Int64, "x";
    u64 => UInt64, "t";
    f64 => Double, "d";
    String => String, "s";
    ObjectPath => ObjectPath, "o";
    Signature => Signature, "g";
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl TryFrom<Value> for Array {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Array(inner) => Ok(inner),
            other => Err(other.mismatch("a")),
        }
    }
}
