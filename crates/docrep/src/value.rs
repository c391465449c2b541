use std::fmt;

use chrono::NaiveDateTime;

use crate::doc::Ann;

/// Half-open interval `[start, stop)`.
///
/// Over an annotation store the bounds are element indices; without a target
/// store they are byte offsets into external text. The wire form is the
/// two-element array `[start, stop - start]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Slice {
    pub start: u64,
    pub stop: u64,
}

impl Slice {
    pub fn new(start: u64, stop: u64) -> Slice {
        Slice { start, stop }
    }

    pub fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// A dynamically-typed field value.
///
/// Non-negative integers normalize to `UInt` and `Int` holds strictly
/// negative values, so values survive a serialization round trip unchanged.
/// `Raw` carries any other MessagePack value a plain scalar field may hold.
#[derive(Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    Slice(Slice),
    Ann(Ann),
    AnnList(Vec<Ann>),
    Raw(rmpv::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::UInt(n) if *n <= i64::MAX as u64 => Some(*n as i64),
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_span(&self) -> Option<Slice> {
        match self {
            Value::Slice(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_ann(&self) -> Option<&Ann> {
        match self {
            Value::Ann(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_anns(&self) -> Option<&[Ann]> {
        match self {
            Value::AnnList(a) => Some(a),
            _ => None,
        }
    }
}

// Pointer values print shallowly (the target's stamped index only), because
// annotation graphs are routinely cyclic.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({v:?})"),
            Value::UInt(v) => write!(f, "UInt({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({v:?})"),
            Value::DateTime(v) => write!(f, "DateTime({v})"),
            Value::Slice(v) => write!(f, "Slice({}..{})", v.start, v.stop),
            Value::Ann(a) => write!(f, "Ann(#{:?})", a.index()),
            Value::AnnList(anns) => {
                write!(f, "AnnList[")?;
                for (i, a) in anns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "#{:?}", a.index())?;
                }
                write!(f, "]")
            }
            Value::Raw(v) => write!(f, "Raw({v})"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::UInt(v as u64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Value {
        Value::UInt(v as u64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        if v >= 0 {
            Value::UInt(v as u64)
        } else {
            Value::Int(v)
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::from(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Value {
        Value::DateTime(v)
    }
}

impl From<Slice> for Value {
    fn from(v: Slice) -> Value {
        Value::Slice(v)
    }
}

impl From<Ann> for Value {
    fn from(v: Ann) -> Value {
        Value::Ann(v)
    }
}

impl From<Vec<Ann>> for Value {
    fn from(v: Vec<Ann>) -> Value {
        Value::AnnList(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            None => Value::Null,
            Some(v) => v.into(),
        }
    }
}

/// Parse an ISO-8601 datetime, leniently. Unparseable text is `None`, which
/// the decoder maps to a null field value.
pub(crate) fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(d.and_time(chrono::NaiveTime::MIN));
    }
    None
}

pub(crate) fn format_datetime(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}
