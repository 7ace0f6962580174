//! Read-only state queries.
//!
//! Machines answer dotted paths (`clock`, `datasette.1.motor`,
//! `io.sources`) without touching emulation state.

use std::collections::BTreeMap;
use std::fmt;

/// Answer to a state query.
///
/// Integers keep their register width so they print the way a monitor
/// shows them: bytes and words in hex, cycle counts in decimal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    /// Cycle counts and file positions.
    U64(u64),
    String(String),
    Array(Vec<Value>),
    /// Named fields, kept in key order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// A map from `(key, value)` pairs.
    pub fn map<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    open: char,
    close: char,
    items: impl Iterator<Item = T>,
    mut each: impl FnMut(&mut fmt::Formatter<'_>, T) -> fmt::Result,
) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        each(f, item)?;
    }
    write!(f, "{close}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "${v:02X}"),
            Value::U16(v) => write!(f, "${v:04X}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Array(items) => write_list(f, '[', ']', items.iter(), |f, v| write!(f, "{v}")),
            Value::Map(fields) => {
                write_list(f, '{', '}', fields.iter(), |f, (k, v)| write!(f, "{k}: {v}"))
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    String => String,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

/// A component whose state can be inspected.
pub trait Observable {
    /// Value at `path`, or `None` for an unknown path.
    fn query(&self, path: &str) -> Option<Value>;

    /// Every path `query` answers. `{1,2}` and `<address>` mark
    /// parameterised segments.
    fn query_paths(&self) -> &'static [&'static str];
}
