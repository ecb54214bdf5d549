//! Typed key/value payload carried by every [`Command`](super::Command).
//!
//! Keys are unique strings. Values are one of a small set of types; asking
//! for a key with the wrong type yields [`PayloadError::TypeMismatch`]
//! instead of silently converting.
use bytes::Bytes;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Discriminant of a [`Value`], used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    #[strum(serialize = "uint")]
    UInt,
    Text,
    Bytes,
    Duration,
    Instant,
}

/// A single payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Bytes),
    Duration(Duration),
    Instant(Instant),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::UInt(_) => ValueKind::UInt,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Duration(_) => ValueKind::Duration,
            Value::Instant(_) => ValueKind::Instant,
        }
    }
}

/// Failed payload lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload key `{0}` not found")]
    KeyNotFound(String),
    #[error("payload key `{key}` holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        found: ValueKind,
    },
}

/// Rust types that can be stored in and read back from a [`Payload`].
pub trait PayloadValue: Sized {
    const KIND: ValueKind;

    fn into_value(self) -> Value;

    /// Returns `None` when the stored value has another type (or does not fit).
    fn from_value(value: &Value) -> Option<Self>;
}

impl PayloadValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

// Signed types are stored as `Int`, unsigned ones as `UInt`; either reads
// back into any integer type it fits.
macro_rules! int_payload_value {
    ($variant:ident => $($ty:ty),*) => {
        $(
            impl PayloadValue for $ty {
                const KIND: ValueKind = ValueKind::$variant;

                fn into_value(self) -> Value {
                    Value::$variant(self.into())
                }

                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::Int(v) => <$ty>::try_from(*v).ok(),
                        Value::UInt(v) => <$ty>::try_from(*v).ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

int_payload_value!(Int => i32, i64);
int_payload_value!(UInt => u32, u64);

impl PayloadValue for String {
    const KIND: ValueKind = ValueKind::Text;

    fn into_value(self) -> Value {
        Value::Text(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl PayloadValue for Bytes {
    const KIND: ValueKind = ValueKind::Bytes;

    fn into_value(self) -> Value {
        Value::Bytes(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl PayloadValue for Duration {
    const KIND: ValueKind = ValueKind::Duration;

    fn into_value(self) -> Value {
        Value::Duration(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Duration(v) => Some(*v),
            _ => None,
        }
    }
}

impl PayloadValue for Instant {
    const KIND: ValueKind = ValueKind::Instant;

    fn into_value(self) -> Value {
        Value::Instant(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Instant(v) => Some(*v),
            _ => None,
        }
    }
}

/// String-keyed map of typed values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    entries: HashMap<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`.
    pub fn insert<T: PayloadValue>(&mut self, key: &str, value: T) {
        self.entries.insert(key.to_string(), value.into_value());
    }

    /// Typed lookup of a key that must be present.
    pub fn get<T: PayloadValue>(&self, key: &str) -> Result<T, PayloadError> {
        match self.find(key)? {
            Some(value) => Ok(value),
            None => Err(PayloadError::KeyNotFound(key.to_string())),
        }
    }

    /// Typed lookup of an optional key: absent keys give `Ok(None)`, a value
    /// of another type is still an error.
    pub fn find<T: PayloadValue>(&self, key: &str) -> Result<Option<T>, PayloadError> {
        let Some(value) = self.entries.get(key) else {
            return Ok(None);
        };
        T::from_value(value)
            .map(Some)
            .ok_or_else(|| PayloadError::TypeMismatch {
                key: key.to_string(),
                expected: T::KIND,
                found: value.kind(),
            })
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Copy every entry of `other` into `self`, overwriting on collision.
    pub fn merge(&mut self, other: &Payload) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_errors() {
        let mut payload = Payload::new();
        payload.insert("errno", -5i32);

        assert_eq!(payload.get::<i32>("errno"), Ok(-5));
        assert_eq!(
            payload.get::<i32>("missing"),
            Err(PayloadError::KeyNotFound("missing".to_string()))
        );
        assert_eq!(
            payload.get::<String>("errno"),
            Err(PayloadError::TypeMismatch {
                key: "errno".to_string(),
                expected: ValueKind::Text,
                found: ValueKind::Int,
            })
        );
        assert_eq!(payload.find::<bool>("missing"), Ok(None));
        assert!(payload.find::<bool>("errno").is_err());
    }

    #[test]
    fn test_integer_width_is_checked() {
        let mut payload = Payload::new();
        payload.insert("big", u64::MAX >> 1);
        assert!(payload.get::<i64>("big").is_ok());
        assert!(payload.get::<u32>("big").is_err());
    }

    #[test]
    fn test_full_range_unsigned_survives_merge() {
        let mut source = Payload::new();
        source.insert("generation", u64::MAX);
        source.insert("offset", -1i64);

        let mut target = Payload::new();
        target.merge(&source);
        assert_eq!(target.get::<u64>("generation"), Ok(u64::MAX));
        assert_eq!(target.get::<i64>("offset"), Ok(-1));
        assert_eq!(
            target.get::<i64>("generation"),
            Err(PayloadError::TypeMismatch {
                key: "generation".to_string(),
                expected: ValueKind::Int,
                found: ValueKind::UInt,
            })
        );
        assert!(target.get::<u64>("offset").is_err());
    }

    #[test]
    fn test_merge_overwrites_and_keeps_values() {
        let mut a = Payload::new();
        a.insert("receive_data", Bytes::from_static(b"hello"));
        a.insert("errno", 0i32);

        let mut b = Payload::new();
        b.insert("errno", -110i32);
        b.insert("caller_context", "inverter-1".to_string());

        b.merge(&a);
        assert_eq!(
            b.get::<Bytes>("receive_data").unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(b.get::<i32>("errno").unwrap(), 0);
        assert_eq!(b.get::<String>("caller_context").unwrap(), "inverter-1");
        assert_eq!(b.len(), 3);
    }
}
