use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

/// A Rust type that can live in a diffable field.
///
/// `same` is the equality used for delta tracking. It compares by content,
/// so two byte buffers with identical bytes are the same value.
pub trait FieldType: Clone + Debug + Default + Send + 'static {
    const TYPE_NAME: &'static str;

    fn to_value(&self) -> FieldValue;

    fn from_value(value: &FieldValue) -> Option<Self>;

    fn same(&self, other: &Self) -> bool;

    /// Decode a field, treating an absent or null value as the type default.
    fn decode(field: &str, value: Option<&FieldValue>) -> Result<Self, CoreError> {
        match value {
            None | Some(FieldValue::Null) => Ok(Self::default()),
            Some(value) => Self::from_value(value).ok_or_else(|| CoreError::FieldType {
                field: field.to_string(),
                expected: Self::TYPE_NAME,
                found: value.type_name(),
            }),
        }
    }
}

impl FieldType for String {
    const TYPE_NAME: &'static str = "text";

    fn to_value(&self) -> FieldValue {
        FieldValue::Text(self.clone())
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_text().map(str::to_string)
    }

    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldType for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn to_value(&self) -> FieldValue {
        FieldValue::Integer(*self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_integer()
    }

    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldType for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn to_value(&self) -> FieldValue {
        FieldValue::Boolean(*self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_boolean()
    }

    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldType for f64 {
    const TYPE_NAME: &'static str = "float";

    fn to_value(&self) -> FieldValue {
        FieldValue::Float(*self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    fn same(&self, other: &Self) -> bool {
        self.total_cmp(other).is_eq()
    }
}

impl FieldType for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn to_value(&self) -> FieldValue {
        FieldValue::Bytes(self.clone())
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_bytes().map(<[u8]>::to_vec)
    }

    fn same(&self, other: &Self) -> bool {
        self.len() == other.len() && self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_compare_by_content() {
        let a = vec![1u8, 2, 3, 4, 5];
        let b = a.clone();
        assert!(a.same(&b));
        assert!(!a.same(&vec![1u8, 2, 3, 4]));
        assert_eq!(FieldValue::Bytes(a), FieldValue::Bytes(b));
    }

    #[test]
    fn nan_is_stable() {
        assert!(f64::NAN.same(&f64::NAN));
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
    }

    #[test]
    fn decode_defaults_missing_values() -> Result<(), CoreError> {
        assert_eq!(i64::decode("duration", None)?, 0);
        assert_eq!(String::decode("name", Some(&FieldValue::Null))?, "");
        assert_eq!(i64::decode("duration", Some(&FieldValue::Integer(90)))?, 90);
        Ok(())
    }

    #[test]
    fn decode_rejects_mismatched_type() {
        let err = bool::decode("is_exam", Some(&FieldValue::Text("yes".into()))).unwrap_err();
        assert!(matches!(
            err,
            CoreError::FieldType { expected: "boolean", found: "text", .. }
        ));
    }

    #[test]
    fn msgpack_round_trip() -> Result<(), CoreError> {
        let value = FieldValue::Text("Вариант 1".into());
        let bytes = value.to_msgpack()?;
        assert_eq!(FieldValue::from_msgpack(&bytes)?, value);
        Ok(())
    }
}
