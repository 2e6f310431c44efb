use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::field_value::{FieldType, FieldValue};
use crate::ids::RecordId;

/// Wire shape of a record.
///
/// The same message carries a full record when loading and a sparse patch
/// when saving. In a patch only changed fields and changed children are
/// present. For an ordered element that moved, `position` is the position
/// the server currently holds and `swap_position` is the new one; a
/// `swap_position` of [`ABSENT_POSITION`](crate::set::ABSENT_POSITION)
/// removes the element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<RecordMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl RecordMessage {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_child(mut self, set: &str, child: RecordMessage) -> Self {
        self.push_child(set, child);
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn set_field(&mut self, key: &str, value: FieldValue) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn push_child(&mut self, set: &str, child: RecordMessage) {
        self.children.entry(set.to_string()).or_default().push(child);
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Decode a typed field; absent fields take the type default.
    pub fn decode_field<T: FieldType>(&self, key: &str) -> Result<T, CoreError> {
        T::decode(key, self.fields.get(key))
    }

    pub fn children(&self, set: &str) -> &[RecordMessage] {
        self.children.get(set).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when the message carries nothing beyond the id.
    pub fn is_bare(&self) -> bool {
        self.fields.is_empty()
            && self.children.is_empty()
            && self.position.is_none()
            && self.swap_position.is_none()
            && self.deleted.is_none()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
