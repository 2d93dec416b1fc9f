//! Canonical entity model, live records and history records
//!
//! Every resource kind is reduced to the same shape before it reaches the
//! engine: an id, scalar fields, opaque blobs and named child collections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar field value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// One row of a child collection
///
/// `key` is the natural key (a label's key, a disk's device name) and is
/// absent for unkeyed value lists such as licenses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildRow {
    pub key: Option<String>,
    pub fields: BTreeMap<String, Value>,
}

impl ChildRow {
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn unkeyed() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&Value::Null)
    }
}

/// Normalized snapshot of one external resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// Stable external identifier
    pub id: String,

    pub scalars: BTreeMap<String, Value>,

    /// Schema-less payloads, compared as raw bytes
    pub opaque: BTreeMap<String, Vec<u8>>,

    /// Child collections by name, in upstream order
    pub children: BTreeMap<String, Vec<ChildRow>>,
}

impl CanonicalEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.scalars.insert(name.into(), value.into());
        self
    }

    pub fn with_opaque(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.opaque.insert(name.into(), bytes.into());
        self
    }

    pub fn with_children(mut self, name: impl Into<String>, rows: Vec<ChildRow>) -> Self {
        self.children.insert(name.into(), rows);
        self
    }

    /// Scalar value by name; absent fields read as `Null`
    pub fn scalar(&self, name: &str) -> &Value {
        self.scalars.get(name).unwrap_or(&Value::Null)
    }

    pub fn opaque(&self, name: &str) -> Option<&[u8]> {
        self.opaque.get(name).map(Vec::as_slice)
    }

    /// Child collection by name; absent collections read as empty
    pub fn collection(&self, name: &str) -> &[ChildRow] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Persisted current state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveRecord {
    pub entity: CanonicalEntity,

    pub scope_id: String,

    /// Last successful observation time
    pub collected_at: DateTime<Utc>,
}

/// Time-bounded snapshot of an entity's scalar and opaque fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub history_id: i64,
    pub entity_id: String,
    pub valid_from: DateTime<Utc>,

    /// `None` while this record is the current one
    pub valid_to: Option<DateTime<Utc>>,

    pub scalars: BTreeMap<String, Value>,
    pub opaque: BTreeMap<String, Vec<u8>>,
    pub scope_id: String,
    pub collected_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// Time-bounded snapshot of one child row, owned by a parent history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildHistoryRecord {
    pub id: i64,
    pub parent_history_id: i64,
    pub entity_id: String,
    pub collection: String,
    pub position: usize,
    pub row: ChildRow,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl ChildHistoryRecord {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

/// Raw object as listed by a collector, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    /// Stable id, extracted during listing
    pub id: String,

    pub payload: serde_json::Value,
}

impl RawObject {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}
