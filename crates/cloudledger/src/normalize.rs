//! Descriptor-driven JSON normalizer
//!
//! Maps a raw JSON payload onto the canonical entity shape using the field
//! paths and kinds a [`ResourceDescriptor`] declares.

use crate::descriptor::{ChildKey, ChildSpec, FieldKind, FieldSpec, ResourceDescriptor};
use crate::error::{LedgerError, Result};
use crate::model::{CanonicalEntity, ChildRow, RawObject, Value};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maps raw objects into canonical entities
pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &RawObject) -> Result<CanonicalEntity>;
}

/// Resolve a dotted path (e.g., "scheduling.preemptible") inside a payload
pub fn lookup<'a>(payload: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(payload, |value, segment| value.get(segment))
}

/// Normalizer driven entirely by a resource descriptor
#[derive(Debug, Clone)]
pub struct JsonNormalizer {
    descriptor: Arc<ResourceDescriptor>,
}

impl JsonNormalizer {
    pub fn new(descriptor: Arc<ResourceDescriptor>) -> Self {
        Self { descriptor }
    }
}

impl Normalizer for JsonNormalizer {
    fn normalize(&self, raw: &RawObject) -> Result<CanonicalEntity> {
        let payload = &raw.payload;
        if !payload.is_object() {
            return Err(LedgerError::conversion(&raw.id, "payload is not a JSON object"));
        }

        let mut entity = CanonicalEntity::new(raw.id.clone());

        for field in &self.descriptor.scalar_fields {
            let value = convert(&raw.id, field, lookup(payload, field.source_path()))?;
            entity.scalars.insert(field.name.clone(), value);
        }

        // serde_json maps are sorted, so identical documents serialize identically.
        for field in &self.descriptor.opaque_fields {
            match lookup(payload, field.source_path()) {
                None | Some(Json::Null) => {}
                Some(value) => {
                    entity
                        .opaque
                        .insert(field.name.clone(), serde_json::to_vec(value)?);
                }
            }
        }

        for child in &self.descriptor.children {
            let rows = child_rows(&raw.id, child, lookup(payload, child.source_path()))?;
            entity.children.insert(child.name.clone(), rows);
        }

        Ok(entity)
    }
}

fn child_rows(entity_id: &str, spec: &ChildSpec, value: Option<&Json>) -> Result<Vec<ChildRow>> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };

    match &spec.key {
        ChildKey::MapKey => {
            let members = value.as_object().ok_or_else(|| {
                LedgerError::conversion(entity_id, format!("{}: expected an object", spec.name))
            })?;
            members
                .iter()
                .map(|(key, item)| {
                    Ok(ChildRow {
                        key: Some(key.clone()),
                        fields: row_fields(entity_id, spec, item)?,
                    })
                })
                .collect()
        }
        ChildKey::Field(key_field) => expect_array(entity_id, spec, value)?
            .iter()
            .map(|item| {
                let fields = row_fields(entity_id, spec, item)?;
                let key = match fields.get(key_field) {
                    None | Some(Value::Null) => {
                        return Err(LedgerError::conversion(
                            entity_id,
                            format!("{}: row without natural key '{}'", spec.name, key_field),
                        ));
                    }
                    Some(v) => v.to_string(),
                };
                Ok(ChildRow {
                    key: Some(key),
                    fields,
                })
            })
            .collect(),
        ChildKey::None => expect_array(entity_id, spec, value)?
            .iter()
            .map(|item| {
                Ok(ChildRow {
                    key: None,
                    fields: row_fields(entity_id, spec, item)?,
                })
            })
            .collect(),
    }
}

fn expect_array<'a>(entity_id: &str, spec: &ChildSpec, value: &'a Json) -> Result<&'a Vec<Json>> {
    value.as_array().ok_or_else(|| {
        LedgerError::conversion(entity_id, format!("{}: expected an array", spec.name))
    })
}

fn row_fields(entity_id: &str, spec: &ChildSpec, item: &Json) -> Result<BTreeMap<String, Value>> {
    let mut fields = BTreeMap::new();
    if item.is_object() {
        for field in &spec.fields {
            let value = convert(entity_id, field, lookup(item, field.source_path()))?;
            fields.insert(field.name.clone(), value);
        }
    } else if let [field] = spec.fields.as_slice() {
        fields.insert(field.name.clone(), convert(entity_id, field, Some(item))?);
    } else {
        return Err(LedgerError::conversion(
            entity_id,
            format!(
                "{}: scalar element but {} fields declared",
                spec.name,
                spec.fields.len()
            ),
        ));
    }
    Ok(fields)
}

fn convert(entity_id: &str, field: &FieldSpec, value: Option<&Json>) -> Result<Value> {
    let Some(value) = value else {
        return Ok(Value::Null);
    };

    let converted = match (field.kind, value) {
        (_, Json::Null) => Some(Value::Null),
        (FieldKind::Text, Json::String(s)) => Some(Value::Text(s.clone())),
        (FieldKind::Text, Json::Number(n)) => Some(Value::Text(n.to_string())),
        (FieldKind::Text, Json::Bool(b)) => Some(Value::Text(b.to_string())),
        (FieldKind::Integer, Json::Number(n)) => n.as_i64().map(Value::Int),
        // int64 values commonly travel as JSON strings
        (FieldKind::Integer, Json::String(s)) => s.parse().ok().map(Value::Int),
        // NaN never equals itself and would rotate history on every pass
        (FieldKind::Real, Json::Number(n)) => {
            n.as_f64().filter(|f| f.is_finite()).map(Value::Float)
        }
        (FieldKind::Real, Json::String(s)) => s
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::Float),
        (FieldKind::Boolean, Json::Bool(b)) => Some(Value::Bool(*b)),
        (FieldKind::Boolean, Json::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    };

    converted.ok_or_else(|| {
        LedgerError::conversion(
            entity_id,
            format!("field '{}': cannot read {} as {:?}", field.name, value, field.kind),
        )
    })
}
