//! Declarative resource-type descriptors
//!
//! A descriptor tells the engine everything it needs to know about one
//! resource kind: which scalar and opaque fields it has, which child
//! collections hang off it, and how each child row is keyed. Storage tables
//! and the JSON normalizer are both derived from it.

use crate::error::{LedgerError, Result};
use crate::model::{CanonicalEntity, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Column names owned by the storage layer
pub const RESERVED_NAMES: &[&str] = &[
    "id",
    "entity_id",
    "scope_id",
    "collected_at",
    "valid_from",
    "valid_to",
    "history_id",
    "parent_history_id",
    "position",
    "row_key",
];

/// Descriptor of one resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource name (e.g., "instance", "disk"), used in table names
    pub name: String,

    #[serde(default)]
    pub scalar_fields: Vec<FieldSpec>,

    #[serde(default)]
    pub opaque_fields: Vec<OpaqueSpec>,

    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

/// Type of a scalar column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Integer,
    Real,
    Boolean,
}

impl FieldKind {
    /// Whether a value can be stored in a column of this kind
    ///
    /// Non-finite reals are refused: they do not compare equal to themselves.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldKind::Real, Value::Float(f)) => f.is_finite(),
            (FieldKind::Text, Value::Text(_))
            | (FieldKind::Integer, Value::Int(_))
            | (FieldKind::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

/// A typed scalar field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(default)]
    pub kind: FieldKind,

    /// Dotted path into the raw payload; defaults to `name`
    #[serde(default)]
    pub source: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            source: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn source_path(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// A schema-less field stored and compared as raw bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueSpec {
    pub name: String,

    #[serde(default)]
    pub source: Option<String>,
}

impl OpaqueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn source_path(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// How rows of a child collection are keyed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKey {
    /// Unkeyed value list, compared as a multiset
    #[default]
    None,
    /// Payload is a JSON object; each member name is the row key
    MapKey,
    /// Payload is an array of objects keyed by the named child field
    Field(String),
}

/// A named child collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub key: ChildKey,

    pub fields: Vec<FieldSpec>,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>, key: ChildKey, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            source: None,
            key,
            fields,
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn source_path(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    pub fn is_keyed(&self) -> bool {
        self.key != ChildKey::None
    }
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scalar_fields: Vec::new(),
            opaque_fields: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_scalar(mut self, field: FieldSpec) -> Self {
        self.scalar_fields.push(field);
        self
    }

    pub fn with_opaque(mut self, field: OpaqueSpec) -> Self {
        self.opaque_fields.push(field);
        self
    }

    pub fn with_child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn child(&self, name: &str) -> Option<&ChildSpec> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn live_table(&self) -> String {
        format!("live_{}", self.name)
    }

    pub fn live_child_table(&self, child: &str) -> String {
        format!("live_{}_{}", self.name, child)
    }

    pub fn history_table(&self) -> String {
        format!("history_{}", self.name)
    }

    pub fn history_child_table(&self, child: &str) -> String {
        format!("history_{}_{}", self.name, child)
    }

    /// Check names so they can be used verbatim as SQL identifiers
    pub fn validate(&self) -> Result<()> {
        check_identifier("resource", &self.name)?;

        let mut columns = HashSet::new();
        let scalar_names = self.scalar_fields.iter().map(|f| f.name.as_str());
        let opaque_names = self.opaque_fields.iter().map(|f| f.name.as_str());
        for name in scalar_names.chain(opaque_names) {
            check_column(&self.name, name)?;
            if !columns.insert(name) {
                return Err(LedgerError::Descriptor(format!(
                    "{}: duplicate field '{}'",
                    self.name, name
                )));
            }
        }

        let mut child_names = HashSet::new();
        for child in &self.children {
            check_identifier("child collection", &child.name)?;
            if !child_names.insert(child.name.as_str()) {
                return Err(LedgerError::Descriptor(format!(
                    "{}: duplicate child collection '{}'",
                    self.name, child.name
                )));
            }
            if child.fields.is_empty() {
                return Err(LedgerError::Descriptor(format!(
                    "{}.{}: child collection declares no fields",
                    self.name, child.name
                )));
            }

            let mut fields = HashSet::new();
            for field in &child.fields {
                check_column(&child.name, &field.name)?;
                if !fields.insert(field.name.as_str()) {
                    return Err(LedgerError::Descriptor(format!(
                        "{}.{}: duplicate field '{}'",
                        self.name, child.name, field.name
                    )));
                }
            }

            if let ChildKey::Field(key) = &child.key {
                if !fields.contains(key.as_str()) {
                    return Err(LedgerError::Descriptor(format!(
                        "{}.{}: key field '{}' is not declared",
                        self.name, child.name, key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Fill in absent scalars with `Null` and absent collections with empty lists
    pub fn complete(&self, mut entity: CanonicalEntity) -> CanonicalEntity {
        for field in &self.scalar_fields {
            entity
                .scalars
                .entry(field.name.clone())
                .or_insert(Value::Null);
        }
        for child in &self.children {
            entity.children.entry(child.name.clone()).or_default();
        }
        entity
    }

    /// Reject entities carrying fields or collections this descriptor does not know
    pub fn check_entity(&self, entity: &CanonicalEntity) -> Result<()> {
        for (name, value) in &entity.scalars {
            let Some(field) = self.scalar_fields.iter().find(|f| &f.name == name) else {
                return Err(LedgerError::conversion(
                    &entity.id,
                    format!("unknown scalar field '{}' for {}", name, self.name),
                ));
            };
            check_kind(&entity.id, field, value)?;
        }
        if let Some(name) = entity
            .opaque
            .keys()
            .find(|n| !self.opaque_fields.iter().any(|f| &f.name == *n))
        {
            return Err(LedgerError::conversion(
                &entity.id,
                format!("unknown opaque field '{}' for {}", name, self.name),
            ));
        }
        for (name, rows) in &entity.children {
            let Some(spec) = self.child(name) else {
                return Err(LedgerError::conversion(
                    &entity.id,
                    format!("unknown child collection '{}' for {}", name, self.name),
                ));
            };
            for row in rows {
                if row.key.is_some() != spec.is_keyed() {
                    return Err(LedgerError::conversion(
                        &entity.id,
                        format!("{}: row keying does not match descriptor", name),
                    ));
                }
                for (field_name, value) in &row.fields {
                    let Some(field) = spec.fields.iter().find(|f| &f.name == field_name) else {
                        return Err(LedgerError::conversion(
                            &entity.id,
                            format!("{}: unknown field '{}'", name, field_name),
                        ));
                    };
                    check_kind(&entity.id, field, value)?;
                }
            }
        }
        Ok(())
    }
}

fn check_kind(entity_id: &str, field: &FieldSpec, value: &Value) -> Result<()> {
    if field.kind.accepts(value) {
        Ok(())
    } else {
        Err(LedgerError::conversion(
            entity_id,
            format!("field '{}' expects {:?}, got {}", field.name, field.kind, value),
        ))
    }
}

fn check_identifier(what: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 48
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::Descriptor(format!(
            "invalid {} name '{}' (expected [a-z][a-z0-9_]*)",
            what, name
        )))
    }
}

fn check_column(owner: &str, name: &str) -> Result<()> {
    check_identifier("field", name)?;
    if RESERVED_NAMES.contains(&name) {
        return Err(LedgerError::Descriptor(format!(
            "{}: field name '{}' is reserved",
            owner, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChildRow;

    fn labels() -> ChildSpec {
        ChildSpec::new("labels", ChildKey::MapKey, vec![FieldSpec::text("value")])
    }

    #[test]
    fn test_table_names() {
        let desc = ResourceDescriptor::new("instance").with_child(labels());
        assert_eq!(desc.live_table(), "live_instance");
        assert_eq!(desc.live_child_table("labels"), "live_instance_labels");
        assert_eq!(desc.history_table(), "history_instance");
        assert_eq!(desc.history_child_table("labels"), "history_instance_labels");
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let desc = ResourceDescriptor::new("instance")
            .with_scalar(FieldSpec::text("status"))
            .with_opaque(OpaqueSpec::new("metadata"))
            .with_child(labels())
            .with_child(ChildSpec::new(
                "disks",
                ChildKey::Field("device_name".into()),
                vec![FieldSpec::text("device_name")],
            ));
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_reserved_and_duplicates() {
        let reserved = ResourceDescriptor::new("instance").with_scalar(FieldSpec::text("valid_to"));
        assert!(matches!(reserved.validate(), Err(LedgerError::Descriptor(_))));

        let duplicate = ResourceDescriptor::new("instance")
            .with_scalar(FieldSpec::text("status"))
            .with_opaque(OpaqueSpec::new("status"));
        assert!(duplicate.validate().is_err());

        let bad_name = ResourceDescriptor::new("Instance; DROP TABLE x");
        assert!(bad_name.validate().is_err());

        let missing_key = ResourceDescriptor::new("instance").with_child(ChildSpec::new(
            "disks",
            ChildKey::Field("device_name".into()),
            vec![FieldSpec::text("source")],
        ));
        assert!(missing_key.validate().is_err());
    }

    #[test]
    fn test_check_entity() {
        let desc = ResourceDescriptor::new("instance")
            .with_scalar(FieldSpec::text("status"))
            .with_child(labels());

        let ok = CanonicalEntity::new("vm-1")
            .with_scalar("status", "RUNNING")
            .with_children(
                "labels",
                vec![ChildRow::keyed("env").with_field("value", "prod")],
            );
        assert!(desc.check_entity(&ok).is_ok());

        let unknown = CanonicalEntity::new("vm-1").with_scalar("color", "blue");
        assert!(desc.check_entity(&unknown).is_err());

        let unkeyed_label = CanonicalEntity::new("vm-1").with_children(
            "labels",
            vec![ChildRow::unkeyed().with_field("value", "prod")],
        );
        assert!(desc.check_entity(&unkeyed_label).is_err());

        let wrong_kind = CanonicalEntity::new("vm-1").with_scalar("status", 3i64);
        assert!(desc.check_entity(&wrong_kind).is_err());
    }

    #[test]
    fn test_real_kind_refuses_nan() {
        assert!(FieldKind::Real.accepts(&Value::Float(1.5)));
        assert!(FieldKind::Real.accepts(&Value::Null));
        assert!(!FieldKind::Real.accepts(&Value::Float(f64::NAN)));
        assert!(!FieldKind::Real.accepts(&Value::Float(f64::INFINITY)));
        assert!(!FieldKind::Integer.accepts(&Value::Float(1.0)));
    }

    #[test]
    fn test_descriptor_from_json() {
        let desc: ResourceDescriptor = serde_json::from_value(serde_json::json!({
            "name": "disk",
            "scalar_fields": [{"name": "size_gb", "kind": "integer", "source": "sizeGb"}],
            "children": [
                {"name": "labels", "key": "map_key", "fields": [{"name": "value"}]},
                {"name": "attachments", "key": {"field": "device"}, "fields": [{"name": "device"}]}
            ]
        }))
        .unwrap();

        assert_eq!(desc.scalar_fields[0].kind, FieldKind::Integer);
        assert_eq!(desc.scalar_fields[0].source_path(), "sizeGb");
        assert_eq!(desc.children[0].key, ChildKey::MapKey);
        assert_eq!(desc.children[1].key, ChildKey::Field("device".into()));
        assert!(desc.validate().is_ok());
    }
}
