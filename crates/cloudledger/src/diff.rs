//! Diff engine
//!
//! Compares the previously persisted state of an entity with a freshly
//! normalized snapshot. Pure and deterministic: no I/O, no clock.

use crate::model::{CanonicalEntity, ChildRow, Value};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Result of comparing two snapshots of the same entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    /// No previous state existed
    pub is_new: bool,

    /// A scalar or opaque field changed
    pub top_level_changed: bool,

    /// Per child collection: whether its content changed
    pub child_changed: BTreeMap<String, bool>,
}

impl Diff {
    pub fn has_any_change(&self) -> bool {
        self.is_new || self.top_level_changed || self.child_changed.values().any(|c| *c)
    }

    /// Names of the collections flagged as changed
    pub fn changed_collections(&self) -> impl Iterator<Item = &str> {
        self.child_changed
            .iter()
            .filter(|(_, changed)| **changed)
            .map(|(name, _)| name.as_str())
    }

    pub fn collection_changed(&self, name: &str) -> bool {
        self.child_changed.get(name).copied().unwrap_or(false)
    }
}

/// Compare a previous snapshot (if any) with a new one
pub fn compare(old: Option<&CanonicalEntity>, new: &CanonicalEntity) -> Diff {
    let Some(old) = old else {
        return Diff {
            is_new: true,
            top_level_changed: false,
            child_changed: new.children.keys().map(|n| (n.clone(), true)).collect(),
        };
    };

    let names: BTreeSet<&String> = old.children.keys().chain(new.children.keys()).collect();
    let child_changed = names
        .into_iter()
        .map(|name| {
            let changed = collection_differs(old.collection(name), new.collection(name));
            (name.clone(), changed)
        })
        .collect();

    Diff {
        is_new: false,
        top_level_changed: scalars_differ(old, new) || opaque_differ(old, new),
        child_changed,
    }
}

fn scalars_differ(old: &CanonicalEntity, new: &CanonicalEntity) -> bool {
    old.scalars
        .keys()
        .chain(new.scalars.keys())
        .any(|name| old.scalar(name) != new.scalar(name))
}

// Raw byte comparison; payloads are never interpreted.
fn opaque_differ(old: &CanonicalEntity, new: &CanonicalEntity) -> bool {
    old.opaque
        .keys()
        .chain(new.opaque.keys())
        .any(|name| old.opaque(name) != new.opaque(name))
}

fn collection_differs(old: &[ChildRow], new: &[ChildRow]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    if old.is_empty() {
        return false;
    }

    let keyed = old.iter().chain(new).all(|row| row.key.is_some());
    if keyed {
        if let (Some(old_map), Some(new_map)) = (index_by_key(old), index_by_key(new)) {
            return old_map
                .iter()
                .any(|(key, fields)| new_map.get(key) != Some(fields));
        }
    }

    // Unkeyed lists, or keyed lists with duplicate keys, compare as multisets.
    multiset(old) != multiset(new)
}

fn index_by_key(rows: &[ChildRow]) -> Option<HashMap<&str, &BTreeMap<String, Value>>> {
    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        let key = row.key.as_deref()?;
        if map.insert(key, &row.fields).is_some() {
            return None;
        }
    }
    Some(map)
}

fn multiset(rows: &[ChildRow]) -> HashMap<String, usize> {
    let mut counts = HashMap::with_capacity(rows.len());
    for row in rows {
        // BTreeMap keeps field order stable, so the encoding is canonical.
        let encoded = serde_json::to_string(row).unwrap_or_default();
        *counts.entry(encoded).or_insert(0) += 1;
    }
    counts
}
