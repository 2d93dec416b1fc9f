//! Collector seam
//!
//! A collector lists every raw object of one resource kind in one scope.
//! Listing is lazy: items are yielded page by page, and a failure anywhere in
//! the listing fails the whole sequence.

use crate::error::{LedgerError, Result};
use crate::model::RawObject;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value as Json;
use std::collections::HashMap;

/// Lazy sequence of listed objects
pub type RawStream<'a> = BoxStream<'a, Result<RawObject>>;

/// Lists raw objects of one resource kind
pub trait Collector: Send + Sync {
    /// Collector name for logs (e.g., "http:instances")
    fn name(&self) -> &str;

    fn fetch_all<'a>(&'a self, scope: &'a str) -> RawStream<'a>;
}

/// Extract the stable id of a listed item; numeric ids are stringified
pub fn extract_id(item: &Json, id_field: &str) -> Option<String> {
    match crate::normalize::lookup(item, id_field)? {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Collector serving a fixed inventory per scope
///
/// Used for dry runs from a JSON file and throughout the tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCollector {
    name: String,
    scopes: HashMap<String, Vec<std::result::Result<RawObject, String>>>,
}

impl StaticCollector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scopes: HashMap::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>, objects: Vec<RawObject>) -> Self {
        self.set_scope(scope, objects);
        self
    }

    /// Replace the inventory of one scope
    pub fn set_scope(&mut self, scope: impl Into<String>, objects: Vec<RawObject>) {
        self.scopes
            .insert(scope.into(), objects.into_iter().map(Ok).collect());
    }

    /// Make the listing of `scope` fail with a transient error after the
    /// objects already registered for it
    pub fn fail_scope(&mut self, scope: &str, message: impl Into<String>) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .push(Err(message.into()));
    }

    /// Build a single-scope collector from `{"items": [...]}` or a bare array
    pub fn from_json(
        name: impl Into<String>,
        scope: impl Into<String>,
        document: &Json,
        id_field: &str,
    ) -> Result<Self> {
        let items = document
            .get("items")
            .unwrap_or(document)
            .as_array()
            .ok_or_else(|| LedgerError::Permanent("inventory document has no item list".into()))?;

        let objects = items
            .iter()
            .map(|item| {
                let id = extract_id(item, id_field).ok_or_else(|| {
                    LedgerError::Permanent(format!("inventory item without '{}'", id_field))
                })?;
                Ok(RawObject::new(id, item.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(name).with_scope(scope, objects))
    }
}

impl Collector for StaticCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_all<'a>(&'a self, scope: &'a str) -> RawStream<'a> {
        let items = self.scopes.get(scope).cloned().unwrap_or_default();
        stream::iter(
            items
                .into_iter()
                .map(|item| item.map_err(LedgerError::Transient)),
        )
        .boxed()
    }
}
