//! Storage abstraction
//!
//! The engine never talks to a database directly. Everything it needs is
//! expressed by [`Store`] (pool-level operations) and [`StoreTx`] (work done
//! inside one transaction). Dropping a `StoreTx` without calling
//! [`StoreTx::commit`] must discard all of its writes.

use crate::descriptor::ResourceDescriptor;
use crate::error::Result;
use crate::model::{CanonicalEntity, ChildHistoryRecord, ChildRow, HistoryRecord, LiveRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Transactional store holding live state and history for any number of
/// resource kinds
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the backend name (e.g., "sqlite", "memory")
    fn name(&self) -> &str;

    /// Create the tables a descriptor needs, if missing
    async fn ensure_schema(&self, desc: &ResourceDescriptor) -> Result<()>;

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// Ids of live entities in `scope` last observed strictly before `before`
    async fn find_stale(
        &self,
        desc: &ResourceDescriptor,
        scope: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Every history record of one entity, ordered by `valid_from`
    async fn entity_history(
        &self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Vec<HistoryRecord>>;

    /// Every child history record under one parent history record, ordered
    /// by collection, `valid_from` and position
    async fn child_history(
        &self,
        desc: &ResourceDescriptor,
        history_id: i64,
    ) -> Result<Vec<ChildHistoryRecord>>;
}

/// Work performed inside one transaction
#[async_trait]
pub trait StoreTx: Send {
    /// Live record with every child collection, if the entity is known
    async fn load_with_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Option<LiveRecord>>;

    /// Advance the freshness watermark without touching anything else
    async fn touch_collected_at(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        collected_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert or replace the live row (scalar and opaque fields only)
    async fn upsert(
        &mut self,
        desc: &ResourceDescriptor,
        entity: &CanonicalEntity,
        scope: &str,
        collected_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_children(&mut self, desc: &ResourceDescriptor, entity_id: &str) -> Result<()>;

    async fn insert_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        children: &BTreeMap<String, Vec<ChildRow>>,
    ) -> Result<()>;

    /// Delete the live row; children must already be gone
    async fn delete(&mut self, desc: &ResourceDescriptor, entity_id: &str) -> Result<()>;

    /// Insert an open history record and return its id
    async fn insert_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity: &CanonicalEntity,
        scope: &str,
        valid_from: DateTime<Utc>,
    ) -> Result<i64>;

    /// Insert open child history records for one collection
    async fn insert_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        entity_id: &str,
        collection: &str,
        rows: &[ChildRow],
        valid_from: DateTime<Utc>,
    ) -> Result<()>;

    /// Close the open history record of an entity; returns rows closed
    async fn close_open_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        valid_to: DateTime<Utc>,
    ) -> Result<u64>;

    /// Close open child history records under a parent, for one collection
    /// or (with `None`) for all of them; returns rows closed
    async fn close_open_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        collection: Option<&str>,
        valid_to: DateTime<Utc>,
    ) -> Result<u64>;

    async fn query_open_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Option<HistoryRecord>>;

    async fn query_open_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        collection: &str,
    ) -> Result<Vec<ChildHistoryRecord>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
