//! In-memory store
//!
//! A transaction takes the store's lock for its whole lifetime and writes in
//! place, logging the prior state of every row it changes. Commit drops the
//! log; dropping the transaction without commit replays it backwards.
//! Transactions are therefore fully serialized, which is exactly what tests
//! and dry runs need. Calling a pool-level method while holding a
//! transaction from the same task would wait forever.

use crate::descriptor::ResourceDescriptor;
use crate::error::{LedgerError, Result};
use crate::model::{CanonicalEntity, ChildHistoryRecord, ChildRow, HistoryRecord, LiveRecord};
use crate::store::{Store, StoreTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct Tables {
    kinds: HashMap<String, KindTables>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct KindTables {
    live: BTreeMap<String, LiveRecord>,
    history: BTreeMap<i64, HistoryRecord>,
    child_history: BTreeMap<i64, ChildHistoryRecord>,

    /// entity id -> its open history id
    open: BTreeMap<String, i64>,

    /// parent history id -> child history ids, in insertion order
    children: BTreeMap<i64, Vec<i64>>,
}

/// Prior state of one row, restored on rollback
#[derive(Debug)]
enum Change {
    Live(String, Option<LiveRecord>),
    History(i64, Option<HistoryRecord>),
    ChildHistory(i64, Option<ChildHistoryRecord>),
    Open(String, Option<i64>),
    ChildAppended(i64),
}

#[derive(Debug)]
enum Undo {
    NextId(i64),
    Kind(String, Change),
}

fn undo(desc: &ResourceDescriptor, change: Change) -> Undo {
    Undo::Kind(desc.name.clone(), change)
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Tables {
    fn kind(&self, desc: &ResourceDescriptor) -> Result<&KindTables> {
        self.kinds
            .get(&desc.name)
            .ok_or_else(|| LedgerError::Storage(format!("no tables for {}", desc.name)))
    }

    fn kind_mut(&mut self, desc: &ResourceDescriptor) -> Result<&mut KindTables> {
        self.kinds
            .get_mut(&desc.name)
            .ok_or_else(|| LedgerError::Storage(format!("no tables for {}", desc.name)))
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn revert(&mut self, entry: Undo) {
        match entry {
            Undo::NextId(id) => self.next_id = id,
            Undo::Kind(name, change) => {
                if let Some(kind) = self.kinds.get_mut(&name) {
                    kind.revert(change);
                }
            }
        }
    }
}

impl KindTables {
    fn revert(&mut self, change: Change) {
        match change {
            Change::Live(id, prior) => restore(&mut self.live, id, prior),
            Change::History(id, prior) => restore(&mut self.history, id, prior),
            Change::ChildHistory(id, prior) => restore(&mut self.child_history, id, prior),
            Change::Open(entity_id, prior) => restore(&mut self.open, entity_id, prior),
            Change::ChildAppended(parent) => {
                if let Some(ids) = self.children.get_mut(&parent) {
                    ids.pop();
                    if ids.is_empty() {
                        self.children.remove(&parent);
                    }
                }
            }
        }
    }

    fn child_records(&self, parent_history_id: i64) -> impl Iterator<Item = &ChildHistoryRecord> {
        self.children
            .get(&parent_history_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.child_history.get(id))
    }
}

/// Store keeping every table in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_schema(&self, desc: &ResourceDescriptor) -> Result<()> {
        desc.validate()?;
        let mut tables = self.tables.lock().await;
        tables.kinds.entry(desc.name.clone()).or_default();
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            tables,
            undo: Vec::new(),
        }))
    }

    async fn find_stale(
        &self,
        desc: &ResourceDescriptor,
        scope: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .kind(desc)?
            .live
            .values()
            .filter(|r| r.scope_id == scope && r.collected_at < before)
            .map(|r| r.entity.id.clone())
            .collect())
    }

    async fn entity_history(
        &self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Vec<HistoryRecord>> {
        let tables = self.tables.lock().await;
        let mut records: Vec<HistoryRecord> = tables
            .kind(desc)?
            .history
            .values()
            .filter(|h| h.entity_id == entity_id)
            .cloned()
            .collect();
        records.sort_by_key(|h| (h.valid_from, h.history_id));
        Ok(records)
    }

    async fn child_history(
        &self,
        desc: &ResourceDescriptor,
        history_id: i64,
    ) -> Result<Vec<ChildHistoryRecord>> {
        let tables = self.tables.lock().await;
        let mut records: Vec<ChildHistoryRecord> =
            tables.kind(desc)?.child_records(history_id).cloned().collect();
        records.sort_by(|a, b| {
            (&a.collection, a.valid_from, a.position, a.id)
                .cmp(&(&b.collection, b.valid_from, b.position, b.id))
        });
        Ok(records)
    }
}

struct MemoryTx {
    tables: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
}

impl MemoryTx {
    fn next_id(&mut self) -> i64 {
        self.undo.push(Undo::NextId(self.tables.next_id));
        self.tables.next_id()
    }

    /// Put or remove a live row, returning the one it replaced
    fn replace_live(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        record: Option<LiveRecord>,
    ) -> Result<Option<LiveRecord>> {
        let live = &mut self.tables.kind_mut(desc)?.live;
        let prior = match record {
            Some(record) => live.insert(entity_id.to_string(), record),
            None => live.remove(entity_id),
        };
        self.undo
            .push(undo(desc, Change::Live(entity_id.to_string(), prior.clone())));
        Ok(prior)
    }

    /// The live row for `entity_id`, saved for rollback before it is handed out
    fn live_mut(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Option<&mut LiveRecord>> {
        let Some(record) = self.tables.kind_mut(desc)?.live.get_mut(entity_id) else {
            return Ok(None);
        };
        self.undo.push(undo(
            desc,
            Change::Live(entity_id.to_string(), Some(record.clone())),
        ));
        Ok(Some(record))
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        while let Some(entry) = self.undo.pop() {
            self.tables.revert(entry);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn load_with_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Option<LiveRecord>> {
        Ok(self.tables.kind(desc)?.live.get(entity_id).cloned().map(|mut record| {
            record.entity = desc.complete(record.entity);
            record
        }))
    }

    async fn touch_collected_at(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        collected_at: DateTime<Utc>,
    ) -> Result<()> {
        let record = self
            .live_mut(desc, entity_id)?
            .ok_or_else(|| LedgerError::Storage(format!("no live row for {}", entity_id)))?;
        record.collected_at = collected_at;
        Ok(())
    }

    async fn upsert(
        &mut self,
        desc: &ResourceDescriptor,
        entity: &CanonicalEntity,
        scope: &str,
        collected_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut stored = CanonicalEntity::new(entity.id.clone());
        stored.scalars = entity.scalars.clone();
        stored.opaque = entity.opaque.clone();
        let record = LiveRecord {
            entity: stored,
            scope_id: scope.to_string(),
            collected_at,
        };
        // Children are written separately and survive the upsert
        if let Some(prior) = self.replace_live(desc, &entity.id, Some(record))? {
            if let Some(current) = self.tables.kind_mut(desc)?.live.get_mut(&entity.id) {
                current.entity.children = prior.entity.children;
            }
        }
        Ok(())
    }

    async fn delete_children(&mut self, desc: &ResourceDescriptor, entity_id: &str) -> Result<()> {
        if let Some(record) = self.live_mut(desc, entity_id)? {
            record.entity.children.clear();
        }
        Ok(())
    }

    async fn insert_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        children: &BTreeMap<String, Vec<ChildRow>>,
    ) -> Result<()> {
        let record = self
            .live_mut(desc, entity_id)?
            .ok_or_else(|| LedgerError::Storage(format!("no live row for {}", entity_id)))?;
        for (name, rows) in children {
            record
                .entity
                .children
                .entry(name.clone())
                .or_default()
                .extend(rows.iter().cloned());
        }
        Ok(())
    }

    async fn delete(&mut self, desc: &ResourceDescriptor, entity_id: &str) -> Result<()> {
        self.replace_live(desc, entity_id, None)?;
        Ok(())
    }

    async fn insert_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity: &CanonicalEntity,
        scope: &str,
        valid_from: DateTime<Utc>,
    ) -> Result<i64> {
        if self.tables.kind(desc)?.open.contains_key(&entity.id) {
            return Err(LedgerError::Invariant(format!(
                "{} {} already has an open history record",
                desc.name, entity.id
            )));
        }
        let history_id = self.next_id();
        let snapshot = desc.complete(entity.clone());
        let kind = self.tables.kind_mut(desc)?;
        kind.history.insert(
            history_id,
            HistoryRecord {
                history_id,
                entity_id: entity.id.clone(),
                valid_from,
                valid_to: None,
                scalars: snapshot.scalars,
                opaque: snapshot.opaque,
                scope_id: scope.to_string(),
                collected_at: valid_from,
            },
        );
        kind.open.insert(entity.id.clone(), history_id);
        self.undo.push(undo(desc, Change::History(history_id, None)));
        self.undo.push(undo(desc, Change::Open(entity.id.clone(), None)));
        Ok(history_id)
    }

    async fn insert_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        entity_id: &str,
        collection: &str,
        rows: &[ChildRow],
        valid_from: DateTime<Utc>,
    ) -> Result<()> {
        if desc.child(collection).is_none() {
            return Err(LedgerError::Storage(format!(
                "no tables for {}.{}",
                desc.name, collection
            )));
        }
        for (position, row) in rows.iter().enumerate() {
            let id = self.next_id();
            let kind = self.tables.kind_mut(desc)?;
            kind.child_history.insert(
                id,
                ChildHistoryRecord {
                    id,
                    parent_history_id,
                    entity_id: entity_id.to_string(),
                    collection: collection.to_string(),
                    position,
                    row: row.clone(),
                    valid_from,
                    valid_to: None,
                },
            );
            kind.children.entry(parent_history_id).or_default().push(id);
            self.undo.push(undo(desc, Change::ChildHistory(id, None)));
            self.undo
                .push(undo(desc, Change::ChildAppended(parent_history_id)));
        }
        Ok(())
    }

    async fn close_open_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        valid_to: DateTime<Utc>,
    ) -> Result<u64> {
        let kind = self.tables.kind_mut(desc)?;
        let Some(history_id) = kind.open.remove(entity_id) else {
            return Ok(0);
        };
        self.undo.push(undo(
            desc,
            Change::Open(entity_id.to_string(), Some(history_id)),
        ));
        let Some(record) = kind.history.get_mut(&history_id) else {
            return Err(LedgerError::Invariant(format!(
                "{} {} points at missing history {}",
                desc.name, entity_id, history_id
            )));
        };
        self.undo
            .push(undo(desc, Change::History(history_id, Some(record.clone()))));
        record.valid_to = Some(valid_to);
        Ok(1)
    }

    async fn close_open_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        collection: Option<&str>,
        valid_to: DateTime<Utc>,
    ) -> Result<u64> {
        let kind = self.tables.kind_mut(desc)?;
        let Some(ids) = kind.children.get(&parent_history_id) else {
            return Ok(0);
        };
        let mut closed = 0;
        for id in ids {
            let Some(record) = kind.child_history.get_mut(id) else {
                continue;
            };
            let in_scope = collection.is_none_or(|c| record.collection == c);
            if in_scope && record.is_open() {
                self.undo
                    .push(undo(desc, Change::ChildHistory(*id, Some(record.clone()))));
                record.valid_to = Some(valid_to);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn query_open_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> Result<Option<HistoryRecord>> {
        let kind = self.tables.kind(desc)?;
        Ok(kind
            .open
            .get(entity_id)
            .and_then(|id| kind.history.get(id))
            .cloned())
    }

    async fn query_open_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        collection: &str,
    ) -> Result<Vec<ChildHistoryRecord>> {
        let mut rows: Vec<ChildHistoryRecord> = self
            .tables
            .kind(desc)?
            .child_records(parent_history_id)
            .filter(|c| c.collection == collection && c.is_open())
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.position);
        Ok(rows)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::model::Value;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_discarded() {
        let store = MemoryStore::new();
        let desc = builtin::disk();
        store.ensure_schema(&desc).await.unwrap();

        let entity = CanonicalEntity::new("d-1").with_scalar("status", "READY");
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert(&desc, &entity, "proj", at(0)).await.unwrap();
            // dropped without commit
        }
        assert!(store.find_stale(&desc, "proj", at(10)).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.upsert(&desc, &entity, "proj", at(0)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            store.find_stale(&desc, "proj", at(10)).await.unwrap(),
            vec!["d-1".to_string()]
        );
        assert!(store.find_stale(&desc, "other", at(10)).await.unwrap().is_empty());
        assert!(store.find_stale(&desc, "proj", at(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_open_history_rejected() {
        let store = MemoryStore::new();
        let desc = builtin::disk();
        store.ensure_schema(&desc).await.unwrap();

        let entity = CanonicalEntity::new("d-1");
        let mut tx = store.begin().await.unwrap();
        tx.insert_history(&desc, &entity, "proj", at(0)).await.unwrap();
        let err = tx
            .insert_history(&desc, &entity, "proj", at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_storage_error() {
        let store = MemoryStore::new();
        let err = store
            .find_stale(&builtin::instance(), "proj", at(0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    fn label_rows(value: &str) -> BTreeMap<String, Vec<ChildRow>> {
        BTreeMap::from([(
            "labels".to_string(),
            vec![ChildRow::keyed("env").with_field("value", value)],
        )])
    }

    #[tokio::test]
    async fn test_rollback_restores_every_table() {
        let store = MemoryStore::new();
        let desc = builtin::disk();
        store.ensure_schema(&desc).await.unwrap();

        let entity = CanonicalEntity::new("d-1").with_scalar("status", "READY");
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&desc, &entity, "proj", at(0)).await.unwrap();
        tx.insert_children(&desc, "d-1", &label_rows("prod")).await.unwrap();
        let first = tx.insert_history(&desc, &entity, "proj", at(0)).await.unwrap();
        let prod = label_rows("prod");
        tx.insert_child_history(&desc, first, "d-1", "labels", &prod["labels"], at(0))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let changed = CanonicalEntity::new("d-1").with_scalar("status", "FAILED");
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&desc, &changed, "proj", at(10)).await.unwrap();
        tx.delete_children(&desc, "d-1").await.unwrap();
        tx.insert_children(&desc, "d-1", &label_rows("dev")).await.unwrap();
        assert_eq!(tx.close_open_history(&desc, "d-1", at(10)).await.unwrap(), 1);
        assert_eq!(
            tx.close_open_child_history(&desc, first, None, at(10))
                .await
                .unwrap(),
            1
        );
        let discarded = tx.insert_history(&desc, &changed, "proj", at(10)).await.unwrap();
        let dev = label_rows("dev");
        tx.insert_child_history(&desc, discarded, "d-1", "labels", &dev["labels"], at(10))
            .await
            .unwrap();
        tx.delete(&desc, "d-1").await.unwrap();
        tx.rollback().await.unwrap();

        let history = store.entity_history(&desc, "d-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_open());
        let children = store.child_history(&desc, first).await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_open());
        assert!(store.child_history(&desc, discarded).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        let live = tx.load_with_children(&desc, "d-1").await.unwrap().unwrap();
        assert_eq!(live.entity.scalar("status"), &Value::Text("READY".into()));
        let labels = live.entity.collection("labels");
        assert_eq!(labels[0].field("value"), &Value::Text("prod".into()));
        assert_eq!(live.collected_at, at(0));
        let open = tx.query_open_history(&desc, "d-1").await.unwrap().unwrap();
        assert_eq!(open.history_id, first);

        // Ids handed out by the discarded transaction are free again
        tx.close_open_history(&desc, "d-1", at(20)).await.unwrap();
        let reused = tx.insert_history(&desc, &changed, "proj", at(20)).await.unwrap();
        assert_eq!(reused, discarded);
    }

    #[tokio::test]
    async fn test_transaction_leaves_other_kinds_alone() {
        let store = MemoryStore::new();
        let disk = builtin::disk();
        let instance = builtin::instance();
        store.ensure_schema(&disk).await.unwrap();
        store.ensure_schema(&instance).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        for i in 0..100 {
            let entity = CanonicalEntity::new(format!("d-{i}"));
            tx.upsert(&disk, &entity, "proj", at(0)).await.unwrap();
            tx.insert_history(&disk, &entity, "proj", at(0)).await.unwrap();
        }
        tx.commit().await.unwrap();

        let vm = CanonicalEntity::new("vm-1");
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert(&instance, &vm, "proj", at(5)).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&instance, &vm, "proj", at(5)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.find_stale(&disk, "proj", at(10)).await.unwrap().len(), 100);
        assert_eq!(store.entity_history(&disk, "d-42").await.unwrap().len(), 1);
        assert_eq!(
            store.find_stale(&instance, "proj", at(10)).await.unwrap(),
            vec!["vm-1".to_string()]
        );
    }
}
