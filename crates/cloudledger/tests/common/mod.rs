#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use cloudledger::{
    CanonicalEntity, ChildRow, HistoryRecord, MemoryStore, Reconciler, ResourceDescriptor,
    StaticCollector, Store, builtin,
};
use std::sync::Arc;

pub const SCOPE: &str = "proj-a";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub desc: Arc<ResourceDescriptor>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_collector(StaticCollector::new("static")).await
    }

    pub async fn with_collector(collector: StaticCollector) -> Self {
        let store = Arc::new(MemoryStore::new());
        let desc = Arc::new(builtin::instance());
        let reconciler = Reconciler::new(desc.clone(), store.clone(), Arc::new(collector));
        reconciler.prepare().await.unwrap();
        Self {
            store,
            desc,
            reconciler,
        }
    }

    /// A reconciler sharing this harness's store but listing from `collector`
    pub fn reconciler_for(&self, collector: StaticCollector) -> Reconciler {
        Reconciler::new(self.desc.clone(), self.store.clone(), Arc::new(collector))
    }

    pub async fn history(&self, id: &str) -> Vec<HistoryRecord> {
        self.store.entity_history(&self.desc, id).await.unwrap()
    }

    pub async fn live(&self, id: &str) -> Option<CanonicalEntity> {
        let mut tx = self.store.begin().await.unwrap();
        let record = tx.load_with_children(&self.desc, id).await.unwrap();
        tx.rollback().await.unwrap();
        record.map(|r| r.entity)
    }
}

pub fn label(key: &str, value: &str) -> ChildRow {
    ChildRow::keyed(key).with_field("value", value)
}

pub fn license(name: &str) -> ChildRow {
    ChildRow::unkeyed().with_field("license", name)
}

/// An instance with one license and the given labels
pub fn vm(id: &str, status: &str, labels: &[(&str, &str)]) -> CanonicalEntity {
    CanonicalEntity::new(id)
        .with_scalar("name", id)
        .with_scalar("status", status)
        .with_children(
            "labels",
            labels.iter().map(|(k, v)| label(k, v)).collect(),
        )
        .with_children("licenses", vec![license("debian-12")])
}

/// Consecutive records share their boundary and only the last may be open
pub fn assert_no_gaps(records: &[HistoryRecord]) {
    for pair in records.windows(2) {
        assert_eq!(Some(pair[1].valid_from), pair[0].valid_to);
    }
    assert!(records.iter().filter(|r| r.is_open()).count() <= 1);
    if let Some((_, closed)) = records.split_last() {
        assert!(closed.iter().all(|r| !r.is_open()));
    }
}
