//! Reconciliation orchestrator
//!
//! One [`Reconciler`] handles one resource kind. A run lists the scope,
//! normalizes each object and reconciles it inside its own transaction. The
//! stale sweep retires entities the run did not observe and must only follow
//! a run that succeeded.

use crate::collect::Collector;
use crate::descriptor::ResourceDescriptor;
use crate::diff;
use crate::error::{LedgerError, Result};
use crate::history::{HistoryTracker, HistoryUpdate};
use crate::model::CanonicalEntity;
use crate::normalize::{JsonNormalizer, Normalizer};
use crate::store::{Store, StoreTx};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of reconciling one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    /// First observation: live row and history opened
    Created,
    /// Unchanged: only the watermark advanced
    Touched,
    /// Top-level change: history rotated
    Replaced,
    /// Only child collections changed
    ChildrenRewritten,
    /// Absent from a complete pass: live row removed, history closed
    Retired,
}

impl fmt::Display for EntityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityAction::Created => write!(f, "created"),
            EntityAction::Touched => write!(f, "touched"),
            EntityAction::Replaced => write!(f, "replaced"),
            EntityAction::ChildrenRewritten => write!(f, "children-rewritten"),
            EntityAction::Retired => write!(f, "retired"),
        }
    }
}

/// An entity that could not be reconciled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_id: String,
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub resource: String,
    pub scope: String,

    /// Objects listed by the collector
    pub entity_count: usize,

    pub created: usize,
    pub touched: usize,
    pub replaced: usize,
    pub children_rewritten: usize,

    /// Objects that could not be normalized
    pub skipped: usize,

    /// Entities whose transaction was rolled back
    pub failed: usize,

    pub failures: Vec<EntityFailure>,

    /// Every id seen during listing, converted or not
    #[serde(skip)]
    pub listed: BTreeSet<String>,

    /// Pass start time; also the watermark for the following sweep
    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,
}

impl RunResult {
    pub fn new(resource: impl Into<String>, scope: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            resource: resource.into(),
            scope: scope.into(),
            entity_count: 0,
            created: 0,
            touched: 0,
            replaced: 0,
            children_rewritten: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            listed: BTreeSet::new(),
            started_at,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Entities that produced new history
    pub fn changed(&self) -> usize {
        self.created + self.replaced + self.children_rewritten
    }

    fn record(&mut self, action: EntityAction) {
        match action {
            EntityAction::Created => self.created += 1,
            EntityAction::Touched => self.touched += 1,
            EntityAction::Replaced => self.replaced += 1,
            EntityAction::ChildrenRewritten => self.children_rewritten += 1,
            EntityAction::Retired => {}
        }
    }

    fn record_failure(&mut self, entity_id: &str, error: &LedgerError) {
        self.failed += 1;
        self.failures.push(EntityFailure {
            entity_id: entity_id.to_string(),
            error: error.to_string(),
            retryable: error.is_retryable(),
        });
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listed: {} created, {} replaced, {} children rewritten, {} unchanged, {} skipped, {} failed",
            self.entity_count,
            self.created,
            self.replaced,
            self.children_rewritten,
            self.touched,
            self.skipped,
            self.failed
        )
    }
}

/// Summary of one stale sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub resource: String,
    pub scope: String,
    pub watermark: DateTime<Utc>,
    pub retired: usize,

    /// Stale entities left alone because the pass listed them
    pub protected: usize,

    pub failed: usize,
    pub failures: Vec<EntityFailure>,
    pub duration_ms: u64,
}

impl fmt::Display for SweepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} retired, {} protected, {} failed",
            self.retired, self.protected, self.failed
        )
    }
}

/// Reconciles one resource kind against a store
#[derive(Clone)]
pub struct Reconciler {
    descriptor: Arc<ResourceDescriptor>,
    store: Arc<dyn Store>,
    collector: Arc<dyn Collector>,
    normalizer: Arc<dyn Normalizer>,
}

impl Reconciler {
    /// Create a reconciler normalizing with the descriptor's own field paths
    pub fn new(
        descriptor: Arc<ResourceDescriptor>,
        store: Arc<dyn Store>,
        collector: Arc<dyn Collector>,
    ) -> Self {
        let normalizer = Arc::new(JsonNormalizer::new(descriptor.clone()));
        Self {
            descriptor,
            store,
            collector,
            normalizer,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate the descriptor and create its tables
    pub async fn prepare(&self) -> Result<()> {
        self.store.ensure_schema(&self.descriptor).await
    }

    /// Reconcile already normalized entities observed at `now`
    ///
    /// Each entity gets its own transaction; failures are counted and the
    /// pass continues.
    pub async fn ingest(
        &self,
        scope: &str,
        entities: impl IntoIterator<Item = CanonicalEntity>,
        now: DateTime<Utc>,
    ) -> RunResult {
        let clock = Instant::now();
        let mut result = RunResult::new(&self.descriptor.name, scope, now);
        for entity in entities {
            result.entity_count += 1;
            result.listed.insert(entity.id.clone());
            self.process(scope, entity, now, &mut result).await;
        }
        result.duration_ms = clock.elapsed().as_millis() as u64;
        result
    }

    /// List, normalize and reconcile every object of `scope`
    ///
    /// A listing failure aborts the run. Entities that fail to reconcile make
    /// the run fail with [`LedgerError::EntitiesFailed`] once the pass is over.
    pub async fn run(&self, scope: &str) -> Result<RunResult> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let resource = self.descriptor.name.as_str();
        let mut result = RunResult::new(resource, scope, started_at);

        debug!(
            resource,
            scope,
            collector = self.collector.name(),
            "Starting reconciliation run"
        );

        let mut listing = self.collector.fetch_all(scope);
        loop {
            let raw = match listing.try_next().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    error!(resource, scope, error = %e, "Listing failed, run aborted");
                    return Err(e);
                }
            };

            result.entity_count += 1;
            result.listed.insert(raw.id.clone());

            match self.normalizer.normalize(&raw) {
                Ok(entity) => {
                    result.listed.insert(entity.id.clone());
                    self.process(scope, entity, started_at, &mut result).await;
                }
                Err(e) => {
                    warn!(resource, scope, entity = %raw.id, error = %e, "Skipping unconvertible object");
                    result.skipped += 1;
                }
            }
        }

        result.duration_ms = clock.elapsed().as_millis() as u64;

        if !result.is_success() {
            error!(resource, scope, "Run finished with failures: {}", result);
            return Err(LedgerError::EntitiesFailed {
                resource: resource.to_string(),
                scope: scope.to_string(),
                failed: result.failed,
                total: result.entity_count,
                retryable: result.failures.iter().all(|f| f.retryable),
            });
        }

        info!(
            resource,
            scope,
            duration_ms = result.duration_ms,
            "Run complete: {}",
            result
        );
        Ok(result)
    }

    /// Retire live entities of `scope` not observed since `watermark`
    ///
    /// Ids in `protected` are never retired. Only call this after a run over
    /// the same scope succeeded.
    pub async fn sweep(
        &self,
        scope: &str,
        watermark: DateTime<Utc>,
        protected: &BTreeSet<String>,
    ) -> Result<SweepResult> {
        let clock = Instant::now();
        let resource = self.descriptor.name.as_str();
        let stale = self
            .store
            .find_stale(&self.descriptor, scope, watermark)
            .await?;

        let mut result = SweepResult {
            resource: resource.to_string(),
            scope: scope.to_string(),
            watermark,
            retired: 0,
            protected: 0,
            failed: 0,
            failures: Vec::new(),
            duration_ms: 0,
        };

        for entity_id in stale {
            if protected.contains(&entity_id) {
                debug!(resource, entity = %entity_id, "Stale but listed this pass, keeping");
                result.protected += 1;
                continue;
            }
            match self.retire(&entity_id, watermark).await {
                Ok(()) => {
                    debug!(resource, entity = %entity_id, action = %EntityAction::Retired, "Reconciled entity");
                    result.retired += 1;
                }
                Err(e) => {
                    warn!(resource, entity = %entity_id, error = %e, "Failed to retire stale entity");
                    result.failed += 1;
                    result.failures.push(EntityFailure {
                        entity_id,
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }

        result.duration_ms = clock.elapsed().as_millis() as u64;
        info!(resource, scope, "Sweep complete: {}", result);
        Ok(result)
    }

    /// A run followed, only on success, by the sweep at the run's start time
    pub async fn run_and_sweep(&self, scope: &str) -> Result<(RunResult, SweepResult)> {
        let run = self.run(scope).await?;
        let sweep = self.sweep(scope, run.started_at, &run.listed).await?;
        Ok((run, sweep))
    }

    async fn process(
        &self,
        scope: &str,
        entity: CanonicalEntity,
        now: DateTime<Utc>,
        result: &mut RunResult,
    ) {
        let resource = self.descriptor.name.as_str();
        match self.reconcile_entity(scope, &entity, now).await {
            Ok(action) => {
                debug!(resource, entity = %entity.id, %action, "Reconciled entity");
                result.record(action);
            }
            Err(e) => {
                warn!(resource, entity = %entity.id, error = %e, "Entity rolled back");
                result.record_failure(&entity.id, &e);
            }
        }
    }

    /// Reconcile one entity in its own transaction
    pub async fn reconcile_entity(
        &self,
        scope: &str,
        entity: &CanonicalEntity,
        now: DateTime<Utc>,
    ) -> Result<EntityAction> {
        self.descriptor.check_entity(entity)?;
        let entity = self.descriptor.complete(entity.clone());

        let mut tx = self.store.begin().await?;
        match self.apply(tx.as_mut(), scope, &entity, now).await {
            Ok(action) => {
                tx.commit().await?;
                Ok(action)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(entity = %entity.id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn StoreTx,
        scope: &str,
        entity: &CanonicalEntity,
        now: DateTime<Utc>,
    ) -> Result<EntityAction> {
        let desc = self.descriptor.as_ref();
        let tracker = HistoryTracker::new(desc);

        let old = tx.load_with_children(desc, &entity.id).await?;
        let diff = diff::compare(old.as_ref().map(|r| &r.entity), entity);

        let Some(old) = old else {
            tx.upsert(desc, entity, scope, now).await?;
            tx.insert_children(desc, &entity.id, &entity.children)
                .await?;
            tracker.create_history(tx, entity, scope, now).await?;
            return Ok(EntityAction::Created);
        };

        if !diff.has_any_change() {
            tx.touch_collected_at(desc, &entity.id, now).await?;
            return Ok(EntityAction::Touched);
        }

        tx.delete_children(desc, &entity.id).await?;
        tx.upsert(desc, entity, scope, now).await?;
        tx.insert_children(desc, &entity.id, &entity.children)
            .await?;

        match tracker
            .update_history(tx, &old.entity, entity, &diff, scope, now)
            .await?
        {
            HistoryUpdate::Rotated { .. } => Ok(EntityAction::Replaced),
            HistoryUpdate::ChildrenRewritten { .. } => Ok(EntityAction::ChildrenRewritten),
        }
    }

    async fn retire(&self, entity_id: &str, now: DateTime<Utc>) -> Result<()> {
        let desc = self.descriptor.as_ref();
        let mut tx = self.store.begin().await?;
        let outcome = async {
            HistoryTracker::new(desc)
                .close_history(tx.as_mut(), entity_id, now)
                .await?;
            tx.delete_children(desc, entity_id).await?;
            tx.delete(desc, entity_id).await
        }
        .await;

        match outcome {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(entity = %entity_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
