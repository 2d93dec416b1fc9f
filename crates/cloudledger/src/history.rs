//! Bitemporal history tracking
//!
//! Every entity has exactly one open history record while it is live. Child
//! collections carry their own validity intervals under that record, so a
//! label change does not rotate the parent and a status change rotates
//! everything.

use crate::descriptor::ResourceDescriptor;
use crate::diff::Diff;
use crate::error::{LedgerError, Result};
use crate::model::CanonicalEntity;
use crate::store::StoreTx;
use chrono::{DateTime, Utc};

/// What `update_history` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryUpdate {
    /// The open record was closed and a complete new lineage opened
    Rotated { previous: i64, current: i64 },

    /// Only the listed collections were closed and reinserted
    ChildrenRewritten {
        history_id: i64,
        collections: Vec<String>,
    },
}

/// Writes history for one resource kind inside a caller-owned transaction
#[derive(Debug, Clone, Copy)]
pub struct HistoryTracker<'a> {
    desc: &'a ResourceDescriptor,
}

impl<'a> HistoryTracker<'a> {
    pub fn new(desc: &'a ResourceDescriptor) -> Self {
        Self { desc }
    }

    /// Open a history record for `entity` plus one open child record per row
    /// of every collection
    pub async fn create_history(
        &self,
        tx: &mut dyn StoreTx,
        entity: &CanonicalEntity,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let history_id = tx.insert_history(self.desc, entity, scope, now).await?;
        for child in &self.desc.children {
            let rows = entity.collection(&child.name);
            if !rows.is_empty() {
                tx.insert_child_history(self.desc, history_id, &entity.id, &child.name, rows, now)
                    .await?;
            }
        }
        Ok(history_id)
    }

    /// Record a change of an already tracked entity
    ///
    /// A top-level change closes the open record with all of its child rows
    /// and opens a fresh lineage at `now`. Otherwise each changed collection
    /// is closed and reinserted as a whole under the still-open record.
    pub async fn update_history(
        &self,
        tx: &mut dyn StoreTx,
        old: &CanonicalEntity,
        new: &CanonicalEntity,
        diff: &Diff,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<HistoryUpdate> {
        if old.id != new.id {
            return Err(LedgerError::Invariant(format!(
                "history update across entities ({} -> {})",
                old.id, new.id
            )));
        }

        let open = tx
            .query_open_history(self.desc, &new.id)
            .await?
            .ok_or_else(|| {
                LedgerError::Invariant(format!(
                    "no open history record for {} {}",
                    self.desc.name, new.id
                ))
            })?;

        if diff.top_level_changed {
            tx.close_open_child_history(self.desc, open.history_id, None, now)
                .await?;
            tx.close_open_history(self.desc, &new.id, now).await?;
            let current = self.create_history(tx, new, scope, now).await?;
            return Ok(HistoryUpdate::Rotated {
                previous: open.history_id,
                current,
            });
        }

        let mut collections = Vec::new();
        for name in diff.changed_collections() {
            if self.desc.child(name).is_none() {
                return Err(LedgerError::Descriptor(format!(
                    "{} has no collection '{}'",
                    self.desc.name, name
                )));
            }
            tx.close_open_child_history(self.desc, open.history_id, Some(name), now)
                .await?;
            let rows = new.collection(name);
            if !rows.is_empty() {
                tx.insert_child_history(self.desc, open.history_id, &new.id, name, rows, now)
                    .await?;
            }
            collections.push(name.to_string());
        }

        Ok(HistoryUpdate::ChildrenRewritten {
            history_id: open.history_id,
            collections,
        })
    }

    /// Permanently close the lineage of a vanished entity
    ///
    /// Returns `false` when there was no open record to close.
    pub async fn close_history(
        &self,
        tx: &mut dyn StoreTx,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(open) = tx.query_open_history(self.desc, entity_id).await? else {
            return Ok(false);
        };
        tx.close_open_child_history(self.desc, open.history_id, None, now)
            .await?;
        tx.close_open_history(self.desc, entity_id, now).await?;
        Ok(true)
    }
}
