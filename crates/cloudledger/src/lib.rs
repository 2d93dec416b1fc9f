//! CloudLedger reconciliation engine
//!
//! Keeps a live inventory of cloud resources in step with an external API and
//! records every observed change as bitemporal history.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │             Scheduler (cloudledgerd)             │
//! │         run(scope) → sweep(scope, start)         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                  cloudledger                     │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  Reconciler (one per ResourceDescriptor)  │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────────┐   │
//! │  │Normalizer│  │   Diff   │  │HistoryTracker│   │
//! │  └──────────┘  └──────────┘  └──────────────┘   │
//! └───────┬─────────────────────────────┬───────────┘
//!         │                             │
//! ┌───────▼───────┐             ┌───────▼───────┐
//! │  trait        │             │  trait Store  │
//! │  Collector    │             │  (sqlite,     │
//! │  (http,       │             │   memory)     │
//! │   static)     │             │               │
//! └───────────────┘             └───────────────┘
//! ```
//!
//! Resource kinds are not hand-written: each one is a [`ResourceDescriptor`]
//! listing its scalar fields, opaque blobs and child collections, and the
//! same engine serves all of them.

pub mod builtin;
pub mod collect;
pub mod descriptor;
pub mod diff;
pub mod error;
pub mod history;
pub mod memory;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod store;

// Re-exports
pub use collect::{Collector, RawStream, StaticCollector, extract_id};
pub use descriptor::{ChildKey, ChildSpec, FieldKind, FieldSpec, OpaqueSpec, ResourceDescriptor};
pub use diff::{Diff, compare};
pub use error::{ErrorClass, LedgerError, Result};
pub use history::{HistoryTracker, HistoryUpdate};
pub use memory::MemoryStore;
pub use model::{
    CanonicalEntity, ChildHistoryRecord, ChildRow, HistoryRecord, LiveRecord, RawObject, Value,
};
pub use normalize::{JsonNormalizer, Normalizer};
pub use reconcile::{EntityAction, EntityFailure, Reconciler, RunResult, SweepResult};
pub use store::{Store, StoreTx};
