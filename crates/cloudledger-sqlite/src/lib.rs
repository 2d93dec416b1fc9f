//! SQLite storage backend for CloudLedger
//!
//! Each resource descriptor maps onto four kinds of tables:
//!
//! ```text
//! live_<resource>                  current state, one row per entity
//! live_<resource>_<child>          current child rows
//! history_<resource>               validity intervals of the top-level fields
//! history_<resource>_<child>       validity intervals of child rows
//! ```
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch. A
//! partial unique index keeps at most one open history record per entity;
//! violating it surfaces as [`cloudledger::LedgerError::Invariant`].

pub mod error;
mod schema;
mod store;

pub use error::{Result, SqliteStoreError};
pub use schema::create_statements as schema_statements;
pub use store::SqliteStore;
