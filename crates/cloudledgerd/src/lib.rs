//! CloudLedger scheduler
//!
//! Turns a [`cloudledger_config::LedgerConfig`] into periodic reconciliation
//! jobs. The `cloudledgerd` binary is a thin CLI over this crate.

pub mod app;
pub mod scheduler;

pub use scheduler::{Job, JobKey, JobOutcome, RetryConfig, Scheduler, SchedulerConfig};
