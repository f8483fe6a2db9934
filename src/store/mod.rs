//! Persistence layer — libSQL-backed storage for messages, tasks, the
//! audit ledger, action plans, token balances, and usage events.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{LedgerAppend, LedgerEntry, TriageStore, UsageEvent};
