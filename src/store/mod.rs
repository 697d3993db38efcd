//! Persistence layer. libSQL-backed ledger of triage state, sender lists
//! and run summaries.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{
    BlockedSender, Ledger, ListChange, MessageOutcome, RunSummary, TriageRecord, TriageStatus,
    VipSender, VipSource,
};
