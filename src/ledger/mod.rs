//! Clock Ledger Module
//!
//! The per-user causal log every replica keeps. The clock is the only
//! ordering used for replication; there are no per-replica counters.

mod record;
mod store;

pub use record::{Clock, ClockInfo, ClockRecord, NewRecord, Record, SourceTable, UserExport};
pub use store::ClockLedger;
