//! Orchestrator Module
//!
//! The periodic state machine plus the queues and workers that carry out
//! the syncs it decides on.

mod decision;
mod machine;
mod monitor;
mod queue;
mod worker;

pub use decision::{DecisionLog, DecisionStage};
pub use machine::{Finding, MachineContext, MachineState, MachineStatus, RunSummary, StateMachine};
pub use monitor::{MonitorOutcome, SyncMonitor};
pub use queue::{QueueStats, SyncJobProcessor, SyncQueues};
pub use worker::SyncJobWorker;
