//! Worker subsystem: one-shot per-task execution with self-verification,
//! report emission, quality hooks, and AutoRecovery on failure.

mod executor;
pub mod recovery;
pub mod report;
pub mod verify;

pub use executor::{WorkerExecutor, WorkerRunSummary};
pub use recovery::{AutoRecoveryEngine, ErrorAnalysis, RecoveryResult, RecoveryStrategy};
