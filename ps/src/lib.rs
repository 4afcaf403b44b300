//! pmstore - Relational store for the PM orchestration framework.
//!
//! The database is the system of record: typed entities over SQLite,
//! a rule-table transition engine, file locks, append-only change history,
//! durable events, and the migration gate. Markdown artifacts elsewhere are
//! projections of this state, never the other way around.
//!
//! # Modules
//!
//! - [`db`] - the `Store` handle and transaction wrapper
//! - [`schema`] - embedded schema, seeds, migrations
//! - [`transition`] - transition engine over the rule table
//! - [`task`] / [`order`] / [`project`] / [`backlog`] - typed entity CRUD
//! - [`lock`] - per-(project, path) exclusive leases
//! - [`dependency`] - dependency edges and readiness queries
//! - [`event`] - durable event rows for the daemon loop
//! - [`history`] - append-only audit of every field mutation
//! - [`incident`] / [`pattern`] / [`escalation`] - failure bookkeeping
//! - [`verify`] - standalone consistency verifier

pub mod backlog;
pub mod db;
pub mod dependency;
pub mod error;
pub mod escalation;
pub mod event;
pub mod history;
pub mod ids;
pub mod incident;
pub mod lock;
pub mod order;
pub mod pattern;
pub mod project;
pub mod schema;
pub mod sqlcheck;
pub mod task;
pub mod transition;
pub mod types;
pub mod verify;

#[doc(hidden)]
pub mod testutil;

// Re-exported so callers can name connection/transaction types in their
// own helper signatures without a direct rusqlite dependency.
pub use rusqlite;

pub use db::{now_iso, Store};
pub use error::{Result, StoreError, TransitionError};
pub use task::{NewTask, Task, TransitionOutcome};
pub use types::{
    BacklogPriority, BacklogStatus, BugPatternStatus, EntityKind, ErrorCategory, EscalationType,
    EventType, Model, OrderStatus, Priority, RecoveryAction, Role, TaskStatus,
};
