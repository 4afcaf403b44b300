//! pmdaemon - autonomous PM orchestration daemon.
//!
//! A resident daemon drives a multi-role pipeline over a shared relational
//! store (pmstore): the PM planner decomposes orders into dependent tasks,
//! worker subprocesses execute tasks, reviewer subprocesses judge reports,
//! and the daemon loop reaps, heals crashes, resolves dependencies, and
//! admits new work under file-lock and resource constraints.
//!
//! # Modules
//!
//! - [`daemon`] - the resident loop, heartbeat, single-instance guard
//! - [`supervisor`] - subprocess lifecycle and the four health checks
//! - [`detector`] - ready-task selection under all constraints
//! - [`resolver`] - BLOCKED -> QUEUED dependency resolution
//! - [`monitor`] - host resource sampling and admission verdicts
//! - [`poller`] - adaptive poll interval
//! - [`pm`] - planner and redesign escalation
//! - [`worker`] - per-task execution, verification, AutoRecovery
//! - [`review`] - verdict processing and the rework loop
//! - [`runner`] - the model invocation port (Anthropic / script)

pub mod cli;
pub mod config;
pub mod daemon;
pub mod detector;
pub mod monitor;
pub mod paths;
pub mod permissions;
pub mod pm;
pub mod poller;
pub mod prompts;
pub mod resolver;
pub mod review;
pub mod runner;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use daemon::{Daemon, DaemonOptions, DaemonRunResult};
pub use review::{ReviewProcessor, ReviewSummary};
pub use runner::{create_runner, AnthropicRunner, Runner, RunnerError, RunnerOutcome, RunnerRequest, ScriptRunner};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::{WorkerExecutor, WorkerRunSummary};
