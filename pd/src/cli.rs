//! CLI command definitions and subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pmstore::{BacklogPriority, Model};

/// pmdaemon - autonomous PM orchestration daemon
#[derive(Parser)]
#[command(
    name = "pd",
    about = "Plans orders, launches workers, reviews results, heals crashes",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file (overrides config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Root of the PROJECTS/ tree (overrides config)
    #[arg(long = "projects-root", global = true)]
    pub projects_root: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register a project
    Init {
        /// Project id (letters, digits, underscores; must not start with a digit)
        project: String,

        /// Filesystem path of the project's working tree
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },

    /// Run the resident daemon for one order until it completes
    Daemon {
        project: String,
        order: String,

        /// Maximum concurrent workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Model for every worker (overrides task recommendations)
        #[arg(long)]
        model: Option<Model>,

        /// Do not spawn reviewers
        #[arg(long)]
        no_review: bool,

        /// Detect and report candidates without launching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// One-shot launcher: admit ready tasks once, then exit
    Launch {
        project: String,
        order: String,

        /// Maximum tasks to launch
        #[arg(long, default_value = "5")]
        max_workers: usize,

        /// Show the launch plan without launching
        #[arg(long)]
        dry_run: bool,
    },

    /// PM: plan an order from its description document
    Plan {
        project: String,
        order: String,

        /// Description file; defaults to PROJECTS/<project>/ORDERS/<order>.md
        #[arg(long)]
        description: Option<PathBuf>,

        /// Runner timeout in seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Execute one task as a worker (spawned by the daemon)
    Worker {
        project: String,
        task: String,

        /// Model override
        #[arg(long)]
        model: Option<Model>,

        /// Runner timeout in seconds
        #[arg(long, default_value = "1800")]
        timeout: u64,
    },

    /// Review one DONE task (spawned by the daemon)
    Review {
        project: String,
        task: String,

        /// Model override
        #[arg(long)]
        model: Option<Model>,

        /// Runner timeout in seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Show order/task status
    Status {
        project: String,

        /// Restrict to one order
        #[arg(long)]
        order: Option<String>,
    },

    /// Read the daemon heartbeat for an order
    Heartbeat {
        project: String,
        order: String,
    },

    /// Backlog intake and conversion
    #[command(subcommand)]
    Backlog(BacklogCommand),
}

#[derive(Subcommand)]
pub enum BacklogCommand {
    /// Add a backlog item
    Add {
        project: String,
        title: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value = "Medium")]
        priority: BacklogPriority,
    },

    /// List backlog items
    List {
        project: String,
    },

    /// Update a backlog item's status
    Update {
        project: String,
        backlog_id: String,

        /// New status (TODO, IN_PROGRESS, DONE, CANCELED, EXTERNAL)
        #[arg(long)]
        status: pmstore::BacklogStatus,
    },

    /// Convert a TODO item into a new order
    ToOrder {
        project: String,
        backlog_id: String,
    },
}
