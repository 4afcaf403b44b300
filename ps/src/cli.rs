//! CLI definitions for the pmstore maintenance binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pmstore - database maintenance for the PM orchestration framework
#[derive(Parser)]
#[command(
    name = "pmstore",
    about = "Initialize, verify, and migrate the orchestration database",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Path to the database file
    #[arg(short, long, global = true, default_value = "pm.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the database and apply the embedded schema
    Init,

    /// Run the consistency verifier and report findings
    Verify,

    /// Apply pending SQL migrations from a directory
    Migrate {
        /// Directory containing {version}_{description}.sql files
        #[arg(value_name = "DIR")]
        migrations_dir: PathBuf,

        /// Apply even while tasks are IN_PROGRESS
        #[arg(long)]
        force: bool,
    },
}
