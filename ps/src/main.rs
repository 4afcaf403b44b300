//! pmstore maintenance binary: init / verify / migrate.

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::info;

use pmstore::Store;

mod cli;
use cli::{Cli, Command};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init => {
            let store = Store::open(&cli.db).context("Failed to open database")?;
            println!("Initialized store at {}", store.path().display());
            Ok(())
        }
        Command::Verify => {
            let store = Store::open(&cli.db).context("Failed to open database")?;
            let findings = store
                .read(|conn| pmstore::verify::verify_consistency(conn))
                .context("Consistency check failed")?;

            if findings.is_empty() {
                println!("{}", "OK: no inconsistencies found".green());
                Ok(())
            } else {
                for finding in &findings {
                    println!("{} {}", format!("[{}]", finding.code).red(), finding.message);
                }
                std::process::exit(1);
            }
        }
        Command::Migrate {
            migrations_dir,
            force,
        } => {
            let store = Store::open(&cli.db).context("Failed to open database")?;
            let applied = store
                .run_migrations(&migrations_dir, force)
                .context("Migration failed")?;
            if applied.is_empty() {
                println!("All migrations already applied");
            } else {
                for version in &applied {
                    info!(version, "migration applied");
                    println!("Applied migration {}", version);
                }
            }
            Ok(())
        }
    }
}
