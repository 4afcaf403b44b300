//! pd - CLI entry point.
//!
//! Exit codes: the daemon returns 0 on clean completion and 1 on residual
//! errors; the one-shot launcher returns 0 iff work was launched (or a
//! dry run matched candidates); worker, reviewer, and planner subprocesses
//! return 0 on declared success and 1 on a captured failure.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::info;

use pmdaemon::cli::{BacklogCommand, Cli, Command};
use pmdaemon::config::Config;
use pmdaemon::daemon::{read_heartbeat, Daemon, DaemonOptions};
use pmdaemon::runner::create_runner;
use pmdaemon::{detector, paths, pm, review, worker};
use pmstore::{backlog, order, project, task, Store};

fn setup_logging(verbose: bool) {
    let default_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    if let Some(root) = &cli.projects_root {
        config.storage.projects_root = root.clone();
    }

    let exit_code = dispatch(cli, config).await?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn dispatch(cli: Cli, config: Config) -> Result<i32> {
    match cli.command {
        Command::Init { project, path } => {
            let store = Store::open(&config.storage.db_path)?;
            let created = store.with_txn(|txn| {
                project::create_project(txn, &project, &project, &path.to_string_lossy())
            })?;
            println!("Registered project {} at {}", created.id, created.path);
            Ok(0)
        }

        Command::Daemon {
            project,
            order,
            max_workers,
            model,
            no_review,
            dry_run,
        } => {
            let store = Store::open(&config.storage.db_path)?;
            let daemon = Daemon::new(
                store,
                config,
                project,
                order,
                DaemonOptions {
                    max_workers,
                    model_override: model,
                    no_review,
                    dry_run,
                },
            )?;
            let result = daemon.run().await?;
            if result.errors.is_empty() {
                Ok(0)
            } else {
                for error in &result.errors {
                    eprintln!("{} {}", "error:".red(), error);
                }
                Ok(1)
            }
        }

        Command::Launch {
            project,
            order,
            max_workers,
            dry_run,
        } => {
            let store = Store::open(&config.storage.db_path)?;
            let candidates = detector::find_launchable(&store, &project, &order, max_workers)?;
            if candidates.is_empty() {
                println!("No launchable tasks");
                return Ok(1);
            }

            if dry_run {
                println!("Launchable tasks:");
                for t in &candidates {
                    println!(
                        "  {} [{}] {} (files: {})",
                        t.id,
                        t.priority,
                        t.title,
                        t.target_files.join(", ")
                    );
                }
                return Ok(0);
            }

            // One-shot admission: a single daemon tick without the loop
            let daemon = Daemon::new(
                store,
                config,
                project,
                order,
                DaemonOptions {
                    max_workers: Some(max_workers),
                    model_override: None,
                    no_review: true,
                    dry_run: false,
                },
            )?;
            let result = daemon.run_once()?;
            println!("Launched {} worker(s)", result);
            Ok(if result > 0 { 0 } else { 1 })
        }

        Command::Plan {
            project,
            order,
            description,
            timeout,
        } => {
            let store = Store::open(&config.storage.db_path)?;
            let description_path = description.unwrap_or_else(|| {
                paths::order_description_file(&config.storage.projects_root, &project, &order)
            });
            let text = std::fs::read_to_string(&description_path).context(format!(
                "Failed to read order description {}",
                description_path.display()
            ))?;

            let runner = create_runner(&config.llm)?;
            let planner = pm::Planner::new(store, runner, config);
            let summary = planner
                .plan(&project, &order, &text, Duration::from_secs(timeout))
                .await?;

            println!(
                "Planned {}: {} task(s), score {}",
                summary.order_id,
                summary.task_ids.len(),
                summary.score
            );
            for warning in &summary.warnings {
                println!("  {} {}", "warning:".yellow(), warning);
            }
            Ok(0)
        }

        Command::Worker {
            project,
            task,
            model,
            timeout,
        } => {
            let store = Store::open(&config.storage.db_path)?;
            let runner = create_runner(&config.llm)?;
            let executor = worker::WorkerExecutor::new(
                store,
                runner,
                config,
                project,
                task,
                model,
                Duration::from_secs(timeout),
            );
            let summary = executor.execute().await;
            if summary.success {
                info!(task_id = %summary.task_id, "worker finished");
                Ok(0)
            } else {
                eprintln!(
                    "{} worker failed: {}",
                    "error:".red(),
                    summary.error.as_deref().unwrap_or("unknown")
                );
                if let Some(recovery) = &summary.recovery {
                    eprintln!(
                        "  recovery: {} -> {}",
                        recovery.action_taken, recovery.next_status
                    );
                }
                Ok(1)
            }
        }

        Command::Review {
            project,
            task,
            model,
            timeout,
        } => {
            let store = Store::open(&config.storage.db_path)?;
            let runner = create_runner(&config.llm)?;
            let processor = review::ReviewProcessor::new(
                store,
                runner,
                config,
                project,
                task,
                model,
                Duration::from_secs(timeout),
            );
            match processor.process().await {
                Ok(summary) => {
                    println!(
                        "{}: {} -> {}",
                        summary.task_id, summary.verdict, summary.final_status
                    );
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("{} review failed: {:#}", "error:".red(), e);
                    Ok(1)
                }
            }
        }

        Command::Status { project, order } => {
            let store = Store::open(&config.storage.db_path)?;
            print_status(&store, &project, order.as_deref())?;
            Ok(0)
        }

        Command::Heartbeat { project, order } => {
            let hb_path = paths::OrderPaths::new(&config.storage.projects_root, &project, &order)
                .heartbeat_file();
            match read_heartbeat(&hb_path) {
                Some(info) => {
                    let liveness = if info.is_alive {
                        "alive".green()
                    } else {
                        "stale".red()
                    };
                    println!(
                        "daemon pid {} [{}] age {}s, {} active worker(s), interval {:.1}s",
                        info.heartbeat.pid,
                        liveness,
                        info.age_seconds,
                        info.heartbeat.active_workers,
                        info.heartbeat.adaptive_poll_interval
                    );
                    Ok(if info.is_alive { 0 } else { 1 })
                }
                None => {
                    println!("No heartbeat for {} / {}", project, order);
                    Ok(1)
                }
            }
        }

        Command::Backlog(cmd) => run_backlog(cmd, &config),
    }
}

fn run_backlog(cmd: BacklogCommand, config: &Config) -> Result<i32> {
    let store = Store::open(&config.storage.db_path)?;
    match cmd {
        BacklogCommand::Add {
            project,
            title,
            description,
            category,
            priority,
        } => {
            let item = store.with_txn(|txn| {
                backlog::add_item(
                    txn,
                    &project,
                    &title,
                    description.as_deref(),
                    category.as_deref(),
                    priority,
                )
            })?;
            println!("Added {} [{}] {}", item.id, item.priority, item.title);
            Ok(0)
        }
        BacklogCommand::List { project } => {
            let items = store.read(|conn| backlog::list_items(conn, &project, None))?;
            if items.is_empty() {
                println!("Backlog is empty");
            }
            for item in items {
                println!(
                    "{} [{}] {} - {}{}",
                    item.id,
                    item.priority,
                    item.status,
                    item.title,
                    item.related_order_id
                        .map(|o| format!(" ({})", o))
                        .unwrap_or_default()
                );
            }
            Ok(0)
        }
        BacklogCommand::Update {
            project,
            backlog_id,
            status,
        } => {
            store.with_txn(|txn| {
                backlog::update_status(
                    txn,
                    &project,
                    &backlog_id,
                    status,
                    pmstore::Role::Any,
                    "CLI",
                    Some("manual status update"),
                )
            })?;
            println!("{} -> {}", backlog_id, status);
            Ok(0)
        }
        BacklogCommand::ToOrder {
            project,
            backlog_id,
        } => {
            let new_order = store.with_txn(|txn| backlog::to_order(txn, &project, &backlog_id))?;
            println!("Created {} from {}", new_order.id, backlog_id);
            println!(
                "Next: pd plan {} {} --description <order description file>",
                project, new_order.id
            );
            Ok(0)
        }
    }
}

fn print_status(store: &Store, project_id: &str, order_filter: Option<&str>) -> Result<()> {
    let orders = store.read(|conn| order::list_orders(conn, project_id))?;
    for o in orders {
        if let Some(filter) = order_filter {
            if o.id != filter {
                continue;
            }
        }

        println!("{} [{}] {} - {}", o.id.bold(), o.priority, o.status, o.title);
        let tasks = store.read(|conn| task::list_tasks(conn, project_id, &o.id, None))?;
        for t in tasks {
            let status = match t.status {
                pmstore::TaskStatus::Completed => t.status.to_string().green(),
                pmstore::TaskStatus::Rejected | pmstore::TaskStatus::Cancelled => {
                    t.status.to_string().red()
                }
                pmstore::TaskStatus::InProgress => t.status.to_string().cyan(),
                _ => t.status.to_string().normal(),
            };
            let rework = if t.reject_count > 0 {
                format!(" (rework x{})", t.reject_count)
            } else {
                String::new()
            };
            println!("  {} [{}] {} - {}{}", t.id, t.priority, status, t.title, rework);
        }
    }
    Ok(())
}
