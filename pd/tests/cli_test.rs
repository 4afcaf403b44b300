//! CLI smoke tests for the pd binary, using the script runner provider so
//! no network or API key is involved.

use assert_cmd::Command;
use predicates::prelude::*;

fn pd() -> Command {
    Command::cargo_bin("pd").unwrap()
}

#[test]
fn help_lists_subcommands() {
    pd().arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("review"))
        .stdout(predicate::str::contains("backlog"));
}

#[test]
fn init_then_status_shows_empty_project() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pm.db");

    pd().args(["init", "demo", "--path"])
        .arg(dir.path())
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered project demo"));

    pd().args(["status", "demo"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success();
}

#[test]
fn init_rejects_bad_project_id() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pm.db");

    pd().args(["init", "9bad"])
        .arg("--db")
        .arg(&db)
        .assert()
        .failure();
}

#[test]
fn backlog_add_list_to_order_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pm.db");

    pd().args(["init", "demo"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success();

    pd().args([
        "backlog",
        "add",
        "demo",
        "Ship feature X",
        "--priority",
        "High",
    ])
    .arg("--db")
    .arg(&db)
    .assert()
    .success()
    .stdout(predicate::str::contains("BACKLOG_001"));

    pd().args(["backlog", "list", "demo"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Ship feature X"));

    pd().args(["backlog", "to-order", "demo", "BACKLOG_001"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("ORDER_001"));
}

#[test]
fn launch_without_tasks_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pm.db");

    pd().args(["init", "demo"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success();

    pd().args(["launch", "demo", "ORDER_001", "--dry-run"])
        .arg("--db")
        .arg(&db)
        .arg("--projects-root")
        .arg(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("No launchable tasks"));
}

#[test]
fn heartbeat_missing_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pm.db");

    pd().args(["heartbeat", "demo", "ORDER_001"])
        .arg("--db")
        .arg(&db)
        .arg("--projects-root")
        .arg(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("No heartbeat"));
}

#[test]
fn plan_via_script_provider_creates_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("pm.db");

    // Config with the script provider so planning needs no API
    let plan_json = r#"{"goal": {"summary": "ship"}, "requirements": {},
        "tasks": [{"title": "Only task", "description": "do it",
                   "priority": "P1", "model": "Sonnet",
                   "depends_on": [], "target_files": ["src/x.py"]}]}"#;
    let reply = dir.path().join("reply.json");
    std::fs::write(&reply, plan_json).unwrap();
    let config_path = dir.path().join("pd.yml");
    std::fs::write(
        &config_path,
        format!(
            "llm:\n  provider: script\n  script-command: \"cat > /dev/null; cat {}\"\n",
            reply.display()
        ),
    )
    .unwrap();

    let description = dir.path().join("order.md");
    std::fs::write(&description, "# Ship it\n\nShip the thing.\n").unwrap();

    pd().args(["init", "demo"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success();

    pd().args(["plan", "demo", "ORDER_001"])
        .arg("--description")
        .arg(&description)
        .arg("--config")
        .arg(&config_path)
        .arg("--db")
        .arg(&db)
        .arg("--projects-root")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 task(s)"));

    pd().args(["status", "demo"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK_001"))
        .stdout(predicate::str::contains("Only task"));
}
