use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn swarm() -> Command {
    let mut cmd = Command::cargo_bin("swarm-engine").unwrap();
    cmd.env_remove("DATABASE_URL")
        .env_remove("SWARM_DATABASE_URL")
        .env_remove("SWARM_JUDGE_URL")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("swarm.toml");
    let body = format!(
        "agents_dir = \"{agents}\"\n{extra}\n[lease]\npool_size = 2\nmax_slot_index = 2\nlock_dir = \"{locks}\"\n",
        agents = dir.join("agents").display(),
        locks = dir.join("locks").display(),
        extra = extra,
    );
    std::fs::create_dir_all(dir.join("agents")).unwrap();
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    swarm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ticket scheduling engine"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("lease"));
}

#[test]
fn test_plan_prints_order_and_groups() {
    let temp = TempDir::new().unwrap();
    let workflow = temp.path().join("release.yaml");
    std::fs::write(
        &workflow,
        r#"
name: release
steps:
  - id: build
    agent: builder
  - id: unit
    agent: tester
    depends_on: [build]
  - id: lint
    agent: linter
    depends_on: [build]
  - id: publish
    agent: publisher
    depends_on: [unit, lint]
"#,
    )
    .unwrap();

    swarm()
        .arg("plan")
        .arg(&workflow)
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow: release"))
        .stdout(predicate::str::contains("Order: build -> unit -> lint -> publish"))
        .stdout(predicate::str::contains("(after start): build"))
        .stdout(predicate::str::contains("(after build): unit, lint"))
        .stdout(predicate::str::contains("(after lint, unit): publish"));
}

#[test]
fn test_plan_rejects_cycles() {
    let temp = TempDir::new().unwrap();
    let workflow = temp.path().join("loop.yaml");
    std::fs::write(
        &workflow,
        "steps:\n  - id: a\n    agent: x\n    depends_on: [b]\n  - id: b\n    agent: x\n    depends_on: [a]\n",
    )
    .unwrap();

    swarm()
        .arg("plan")
        .arg(&workflow)
        .assert()
        .code(6)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_missing_config_file_is_a_config_error() {
    swarm()
        .args(["lease", "list", "--config", "/nonexistent/swarm.toml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to load settings"));
}

#[test]
fn test_lease_list_and_reclaim() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");
    let locks = temp.path().join("locks");
    std::fs::create_dir_all(&locks).unwrap();
    let host = hostname::get().unwrap().into_string().unwrap();
    std::fs::write(
        locks.join("slot-2.lock"),
        format!(
            r#"{{"slot":2,"process_id":999999999,"hostname":"{}","holder":"00000000-0000-0000-0000-000000000000","acquired_at":"2026-01-01T00:00:00Z"}}"#,
            host
        ),
    )
    .unwrap();

    swarm()
        .args(["lease", "list", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("slot 1\tfree"))
        .stdout(predicate::str::contains("slot 2\theld\tpid 999999999"))
        .stdout(predicate::str::contains("(stale)"));

    swarm()
        .args(["lease", "reclaim", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Reclaimed slot 2"));

    swarm()
        .args(["lease", "reclaim", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No stale locks"));
}

#[test]
fn test_run_once_with_seeded_tickets() {
    let temp = TempDir::new().unwrap();
    let config = write_config(
        temp.path(),
        "[engine]\npoll_interval = \"20ms\"\n\n[executor]\ndefault_mode = \"local\"\n",
    );

    let code = temp.path().join("agents").join("echo-code");
    std::fs::create_dir_all(&code).unwrap();
    std::fs::write(code.join("run.sh"), "cp \"$SWARM_INPUT\" \"$SWARM_OUTPUT\"\n").unwrap();
    std::fs::write(
        temp.path().join("agents").join("echo.yaml"),
        format!(
            "name: echo\nversion: 1.0.0\nentry: sh run.sh\ncode_dir: {}\n",
            code.display()
        ),
    )
    .unwrap();

    let tickets = temp.path().join("tickets.yaml");
    std::fs::write(
        &tickets,
        r#"
- id: T-1
  state: ready
  assignee_id: echo
  assignee_type: agent
  inputs: {message: hello}
- id: T-2
  state: blocked
  depends_on: [T-1]
  assignee_id: echo
  assignee_type: agent
- id: T-3
  state: ready
  assignee_id: missing
  assignee_type: agent
"#,
    )
    .unwrap();

    swarm()
        .args(["run", "--once", "-c"])
        .arg(&config)
        .arg("--tickets")
        .arg(&tickets)
        .assert()
        .success()
        .stdout(predicate::str::contains("T-1\tdone"))
        .stdout(predicate::str::contains("T-2\tdone"))
        .stdout(predicate::str::contains("T-3\ton_hold"));
}
