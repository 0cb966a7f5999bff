#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn govmig_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_govmig"))
}

fn temp_path(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("govmig-{label}-{}.{extension}", Ulid::new()))
}

fn govmig_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(govmig_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run govmig command {:?}: {err}", args),
    }
}

fn govmig_ok(db_path: &Path, args: &[&str]) -> Value {
    let output = govmig_output(db_path, args);
    assert!(
        output.status.success(),
        "govmig {:?} failed\nstdout={}\nstderr={}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn seeded_db(label: &str) -> PathBuf {
    let db_path = temp_path(label, "sqlite3");
    let status = govmig_ok(&db_path, &["fixture", "seed"]);
    assert_eq!(status["proposals"], 2);
    db_path
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(govmig_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["status", "migrate", "verify", "show", "fixture"] {
        assert!(
            stdout.contains(required),
            "missing subcommand {required} in help output"
        );
    }
}

#[test]
fn status_reports_pending_upgrade_after_seed() {
    let db_path = seeded_db("status");
    let status = govmig_ok(&db_path, &["status"]);

    assert_eq!(status["contract_version"], "gov_state_status.v1");
    assert_eq!(status["module"], "gov");
    assert_eq!(status["from_version"], 2);
    assert_eq!(status["to_version"], 3);
    assert_eq!(status["applied"], Value::Null);
    assert_eq!(status["module_keys"], 3);
    assert_eq!(status["params_present"].as_array().map(Vec::len), Some(3));
}

#[test]
fn dry_run_reports_plan_and_leaves_state_alone() {
    let db_path = seeded_db("dry-run");
    let before = govmig_ok(&db_path, &["status"]);

    let run = govmig_ok(&db_path, &["migrate", "--dry-run"]);
    assert_eq!(run["report"]["status"], "planned");
    assert_eq!(run["report"]["proposals_migrated"], 2);
    assert_eq!(run["verification"]["healthy"], true);

    let after = govmig_ok(&db_path, &["status"]);
    assert_eq!(after["state_digest"], before["state_digest"]);
    assert_eq!(after["applied"], Value::Null);
    assert_eq!(
        run["report"]["pre_digest"], before["state_digest"],
        "report digest should cover the same keys as status"
    );
}

#[test]
fn migrate_rewrites_proposals_and_records_ledger() {
    let db_path = seeded_db("migrate");
    let legacy = govmig_ok(&db_path, &["show", "proposal", "--id", "2"]);
    assert_eq!(legacy["schema"], "v1beta1");
    assert_eq!(legacy["status"], "PROPOSAL_STATUS_DEPOSIT_PERIOD");

    let run = govmig_ok(&db_path, &["migrate"]);
    assert_eq!(run["report"]["status"], "applied");
    assert_eq!(run["report"]["contract_version"], "gov_migration_report.v1");
    assert_eq!(
        run["report"]["content_types"]["/cosmos.gov.v1beta1.TextProposal"],
        1
    );

    let migrated = govmig_ok(&db_path, &["show", "proposal", "--id", "2"]);
    assert_eq!(migrated["schema"], "v1");
    assert_eq!(migrated["id"], 2);
    assert_eq!(migrated["status"], legacy["status"]);
    assert_eq!(migrated["submit_time"], "2001-09-09T01:46:40Z");
    assert_eq!(migrated["submit_time"], legacy["submit_time"]);
    assert_eq!(migrated["voting_end_time"], legacy["voting_end_time"]);
    assert_eq!(migrated["final_tally_result"], legacy["final_tally_result"]);
    assert_eq!(migrated["metadata"], "");

    let message = &migrated["messages"][0];
    assert_eq!(message["type_url"], "/cosmos.gov.v1.MsgExecLegacyContent");
    assert_eq!(
        message["authority"],
        "cosmos10d07y265gmmuvt4z0w9aw880jnsr700j6zn9kn"
    );
    assert_eq!(message["content"], legacy["content"]);
    assert_eq!(message["content"]["title"], "my title 2");

    let params = govmig_ok(&db_path, &["show", "params"]);
    assert_eq!(params["schema"], "v1");
    assert_eq!(params["tallyparams"]["quorum"], "0.334000000000000000");
    assert_eq!(params["votingparams"]["voting_period"], "172800000000000");

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open migrated db: {err}"),
    };
    let ledger_rows: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM module_migrations WHERE module = 'gov' AND to_version = 3",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to query ledger: {err}"),
    };
    assert_eq!(ledger_rows, 1);
}

#[test]
fn second_migrate_is_refused() {
    let db_path = seeded_db("twice");
    govmig_ok(&db_path, &["migrate"]);

    let output = govmig_output(&db_path, &["migrate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("already applied"), "stderr={stderr}");
}

#[test]
fn verify_against_pre_upgrade_copy_is_healthy() {
    let before = seeded_db("verify-before");
    let after = seeded_db("verify-after");
    govmig_ok(&after, &["migrate"]);

    let before_arg = before.to_string_lossy().to_string();
    let report = govmig_ok(&after, &["verify", "--before", &before_arg]);
    assert_eq!(report["contract_version"], "gov_migration_verification.v1");
    assert_eq!(report["healthy"], true);
    assert_eq!(report["proposals_checked"], 2);
}

/// Copies the key-value rows of a seeded state file into a bare file that
/// holds nothing but `kv_state`, the shape of an exported node snapshot.
fn bare_state_copy(seeded: &Path, label: &str) -> PathBuf {
    let path = temp_path(label, "sqlite3");
    let conn = match Connection::open(&path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to create bare state file: {err}"),
    };
    let seeded_arg = seeded.to_string_lossy().to_string();
    if let Err(err) = conn.execute("ATTACH DATABASE ?1 AS seeded", [seeded_arg.as_str()]) {
        panic!("failed to attach seeded db: {err}");
    }
    if let Err(err) = conn.execute_batch(
        "CREATE TABLE kv_state (key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID;
         INSERT INTO kv_state SELECT key, value FROM seeded.kv_state;
         DETACH DATABASE seeded;",
    ) {
        panic!("failed to copy state rows: {err}");
    }
    path
}

fn table_names(path: &Path) -> Vec<String> {
    let conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open {}: {err}", path.display()),
    };
    let mut stmt = match conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name") {
        Ok(stmt) => stmt,
        Err(err) => panic!("failed to prepare table query: {err}"),
    };
    let names = match stmt.query_map([], |row| row.get::<_, String>(0)) {
        Ok(rows) => rows.collect::<rusqlite::Result<Vec<_>>>(),
        Err(err) => panic!("failed to list tables: {err}"),
    };
    match names {
        Ok(names) => names,
        Err(err) => panic!("failed to read table name: {err}"),
    }
}

#[test]
fn verify_leaves_before_file_byte_identical() {
    let seeded = seeded_db("verify-readonly-seed");
    let before = bare_state_copy(&seeded, "verify-readonly-before");
    let after = seeded_db("verify-readonly-after");
    govmig_ok(&after, &["migrate"]);

    let read = |path: &Path| match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    let snapshot = read(&before);

    let before_arg = before.to_string_lossy().to_string();
    let report = govmig_ok(&after, &["verify", "--before", &before_arg]);
    assert_eq!(report["healthy"], true);

    assert!(read(&before) == snapshot, "verify modified the before file");
    assert_eq!(table_names(&before), vec!["kv_state".to_string()]);
}

#[test]
fn verify_rejects_before_file_without_state() {
    let db_path = seeded_db("verify-no-state");
    let empty = temp_path("verify-no-state-before", "sqlite3");
    if let Err(err) = std::fs::write(&empty, b"") {
        panic!("failed to create empty before file: {err}");
    }
    let empty_arg = empty.to_string_lossy().to_string();

    let output = govmig_output(&db_path, &["verify", "--before", &empty_arg]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing kv_state table"), "stderr={stderr}");
}

#[test]
fn verify_flags_unmigrated_state() {
    let before = seeded_db("unmigrated-before");
    let after = seeded_db("unmigrated-after");

    let before_arg = before.to_string_lossy().to_string();
    let output = govmig_output(&after, &["verify", "--before", &before_arg]);
    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["healthy"], false);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("verification failed"), "stderr={stderr}");
}

#[test]
fn verify_requires_existing_before_file() {
    let db_path = seeded_db("verify-missing");
    let missing = temp_path("missing", "sqlite3");
    let missing_arg = missing.to_string_lossy().to_string();

    let output = govmig_output(&db_path, &["verify", "--before", &missing_arg]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr={stderr}");
}

#[test]
fn show_missing_proposal_fails() {
    let db_path = seeded_db("show-missing");
    let output = govmig_output(&db_path, &["show", "proposal", "--id", "99"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("proposal 99 not found"), "stderr={stderr}");
}

#[test]
fn fixture_seed_refuses_populated_state() {
    let db_path = seeded_db("seed-twice");
    let output = govmig_output(&db_path, &["fixture", "seed"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("refusing to seed"), "stderr={stderr}");
}

#[test]
fn config_file_overrides_authority() {
    let db_path = seeded_db("config");
    let config_path = temp_path("config", "json");
    if let Err(err) = std::fs::write(
        &config_path,
        r#"{"authority":"cosmos1operatorauthority","migrate_votes":false}"#,
    ) {
        panic!("failed to write config: {err}");
    }
    let config_arg = config_path.to_string_lossy().to_string();

    govmig_ok(&db_path, &["--config", &config_arg, "migrate"]);
    let migrated = govmig_ok(&db_path, &["show", "proposal", "--id", "1"]);
    assert_eq!(
        migrated["messages"][0]["authority"],
        "cosmos1operatorauthority"
    );
}

#[test]
fn invalid_config_is_rejected() {
    let db_path = temp_path("bad-config", "sqlite3");
    let config_path = temp_path("bad-config", "json");
    if let Err(err) = std::fs::write(
        &config_path,
        r#"{"params_subspace_prefix":"s/k:gov/params/"}"#,
    ) {
        panic!("failed to write config: {err}");
    }
    let config_arg = config_path.to_string_lossy().to_string();

    let output = govmig_output(&db_path, &["--config", &config_arg, "status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("MUST NOT overlap"), "stderr={stderr}");
}
