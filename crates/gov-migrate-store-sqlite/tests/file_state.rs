#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};

use gov_migrate_core::{KvStore, MigrationConfig, MigrationStatus, Migrator, WriteBatch};
use gov_migrate_store_sqlite::{run_module_migration, seed_legacy_fixture, SqliteStateStore};
use ulid::Ulid;

fn must<T>(result: anyhow::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("govmig-state-{}.sqlite3", Ulid::new()))
}

fn open(path: &Path) -> SqliteStateStore {
    let store = must(SqliteStateStore::open(path));
    must(store.migrate());
    store
}

#[test]
fn applied_upgrade_survives_reopen() {
    let path = temp_db_path();
    let config = MigrationConfig::v046();

    let run = {
        let mut store = open(&path);
        must(seed_legacy_fixture(&mut store, &config));
        must(run_module_migration(&mut store, &Migrator::v046(), false))
    };
    assert_eq!(run.report.status, MigrationStatus::Applied);

    let store = open(&path);
    let status = must(store.status(&config));
    let applied = match status.applied {
        Some(entry) => entry,
        None => panic!("ledger entry missing after reopen"),
    };
    assert_eq!(applied.run_id, run.report.run_id);
    assert_eq!(applied.post_digest, run.report.post_digest);
    assert_eq!(status.state_digest, run.report.post_digest);
    assert_eq!(status.proposals, 2);
    assert_eq!(status.params_present.len(), 3);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn failed_run_leaves_file_untouched() {
    let path = temp_db_path();
    let config = MigrationConfig::v046();
    let mut store = open(&path);
    must(seed_legacy_fixture(&mut store, &config));

    let tally_key = config.params_namespace().key(b"tallyparams");
    let mut batch = gov_migrate_core::WriteBatch::new();
    batch.set(tally_key, b"{\"quorum\":\"not a number\"}".to_vec());
    if let Err(err) = store.commit(batch) {
        panic!("test failure: {err}");
    }
    let before = must(store.status(&config));

    let err = match run_module_migration(&mut store, &Migrator::v046(), false) {
        Ok(_) => panic!("expected corrupt tally params to abort the upgrade"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("tallyparams"));

    drop(store);
    let reopened = open(&path);
    let after = must(reopened.status(&config));
    assert_eq!(after.state_digest, before.state_digest);
    assert_eq!(after.applied, None);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn read_only_open_never_writes_the_file() {
    let path = temp_db_path();
    let config = MigrationConfig::v046();
    {
        let mut store = open(&path);
        must(seed_legacy_fixture(&mut store, &config));
    }
    let bytes_before = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => panic!("failed to read state file: {err}"),
    };

    {
        let mut store = must(SqliteStateStore::open_read_only(&path));
        let module = match store.scan_prefix(config.module_namespace().prefix()) {
            Ok(pairs) => pairs,
            Err(err) => panic!("scan failed: {err}"),
        };
        assert_eq!(module.len(), 3);

        let mut batch = WriteBatch::new();
        batch.set(b"s/k:gov/extra".to_vec(), b"x".to_vec());
        assert!(store.commit(batch).is_err(), "read-only store accepted a write");
    }

    let bytes_after = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => panic!("failed to re-read state file: {err}"),
    };
    assert!(bytes_before == bytes_after, "state file changed on read-only open");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn read_only_open_rejects_files_without_state() {
    let path = temp_db_path();
    {
        let conn = match rusqlite::Connection::open(&path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to create sqlite file: {err}"),
        };
        if let Err(err) = conn.execute_batch("CREATE TABLE unrelated (id INTEGER PRIMARY KEY);") {
            panic!("failed to create table: {err}");
        }
    }

    let err = match SqliteStateStore::open_read_only(&path) {
        Ok(_) => panic!("expected a file without kv_state to be rejected"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("missing kv_state table"));

    let _ = std::fs::remove_file(&path);
}
