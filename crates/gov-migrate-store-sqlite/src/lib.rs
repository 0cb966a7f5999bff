#![allow(clippy::missing_errors_doc)]

//! SQLite-backed node state for the governance upgrade.
//!
//! The whole ordered keyspace lives in one `kv_state` table. A migration
//! batch and its ledger row are written in a single SQLite transaction, so
//! the file holds either the complete pre-upgrade or the complete
//! post-upgrade state, and a second run is refused by the ledger's key.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use gov_migrate_core::fixtures::seed_scenario;
use gov_migrate_core::keys::{is_proposal_key, is_vote_key};
use gov_migrate_core::params::{DEPOSIT_PARAMS_KEY, TALLY_PARAMS_KEY, VOTING_PARAMS_KEY};
use gov_migrate_core::store::{prefix_upper_bound, snapshot_prefixes, state_digest, KvPair};
use gov_migrate_core::{
    format_rfc3339, now_utc, verify_migration, KvStore, MigrationConfig, MigrationReport,
    MigrationStatus, Migrator, StoreError, VerificationReport, WriteBatch,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

const STATE_SCHEMA_VERSION: i64 = 1;
pub const STATUS_CONTRACT_VERSION: &str = "gov_state_status.v1";

const SCHEMA_STATE_V1: &str = r"
CREATE TABLE IF NOT EXISTS kv_state (
  key BLOB PRIMARY KEY,
  value BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS module_migrations (
  module TEXT NOT NULL,
  from_version INTEGER NOT NULL CHECK (from_version >= 0),
  to_version INTEGER NOT NULL CHECK (to_version > from_version),
  run_id TEXT NOT NULL UNIQUE,
  applied_at TEXT NOT NULL,
  proposals_migrated INTEGER NOT NULL CHECK (proposals_migrated >= 0),
  votes_migrated INTEGER NOT NULL CHECK (votes_migrated >= 0),
  post_digest TEXT NOT NULL,
  PRIMARY KEY (module, to_version)
);

CREATE TRIGGER IF NOT EXISTS trg_module_migrations_no_update
BEFORE UPDATE ON module_migrations
BEGIN
  SELECT RAISE(FAIL, 'module_migrations is append-only');
END;
";

pub struct SqliteStateStore {
    conn: Connection,
}

/// One applied module upgrade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub module: String,
    pub from_version: u64,
    pub to_version: u64,
    pub run_id: String,
    pub applied_at: String,
    pub proposals_migrated: u64,
    pub votes_migrated: u64,
    pub post_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateStatus {
    pub contract_version: String,
    pub module: String,
    pub from_version: u64,
    pub to_version: u64,
    pub applied: Option<LedgerEntry>,
    pub module_keys: u64,
    pub proposals: u64,
    pub votes: u64,
    pub params_present: Vec<String>,
    pub state_digest: String,
}

/// Result of [`run_module_migration`]: the driver's report plus the audit of
/// the state it produced (or would produce, for a dry run).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRun {
    pub report: MigrationReport,
    pub verification: VerificationReport,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens an existing state file for reading only. Pragmas and schema
    /// setup are skipped, so the file is left byte-for-byte as found.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).with_context(|| {
            format!("failed to open sqlite database at {} read-only", path.display())
        })?;

        let has_state: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'kv_state')",
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to inspect schema of {}", path.display()))?;
        if !has_state {
            bail!("{} holds no governance state (missing kv_state table)", path.display());
        }

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STATE_V1)
            .context("failed to apply state schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STATE_SCHEMA_VERSION, now],
            )
            .context("failed to register state schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Applies `batch` and records `report` in the ledger inside one
    /// transaction. Any failure, including a ledger conflict, rolls back
    /// every write.
    pub fn commit_migration(&mut self, batch: WriteBatch, report: &MigrationReport) -> Result<LedgerEntry> {
        let applied_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let entry = LedgerEntry {
            module: report.module.clone(),
            from_version: report.from_version,
            to_version: report.to_version,
            run_id: report.run_id.clone(),
            applied_at,
            proposals_migrated: report.proposals_migrated,
            votes_migrated: report.votes_migrated,
            post_digest: report.post_digest.clone(),
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start migration transaction")?;

        apply_batch(&tx, batch).context("failed to stage migration batch")?;

        tx.execute(
            "INSERT INTO module_migrations(
                module, from_version, to_version, run_id, applied_at,
                proposals_migrated, votes_migrated, post_digest
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.module,
                to_sql_int(entry.from_version)?,
                to_sql_int(entry.to_version)?,
                entry.run_id,
                entry.applied_at,
                to_sql_int(entry.proposals_migrated)?,
                to_sql_int(entry.votes_migrated)?,
                entry.post_digest,
            ],
        )
        .with_context(|| {
            format!(
                "failed to record migration of module {} to version {} (already applied?)",
                entry.module, entry.to_version
            )
        })?;

        tx.commit().context("failed to commit migration transaction")?;
        Ok(entry)
    }

    pub fn applied_migration(&self, module: &str, to_version: u64) -> Result<Option<LedgerEntry>> {
        self.conn
            .query_row(
                "SELECT module, from_version, to_version, run_id, applied_at,
                        proposals_migrated, votes_migrated, post_digest
                 FROM module_migrations
                 WHERE module = ?1 AND to_version = ?2",
                params![module, to_sql_int(to_version)?],
                ledger_row,
            )
            .optional()
            .context("failed to query module_migrations")?
            .transpose()
    }

    pub fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT module, from_version, to_version, run_id, applied_at,
                        proposals_migrated, votes_migrated, post_digest
                 FROM module_migrations
                 ORDER BY applied_at ASC, module ASC",
            )
            .context("failed to prepare ledger query")?;
        let rows = stmt
            .query_map([], ledger_row)
            .context("failed to query ledger")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode ledger row")??);
        }
        Ok(entries)
    }

    pub fn count_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let count: i64 = match prefix_upper_bound(prefix) {
            Some(upper) => self.conn.query_row(
                "SELECT COUNT(*) FROM kv_state WHERE key >= ?1 AND key < ?2",
                params![prefix, upper],
                |row| row.get(0),
            ),
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM kv_state WHERE key >= ?1",
                params![prefix],
                |row| row.get(0),
            ),
        }
        .context("failed to count kv_state keys")?;
        u64::try_from(count).with_context(|| format!("invalid kv_state key count: {count}"))
    }

    pub fn status(&self, config: &MigrationConfig) -> Result<StateStatus> {
        let module = config.module_namespace();
        let subspace = config.params_namespace();
        let module_pairs = module.scan(self, b"")?;

        let proposals = module_pairs.iter().filter(|(key, _)| is_proposal_key(key)).count();
        let votes = module_pairs.iter().filter(|(key, _)| is_vote_key(key)).count();
        let mut params_present = Vec::new();
        for key in [DEPOSIT_PARAMS_KEY, VOTING_PARAMS_KEY, TALLY_PARAMS_KEY] {
            if self.get(&subspace.key(key.as_bytes()))?.is_some() {
                params_present.push(key.to_string());
            }
        }

        Ok(StateStatus {
            contract_version: STATUS_CONTRACT_VERSION.to_string(),
            module: config.module.clone(),
            from_version: config.from_version,
            to_version: config.to_version,
            applied: self.applied_migration(&config.module, config.to_version)?,
            module_keys: self.count_prefix(module.prefix())?,
            proposals: u64::try_from(proposals).context("proposal count overflow")?,
            votes: u64::try_from(votes).context("vote count overflow")?,
            params_present,
            state_digest: state_digest(self, &[module.prefix(), subspace.prefix()])?,
        })
    }
}

impl KvStore for SqliteStateStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend_error)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let upper = prefix_upper_bound(prefix);
        let sql = if upper.is_some() {
            "SELECT key, value FROM kv_state WHERE key >= ?1 AND key < ?2 ORDER BY key ASC"
        } else {
            "SELECT key, value FROM kv_state WHERE key >= ?1 ORDER BY key ASC"
        };
        let mut stmt = self.conn.prepare(sql).map_err(backend_error)?;
        let read = |row: &rusqlite::Row<'_>| -> rusqlite::Result<KvPair> { Ok((row.get(0)?, row.get(1)?)) };
        let rows = match &upper {
            Some(upper) => stmt.query_map(params![prefix, upper], read),
            None => stmt.query_map(params![prefix], read),
        }
        .map_err(backend_error)?;

        let pairs = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend_error)?;
        Ok(pairs)
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(backend_error)?;
        apply_batch(&tx, batch).map_err(backend_error)?;
        tx.commit().map_err(backend_error)
    }
}

fn apply_batch(conn: &Connection, batch: WriteBatch) -> rusqlite::Result<()> {
    let mut upsert = conn.prepare_cached(
        "INSERT INTO kv_state(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )?;
    let mut delete = conn.prepare_cached("DELETE FROM kv_state WHERE key = ?1")?;
    for (key, value) in batch.into_ops() {
        match value {
            Some(value) => upsert.execute(params![key, value])?,
            None => delete.execute(params![key])?,
        };
    }
    Ok(())
}

#[allow(clippy::needless_pass_by_value)]
fn backend_error(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} does not fit in an sqlite integer"))
}

fn from_sql_int(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("invalid {column}: {value}"))
}

fn ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<LedgerEntry>> {
    let from_version: i64 = row.get(1)?;
    let to_version: i64 = row.get(2)?;
    let proposals: i64 = row.get(5)?;
    let votes: i64 = row.get(6)?;
    Ok(ledger_entry(
        row.get(0)?,
        [from_version, to_version, proposals, votes],
        row.get(3)?,
        row.get(4)?,
        row.get(7)?,
    ))
}

fn ledger_entry(
    module: String,
    [from_version, to_version, proposals, votes]: [i64; 4],
    run_id: String,
    applied_at: String,
    post_digest: String,
) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        module,
        from_version: from_sql_int(from_version, "from_version")?,
        to_version: from_sql_int(to_version, "to_version")?,
        run_id,
        applied_at,
        proposals_migrated: from_sql_int(proposals, "proposals_migrated")?,
        votes_migrated: from_sql_int(votes, "votes_migrated")?,
        post_digest,
    })
}

/// Plans the upgrade, audits the projected state against a snapshot of the
/// current one, and (unless `dry_run`) commits batch and ledger row together.
///
/// Refuses to run when the ledger already records this upgrade, and refuses
/// to commit a plan whose audit is unhealthy.
pub fn run_module_migration(
    store: &mut SqliteStateStore,
    migrator: &Migrator,
    dry_run: bool,
) -> Result<MigrationRun> {
    let config = migrator.config();
    if let Some(entry) = store.applied_migration(&config.module, config.to_version)? {
        bail!(
            "migration of module {} to version {} already applied (run_id={}, applied_at={})",
            entry.module,
            entry.to_version,
            entry.run_id,
            entry.applied_at
        );
    }

    let before = snapshot_prefixes(&*store, &[b""])?;
    let plan = migrator.plan(&before)?;

    let mut projected = before.clone();
    projected.commit(plan.batch.clone())?;
    let verification = verify_migration(&before, &projected, migrator.registry(), config)?;

    let mut report = plan.report;
    if dry_run {
        info!(
            event = "gov_migration.dry_run",
            run_id = %report.run_id,
            writes = plan.batch.len(),
            healthy = verification.healthy
        );
        return Ok(MigrationRun {
            report,
            verification,
        });
    }

    if !verification.healthy {
        error!(
            event = "gov_migration.failed",
            phase = "verify",
            run_id = %report.run_id,
            issues = verification.issues.len()
        );
        bail!(
            "refusing to commit migration {}: projected state failed verification with {} issue(s)",
            report.run_id,
            verification.issues.len()
        );
    }

    let entry = store.commit_migration(plan.batch, &report)?;
    report.status = MigrationStatus::Applied;
    report.finished_at = entry.applied_at.clone();

    let prefixes = [
        config.module_store_prefix.as_bytes(),
        config.params_subspace_prefix.as_bytes(),
    ];
    let committed_digest = state_digest(&*store, &prefixes)?;
    if committed_digest != report.post_digest {
        bail!(
            "committed state digest {committed_digest} does not match planned digest {}",
            report.post_digest
        );
    }

    info!(
        event = "gov_migration.applied",
        run_id = %report.run_id,
        proposals = report.proposals_migrated,
        votes = report.votes_migrated,
        post_digest = %report.post_digest
    );
    Ok(MigrationRun {
        report,
        verification,
    })
}

/// Writes the two-proposal pre-upgrade fixture plus default parameters.
pub fn seed_legacy_fixture(store: &mut SqliteStateStore, config: &MigrationConfig) -> Result<()> {
    seed_scenario(store, config).context("failed to seed legacy governance fixture")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gov_migrate_core::keys::proposal_key;
    use gov_migrate_core::types::v1;
    use prost::Message;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteStateStore {
        let mut store = must(SqliteStateStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(seed_legacy_fixture(&mut store, &MigrationConfig::v046()));
        store
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn scan_matches_in_memory_ordering() {
        let store = fixture_store();
        let pairs = match store.scan_prefix(b"s/k:gov/") {
            Ok(pairs) => pairs,
            Err(err) => panic!("test failure: {err}"),
        };
        let keys: Vec<&Vec<u8>> = pairs.iter().map(|(key, _)| key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(pairs.len(), 3);
        assert_eq!(must(store.count_prefix(b"s/k:gov/")), 3);
        assert_eq!(must(store.count_prefix(b"")), 6);
    }

    #[test]
    fn migration_applies_and_records_ledger() {
        let mut store = fixture_store();
        let run = must(run_module_migration(&mut store, &Migrator::v046(), false));
        assert_eq!(run.report.status, MigrationStatus::Applied);
        assert!(run.verification.healthy);

        let config = MigrationConfig::v046();
        let entry = match must(store.applied_migration(&config.module, config.to_version)) {
            Some(entry) => entry,
            None => panic!("ledger row missing"),
        };
        assert_eq!(entry.run_id, run.report.run_id);
        assert_eq!(entry.proposals_migrated, 2);

        let key = config.module_namespace().key(&proposal_key(1));
        let migrated = match store.get(&key) {
            Ok(Some(bytes)) => bytes,
            other => panic!("unexpected read result {other:?}"),
        };
        let proposal = match v1::Proposal::decode(migrated.as_slice()) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(proposal.messages.len(), 1);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let mut store = fixture_store();
        let digest_before = must(store.status(&MigrationConfig::v046())).state_digest;

        let run = must(run_module_migration(&mut store, &Migrator::v046(), true));
        assert_eq!(run.report.status, MigrationStatus::Planned);

        let status = must(store.status(&MigrationConfig::v046()));
        assert_eq!(status.state_digest, digest_before);
        assert_eq!(status.applied, None);
        assert!(must(store.ledger()).is_empty());
    }

    #[test]
    fn second_run_is_refused() {
        let mut store = fixture_store();
        must(run_module_migration(&mut store, &Migrator::v046(), false));
        let err = match run_module_migration(&mut store, &Migrator::v046(), false) {
            Ok(_) => panic!("expected second run to be refused"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("already applied"));
        assert_eq!(must(store.ledger()).len(), 1);
    }

    #[test]
    fn ledger_conflict_rolls_back_every_record_write() {
        let mut store = fixture_store();
        let config = MigrationConfig::v046();
        let plan = match Migrator::v046().plan(&store) {
            Ok(plan) => plan,
            Err(err) => panic!("test failure: {err}"),
        };
        let digest_before = must(store.status(&config)).state_digest;

        // Simulate a concurrent run that recorded the upgrade first.
        let mut earlier = plan.report.clone();
        earlier.run_id = "01J0SQQP7M70P6Y3R4T8D8G8M2".to_string();
        must(store.commit_migration(WriteBatch::new(), &earlier));

        let err = match store.commit_migration(plan.batch, &plan.report) {
            Ok(_) => panic!("expected ledger conflict"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("already applied"));
        assert_eq!(must(store.status(&config)).state_digest, digest_before);
    }
}
