//! Migration driver: scan, transcode, stage, then commit once.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::content::ContentRegistry;
use crate::keys::{
    describe_key, parse_proposal_key, parse_vote_key, PROPOSALS_PREFIX, VOTES_PREFIX,
};
use crate::params::migrate_params;
use crate::store::{snapshot_prefixes, state_digest, KvStore, WriteBatch};
use crate::transcode::{transcode_vote, ProposalTranscoder};
use crate::{format_rfc3339, now_utc, MigrationConfig, MigrationError};

pub const REPORT_CONTRACT_VERSION: &str = "gov_migration_report.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Batch computed, nothing written.
    Planned,
    Applied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub contract_version: String,
    pub run_id: String,
    pub module: String,
    pub from_version: u64,
    pub to_version: u64,
    pub status: MigrationStatus,
    pub proposals_migrated: u64,
    pub votes_migrated: u64,
    pub params_rewritten: u64,
    pub content_types: BTreeMap<String, u64>,
    pub pre_digest: String,
    /// Digest of the state the batch produces, computed before it is applied.
    pub post_digest: String,
    pub started_at: String,
    pub finished_at: String,
}

/// A fully staged migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub batch: WriteBatch,
    pub report: MigrationReport,
}

#[derive(Debug, Clone)]
pub struct Migrator {
    config: MigrationConfig,
    registry: ContentRegistry,
}

impl Migrator {
    /// # Errors
    /// Returns [`MigrationError::Configuration`] when `config` is invalid.
    pub fn new(config: MigrationConfig, registry: ContentRegistry) -> Result<Self, MigrationError> {
        config.validate()?;
        Ok(Self { config, registry })
    }

    /// The reference upgrade: default namespaces, authority, and every
    /// pre-upgrade content type.
    #[must_use]
    pub fn v046() -> Self {
        Self {
            config: MigrationConfig::v046(),
            registry: ContentRegistry::v1beta1(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    /// Computes every write the migration would make, without writing.
    ///
    /// # Errors
    /// Returns the first [`MigrationError`] met while converting a record
    /// or the parameter subspace.
    pub fn plan<S: KvStore + ?Sized>(&self, store: &S) -> Result<MigrationPlan, MigrationError> {
        let started_at = format_rfc3339(now_utc())?;
        let run_id = Ulid::new().to_string();
        let module = self.config.module_namespace();
        let subspace = self.config.params_namespace();
        let prefixes = [module.prefix(), subspace.prefix()];

        info!(
            event = "gov_migration.plan_started",
            run_id = %run_id,
            module = %self.config.module,
            from_version = self.config.from_version,
            to_version = self.config.to_version
        );

        let pre_digest = state_digest(store, &prefixes)?;
        let mut batch = WriteBatch::new();
        let mut content_types = BTreeMap::<String, u64>::new();

        // Collect before staging: nothing is written while the scan result is live.
        let proposals = module.scan(store, &[PROPOSALS_PREFIX])?;
        let transcoder = ProposalTranscoder::new(&self.registry, &self.config.authority);
        for (key, value) in &proposals {
            let proposal_id = parse_proposal_key(key).map_err(|err| MigrationError::Decode {
                record: describe_key(key),
                message: err.to_string(),
            })?;
            let transcoded = transcoder.transcode(proposal_id, value)?;
            *content_types.entry(transcoded.content_type).or_default() += 1;
            batch.set(module.key(key), transcoded.bytes);
        }
        let proposals_migrated = count(proposals.len());
        info!(
            event = "gov_migration.proposals_staged",
            run_id = %run_id,
            proposals = proposals_migrated
        );

        let mut votes_migrated = 0;
        if self.config.migrate_votes {
            let votes = module.scan(store, &[VOTES_PREFIX])?;
            for (key, value) in &votes {
                let (proposal_id, voter) =
                    parse_vote_key(key).map_err(|err| MigrationError::Decode {
                        record: describe_key(key),
                        message: err.to_string(),
                    })?;
                let transcoded = transcode_vote(proposal_id, &hex::encode(&voter), value)?;
                debug!(
                    event = "gov_migration.vote_transcoded",
                    proposal_id,
                    options = transcoded.vote.options.len()
                );
                batch.set(module.key(key), transcoded.bytes);
            }
            votes_migrated = count(votes.len());
            info!(
                event = "gov_migration.votes_staged",
                run_id = %run_id,
                votes = votes_migrated
            );
        }

        migrate_params(store, &subspace, &mut batch)?;
        info!(event = "gov_migration.params_staged", run_id = %run_id);

        let mut projected = snapshot_prefixes(store, &prefixes)?;
        projected.commit(batch.clone())?;
        let post_digest = state_digest(&projected, &prefixes)?;

        let report = MigrationReport {
            contract_version: REPORT_CONTRACT_VERSION.to_string(),
            run_id,
            module: self.config.module.clone(),
            from_version: self.config.from_version,
            to_version: self.config.to_version,
            status: MigrationStatus::Planned,
            proposals_migrated,
            votes_migrated,
            params_rewritten: 1,
            content_types,
            pre_digest,
            post_digest,
            started_at,
            finished_at: format_rfc3339(now_utc())?,
        };

        Ok(MigrationPlan { batch, report })
    }

    /// Plans, then applies the whole batch in one commit. On error the
    /// store is unchanged.
    ///
    /// # Errors
    /// Returns the planning error, or [`MigrationError::Store`] when the
    /// commit fails.
    pub fn migrate<S: KvStore + ?Sized>(&self, store: &mut S) -> Result<MigrationReport, MigrationError> {
        let plan = match self.plan(store) {
            Ok(plan) => plan,
            Err(err) => {
                error!(event = "gov_migration.failed", phase = "plan", code = err.code(), error = %err);
                return Err(err);
            }
        };
        self.apply(store, plan)
    }

    /// Commits a previously computed plan.
    ///
    /// # Errors
    /// Returns [`MigrationError::Store`] when the commit fails.
    pub fn apply<S: KvStore + ?Sized>(
        &self,
        store: &mut S,
        plan: MigrationPlan,
    ) -> Result<MigrationReport, MigrationError> {
        let MigrationPlan { batch, mut report } = plan;
        let writes = batch.len();
        if let Err(err) = store.commit(batch) {
            error!(event = "gov_migration.failed", phase = "commit", run_id = %report.run_id, error = %err);
            return Err(err.into());
        }

        report.status = MigrationStatus::Applied;
        report.finished_at = format_rfc3339(now_utc())?;
        info!(
            event = "gov_migration.applied",
            run_id = %report.run_id,
            writes,
            proposals = report.proposals_migrated,
            votes = report.votes_migrated,
            post_digest = %report.post_digest
        );
        Ok(report)
    }
}

/// One-shot entry point: migrate every governance record and the tally
/// parameters in `store`, or nothing at all.
///
/// # Errors
/// Returns the first [`MigrationError`] encountered; the store is then unchanged.
pub fn migrate_store<S: KvStore + ?Sized>(
    store: &mut S,
    registry: &ContentRegistry,
    config: &MigrationConfig,
) -> Result<MigrationReport, MigrationError> {
    Migrator::new(config.clone(), registry.clone())?.migrate(store)
}

fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::seed_scenario;
    use crate::store::MemStore;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn plan_does_not_write() {
        let config = MigrationConfig::v046();
        let mut store = MemStore::new();
        must(seed_scenario(&mut store, &config));
        let before = store.clone();

        let plan = must(Migrator::v046().plan(&store));
        assert_eq!(store, before);
        assert_eq!(plan.report.status, MigrationStatus::Planned);
        assert_eq!(plan.report.proposals_migrated, 2);
        assert_eq!(plan.batch.len(), 3);
        assert_ne!(plan.report.pre_digest, plan.report.post_digest);
    }

    #[test]
    fn applied_digest_matches_projection() {
        let config = MigrationConfig::v046();
        let mut store = MemStore::new();
        must(seed_scenario(&mut store, &config));

        let report = must(Migrator::v046().migrate(&mut store));
        assert_eq!(report.status, MigrationStatus::Applied);
        let prefixes = [
            config.module_store_prefix.as_bytes(),
            config.params_subspace_prefix.as_bytes(),
        ];
        assert_eq!(must(state_digest(&store, &prefixes)), report.post_digest);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = MigrationConfig::v046();
        config.authority = String::new();
        assert!(Migrator::new(config, ContentRegistry::v1beta1()).is_err());
    }

    #[test]
    fn report_serializes_snake_case_status() {
        let json = must(serde_json::to_value(MigrationStatus::Planned));
        assert_eq!(json, serde_json::json!("planned"));
    }
}
