//! Post-migration audit.
//!
//! Compares a pre-migration snapshot with a migrated store and reports every
//! divergence from the upgrade's preservation guarantees. The verifier shares
//! the decoders with the driver but none of its conversion code.

use std::collections::BTreeSet;

use num_bigint::BigInt;
use prost::Message;
use prost_types::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::content::{unwrap_legacy_content, ContentRegistry, Envelope};
use crate::keys::{describe_key, is_proposal_key, is_vote_key, parse_proposal_key};
use crate::numeric::{parse_wire_int, timestamp_to_datetime, LegacyDec};
use crate::params::{read_param, DEPOSIT_PARAMS_KEY, TALLY_PARAMS_KEY, VOTING_PARAMS_KEY};
use crate::store::{KvPair, KvStore, Namespace};
use crate::types::{v1, v1beta1, Coin, VoteOption};
use crate::{MigrationConfig, MigrationError};

pub const VERIFICATION_CONTRACT_VERSION: &str = "gov_migration_verification.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub contract_version: String,
    pub healthy: bool,
    pub proposals_checked: u64,
    pub votes_checked: u64,
    pub issues: Vec<VerificationIssue>,
}

impl VerificationReport {
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        self.issues.iter().any(|issue| issue.code == code)
    }
}

#[derive(Default)]
struct Findings {
    issues: Vec<VerificationIssue>,
    proposals_checked: u64,
    votes_checked: u64,
}

impl Findings {
    fn error(&mut self, code: &str, message: String) {
        self.issues.push(VerificationIssue {
            code: code.to_string(),
            severity: IssueSeverity::Error,
            message,
        });
    }

    fn warning(&mut self, code: &str, message: String) {
        self.issues.push(VerificationIssue {
            code: code.to_string(),
            severity: IssueSeverity::Warning,
            message,
        });
    }
}

/// Audits `after` against the pre-migration `before` state.
///
/// Only backend failures are returned as errors; every data divergence
/// becomes an issue in the report.
///
/// # Errors
/// Returns [`MigrationError::Store`] when a scan fails.
pub fn verify_migration<B, A>(
    before: &B,
    after: &A,
    registry: &ContentRegistry,
    config: &MigrationConfig,
) -> Result<VerificationReport, MigrationError>
where
    B: KvStore + ?Sized,
    A: KvStore + ?Sized,
{
    let module = config.module_namespace();
    let subspace = config.params_namespace();
    let mut findings = Findings::default();

    let before_module = module.scan(before, b"")?;
    let after_module = module.scan(after, b"")?;
    check_key_sets(&mut findings, "module", &before_module, &after_module);

    for (key, old) in &before_module {
        let Some(new) = lookup(&after_module, key) else {
            continue;
        };
        if is_proposal_key(key) {
            findings.proposals_checked += 1;
            check_proposal(&mut findings, key, old, new, registry, config);
        } else if is_vote_key(key) && config.migrate_votes {
            findings.votes_checked += 1;
            check_vote(&mut findings, key, old, new);
        } else if old != new {
            findings.error(
                "unexpected_rewrite",
                format!("{} changed but is not a migrated record", describe_key(key)),
            );
        }
    }

    check_params(&mut findings, before, after, &subspace)?;
    check_foreign_keys(&mut findings, before, after, &[&module, &subspace])?;

    let healthy = !findings
        .issues
        .iter()
        .any(|issue| issue.severity == IssueSeverity::Error);
    info!(
        event = "gov_migration.verified",
        healthy,
        issues = findings.issues.len(),
        proposals = findings.proposals_checked,
        votes = findings.votes_checked
    );

    Ok(VerificationReport {
        contract_version: VERIFICATION_CONTRACT_VERSION.to_string(),
        healthy,
        proposals_checked: findings.proposals_checked,
        votes_checked: findings.votes_checked,
        issues: findings.issues,
    })
}

fn lookup<'p>(pairs: &'p [KvPair], key: &[u8]) -> Option<&'p [u8]> {
    pairs
        .binary_search_by(|(candidate, _)| candidate.as_slice().cmp(key))
        .ok()
        .map(|index| pairs[index].1.as_slice())
}

fn check_key_sets(findings: &mut Findings, scope: &str, before: &[KvPair], after: &[KvPair]) {
    let old: BTreeSet<&[u8]> = before.iter().map(|(key, _)| key.as_slice()).collect();
    let new: BTreeSet<&[u8]> = after.iter().map(|(key, _)| key.as_slice()).collect();
    for key in old.difference(&new) {
        findings.error(
            "key_removed",
            format!("{scope} {} missing after migration", describe_key(key)),
        );
    }
    for key in new.difference(&old) {
        findings.error(
            "key_added",
            format!("{scope} {} appeared during migration", describe_key(key)),
        );
    }
}

fn check_proposal(
    findings: &mut Findings,
    key: &[u8],
    old: &[u8],
    new: &[u8],
    registry: &ContentRegistry,
    config: &MigrationConfig,
) {
    let label = describe_key(key);
    let legacy = match v1beta1::Proposal::decode(old) {
        Ok(value) => value,
        Err(err) => {
            findings.error("decode_failed", format!("{label} (before): {err}"));
            return;
        }
    };
    let migrated = match v1::Proposal::decode(new) {
        Ok(value) => value,
        Err(err) => {
            findings.error("decode_failed", format!("{label} (after): {err}"));
            return;
        }
    };

    let key_id = parse_proposal_key(key).ok();
    if Some(migrated.id) != key_id || migrated.id != legacy.proposal_id {
        findings.error(
            "id_mismatch",
            format!("{label} carries id {} (was {})", migrated.id, legacy.proposal_id),
        );
    }
    if migrated.status != legacy.status {
        findings.error(
            "status_mismatch",
            format!("{label} status {} (was {})", migrated.status, legacy.status),
        );
    }

    check_tally(findings, &label, legacy.final_tally_result.as_ref(), migrated.final_tally_result.as_ref());
    if !same_coins(&legacy.total_deposit, &migrated.total_deposit) {
        findings.error("deposit_mismatch", format!("{label} total deposit changed"));
    }

    for (field, old_time, new_time) in [
        ("submit_time", &legacy.submit_time, &migrated.submit_time),
        ("deposit_end_time", &legacy.deposit_end_time, &migrated.deposit_end_time),
        ("voting_start_time", &legacy.voting_start_time, &migrated.voting_start_time),
        ("voting_end_time", &legacy.voting_end_time, &migrated.voting_end_time),
    ] {
        if !same_instant(old_time.as_ref(), new_time.as_ref()) {
            findings.error("timestamp_mismatch", format!("{label} {field} moved"));
        }
    }

    if !migrated.metadata.is_empty() {
        findings.warning(
            "metadata_not_empty",
            format!("{label} carries metadata on a migrated record"),
        );
    }

    let [message] = migrated.messages.as_slice() else {
        findings.error(
            "envelope_count_mismatch",
            format!("{label} holds {} messages, expected 1", migrated.messages.len()),
        );
        return;
    };

    let envelope = Envelope::from_any(message.clone());
    let exec = match unwrap_legacy_content(&envelope, registry) {
        Ok(exec) => exec,
        Err(err) => {
            findings.error("envelope_invalid", format!("{label}: {err}"));
            return;
        }
    };
    if exec.authority != config.authority {
        findings.error(
            "authority_mismatch",
            format!("{label} authority {} (expected {})", exec.authority, config.authority),
        );
    }
    if legacy.content.as_ref() != Some(exec.content.as_any()) {
        findings.error(
            "content_mismatch",
            format!("{label} wrapped content differs from the original"),
        );
    }
}

fn check_tally(
    findings: &mut Findings,
    label: &str,
    legacy: Option<&v1beta1::TallyResult>,
    migrated: Option<&v1::TallyResult>,
) {
    let empty = v1beta1::TallyResult::empty();
    let legacy = legacy.unwrap_or(&empty);
    let Some(migrated) = migrated else {
        findings.error("tally_mismatch", format!("{label} lost its tally"));
        return;
    };

    for (field, old, new) in [
        ("yes", &legacy.yes, &migrated.yes),
        ("abstain", &legacy.abstain, &migrated.abstain),
        ("no", &legacy.no, &migrated.no),
        ("no_with_veto", &legacy.no_with_veto, &migrated.no_with_veto),
    ] {
        if !same_int(old, new) {
            findings.error(
                "tally_mismatch",
                format!("{label} tally {field} {new:?} (was {old:?})"),
            );
        }
    }
}

fn check_vote(findings: &mut Findings, key: &[u8], old: &[u8], new: &[u8]) {
    let label = describe_key(key);
    let (legacy, migrated) = match (v1beta1::Vote::decode(old), v1::Vote::decode(new)) {
        (Ok(legacy), Ok(migrated)) => (legacy, migrated),
        (Err(err), _) | (_, Err(err)) => {
            findings.error("decode_failed", format!("{label}: {err}"));
            return;
        }
    };

    if legacy.proposal_id != migrated.proposal_id || legacy.voter != migrated.voter {
        findings.error("vote_identity_mismatch", format!("{label} changed owner"));
    }

    let expected: Vec<(i32, Option<LegacyDec>)> =
        if legacy.options.is_empty() && legacy.option != VoteOption::Unspecified as i32 {
            vec![(legacy.option, Some(LegacyDec::one()))]
        } else {
            legacy
                .options
                .iter()
                .map(|option| (option.option, LegacyDec::from_wire(&option.weight).ok()))
                .collect()
        };
    let actual: Vec<(i32, Option<LegacyDec>)> = migrated
        .options
        .iter()
        .map(|option| (option.option, LegacyDec::parse(&option.weight).ok()))
        .collect();

    if expected != actual || actual.iter().any(|(_, weight)| weight.is_none()) {
        findings.error(
            "vote_weight_mismatch",
            format!("{label} weighted options differ from the original"),
        );
    }
}

fn check_params<B, A>(
    findings: &mut Findings,
    before: &B,
    after: &A,
    subspace: &Namespace,
) -> Result<(), MigrationError>
where
    B: KvStore + ?Sized,
    A: KvStore + ?Sized,
{
    let old_pairs = subspace.scan(before, b"")?;
    let new_pairs = subspace.scan(after, b"")?;
    check_key_sets(findings, "param", &old_pairs, &new_pairs);

    for (key, old) in &old_pairs {
        if key.as_slice() == TALLY_PARAMS_KEY.as_bytes() {
            continue;
        }
        if lookup(&new_pairs, key).is_some_and(|new| new != old.as_slice()) {
            let name = String::from_utf8_lossy(key);
            let code = if name == DEPOSIT_PARAMS_KEY || name == VOTING_PARAMS_KEY {
                "param_changed"
            } else {
                "unexpected_rewrite"
            };
            findings.error(code, format!("param {name} bytes changed"));
        }
    }

    let legacy: v1beta1::TallyParams = match read_param(before, subspace, TALLY_PARAMS_KEY) {
        Ok(value) => value,
        Err(MigrationError::Store(err)) => return Err(err.into()),
        Err(err) => {
            findings.error("param_decode_failed", format!("before: {err}"));
            return Ok(());
        }
    };
    let migrated: v1::TallyParams = match read_param(after, subspace, TALLY_PARAMS_KEY) {
        Ok(value) => value,
        Err(MigrationError::Store(err)) => return Err(err.into()),
        Err(err) => {
            findings.error("param_decode_failed", format!("after: {err}"));
            return Ok(());
        }
    };

    for (field, old, new) in [
        ("quorum", &legacy.quorum, &migrated.quorum),
        ("threshold", &legacy.threshold, &migrated.threshold),
        ("veto_threshold", &legacy.veto_threshold, &migrated.veto_threshold),
    ] {
        if LegacyDec::parse(new).ok().as_ref() != Some(old) {
            findings.error(
                "tally_params_mismatch",
                format!("tally param {field} {new:?} (was {old})"),
            );
        }
    }
    Ok(())
}

/// Everything outside the two owned namespaces must be byte-identical.
fn check_foreign_keys<B, A>(
    findings: &mut Findings,
    before: &B,
    after: &A,
    owned: &[&Namespace],
) -> Result<(), MigrationError>
where
    B: KvStore + ?Sized,
    A: KvStore + ?Sized,
{
    let foreign = |pairs: Vec<KvPair>| -> Vec<KvPair> {
        pairs
            .into_iter()
            .filter(|(key, _)| owned.iter().all(|namespace| namespace.strip(key).is_none()))
            .collect()
    };
    let old = foreign(before.scan_prefix(b"")?);
    let new = foreign(after.scan_prefix(b"")?);
    if old != new {
        findings.error(
            "foreign_key_changed",
            format!(
                "keys outside the module keyspace changed ({} before, {} after)",
                old.len(),
                new.len()
            ),
        );
    }
    Ok(())
}

fn same_int(old: &str, new: &str) -> bool {
    // The migrated side must already be canonical text.
    match (parse_wire_int(old), new.parse::<BigInt>()) {
        (Ok(old), Ok(parsed)) => old == parsed && parsed.to_string() == new,
        _ => false,
    }
}

fn same_coins(old: &[Coin], new: &[Coin]) -> bool {
    old.len() == new.len()
        && old
            .iter()
            .zip(new)
            .all(|(old, new)| old.denom == new.denom && same_int(&old.amount, &new.amount))
}

fn same_instant(old: Option<&Timestamp>, new: Option<&Timestamp>) -> bool {
    match (old, new) {
        (None, None) => true,
        (Some(old), Some(new)) => match (timestamp_to_datetime(old), timestamp_to_datetime(new)) {
            (Ok(old), Ok(new)) => old == new,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::seed_scenario;
    use crate::keys::proposal_key;
    use crate::store::{MemStore, WriteBatch};
    use crate::Migrator;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn migrated_pair() -> (MemStore, MemStore, MigrationConfig) {
        let config = MigrationConfig::v046();
        let mut before = MemStore::new();
        must(seed_scenario(&mut before, &config));
        let mut after = before.clone();
        must(Migrator::v046().migrate(&mut after));
        (before, after, config)
    }

    #[test]
    fn clean_migration_is_healthy() {
        let (before, after, config) = migrated_pair();
        let report = must(verify_migration(&before, &after, &ContentRegistry::v1beta1(), &config));
        assert!(report.healthy, "unexpected issues: {:?}", report.issues);
        assert_eq!(report.proposals_checked, 2);
        assert_eq!(report.contract_version, VERIFICATION_CONTRACT_VERSION);
    }

    #[test]
    fn unmigrated_store_is_unhealthy() {
        let (before, _, config) = migrated_pair();
        let report = must(verify_migration(&before, &before, &ContentRegistry::v1beta1(), &config));
        assert!(!report.healthy);
        assert!(report.has_code("envelope_invalid"));
    }

    #[test]
    fn tampered_tally_is_reported() {
        let (before, mut after, config) = migrated_pair();
        let key = config.module_namespace().key(&proposal_key(1));
        let mut proposal = match must(after.get(&key)) {
            Some(bytes) => must(v1::Proposal::decode(bytes.as_slice())),
            None => panic!("proposal 1 missing"),
        };
        proposal.final_tally_result = Some(v1::TallyResult {
            yes: "1".to_string(),
            abstain: "0".to_string(),
            no: "0".to_string(),
            no_with_veto: "0".to_string(),
        });
        let mut batch = WriteBatch::new();
        batch.set(key, proposal.encode_to_vec());
        must(after.commit(batch));

        let report = must(verify_migration(&before, &after, &ContentRegistry::v1beta1(), &config));
        assert!(!report.healthy);
        assert!(report.has_code("tally_mismatch"));
    }

    #[test]
    fn foreign_and_missing_keys_are_reported() {
        let (before, mut after, config) = migrated_pair();
        let mut batch = WriteBatch::new();
        batch.set(b"s/k:bank/balance".to_vec(), b"1".to_vec());
        batch.delete(config.module_namespace().key(&proposal_key(2)));
        must(after.commit(batch));

        let report = must(verify_migration(&before, &after, &ContentRegistry::v1beta1(), &config));
        assert!(report.has_code("foreign_key_changed"));
        assert!(report.has_code("key_removed"));
    }

    #[test]
    fn noncanonical_integers_do_not_match() {
        assert!(same_int("0100", "100"));
        assert!(!same_int("100", "0100"));
        assert!(same_int("", "0"));
        assert!(same_int("-5", "-5"));
    }
}
