//! Pre-upgrade state builders shared by tests, the SQLite crate, and the
//! operator CLI's `fixture seed` command.

use prost::Message;
use prost_types::Timestamp;

use crate::content::{LegacyContent, Plan, SoftwareUpgradeProposal, TextProposal};
use crate::keys::{proposal_key, vote_key, PROPOSAL_ID_KEY};
use crate::params::{encode_param, DEPOSIT_PARAMS_KEY, TALLY_PARAMS_KEY, VOTING_PARAMS_KEY};
use crate::store::{KvStore, WriteBatch};
use crate::types::{v1beta1, DepositParams, ProposalStatus, VoteOption, VotingParams};
use crate::{MigrationConfig, MigrationError};

/// Unix seconds of the scenario's submit time.
pub const SCENARIO_SUBMIT_SECONDS: i64 = 1_000_000_000;

/// `0001-01-01T00:00:00Z`, the value an unset non-nullable time encodes to.
pub const ZERO_TIME_SECONDS: i64 = -62_135_596_800;

#[must_use]
pub fn zero_time() -> Timestamp {
    Timestamp {
        seconds: ZERO_TIME_SECONDS,
        nanos: 0,
    }
}

/// A freshly submitted proposal: deposit period, empty tally, no deposit,
/// voting times not yet set.
#[must_use]
pub fn legacy_proposal(proposal_id: u64, content: &LegacyContent, submit_seconds: i64) -> v1beta1::Proposal {
    let submitted = || Timestamp {
        seconds: submit_seconds,
        nanos: 0,
    };
    v1beta1::Proposal {
        proposal_id,
        content: Some(content.to_any()),
        status: ProposalStatus::DepositPeriod as i32,
        final_tally_result: Some(v1beta1::TallyResult::empty()),
        submit_time: Some(submitted()),
        deposit_end_time: Some(submitted()),
        total_deposit: Vec::new(),
        voting_start_time: Some(zero_time()),
        voting_end_time: Some(zero_time()),
    }
}

#[must_use]
pub fn text_content(title: &str, description: &str) -> LegacyContent {
    LegacyContent::Text(TextProposal {
        title: title.to_string(),
        description: description.to_string(),
    })
}

#[must_use]
pub fn upgrade_content(title: &str, description: &str, plan_name: &str) -> LegacyContent {
    LegacyContent::SoftwareUpgrade(SoftwareUpgradeProposal {
        title: title.to_string(),
        description: description.to_string(),
        plan: Some(Plan {
            name: plan_name.to_string(),
            ..Plan::default()
        }),
    })
}

/// The two reference proposals: a text proposal and a software upgrade,
/// both submitted at unix time 1e9.
#[must_use]
pub fn scenario_proposals() -> Vec<v1beta1::Proposal> {
    vec![
        legacy_proposal(
            1,
            &text_content("my title 1", "my desc 1"),
            SCENARIO_SUBMIT_SECONDS,
        ),
        legacy_proposal(
            2,
            &upgrade_content("my title 2", "my desc 2", "my plan 2"),
            SCENARIO_SUBMIT_SECONDS,
        ),
    ]
}

#[must_use]
pub fn legacy_vote(proposal_id: u64, voter: &str, options: &[(VoteOption, &str)]) -> v1beta1::Vote {
    v1beta1::Vote {
        proposal_id,
        voter: voter.to_string(),
        option: VoteOption::Unspecified as i32,
        options: options
            .iter()
            .map(|(option, weight)| v1beta1::WeightedVoteOption {
                option: *option as i32,
                weight: (*weight).to_string(),
            })
            .collect(),
    }
}

/// Stages a proposal under its key in the configured module keyspace.
pub fn stage_proposal(batch: &mut WriteBatch, config: &MigrationConfig, proposal: &v1beta1::Proposal) {
    batch.set(
        config.module_namespace().key(&proposal_key(proposal.proposal_id)),
        proposal.encode_to_vec(),
    );
}

/// Stages a vote under its `(proposal, voter)` key.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when the voter cannot be keyed.
pub fn stage_vote(
    batch: &mut WriteBatch,
    config: &MigrationConfig,
    vote: &v1beta1::Vote,
) -> Result<(), MigrationError> {
    let key = vote_key(vote.proposal_id, vote.voter.as_bytes()).map_err(|err| {
        MigrationError::Encode {
            record: format!("vote {}/{}", vote.proposal_id, vote.voter),
            message: err.to_string(),
        }
    })?;
    batch.set(config.module_namespace().key(&key), vote.encode_to_vec());
    Ok(())
}

/// Stages the genesis-default deposit, voting, and tally groups.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when a group fails to serialize.
pub fn stage_default_params(batch: &mut WriteBatch, config: &MigrationConfig) -> Result<(), MigrationError> {
    let subspace = config.params_namespace();
    batch.set(
        subspace.key(DEPOSIT_PARAMS_KEY.as_bytes()),
        encode_param(DEPOSIT_PARAMS_KEY, &DepositParams::genesis_default())?,
    );
    batch.set(
        subspace.key(VOTING_PARAMS_KEY.as_bytes()),
        encode_param(VOTING_PARAMS_KEY, &VotingParams::genesis_default())?,
    );
    batch.set(
        subspace.key(TALLY_PARAMS_KEY.as_bytes()),
        encode_param(TALLY_PARAMS_KEY, &v1beta1::TallyParams::genesis_default())?,
    );
    Ok(())
}

/// The full pre-upgrade fixture: both reference proposals, the next-id
/// counter, and default parameters.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when a parameter group fails to serialize.
pub fn scenario_batch(config: &MigrationConfig) -> Result<WriteBatch, MigrationError> {
    let mut batch = WriteBatch::new();
    let proposals = scenario_proposals();
    for proposal in &proposals {
        stage_proposal(&mut batch, config, proposal);
    }
    let next_id = proposals
        .iter()
        .map(|proposal| proposal.proposal_id)
        .max()
        .unwrap_or(0)
        + 1;
    batch.set(
        config.module_namespace().key(&[PROPOSAL_ID_KEY]),
        next_id.to_be_bytes().to_vec(),
    );
    stage_default_params(&mut batch, config)?;
    Ok(batch)
}

/// Writes [`scenario_batch`] into `store` in one commit.
///
/// # Errors
/// Returns [`MigrationError`] when encoding or the commit fails.
pub fn seed_scenario<S: KvStore + ?Sized>(store: &mut S, config: &MigrationConfig) -> Result<(), MigrationError> {
    store.commit(scenario_batch(config)?)?;
    Ok(())
}
