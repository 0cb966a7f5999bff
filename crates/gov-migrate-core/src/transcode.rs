//! Per-record conversion from the `v1beta1` wire schema to `v1`.

use prost::Message;
use prost_types::Any;
use tracing::debug;

use crate::content::{wrap_legacy_content, ContentError, ContentRegistry};
use crate::numeric::{
    dec_wire_to_decimal_string, int_to_decimal_string, normalize_deposit, normalize_timestamp,
    LegacyDec, NumericError,
};
use crate::types::{v1, v1beta1, VoteOption};
use crate::MigrationError;

/// One rewritten proposal record, ready to be staged under its original key.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodedProposal {
    pub proposal_id: u64,
    pub content_type: String,
    pub proposal: v1::Proposal,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodedVote {
    pub proposal_id: u64,
    pub vote: v1::Vote,
    pub bytes: Vec<u8>,
}

/// Stateless converter bound to one content registry and authority.
#[derive(Debug, Clone, Copy)]
pub struct ProposalTranscoder<'a> {
    registry: &'a ContentRegistry,
    authority: &'a str,
}

impl<'a> ProposalTranscoder<'a> {
    #[must_use]
    pub fn new(registry: &'a ContentRegistry, authority: &'a str) -> Self {
        Self {
            registry,
            authority,
        }
    }

    /// Decodes one legacy proposal record, converts it, and re-encodes it.
    ///
    /// `key_id` is the id recovered from the record's key; a record whose
    /// own id disagrees with it is treated as corrupt.
    ///
    /// # Errors
    /// Returns [`MigrationError::Decode`] for undecodable or inconsistent
    /// records, [`MigrationError::UnsupportedContentType`] for unregistered
    /// content, [`MigrationError::InvalidAmount`] and
    /// [`MigrationError::InvalidDenom`] for unconvertible deposits, and
    /// [`MigrationError::Encode`] when the output violates the new schema.
    pub fn transcode(&self, key_id: u64, raw: &[u8]) -> Result<TranscodedProposal, MigrationError> {
        let record = format!("proposal {key_id}");
        let legacy = v1beta1::Proposal::decode(raw).map_err(|err| MigrationError::Decode {
            record: record.clone(),
            message: err.to_string(),
        })?;

        if legacy.proposal_id != key_id {
            return Err(MigrationError::Decode {
                record,
                message: format!("record carries id {}", legacy.proposal_id),
            });
        }

        let proposal = self.convert(legacy)?;
        let content_type = legacy_content_type(&proposal)?;
        let bytes = proposal.encode_to_vec();
        debug!(
            event = "gov_migration.proposal_transcoded",
            proposal_id = key_id,
            content_type = %content_type,
            bytes = bytes.len()
        );

        Ok(TranscodedProposal {
            proposal_id: key_id,
            content_type,
            proposal,
            bytes,
        })
    }

    /// Converts an already-decoded legacy proposal.
    ///
    /// # Errors
    /// See [`ProposalTranscoder::transcode`].
    pub fn convert(&self, legacy: v1beta1::Proposal) -> Result<v1::Proposal, MigrationError> {
        let proposal_id = legacy.proposal_id;
        let record = format!("proposal {proposal_id}");

        let content_any = legacy.content.ok_or_else(|| MigrationError::Decode {
            record: record.clone(),
            message: "missing content".to_string(),
        })?;
        let content = self
            .registry
            .decode(&content_any)
            .map_err(|err| match err {
                ContentError::Unsupported(type_url) => MigrationError::UnsupportedContentType {
                    proposal_id,
                    type_url,
                },
                ContentError::Malformed { .. } => MigrationError::Decode {
                    record: record.clone(),
                    message: err.to_string(),
                },
            })?;
        let message = wrap_legacy_content(content_any, content, self.authority).into_any();

        let tally = legacy
            .final_tally_result
            .unwrap_or_else(v1beta1::TallyResult::empty);
        let final_tally_result = convert_tally(&tally).map_err(|err| MigrationError::Decode {
            record: record.clone(),
            message: format!("final tally: {err}"),
        })?;

        let total_deposit =
            normalize_deposit(&legacy.total_deposit).map_err(|err| deposit_error(proposal_id, err))?;

        let timestamp = |field: &str, value: Option<&prost_types::Timestamp>| {
            normalize_timestamp(value).map_err(|err| MigrationError::Decode {
                record: record.clone(),
                message: format!("{field}: {err}"),
            })
        };

        Ok(v1::Proposal {
            id: proposal_id,
            messages: vec![message],
            status: legacy.status,
            final_tally_result: Some(final_tally_result),
            submit_time: timestamp("submit_time", legacy.submit_time.as_ref())?,
            deposit_end_time: timestamp("deposit_end_time", legacy.deposit_end_time.as_ref())?,
            total_deposit,
            voting_start_time: timestamp("voting_start_time", legacy.voting_start_time.as_ref())?,
            voting_end_time: timestamp("voting_end_time", legacy.voting_end_time.as_ref())?,
            metadata: String::new(),
        })
    }
}

/// Each counter keeps its exact value; negative counters are carried as-is.
///
/// # Errors
/// Returns [`NumericError::InvalidInteger`] for malformed counter text.
pub fn convert_tally(tally: &v1beta1::TallyResult) -> Result<v1::TallyResult, NumericError> {
    Ok(v1::TallyResult {
        yes: int_to_decimal_string(&tally.yes)?,
        abstain: int_to_decimal_string(&tally.abstain)?,
        no: int_to_decimal_string(&tally.no)?,
        no_with_veto: int_to_decimal_string(&tally.no_with_veto)?,
    })
}

fn deposit_error(proposal_id: u64, err: NumericError) -> MigrationError {
    match err {
        NumericError::InvalidDenom(_) => MigrationError::InvalidDenom {
            proposal_id,
            message: err.to_string(),
        },
        _ => MigrationError::InvalidAmount {
            proposal_id,
            message: err.to_string(),
        },
    }
}

/// The wrapped content's type URL. Rejects output that does not hold
/// exactly one executable message.
fn legacy_content_type(proposal: &v1::Proposal) -> Result<String, MigrationError> {
    let encode_error = |message: String| MigrationError::Encode {
        record: format!("proposal {}", proposal.id),
        message,
    };

    let [message] = proposal.messages.as_slice() else {
        return Err(encode_error(format!(
            "expected exactly one message, found {}",
            proposal.messages.len()
        )));
    };
    let exec = v1::MsgExecLegacyContent::decode(message.value.as_slice())
        .map_err(|err| encode_error(err.to_string()))?;
    exec.content
        .map(|content: Any| content.type_url)
        .ok_or_else(|| encode_error("wrapped message has no content".to_string()))
}

/// Converts one vote record. Weights move from scaled-integer wire text to
/// decimal strings; a vote that only sets the deprecated single option
/// becomes one option of weight one.
///
/// # Errors
/// Returns [`MigrationError::Decode`] when the record or a weight cannot be
/// decoded, or the record's proposal id disagrees with its key.
pub fn transcode_vote(key_id: u64, voter_hex: &str, raw: &[u8]) -> Result<TranscodedVote, MigrationError> {
    let record = format!("vote {key_id}/{voter_hex}");
    let legacy = v1beta1::Vote::decode(raw).map_err(|err| MigrationError::Decode {
        record: record.clone(),
        message: err.to_string(),
    })?;

    if legacy.proposal_id != key_id {
        return Err(MigrationError::Decode {
            record,
            message: format!("record carries proposal id {}", legacy.proposal_id),
        });
    }

    let options = if legacy.options.is_empty() && legacy.option != VoteOption::Unspecified as i32 {
        vec![v1::WeightedVoteOption {
            option: legacy.option,
            weight: LegacyDec::one().to_string(),
        }]
    } else {
        legacy
            .options
            .iter()
            .map(|option| {
                Ok(v1::WeightedVoteOption {
                    option: option.option,
                    weight: dec_wire_to_decimal_string(&option.weight)?,
                })
            })
            .collect::<Result<Vec<_>, NumericError>>()
            .map_err(|err| MigrationError::Decode {
                record: record.clone(),
                message: format!("vote weight: {err}"),
            })?
    };

    let vote = v1::Vote {
        proposal_id: legacy.proposal_id,
        voter: legacy.voter,
        options,
        metadata: String::new(),
    };
    let bytes = vote.encode_to_vec();
    Ok(TranscodedVote {
        proposal_id: key_id,
        vote,
        bytes,
    })
}
