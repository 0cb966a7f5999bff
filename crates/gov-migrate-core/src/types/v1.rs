//! Post-upgrade schema.

use prost_types::{Any, Timestamp};
use serde::{Deserialize, Serialize};

use super::{Coin, ProposalStatus, VoteOption};

pub const MSG_EXEC_LEGACY_CONTENT_TYPE_URL: &str = "/cosmos.gov.v1.MsgExecLegacyContent";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Proposal {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, repeated, tag = "2")]
    pub messages: Vec<Any>,
    #[prost(enumeration = "ProposalStatus", tag = "3")]
    pub status: i32,
    #[prost(message, optional, tag = "4")]
    pub final_tally_result: Option<TallyResult>,
    #[prost(message, optional, tag = "5")]
    pub submit_time: Option<Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub deposit_end_time: Option<Timestamp>,
    #[prost(message, repeated, tag = "7")]
    pub total_deposit: Vec<Coin>,
    #[prost(message, optional, tag = "8")]
    pub voting_start_time: Option<Timestamp>,
    #[prost(message, optional, tag = "9")]
    pub voting_end_time: Option<Timestamp>,
    #[prost(string, tag = "10")]
    pub metadata: String,
}

/// Vote counters as canonical decimal strings.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct TallyResult {
    #[prost(string, tag = "1")]
    pub yes: String,
    #[prost(string, tag = "2")]
    pub abstain: String,
    #[prost(string, tag = "3")]
    pub no: String,
    #[prost(string, tag = "4")]
    pub no_with_veto: String,
}

/// Executes a pre-upgrade content payload through the legacy handler on
/// behalf of `authority`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgExecLegacyContent {
    #[prost(message, optional, tag = "1")]
    pub content: Option<Any>,
    #[prost(string, tag = "2")]
    pub authority: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Vote {
    #[prost(uint64, tag = "1")]
    pub proposal_id: u64,
    #[prost(string, tag = "2")]
    pub voter: String,
    #[prost(message, repeated, tag = "4")]
    pub options: Vec<WeightedVoteOption>,
    #[prost(string, tag = "5")]
    pub metadata: String,
}

/// `weight` is the canonical 18-place decimal string.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct WeightedVoteOption {
    #[prost(enumeration = "VoteOption", tag = "1")]
    pub option: i32,
    #[prost(string, tag = "2")]
    pub weight: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TallyParams {
    pub quorum: String,
    pub threshold: String,
    pub veto_threshold: String,
}
