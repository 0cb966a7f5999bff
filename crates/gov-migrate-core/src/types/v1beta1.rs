//! Pre-upgrade schema.

use prost_types::{Any, Timestamp};
use serde::{Deserialize, Serialize};

use super::{Coin, ProposalStatus, VoteOption};
use crate::numeric::LegacyDec;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Proposal {
    #[prost(uint64, tag = "1")]
    pub proposal_id: u64,
    #[prost(message, optional, tag = "2")]
    pub content: Option<Any>,
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
}

/// Vote counters as big-integer decimal text.
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

impl TallyResult {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            yes: "0".to_string(),
            abstain: "0".to_string(),
            no: "0".to_string(),
            no_with_veto: "0".to_string(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Vote {
    #[prost(uint64, tag = "1")]
    pub proposal_id: u64,
    #[prost(string, tag = "2")]
    pub voter: String,
    /// Superseded by `options`; still honored when `options` is empty.
    #[prost(enumeration = "VoteOption", tag = "3")]
    pub option: i32,
    #[prost(message, repeated, tag = "4")]
    pub options: Vec<WeightedVoteOption>,
}

/// `weight` is a fixed-point decimal in scaled-integer wire form.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct WeightedVoteOption {
    #[prost(enumeration = "VoteOption", tag = "1")]
    pub option: i32,
    #[prost(string, tag = "2")]
    pub weight: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TallyParams {
    pub quorum: LegacyDec,
    pub threshold: LegacyDec,
    pub veto_threshold: LegacyDec,
}

impl TallyParams {
    /// Genesis defaults: quorum 33.4%, threshold 50%, veto threshold 33.4%.
    #[must_use]
    pub fn genesis_default() -> Self {
        let quorum = LegacyDec::from_scaled(334_000_000_000_000_000_u64.into());
        Self {
            quorum: quorum.clone(),
            threshold: LegacyDec::from_scaled(500_000_000_000_000_000_u64.into()),
            veto_threshold: quorum,
        }
    }
}
