//! Wire schemas for both sides of the upgrade.
//!
//! Records are protobuf messages; parameter-subspace values are JSON.
//! [`v1beta1`] is the pre-upgrade schema and [`v1`] the post-upgrade one.
//! Types whose wire form did not change live here.

use serde::{Deserialize, Serialize};
use time::Duration;

pub mod v1;
pub mod v1beta1;

#[derive(Clone, PartialEq, Eq, Hash, prost::Message, Serialize, Deserialize)]
pub struct Coin {
    #[prost(string, tag = "1")]
    pub denom: String,
    #[prost(string, tag = "2")]
    pub amount: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProposalStatus {
    Unspecified = 0,
    DepositPeriod = 1,
    VotingPeriod = 2,
    Passed = 3,
    Rejected = 4,
    Failed = 5,
}

impl ProposalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "PROPOSAL_STATUS_UNSPECIFIED",
            Self::DepositPeriod => "PROPOSAL_STATUS_DEPOSIT_PERIOD",
            Self::VotingPeriod => "PROPOSAL_STATUS_VOTING_PERIOD",
            Self::Passed => "PROPOSAL_STATUS_PASSED",
            Self::Rejected => "PROPOSAL_STATUS_REJECTED",
            Self::Failed => "PROPOSAL_STATUS_FAILED",
        }
    }

    /// Renders a raw wire value, keeping unknown values visible as numbers.
    #[must_use]
    pub fn describe(raw: i32) -> String {
        match Self::try_from(raw) {
            Ok(status) => status.as_str().to_string(),
            Err(_) => raw.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VoteOption {
    Unspecified = 0,
    Yes = 1,
    Abstain = 2,
    No = 3,
    NoWithVeto = 4,
}

/// Deposit parameter group. Unchanged by the upgrade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositParams {
    pub min_deposit: Vec<Coin>,
    #[serde(with = "nanos_duration")]
    pub max_deposit_period: Duration,
}

impl DepositParams {
    #[must_use]
    pub fn genesis_default() -> Self {
        Self {
            min_deposit: vec![Coin {
                denom: "stake".to_string(),
                amount: "10000000".to_string(),
            }],
            max_deposit_period: Duration::hours(48),
        }
    }
}

/// Voting parameter group. Unchanged by the upgrade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VotingParams {
    #[serde(with = "nanos_duration")]
    pub voting_period: Duration,
}

impl VotingParams {
    #[must_use]
    pub fn genesis_default() -> Self {
        Self {
            voting_period: Duration::hours(48),
        }
    }
}

/// Durations in the parameter subspace are JSON strings of whole nanoseconds.
mod nanos_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.whole_nanoseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let nanos: i64 = raw
            .parse()
            .map_err(|err| serde::de::Error::custom(format!("invalid duration {raw:?}: {err}")))?;
        Ok(Duration::nanoseconds(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_round_trip_as_nanosecond_strings() {
        let json = match serde_json::to_value(VotingParams::genesis_default()) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode voting params: {err}"),
        };
        assert_eq!(json, serde_json::json!({ "voting_period": "172800000000000" }));
    }

    #[test]
    fn unknown_status_values_stay_numeric() {
        assert_eq!(ProposalStatus::describe(3), "PROPOSAL_STATUS_PASSED");
        assert_eq!(ProposalStatus::describe(42), "42");
    }
}
