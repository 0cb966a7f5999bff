//! Parameter subspace conversion. Only the tally group changes shape; the
//! deposit and voting groups are decoded to prove they are present and sound,
//! then left byte-for-byte untouched.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::store::{KvStore, Namespace, WriteBatch};
use crate::types::{v1, v1beta1, DepositParams, VotingParams};
use crate::MigrationError;

pub const DEPOSIT_PARAMS_KEY: &str = "depositparams";
pub const VOTING_PARAMS_KEY: &str = "votingparams";
pub const TALLY_PARAMS_KEY: &str = "tallyparams";

/// Decoded parameter groups plus the staged tally rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamsMigration {
    pub deposit: DepositParams,
    pub voting: VotingParams,
    pub legacy_tally: v1beta1::TallyParams,
    pub tally: v1::TallyParams,
    pub tally_bytes: Vec<u8>,
}

/// Reads all three parameter groups and stages the converted tally group.
///
/// # Errors
/// Returns [`MigrationError::ParamNotFound`] when a group is absent,
/// [`MigrationError::ParamDecode`] when one does not decode, and
/// [`MigrationError::Store`] when the backend read fails.
pub fn migrate_params<S: KvStore + ?Sized>(
    store: &S,
    subspace: &Namespace,
    batch: &mut WriteBatch,
) -> Result<ParamsMigration, MigrationError> {
    let deposit: DepositParams = read_param(store, subspace, DEPOSIT_PARAMS_KEY)?;
    let voting: VotingParams = read_param(store, subspace, VOTING_PARAMS_KEY)?;
    let legacy_tally: v1beta1::TallyParams = read_param(store, subspace, TALLY_PARAMS_KEY)?;

    let tally = convert_tally_params(&legacy_tally);
    let tally_bytes = encode_param(TALLY_PARAMS_KEY, &tally)?;
    batch.set(subspace.key(TALLY_PARAMS_KEY.as_bytes()), tally_bytes.clone());
    debug!(
        event = "gov_migration.tally_params_staged",
        quorum = %tally.quorum,
        threshold = %tally.threshold,
        veto_threshold = %tally.veto_threshold
    );

    Ok(ParamsMigration {
        deposit,
        voting,
        legacy_tally,
        tally,
        tally_bytes,
    })
}

#[must_use]
pub fn convert_tally_params(legacy: &v1beta1::TallyParams) -> v1::TallyParams {
    v1::TallyParams {
        quorum: legacy.quorum.to_string(),
        threshold: legacy.threshold.to_string(),
        veto_threshold: legacy.veto_threshold.to_string(),
    }
}

/// Reads and decodes one JSON parameter value.
///
/// # Errors
/// See [`migrate_params`].
pub fn read_param<S, T>(store: &S, subspace: &Namespace, key: &str) -> Result<T, MigrationError>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    let raw = store
        .get(&subspace.key(key.as_bytes()))?
        .ok_or_else(|| MigrationError::ParamNotFound {
            key: key.to_string(),
        })?;
    serde_json::from_slice(&raw).map_err(|err| MigrationError::ParamDecode {
        key: key.to_string(),
        message: err.to_string(),
    })
}

/// Encodes one JSON parameter value.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when serialization fails.
pub fn encode_param<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, MigrationError> {
    serde_json::to_vec(value).map_err(|err| MigrationError::Encode {
        record: format!("param {key}"),
        message: err.to_string(),
    })
}
