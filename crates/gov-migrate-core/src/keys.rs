//! Record keys inside the governance module keyspace. The layout is
//! identical on both sides of the upgrade.

pub const PROPOSALS_PREFIX: u8 = 0x00;
pub const PROPOSAL_ID_KEY: u8 = 0x03;
pub const VOTES_PREFIX: u8 = 0x20;

const ID_LEN: usize = 8;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KeyError {
    #[error("key prefix {found:#04x} does not match expected {expected:#04x}")]
    WrongPrefix { expected: u8, found: u8 },
    #[error("key is empty")]
    Empty,
    #[error("key length {found} does not match expected {expected}")]
    Length { expected: usize, found: usize },
    #[error("voter address of {0} bytes exceeds the 255-byte length prefix")]
    VoterTooLong(usize),
}

/// `0x00 || be64(id)`
#[must_use]
pub fn proposal_key(proposal_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ID_LEN);
    key.push(PROPOSALS_PREFIX);
    key.extend_from_slice(&proposal_id.to_be_bytes());
    key
}

/// Recovers the proposal id from a proposal key.
///
/// # Errors
/// Returns [`KeyError`] when the prefix or length is wrong.
pub fn parse_proposal_key(key: &[u8]) -> Result<u64, KeyError> {
    let rest = strip_prefix(key, PROPOSALS_PREFIX)?;
    read_id(rest, key.len())
}

/// `0x20 || be64(id)`: all votes cast on one proposal.
#[must_use]
pub fn votes_key(proposal_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ID_LEN);
    key.push(VOTES_PREFIX);
    key.extend_from_slice(&proposal_id.to_be_bytes());
    key
}

/// `0x20 || be64(id) || len(voter) || voter`
///
/// # Errors
/// Returns [`KeyError::VoterTooLong`] when the voter does not fit the
/// one-byte length prefix.
pub fn vote_key(proposal_id: u64, voter: &[u8]) -> Result<Vec<u8>, KeyError> {
    let voter_len = u8::try_from(voter.len()).map_err(|_| KeyError::VoterTooLong(voter.len()))?;
    let mut key = votes_key(proposal_id);
    key.push(voter_len);
    key.extend_from_slice(voter);
    Ok(key)
}

/// Splits a vote key into proposal id and voter address bytes.
///
/// # Errors
/// Returns [`KeyError`] when the prefix, length byte, or total length is wrong.
pub fn parse_vote_key(key: &[u8]) -> Result<(u64, Vec<u8>), KeyError> {
    let rest = strip_prefix(key, VOTES_PREFIX)?;
    if rest.len() < ID_LEN + 1 {
        return Err(KeyError::Length {
            expected: 1 + ID_LEN + 1,
            found: key.len(),
        });
    }

    let proposal_id = read_id(&rest[..ID_LEN], 1 + ID_LEN)?;
    let voter_len = usize::from(rest[ID_LEN]);
    let voter = &rest[ID_LEN + 1..];
    if voter.len() != voter_len {
        return Err(KeyError::Length {
            expected: 1 + ID_LEN + 1 + voter_len,
            found: key.len(),
        });
    }

    Ok((proposal_id, voter.to_vec()))
}

#[must_use]
pub fn is_proposal_key(key: &[u8]) -> bool {
    key.len() == 1 + ID_LEN && key.first() == Some(&PROPOSALS_PREFIX)
}

#[must_use]
pub fn is_vote_key(key: &[u8]) -> bool {
    key.first() == Some(&VOTES_PREFIX)
}

/// Short human-readable label used in error messages and reports.
#[must_use]
pub fn describe_key(key: &[u8]) -> String {
    if let Ok(proposal_id) = parse_proposal_key(key) {
        return format!("proposal {proposal_id}");
    }
    if let Ok((proposal_id, voter)) = parse_vote_key(key) {
        return format!("vote {proposal_id}/{}", hex::encode(voter));
    }
    format!("key {}", hex::encode(key))
}

fn strip_prefix(key: &[u8], expected: u8) -> Result<&[u8], KeyError> {
    match key.split_first() {
        None => Err(KeyError::Empty),
        Some((&found, rest)) if found == expected => Ok(rest),
        Some((&found, _)) => Err(KeyError::WrongPrefix { expected, found }),
    }
}

fn read_id(bytes: &[u8], total_len: usize) -> Result<u64, KeyError> {
    let raw: [u8; ID_LEN] = bytes.try_into().map_err(|_| KeyError::Length {
        expected: 1 + ID_LEN,
        found: total_len,
    })?;
    Ok(u64::from_be_bytes(raw))
}
