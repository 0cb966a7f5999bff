//! Amount, tally, decimal, and timestamp conversions between schema versions.
//!
//! Integers travel on the wire as decimal text of arbitrary size. Legacy
//! fixed-point decimals travel as the text of their integer scaled by
//! 10^18; the new schema carries the canonical 18-place decimal string.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use num_bigint::{BigInt, BigUint, Sign};
use prost_types::Timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::types::Coin;

pub const LEGACY_DEC_PRECISION: usize = 18;
const LEGACY_DEC_SCALE: u64 = 1_000_000_000_000_000_000;
const NANOS_PER_SECOND: i128 = 1_000_000_000;
const MAX_DENOM_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NumericError {
    #[error("invalid integer text {0:?}")]
    InvalidInteger(String),
    #[error("invalid decimal text {text:?}: {reason}")]
    InvalidDecimal { text: String, reason: &'static str },
    #[error("negative amount {amount} for denom {denom}")]
    NegativeAmount { denom: String, amount: String },
    #[error("denom {0:?} cannot be represented in the new coin schema")]
    InvalidDenom(String),
    #[error("timestamp out of range: seconds={seconds} nanos={nanos}")]
    TimestampOutOfRange { seconds: i64, nanos: i32 },
}

/// Parses big-integer wire text. Empty text is the zero value, matching how
/// an unset integer field decodes.
///
/// # Errors
/// Returns [`NumericError::InvalidInteger`] for anything other than an
/// optional `-` followed by ASCII digits.
pub fn parse_wire_int(text: &str) -> Result<BigInt, NumericError> {
    if text.is_empty() {
        return Ok(BigInt::default());
    }

    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(NumericError::InvalidInteger(text.to_string()));
    }

    BigInt::from_str(text).map_err(|_| NumericError::InvalidInteger(text.to_string()))
}

/// Re-emits a big integer as its canonical decimal string: no leading zeros,
/// no separators, `-` only when negative.
///
/// # Errors
/// Returns [`NumericError::InvalidInteger`] when the wire text is malformed.
pub fn int_to_decimal_string(text: &str) -> Result<String, NumericError> {
    Ok(parse_wire_int(text)?.to_string())
}

/// Returns `true` when `denom` fits the coin denomination grammar
/// `[a-zA-Z][a-zA-Z0-9/:._-]{2,127}`.
#[must_use]
pub fn is_valid_denom(denom: &str) -> bool {
    let bytes = denom.as_bytes();
    if bytes.len() < 3 || bytes.len() > MAX_DENOM_LEN {
        return false;
    }

    bytes[0].is_ascii_alphabetic()
        && bytes[1..]
            .iter()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'/' | b':' | b'.' | b'_' | b'-'))
}

/// Converts a legacy deposit coin list into the new container, one element
/// per input element in the original order.
///
/// # Errors
/// Returns [`NumericError::InvalidInteger`] for malformed amounts,
/// [`NumericError::NegativeAmount`] for negative amounts, and
/// [`NumericError::InvalidDenom`] when a denomination cannot be represented.
pub fn normalize_deposit(coins: &[Coin]) -> Result<Vec<Coin>, NumericError> {
    coins
        .iter()
        .map(|coin| {
            let amount = parse_wire_int(&coin.amount)?;
            if amount.sign() == Sign::Minus {
                return Err(NumericError::NegativeAmount {
                    denom: coin.denom.clone(),
                    amount: amount.to_string(),
                });
            }
            if !is_valid_denom(&coin.denom) {
                return Err(NumericError::InvalidDenom(coin.denom.clone()));
            }

            Ok(Coin {
                denom: coin.denom.clone(),
                amount: amount.to_string(),
            })
        })
        .collect()
}

/// Fixed-point decimal with 18 fractional digits, stored as the scaled integer.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LegacyDec(BigInt);

impl LegacyDec {
    #[must_use]
    pub fn from_scaled(scaled: BigInt) -> Self {
        Self(scaled)
    }

    #[must_use]
    pub fn one() -> Self {
        Self(BigInt::from(LEGACY_DEC_SCALE))
    }

    /// Decodes the record-wire form: decimal text of the scaled integer.
    ///
    /// # Errors
    /// Returns [`NumericError::InvalidInteger`] when the text is malformed.
    pub fn from_wire(text: &str) -> Result<Self, NumericError> {
        parse_wire_int(text).map(Self)
    }

    #[must_use]
    pub fn to_wire(&self) -> String {
        self.0.to_string()
    }

    /// Parses decimal text such as `0.334` or `-12.5`. At most 18 fractional
    /// digits are accepted; nothing is rounded.
    ///
    /// # Errors
    /// Returns [`NumericError::InvalidDecimal`] describing the first problem found.
    pub fn parse(text: &str) -> Result<Self, NumericError> {
        let invalid = |reason| NumericError::InvalidDecimal {
            text: text.to_string(),
            reason,
        };

        let (negative, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (whole, fraction) = match body.split_once('.') {
            Some((whole, fraction)) => {
                if fraction.is_empty() {
                    return Err(invalid("missing fractional digits"));
                }
                (whole, fraction)
            }
            None => (body, ""),
        };

        if whole.is_empty() {
            return Err(invalid("missing integer part"));
        }
        if !whole.bytes().all(|byte| byte.is_ascii_digit())
            || !fraction.bytes().all(|byte| byte.is_ascii_digit())
        {
            return Err(invalid("non-digit character"));
        }
        if fraction.len() > LEGACY_DEC_PRECISION {
            return Err(invalid("more than 18 fractional digits"));
        }

        let digits = format!("{whole}{fraction:0<LEGACY_DEC_PRECISION$}");
        let magnitude = BigUint::parse_bytes(digits.as_bytes(), 10)
            .ok_or_else(|| invalid("non-digit character"))?;
        let sign = if negative { Sign::Minus } else { Sign::Plus };
        Ok(Self(BigInt::from_biguint(sign, magnitude)))
    }
}

impl Display for LegacyDec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let scale = BigUint::from(LEGACY_DEC_SCALE);
        let magnitude = self.0.magnitude();
        let whole = magnitude / &scale;
        let fraction = (magnitude % &scale).to_string();
        let sign = if self.0.sign() == Sign::Minus { "-" } else { "" };
        write!(f, "{sign}{whole}.{fraction:0>LEGACY_DEC_PRECISION$}")
    }
}

impl FromStr for LegacyDec {
    type Err = NumericError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for LegacyDec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LegacyDec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Converts a legacy fixed-point wire value to the canonical decimal string.
///
/// # Errors
/// Returns [`NumericError::InvalidInteger`] when the wire text is malformed.
pub fn dec_wire_to_decimal_string(text: &str) -> Result<String, NumericError> {
    Ok(LegacyDec::from_wire(text)?.to_string())
}

/// Interprets a protobuf timestamp as an instant.
///
/// # Errors
/// Returns [`NumericError::TimestampOutOfRange`] when the instant cannot be represented.
pub fn timestamp_to_datetime(value: &Timestamp) -> Result<OffsetDateTime, NumericError> {
    let out_of_range = || NumericError::TimestampOutOfRange {
        seconds: value.seconds,
        nanos: value.nanos,
    };
    let total = i128::from(value.seconds) * NANOS_PER_SECOND + i128::from(value.nanos);
    OffsetDateTime::from_unix_timestamp_nanos(total).map_err(|_| out_of_range())
}

/// Builds the canonical protobuf timestamp (`0 <= nanos < 1e9`) for an instant.
///
/// # Errors
/// Returns [`NumericError::TimestampOutOfRange`] when seconds overflow `i64`.
pub fn datetime_to_timestamp(value: OffsetDateTime) -> Result<Timestamp, NumericError> {
    let total = value.unix_timestamp_nanos();
    let seconds = i64::try_from(total.div_euclid(NANOS_PER_SECOND));
    let nanos = i32::try_from(total.rem_euclid(NANOS_PER_SECOND));
    match (seconds, nanos) {
        (Ok(seconds), Ok(nanos)) => Ok(Timestamp { seconds, nanos }),
        _ => Err(NumericError::TimestampOutOfRange {
            seconds: value.unix_timestamp(),
            nanos: 0,
        }),
    }
}

/// Carries a timestamp across schemas. The representation may be normalized;
/// the instant never changes.
///
/// # Errors
/// Returns [`NumericError::TimestampOutOfRange`] for unrepresentable instants.
pub fn normalize_timestamp(value: Option<&Timestamp>) -> Result<Option<Timestamp>, NumericError> {
    value
        .map(|timestamp| datetime_to_timestamp(timestamp_to_datetime(timestamp)?))
        .transpose()
}
