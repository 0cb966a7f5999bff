//! Governance store migration from the `v1beta1` proposal schema to `v1`.
//!
//! The engine is run once during a node upgrade. It rewrites every proposal
//! (and vote) record of the governance module in place, under unchanged keys,
//! and converts the tally parameter group to its string-encoded form. All
//! writes are collected into a single [`WriteBatch`] that the backing store
//! commits atomically, so a failed run leaves the store untouched.
//!
//! Entry points:
//! - [`migrate_store`] / [`Migrator::migrate`] plan and commit in one call.
//! - [`Migrator::plan`] computes the batch and report without writing.
//! - [`verify_migration`] audits a migrated store against a pre-migration snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub mod content;
pub mod driver;
pub mod fixtures;
pub mod keys;
pub mod numeric;
pub mod params;
pub mod store;
pub mod transcode;
pub mod types;
pub mod verify;

pub use content::{ContentError, ContentRegistry, Envelope, ExecLegacyContent, LegacyContent};
pub use driver::{migrate_store, MigrationPlan, MigrationReport, MigrationStatus, Migrator};
pub use keys::KeyError;
pub use numeric::{LegacyDec, NumericError};
pub use store::{KvStore, MemStore, Namespace, StoreError, WriteBatch};
pub use verify::{verify_migration, IssueSeverity, VerificationIssue, VerificationReport};

/// Bech32 address of the governance module account on the reference chain.
pub const GOV_MODULE_AUTHORITY: &str = "cosmos10d07y265gmmuvt4z0w9aw880jnsr700j6zn9kn";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("decode error for {record}: {message}")]
    Decode { record: String, message: String },
    #[error("unsupported content type {type_url:?} in proposal {proposal_id}")]
    UnsupportedContentType { proposal_id: u64, type_url: String },
    #[error("invalid amount in proposal {proposal_id}: {message}")]
    InvalidAmount { proposal_id: u64, message: String },
    #[error("invalid denom in proposal {proposal_id}: {message}")]
    InvalidDenom { proposal_id: u64, message: String },
    #[error("parameter {key:?} not found in subspace")]
    ParamNotFound { key: String },
    #[error("parameter {key:?} could not be decoded: {message}")]
    ParamDecode { key: String, message: String },
    #[error("encode error for {record}: {message}")]
    Encode { record: String, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// Stable machine-readable code, used in operator-facing error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "migration.decode_error",
            Self::UnsupportedContentType { .. } => "migration.unsupported_content_type",
            Self::InvalidAmount { .. } => "migration.invalid_amount",
            Self::InvalidDenom { .. } => "migration.invalid_denom",
            Self::ParamNotFound { .. } => "migration.param_not_found",
            Self::ParamDecode { .. } => "migration.param_decode_error",
            Self::Encode { .. } => "migration.encode_error",
            Self::Configuration(_) => "migration.configuration",
            Self::Store(_) => "migration.store",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub module: String,
    pub module_store_prefix: String,
    pub params_subspace_prefix: String,
    pub authority: String,
    pub from_version: u64,
    pub to_version: u64,
    pub migrate_votes: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::v046()
    }
}

impl MigrationConfig {
    #[must_use]
    pub fn v046() -> Self {
        Self {
            module: "gov".to_string(),
            module_store_prefix: "s/k:gov/".to_string(),
            params_subspace_prefix: "s/k:params/gov/".to_string(),
            authority: GOV_MODULE_AUTHORITY.to_string(),
            from_version: 2,
            to_version: 3,
            migrate_votes: true,
        }
    }

    /// Validates namespaces, authority, and the version step.
    ///
    /// # Errors
    /// Returns [`MigrationError::Configuration`] when a field is empty, the
    /// two namespaces overlap, or the version step does not move forward.
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (name, value) in [
            ("module", &self.module),
            ("module_store_prefix", &self.module_store_prefix),
            ("params_subspace_prefix", &self.params_subspace_prefix),
            ("authority", &self.authority),
        ] {
            if value.trim().is_empty() {
                return Err(MigrationError::Configuration(format!(
                    "{name} MUST be provided"
                )));
            }
        }

        if self.module_store_prefix.starts_with(&self.params_subspace_prefix)
            || self.params_subspace_prefix.starts_with(&self.module_store_prefix)
        {
            return Err(MigrationError::Configuration(
                "module_store_prefix and params_subspace_prefix MUST NOT overlap".to_string(),
            ));
        }

        if !self
            .authority
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric())
        {
            return Err(MigrationError::Configuration(
                "authority MUST be an ASCII alphanumeric account address".to_string(),
            ));
        }

        if self.to_version <= self.from_version {
            return Err(MigrationError::Configuration(
                "to_version MUST be greater than from_version".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON. Missing fields keep
    /// their [`MigrationConfig::v046`] values; unknown fields are rejected.
    ///
    /// # Errors
    /// Returns [`MigrationError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, MigrationError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            MigrationError::Configuration(format!("invalid migration config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn module_namespace(&self) -> Namespace {
        Namespace::new(self.module_store_prefix.as_bytes())
    }

    #[must_use]
    pub fn params_namespace(&self) -> Namespace {
        Namespace::new(self.params_subspace_prefix.as_bytes())
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MigrationError::Encode`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MigrationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| MigrationError::Encode {
            record: "timestamp".to_string(),
            message: format!("failed to format RFC3339 timestamp: {err}"),
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
