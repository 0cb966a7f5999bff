//! Legacy proposal content, the registry that decodes it, and the envelope
//! that wraps it into a `v1` executable message.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use prost::Message;
use prost_types::{Any, Timestamp};

use crate::types::v1::{MsgExecLegacyContent, MSG_EXEC_LEGACY_CONTENT_TYPE_URL};
use crate::types::Coin;

pub const TEXT_PROPOSAL_TYPE_URL: &str = "/cosmos.gov.v1beta1.TextProposal";
pub const PARAMETER_CHANGE_PROPOSAL_TYPE_URL: &str = "/cosmos.params.v1beta1.ParameterChangeProposal";
pub const SOFTWARE_UPGRADE_PROPOSAL_TYPE_URL: &str = "/cosmos.upgrade.v1beta1.SoftwareUpgradeProposal";
pub const CANCEL_SOFTWARE_UPGRADE_PROPOSAL_TYPE_URL: &str =
    "/cosmos.upgrade.v1beta1.CancelSoftwareUpgradeProposal";
pub const COMMUNITY_POOL_SPEND_PROPOSAL_TYPE_URL: &str =
    "/cosmos.distribution.v1beta1.CommunityPoolSpendProposal";

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct TextProposal {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub description: String,
}

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct ParamChange {
    #[prost(string, tag = "1")]
    pub subspace: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct ParameterChangeProposal {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, repeated, tag = "3")]
    pub changes: Vec<ParamChange>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Plan {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub time: Option<Timestamp>,
    #[prost(int64, tag = "3")]
    pub height: i64,
    #[prost(string, tag = "4")]
    pub info: String,
    #[prost(message, optional, tag = "5")]
    pub upgraded_client_state: Option<Any>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SoftwareUpgradeProposal {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, optional, tag = "3")]
    pub plan: Option<Plan>,
}

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct CancelSoftwareUpgradeProposal {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub description: String,
}

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct CommunityPoolSpendProposal {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(string, tag = "3")]
    pub recipient: String,
    #[prost(message, repeated, tag = "4")]
    pub amount: Vec<Coin>,
}

/// The closed set of content variants a legacy proposal can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyContent {
    Text(TextProposal),
    ParameterChange(ParameterChangeProposal),
    SoftwareUpgrade(SoftwareUpgradeProposal),
    CancelSoftwareUpgrade(CancelSoftwareUpgradeProposal),
    CommunityPoolSpend(CommunityPoolSpendProposal),
}

impl LegacyContent {
    #[must_use]
    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Text(_) => TEXT_PROPOSAL_TYPE_URL,
            Self::ParameterChange(_) => PARAMETER_CHANGE_PROPOSAL_TYPE_URL,
            Self::SoftwareUpgrade(_) => SOFTWARE_UPGRADE_PROPOSAL_TYPE_URL,
            Self::CancelSoftwareUpgrade(_) => CANCEL_SOFTWARE_UPGRADE_PROPOSAL_TYPE_URL,
            Self::CommunityPoolSpend(_) => COMMUNITY_POOL_SPEND_PROPOSAL_TYPE_URL,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Text(inner) => &inner.title,
            Self::ParameterChange(inner) => &inner.title,
            Self::SoftwareUpgrade(inner) => &inner.title,
            Self::CancelSoftwareUpgrade(inner) => &inner.title,
            Self::CommunityPoolSpend(inner) => &inner.title,
        }
    }

    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::Text(inner) => &inner.description,
            Self::ParameterChange(inner) => &inner.description,
            Self::SoftwareUpgrade(inner) => &inner.description,
            Self::CancelSoftwareUpgrade(inner) => &inner.description,
            Self::CommunityPoolSpend(inner) => &inner.description,
        }
    }

    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            Self::Text(inner) => inner.encode_to_vec(),
            Self::ParameterChange(inner) => inner.encode_to_vec(),
            Self::SoftwareUpgrade(inner) => inner.encode_to_vec(),
            Self::CancelSoftwareUpgrade(inner) => inner.encode_to_vec(),
            Self::CommunityPoolSpend(inner) => inner.encode_to_vec(),
        }
    }

    #[must_use]
    pub fn to_any(&self) -> Any {
        Any {
            type_url: self.type_url().to_string(),
            value: self.encode_to_vec(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ContentError {
    #[error("content type {0:?} is not registered")]
    Unsupported(String),
    #[error("malformed {type_url} payload: {message}")]
    Malformed { type_url: String, message: String },
}

pub type ContentDecoder = fn(&[u8]) -> Result<LegacyContent, prost::DecodeError>;

/// Maps type URLs to decoders. Built explicitly and handed to the
/// transcoder; there is no process-wide registry.
#[derive(Clone)]
pub struct ContentRegistry {
    decoders: BTreeMap<String, ContentDecoder>,
}

impl Debug for ContentRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRegistry")
            .field("type_urls", &self.type_urls().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::v1beta1()
    }
}

impl ContentRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    /// Every content type the pre-upgrade chain could store.
    #[must_use]
    pub fn v1beta1() -> Self {
        Self::empty()
            .with(TEXT_PROPOSAL_TYPE_URL, decode_text)
            .with(PARAMETER_CHANGE_PROPOSAL_TYPE_URL, decode_parameter_change)
            .with(SOFTWARE_UPGRADE_PROPOSAL_TYPE_URL, decode_software_upgrade)
            .with(
                CANCEL_SOFTWARE_UPGRADE_PROPOSAL_TYPE_URL,
                decode_cancel_software_upgrade,
            )
            .with(
                COMMUNITY_POOL_SPEND_PROPOSAL_TYPE_URL,
                decode_community_pool_spend,
            )
    }

    #[must_use]
    pub fn with(mut self, type_url: &str, decoder: ContentDecoder) -> Self {
        self.decoders.insert(type_url.to_string(), decoder);
        self
    }

    pub fn type_urls(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Decodes `any` into its registered variant.
    ///
    /// # Errors
    /// Returns [`ContentError::Unsupported`] for unregistered type URLs and
    /// [`ContentError::Malformed`] when the payload does not decode.
    pub fn decode(&self, any: &Any) -> Result<LegacyContent, ContentError> {
        let decoder = self
            .decoders
            .get(&any.type_url)
            .ok_or_else(|| ContentError::Unsupported(any.type_url.clone()))?;
        let content = decoder(&any.value).map_err(|err| ContentError::Malformed {
            type_url: any.type_url.clone(),
            message: err.to_string(),
        })?;

        // A decoder registered under a foreign URL would silently retag content.
        if content.type_url() != any.type_url {
            return Err(ContentError::Malformed {
                type_url: any.type_url.clone(),
                message: format!("decoder produced {}", content.type_url()),
            });
        }

        Ok(content)
    }
}

fn decode_text(bytes: &[u8]) -> Result<LegacyContent, prost::DecodeError> {
    TextProposal::decode(bytes).map(LegacyContent::Text)
}

fn decode_parameter_change(bytes: &[u8]) -> Result<LegacyContent, prost::DecodeError> {
    ParameterChangeProposal::decode(bytes).map(LegacyContent::ParameterChange)
}

fn decode_software_upgrade(bytes: &[u8]) -> Result<LegacyContent, prost::DecodeError> {
    SoftwareUpgradeProposal::decode(bytes).map(LegacyContent::SoftwareUpgrade)
}

fn decode_cancel_software_upgrade(bytes: &[u8]) -> Result<LegacyContent, prost::DecodeError> {
    CancelSoftwareUpgradeProposal::decode(bytes).map(LegacyContent::CancelSoftwareUpgrade)
}

fn decode_community_pool_spend(bytes: &[u8]) -> Result<LegacyContent, prost::DecodeError> {
    CommunityPoolSpendProposal::decode(bytes).map(LegacyContent::CommunityPoolSpend)
}

/// A type-tagged payload plus its decoded value, resolved at most once.
///
/// The raw [`Any`] is the source of truth; the cached value is only ever set
/// by construction or by [`Envelope::resolve_with`].
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    any: Any,
    resolved: OnceCell<T>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn from_any(any: Any) -> Self {
        Self {
            any,
            resolved: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_value(any: Any, value: T) -> Self {
        Self {
            any,
            resolved: OnceCell::from(value),
        }
    }

    #[must_use]
    pub fn type_url(&self) -> &str {
        &self.any.type_url
    }

    #[must_use]
    pub fn as_any(&self) -> &Any {
        &self.any
    }

    #[must_use]
    pub fn into_any(self) -> Any {
        self.any
    }

    #[must_use]
    pub fn cached(&self) -> Option<&T> {
        self.resolved.get()
    }

    /// Returns the cached value, decoding it with `decode` on first access.
    ///
    /// # Errors
    /// Propagates the decoder's error; the cache stays empty in that case.
    pub fn resolve_with<E>(&self, decode: impl FnOnce(&Any) -> Result<T, E>) -> Result<&T, E> {
        if let Some(value) = self.resolved.get() {
            return Ok(value);
        }
        let value = decode(&self.any)?;
        Ok(self.resolved.get_or_init(|| value))
    }
}

impl<T> PartialEq for Envelope<T> {
    fn eq(&self, other: &Self) -> bool {
        self.any == other.any
    }
}

/// Decoded form of a `MsgExecLegacyContent` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecLegacyContent {
    pub content: Envelope<LegacyContent>,
    pub authority: String,
}

/// Wraps one legacy content value into a single executable message that
/// re-dispatches it under `authority`. The content bytes are carried verbatim.
#[must_use]
pub fn wrap_legacy_content(
    content_any: Any,
    content: LegacyContent,
    authority: &str,
) -> Envelope<ExecLegacyContent> {
    let message = MsgExecLegacyContent {
        content: Some(content_any.clone()),
        authority: authority.to_string(),
    };
    let any = Any {
        type_url: MSG_EXEC_LEGACY_CONTENT_TYPE_URL.to_string(),
        value: message.encode_to_vec(),
    };

    Envelope::with_value(
        any,
        ExecLegacyContent {
            content: Envelope::with_value(content_any, content),
            authority: authority.to_string(),
        },
    )
}

/// Decodes a `v1` message envelope back into the wrapped legacy content.
///
/// # Errors
/// Returns [`ContentError::Unsupported`] when the envelope is not a
/// `MsgExecLegacyContent` or its content type is unregistered, and
/// [`ContentError::Malformed`] when either layer fails to decode.
pub fn unwrap_legacy_content<'e>(
    envelope: &'e Envelope<ExecLegacyContent>,
    registry: &ContentRegistry,
) -> Result<&'e ExecLegacyContent, ContentError> {
    let exec = envelope.resolve_with(|any| {
        if any.type_url != MSG_EXEC_LEGACY_CONTENT_TYPE_URL {
            return Err(ContentError::Unsupported(any.type_url.clone()));
        }
        let message =
            MsgExecLegacyContent::decode(any.value.as_slice()).map_err(|err| {
                ContentError::Malformed {
                    type_url: any.type_url.clone(),
                    message: err.to_string(),
                }
            })?;
        let content_any = message.content.ok_or_else(|| ContentError::Malformed {
            type_url: any.type_url.clone(),
            message: "missing content".to_string(),
        })?;
        Ok(ExecLegacyContent {
            content: Envelope::from_any(content_any),
            authority: message.authority,
        })
    })?;

    exec.content.resolve_with(|any| registry.decode(any))?;
    Ok(exec)
}
