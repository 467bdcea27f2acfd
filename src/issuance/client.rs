use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    context::{Cancelled, Context},
    errors::{Classify, ErrorClass},
    types::State,
};

const PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// RFC 7807 problem document as returned by an ACME authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
}

impl Problem {
    /// Short problem name with the ACME URN prefix removed.
    pub fn short_kind(&self) -> &str {
        self.kind.strip_prefix(PROBLEM_PREFIX).unwrap_or(&self.kind)
    }

    pub fn is_transient(&self) -> bool {
        if matches!(
            self.short_kind(),
            "rateLimited" | "serverInternal" | "badNonce"
        ) {
            return true;
        }
        matches!(self.status, Some(status) if status == 429 || status >= 500)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.detail.is_empty()) {
            (Some(status), false) => write!(f, "{status} {}: {}", self.kind, self.detail),
            (Some(status), true) => write!(f, "{status} {}", self.kind),
            (None, false) => write!(f, "{}: {}", self.kind, self.detail),
            (None, true) => f.write_str(&self.kind),
        }
    }
}

/// Error attached to a challenge by the authority.
///
/// Authorities are expected to send a problem document, but anything else is
/// kept as-is so its text can still be surfaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChallengeError {
    Structured(Problem),
    Unstructured(serde_json::Value),
}

impl ChallengeError {
    /// Text to surface as the challenge reason.
    pub fn reason(&self) -> String {
        match self {
            ChallengeError::Structured(problem) => problem.detail.clone(),
            ChallengeError::Unstructured(value) => value.to_string_lossless(),
        }
    }
}

impl fmt::Display for ChallengeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeError::Structured(problem) => problem.fmt(f),
            ChallengeError::Unstructured(value) => f.write_str(&value.to_string_lossless()),
        }
    }
}

trait LosslessString {
    fn to_string_lossless(&self) -> String;
}

impl LosslessString for serde_json::Value {
    fn to_string_lossless(&self) -> String {
        match self {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeChallenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub status: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChallengeError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    /// Location the authorization was fetched from; not part of the wire body.
    #[serde(default, skip_serializing)]
    pub url: String,
    pub identifier: Identifier,
    #[serde(default)]
    pub status: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub challenges: Vec<AcmeChallenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    pub fn challenge_by_url(&self, url: &str) -> Option<&AcmeChallenge> {
        self.challenges.iter().find(|challenge| challenge.url == url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeOrder {
    /// Location of the order; taken from the `Location` header on creation.
    #[serde(default, skip_serializing)]
    pub url: String,
    #[serde(default)]
    pub status: State,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    #[serde(default)]
    pub finalize: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authority error: {0}")]
    Protocol(Problem),
    #[error("malformed authority response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl AuthorityError {
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            AuthorityError::Protocol(problem) => Some(problem),
            _ => None,
        }
    }

    /// Human readable detail for a terminal failure reason.
    pub fn reason(&self) -> String {
        match self {
            AuthorityError::Protocol(problem) if !problem.detail.is_empty() => {
                problem.detail.clone()
            }
            other => other.to_string(),
        }
    }
}

impl Classify for AuthorityError {
    fn class(&self) -> ErrorClass {
        match self {
            AuthorityError::Transport(_) => ErrorClass::Transport,
            AuthorityError::Protocol(problem) => ErrorClass::AuthorityProtocol {
                transient: problem.is_transient(),
            },
            // A body we could not decode is usually a proxy or outage page.
            AuthorityError::Malformed(_) => ErrorClass::Transport,
            AuthorityError::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

/// Operations the issuance state machine needs from an ACME authority.
///
/// Every call is blocking and must give up with `AuthorityError::Cancelled`
/// once `ctx` is cancelled or past its deadline.
pub trait AuthorityClient: Send + Sync {
    fn create_order(
        &self,
        ctx: &Context,
        identifiers: &[Identifier],
    ) -> Result<AcmeOrder, AuthorityError>;

    fn get_order(&self, ctx: &Context, url: &str) -> Result<AcmeOrder, AuthorityError>;

    /// Fetches an authorization with POST-as-GET.
    fn get_authorization(&self, ctx: &Context, url: &str) -> Result<Authorization, AuthorityError>;

    fn accept_challenge(&self, ctx: &Context, url: &str) -> Result<AcmeChallenge, AuthorityError>;

    fn finalize_order(
        &self,
        ctx: &Context,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<AcmeOrder, AuthorityError>;

    /// Downloads the PEM certificate chain.
    fn get_certificate(&self, ctx: &Context, url: &str) -> Result<Vec<u8>, AuthorityError>;

    fn key_authorization(&self, token: &str) -> Result<String, AuthorityError>;
}
