use std::{borrow::Cow, collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use k8s_openapi::{NamespaceResourceScope, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const API_GROUP: &str = "acme.reconciler.io";
pub const API_VERSION: &str = "v1";

/// Finalizer placed on every Challenge so solver clean-up runs before removal.
pub const CHALLENGE_FINALIZER: &str = "finalizer.acme.reconciler.io";
/// Label linking a Challenge to the Order that created it.
pub const ORDER_NAME_LABEL: &str = "acme.reconciler.io/order-name";

pub const HTTP01: &str = "http-01";
pub const DNS01: &str = "dns-01";
pub const TLS_ALPN01: &str = "tls-alpn-01";

/// Authority-reported state of an order, authorization or challenge.
///
/// Values the authority sends that are not listed here are kept verbatim in
/// `Other` so newer authority states survive a round trip through storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum State {
    #[default]
    Unset,
    Pending,
    Processing,
    Ready,
    Valid,
    Invalid,
    Expired,
    Errored,
    Other(String),
}

impl State {
    pub fn as_str(&self) -> &str {
        match self {
            State::Unset => "",
            State::Pending => "pending",
            State::Processing => "processing",
            State::Ready => "ready",
            State::Valid => "valid",
            State::Invalid => "invalid",
            State::Expired => "expired",
            State::Errored => "errored",
            State::Other(raw) => raw,
        }
    }

    /// Terminal states are an explicit allow-list; unknown values never count as final.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            State::Valid | State::Invalid | State::Expired | State::Errored
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, State::Invalid | State::Expired | State::Errored)
    }
}

impl From<&str> for State {
    fn from(raw: &str) -> Self {
        match raw {
            "" => State::Unset,
            "pending" => State::Pending,
            "processing" => State::Processing,
            "ready" => State::Ready,
            "valid" => State::Valid,
            "invalid" => State::Invalid,
            "expired" => State::Expired,
            "errored" => State::Errored,
            other => State::Other(other.to_string()),
        }
    }
}

impl From<String> for State {
    fn from(raw: String) -> Self {
        State::from(raw.as_str())
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespaced identity of a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One authority-side challenge bound to one authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ChallengeSpec,
    #[serde(default)]
    pub status: ChallengeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSpec {
    /// Authority-assigned challenge URL; empty until the order exists at the authority.
    #[serde(default)]
    pub url: String,
    pub authorization_url: String,
    pub dns_name: String,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub token: String,
    /// Proof value the solver must present (key authorization or its DNS digest).
    pub key: String,
    #[serde(default)]
    pub order_ref: String,
    #[serde(default)]
    pub issuer_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStatus {
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub presented: bool,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub reason: String,
    /// Authority polls performed since the challenge was accepted.
    #[serde(default)]
    pub processing_attempts: u32,
    /// Presentation checks performed before the challenge was accepted.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Where a challenge sits in its local lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePhase {
    Created,
    Presenting,
    Accepting,
    Polling,
    Finished,
}

impl Challenge {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::of(&self.metadata)
    }

    pub fn phase(&self) -> ChallengePhase {
        let status = &self.status;
        if status.state.is_final() {
            ChallengePhase::Finished
        } else if status.accepted {
            ChallengePhase::Polling
        } else if status.presented {
            ChallengePhase::Accepting
        } else if status.processing {
            ChallengePhase::Presenting
        } else {
            ChallengePhase::Created
        }
    }
}

/// One authority-side certificate order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: OrderSpec,
    #[serde(default)]
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    /// PEM encoded certificate signing request submitted at finalization.
    pub request: String,
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub issuer_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub finalize_url: String,
    #[serde(default)]
    pub certificate_url: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub authorizations: Vec<AuthorizationStatus>,
    /// PEM encoded chain, set once the order is valid.
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    pub poll: PollState,
    #[serde(default)]
    pub failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationStatus {
    pub url: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(default)]
    pub initial_state: State,
    #[serde(default)]
    pub offered: Vec<ChallengeOffer>,
    #[serde(default)]
    pub attempted_types: Vec<String>,
    /// Name of the live Challenge solving this authorization.
    #[serde(default)]
    pub challenge: Option<String>,
}

impl AuthorizationStatus {
    pub fn fetched(&self) -> bool {
        !self.identifier.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeOffer {
    pub url: String,
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub token: String,
}

/// Persisted bookkeeping for a bounded polling loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl PollState {
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt = Some(now);
    }

    pub fn reset(&mut self) {
        *self = PollState::default();
    }
}

/// A resource kind the reconcilers can read and persist.
///
/// The status block is compared separately from metadata so status writes and
/// metadata writes can be issued independently.
pub trait StoredResource:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Status: Clone + fmt::Debug + Default + PartialEq + Serialize + DeserializeOwned;

    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn resource_key(&self) -> ResourceKey {
        ResourceKey::of(self.meta())
    }

    fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or_default()
    }

    fn labels(&self) -> Cow<'_, BTreeMap<String, String>> {
        match &self.meta().labels {
            Some(labels) => Cow::Borrowed(labels),
            None => Cow::Owned(BTreeMap::new()),
        }
    }
}

macro_rules! stored_resource {
    ($ty:ty, $status:ty, $kind:literal, $plural:literal) => {
        impl kube::Resource for $ty {
            type DynamicType = ();
            type Scope = NamespaceResourceScope;

            fn kind(_: &()) -> Cow<'_, str> {
                Cow::Borrowed($kind)
            }

            fn group(_: &()) -> Cow<'_, str> {
                Cow::Borrowed(API_GROUP)
            }

            fn version(_: &()) -> Cow<'_, str> {
                Cow::Borrowed(API_VERSION)
            }

            fn plural(_: &()) -> Cow<'_, str> {
                Cow::Borrowed($plural)
            }

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }

        impl StoredResource for $ty {
            type Status = $status;

            fn status(&self) -> &$status {
                &self.status
            }

            fn status_mut(&mut self) -> &mut $status {
                &mut self.status
            }
        }
    };
}

stored_resource!(Challenge, ChallengeStatus, "Challenge", "challenges");
stored_resource!(Order, OrderStatus, "Order", "orders");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_states_round_trip_verbatim() {
        let state: State = serde_json::from_str("\"deactivated\"").unwrap();
        assert_eq!(state, State::Other("deactivated".into()));
        assert!(!state.is_final());
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"deactivated\"");
    }

    #[test]
    fn final_states_are_an_allow_list() {
        for raw in ["valid", "invalid", "expired", "errored"] {
            assert!(State::from(raw).is_final(), "{raw} should be final");
        }
        for raw in ["", "pending", "processing", "ready", "revoked"] {
            assert!(!State::from(raw).is_final(), "{raw} should not be final");
        }
    }

    #[test]
    fn challenge_phase_follows_status_flags() {
        let mut ch = Challenge::default();
        assert_eq!(ch.phase(), ChallengePhase::Created);
        ch.status.processing = true;
        assert_eq!(ch.phase(), ChallengePhase::Presenting);
        ch.status.presented = true;
        assert_eq!(ch.phase(), ChallengePhase::Accepting);
        ch.status.accepted = true;
        assert_eq!(ch.phase(), ChallengePhase::Polling);
        ch.status.state = State::Valid;
        assert_eq!(ch.phase(), ChallengePhase::Finished);
    }

    #[test]
    fn challenge_spec_uses_wire_field_names() {
        let raw = serde_json::json!({
            "metadata": { "name": "ch-1", "namespace": "default" },
            "spec": {
                "url": "https://ca.example/chall/1",
                "authorizationUrl": "https://ca.example/authz/9",
                "dnsName": "example.com",
                "type": "http-01",
                "token": "tok",
                "key": "tok.thumb"
            }
        });
        let ch: Challenge = serde_json::from_value(raw).unwrap();
        assert_eq!(ch.spec.challenge_type, HTTP01);
        assert_eq!(ch.status.state, State::Unset);
        assert_eq!(ch.key(), ResourceKey::new("default", "ch-1"));
    }
}
