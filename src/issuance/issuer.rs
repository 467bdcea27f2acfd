use std::{sync::Arc, time::Duration};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    context::{Cancelled, Context},
    errors::{Classify, ErrorClass},
};
use crate::issuance::{
    acme::{AccountKey, AcmeHttpClient},
    ca::CaSigner,
    client::{AuthorityClient, AuthorityError},
    venafi::VenafiClient,
};
use crate::secrets::{
    store::{CredentialStore, SecretStoreError},
    types::CredentialData,
};

const DEFAULT_ACCOUNT_KEY: &str = "tls.key";

#[derive(Error, Debug)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
    #[error("issuer configuration invalid: {0}")]
    InvalidConfig(String),
    #[error("issuer operation failed: {0}")]
    Operation(String),
    #[error("certificate is not ready yet: {0}")]
    Pending(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Classify for IssuerError {
    fn class(&self) -> ErrorClass {
        match self {
            IssuerError::Unavailable(_) => ErrorClass::Transport,
            IssuerError::InvalidConfig(_) => ErrorClass::Configuration,
            IssuerError::Operation(_) => ErrorClass::AuthorityProtocol { transient: false },
            IssuerError::Pending(_) => ErrorClass::AuthorityProtocol { transient: true },
            IssuerError::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

impl From<SecretStoreError> for IssuerError {
    fn from(err: SecretStoreError) -> Self {
        match err {
            SecretStoreError::Unavailable(_) => IssuerError::Unavailable(err.to_string()),
            SecretStoreError::Cancelled(cancelled) => IssuerError::Cancelled(cancelled),
            SecretStoreError::NotFound(_) | SecretStoreError::Store(_) => {
                IssuerError::InvalidConfig(err.to_string())
            }
        }
    }
}

impl From<AuthorityError> for IssuerError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Cancelled(cancelled) => IssuerError::Cancelled(cancelled),
            other if other.is_retryable() => IssuerError::Unavailable(other.to_string()),
            other => IssuerError::InvalidConfig(other.to_string()),
        }
    }
}

/// Reference to one key inside a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerConfig {
    /// Directory URL of the authority.
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub private_key_secret_ref: SecretKeyRef,
    /// Known account URL; registration is skipped when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenafiTppConfig {
    pub url: String,
    pub credentials_ref: SecretKeyRef,
    /// PEM bundle trusted for the TPP endpoint in addition to system roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenafiCloudConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub api_token_secret_ref: SecretKeyRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenafiIssuerConfig {
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpp: Option<VenafiTppConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<VenafiCloudConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuerConfig {
    /// Credential holding `tls.crt` and `tls.key` of the signing CA.
    pub secret_name: String,
}

/// Issuer configuration; exactly one backend per issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IssuerConfig {
    Acme(AcmeIssuerConfig),
    Venafi(VenafiIssuerConfig),
    Ca(CaIssuerConfig),
}

impl IssuerConfig {
    pub fn from_json(raw: &str) -> Result<Self, IssuerError> {
        serde_json::from_str(raw)
            .map_err(|err| IssuerError::InvalidConfig(format!("failed to parse issuer config: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub name: String,
    pub value: String,
}

/// Subject defaults and restrictions a non-ACME backend applies to requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfiguration {
    pub organization: Option<String>,
    pub organizational_units: Vec<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub locality: Option<String>,
}

/// Request/retrieve style backends that sign a CSR without an ACME order.
pub trait CertificateAuthority: Send + Sync {
    /// Submits `csr_pem` and returns the id to pick the certificate up with.
    fn request_certificate(
        &self,
        ctx: &Context,
        csr_pem: &[u8],
        duration: Duration,
        custom_fields: &[CustomField],
    ) -> Result<String, IssuerError>;

    /// Returns the PEM chain, or `IssuerError::Pending` while it is being issued.
    fn retrieve_certificate(
        &self,
        ctx: &Context,
        pickup_id: &str,
        csr_pem: &[u8],
        duration: Duration,
        custom_fields: &[CustomField],
    ) -> Result<Vec<u8>, IssuerError>;

    fn read_zone_configuration(&self, ctx: &Context) -> Result<ZoneConfiguration, IssuerError>;
}

/// The backend selected for one issuer, built once and reused for every call.
pub enum IssuerBackend {
    Acme(Arc<AcmeHttpClient>),
    Venafi(VenafiClient),
    Ca(CaSigner),
}

impl std::fmt::Debug for IssuerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

fn credential(
    ctx: &Context,
    store: &dyn CredentialStore,
    namespace: &str,
    name: &str,
) -> Result<CredentialData, IssuerError> {
    let bytes = store.get_credential(ctx, namespace, name)?;
    Ok(CredentialData::parse(&bytes))
}

impl IssuerBackend {
    /// Builds the backend named by `config`.
    ///
    /// Credential lookups and any authentication handshake happen here.
    /// Errors are `Unavailable` when a later attempt may succeed and
    /// `InvalidConfig` when the configuration itself is at fault.
    pub fn from_config(
        ctx: &Context,
        namespace: &str,
        config: &IssuerConfig,
        credentials: &dyn CredentialStore,
        http_timeout: Duration,
    ) -> Result<Self, IssuerError> {
        ctx.check()?;
        let backend = match config {
            IssuerConfig::Acme(acme) => {
                let secret = credential(ctx, credentials, namespace, &acme.private_key_secret_ref.name)?;
                let field = acme
                    .private_key_secret_ref
                    .key
                    .as_deref()
                    .unwrap_or(DEFAULT_ACCOUNT_KEY);
                let pem = secret.field_or_raw(field).ok_or_else(|| {
                    IssuerError::InvalidConfig(format!(
                        "credential {} has no {field} entry",
                        acme.private_key_secret_ref.name
                    ))
                })?;
                let key = AccountKey::from_pem(pem.as_bytes())
                    .map_err(|err| IssuerError::InvalidConfig(format!("{err:#}")))?;
                let mut client =
                    AcmeHttpClient::new(&acme.server, key, acme.email.clone(), http_timeout);
                if let Some(account_url) = &acme.account_url {
                    client = client.with_account_url(account_url);
                }
                let account = client.ensure_account(ctx)?;
                debug!("[issuer] ACME account {account} at {}", acme.server);
                IssuerBackend::Acme(Arc::new(client))
            }
            IssuerConfig::Venafi(venafi) => match (&venafi.tpp, &venafi.cloud) {
                (Some(tpp), _) => {
                    let secret = credential(ctx, credentials, namespace, &tpp.credentials_ref.name)?;
                    IssuerBackend::Venafi(VenafiClient::tpp(
                        ctx,
                        tpp,
                        &venafi.zone,
                        &secret,
                        http_timeout,
                    )?)
                }
                (None, Some(cloud)) => {
                    let secret =
                        credential(ctx, credentials, namespace, &cloud.api_token_secret_ref.name)?;
                    IssuerBackend::Venafi(VenafiClient::cloud(
                        cloud,
                        &venafi.zone,
                        &secret,
                        http_timeout,
                    )?)
                }
                (None, None) => {
                    return Err(IssuerError::InvalidConfig(
                        "neither Venafi Cloud or TPP configuration found".into(),
                    ));
                }
            },
            IssuerConfig::Ca(ca) => {
                let secret = credential(ctx, credentials, namespace, &ca.secret_name)?;
                IssuerBackend::Ca(CaSigner::from_credential(&secret)?)
            }
        };
        info!("[issuer] {} backend ready for namespace {namespace}", backend.kind());
        Ok(backend)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IssuerBackend::Acme(_) => "acme",
            IssuerBackend::Venafi(_) => "venafi",
            IssuerBackend::Ca(_) => "ca",
        }
    }

    /// The ACME client driving the order state machine, for ACME issuers.
    pub fn authority(&self) -> Option<Arc<dyn AuthorityClient>> {
        match self {
            IssuerBackend::Acme(client) => Some(client.clone() as Arc<dyn AuthorityClient>),
            _ => None,
        }
    }

    /// Request/retrieve interface, for every non-ACME issuer.
    pub fn certificate_authority(&self) -> Option<&dyn CertificateAuthority> {
        match self {
            IssuerBackend::Acme(_) => None,
            IssuerBackend::Venafi(client) => Some(client),
            IssuerBackend::Ca(signer) => Some(signer),
        }
    }
}
