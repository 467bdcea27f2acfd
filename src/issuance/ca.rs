use std::time::Duration;

use log::{debug, info};
use rcgen::{Certificate, CertificateParams, CertificateSigningRequestParams, IsCa, KeyPair};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::pem::parse_x509_pem;

use crate::core::context::Context;
use crate::issuance::issuer::{CertificateAuthority, CustomField, IssuerError, ZoneConfiguration};
use crate::secrets::types::CredentialData;

const DEFAULT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

/// Signs CSRs locally with a CA key pair held in the credential store.
pub struct CaSigner {
    ca_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_not_after: OffsetDateTime,
    zone: ZoneConfiguration,
}

fn invalid(message: impl std::fmt::Display) -> IssuerError {
    IssuerError::InvalidConfig(message.to_string())
}

impl CaSigner {
    /// Expects `tls.crt` and `tls.key` entries.
    pub fn from_credential(credential: &CredentialData) -> Result<Self, IssuerError> {
        let cert_pem = credential
            .get("tls.crt")
            .ok_or_else(|| invalid("CA credential has no tls.crt entry"))?;
        let key_pem = credential
            .get("tls.key")
            .ok_or_else(|| invalid("CA credential has no tls.key entry"))?;
        Self::from_pem(cert_pem, key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, IssuerError> {
        let (_, pem_block) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|err| invalid(format!("failed to parse CA certificate PEM: {err}")))?;
        let parsed = pem_block
            .parse_x509()
            .map_err(|err| invalid(format!("failed to parse CA certificate: {err}")))?;
        if !parsed.is_ca() {
            return Err(invalid("tls.crt is not a CA certificate"));
        }
        let ca_not_after = OffsetDateTime::from_unix_timestamp(parsed.validity().not_after.timestamp())
            .map_err(|err| invalid(format!("CA expiry out of range: {err}")))?;
        let subject = parsed.subject();
        let first = |values: Vec<&str>| values.first().map(|value| value.to_string());
        let zone = ZoneConfiguration {
            organization: first(subject.iter_organization().filter_map(|a| a.as_str().ok()).collect()),
            organizational_units: subject
                .iter_organizational_unit()
                .filter_map(|a| a.as_str().ok())
                .map(str::to_string)
                .collect(),
            country: first(subject.iter_country().filter_map(|a| a.as_str().ok()).collect()),
            province: first(subject.iter_state_or_province().filter_map(|a| a.as_str().ok()).collect()),
            locality: first(subject.iter_locality().filter_map(|a| a.as_str().ok()).collect()),
        };

        let ca_key = KeyPair::from_pem(key_pem).map_err(|err| invalid(format!("invalid CA key: {err}")))?;
        let ca_cert = CertificateParams::from_ca_cert_pem(cert_pem)
            .and_then(|params| params.self_signed(&ca_key))
            .map_err(|err| invalid(format!("CA certificate does not match its key: {err}")))?;
        debug!("[issuer] loaded CA {}", parsed.subject());

        Ok(Self {
            ca_pem: cert_pem.trim_end().to_string() + "\n",
            ca_cert,
            ca_key,
            ca_not_after,
            zone,
        })
    }

    fn parse_csr(csr_pem: &[u8]) -> Result<CertificateSigningRequestParams, IssuerError> {
        let text = std::str::from_utf8(csr_pem).map_err(|_| invalid("CSR is not valid PEM text"))?;
        CertificateSigningRequestParams::from_pem(text).map_err(|err| invalid(format!("invalid CSR: {err}")))
    }

    /// Leaf PEM followed by the CA certificate. Validity never outlives the CA.
    pub fn sign(&self, csr_pem: &[u8], duration: Duration) -> Result<Vec<u8>, IssuerError> {
        let mut csr = Self::parse_csr(csr_pem)?;
        let duration = if duration.is_zero() { DEFAULT_VALIDITY } else { duration };
        let not_before = OffsetDateTime::now_utc();
        let not_after = (not_before + duration).min(self.ca_not_after);
        if not_after <= not_before {
            return Err(IssuerError::Operation("CA certificate has expired".into()));
        }
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.use_authority_key_identifier_extension = true;
        let leaf = csr
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|err| IssuerError::Operation(format!("failed to sign certificate: {err}")))?;
        let mut chain = leaf.pem();
        chain.push_str(&self.ca_pem);
        Ok(chain.into_bytes())
    }
}

impl CertificateAuthority for CaSigner {
    fn request_certificate(
        &self,
        ctx: &Context,
        csr_pem: &[u8],
        _duration: Duration,
        _custom_fields: &[CustomField],
    ) -> Result<String, IssuerError> {
        ctx.check()?;
        Self::parse_csr(csr_pem)?;
        Ok(hex::encode(Sha256::digest(csr_pem)))
    }

    fn retrieve_certificate(
        &self,
        ctx: &Context,
        pickup_id: &str,
        csr_pem: &[u8],
        duration: Duration,
        _custom_fields: &[CustomField],
    ) -> Result<Vec<u8>, IssuerError> {
        ctx.check()?;
        if hex::encode(Sha256::digest(csr_pem)) != pickup_id {
            return Err(IssuerError::Operation(format!(
                "CSR does not match pickup id {pickup_id}"
            )));
        }
        let chain = self.sign(csr_pem, duration)?;
        info!("[issuer] CA signed certificate {pickup_id}");
        Ok(chain)
    }

    fn read_zone_configuration(&self, ctx: &Context) -> Result<ZoneConfiguration, IssuerError> {
        ctx.check()?;
        Ok(self.zone.clone())
    }
}
