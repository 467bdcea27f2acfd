use std::time::Duration;

use anyhow::{Result, anyhow};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

use acme_reconciler::core::context::Context;
use acme_reconciler::core::errors::{Classify, ErrorClass};
use acme_reconciler::issuance::issuer::{IssuerBackend, IssuerConfig, IssuerError};
use acme_reconciler::secrets::memory::MemoryCredentialStore;

use super::support::csr_pem;

fn store_ca(credentials: &MemoryCredentialStore) -> Result<String> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, "Integration CA");
    params.distinguished_name.push(DnType::OrganizationName, "Integration Org");
    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    let key_pem = key.serialize_pem();
    credentials.insert_fields(
        "default",
        "ca-key-pair",
        &[("tls.crt", cert_pem.as_str()), ("tls.key", key_pem.as_str())],
    );
    Ok(cert_pem)
}

#[test]
fn ca_issuer_signs_through_request_and_retrieve() -> Result<()> {
    let ctx = Context::background();
    let credentials = MemoryCredentialStore::new();
    let ca_pem = store_ca(&credentials)?;
    let config = IssuerConfig::from_json(r#"{"type": "ca", "secretName": "ca-key-pair"}"#)?;

    let backend = IssuerBackend::from_config(&ctx, "default", &config, &credentials, Duration::from_secs(5))?;
    assert_eq!(backend.kind(), "ca");
    assert!(backend.authority().is_none());
    let ca = backend
        .certificate_authority()
        .ok_or_else(|| anyhow!("ca backend has no request interface"))?;

    let csr = csr_pem(&["svc.example.com"]);
    let duration = Duration::from_secs(30 * 24 * 3600);
    let pickup = ca.request_certificate(&ctx, csr.as_bytes(), duration, &[])?;
    let chain = String::from_utf8(ca.retrieve_certificate(&ctx, &pickup, csr.as_bytes(), duration, &[])?)?;

    assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);
    assert!(chain.contains(ca_pem.trim_end()));
    let zone = ca.read_zone_configuration(&ctx)?;
    assert_eq!(zone.organization.as_deref(), Some("Integration Org"));
    Ok(())
}

#[test]
fn backend_errors_follow_the_taxonomy() -> Result<()> {
    let ctx = Context::background();
    let credentials = MemoryCredentialStore::new();

    let missing = IssuerConfig::from_json(r#"{"type": "ca", "secretName": "absent"}"#)?;
    let err = IssuerBackend::from_config(&ctx, "default", &missing, &credentials, Duration::from_secs(5))
        .err()
        .ok_or_else(|| anyhow!("expected a missing credential to fail"))?;
    assert_eq!(err.class(), ErrorClass::Configuration);

    let cancelled = Context::background();
    cancelled.cancel_handle().cancel();
    let err = IssuerBackend::from_config(&cancelled, "default", &missing, &credentials, Duration::from_secs(5))
        .err()
        .ok_or_else(|| anyhow!("expected a cancelled context to fail"))?;
    assert!(matches!(err, IssuerError::Cancelled(_)));
    Ok(())
}
