//! Live checks against a real Venafi TPP. Run with
//! `--features integration-tests` and the variables below set.

use std::{env, time::Duration};

use anyhow::{Context as _, Result, anyhow};

use acme_reconciler::core::context::Context;
use acme_reconciler::issuance::issuer::{
    CertificateAuthority, IssuerError, SecretKeyRef, VenafiTppConfig,
};
use acme_reconciler::issuance::venafi::VenafiClient;
use acme_reconciler::secrets::types::CredentialData;

use super::support::csr_pem;

struct TppTestConfig {
    url: String,
    zone: String,
    access_token: String,
    dns_name: String,
}

fn load_tpp_config() -> Result<TppTestConfig> {
    let var = |name: &str| env::var(name).with_context(|| format!("{name} must be set"));
    Ok(TppTestConfig {
        url: var("VENAFI_TPP_URL")?,
        zone: var("VENAFI_TPP_ZONE")?,
        access_token: var("VENAFI_TPP_ACCESS_TOKEN")?,
        dns_name: var("VENAFI_TEST_DNS_NAME")?,
    })
}

fn connect(config: &TppTestConfig) -> Result<VenafiClient> {
    let credentials = CredentialData::parse(
        serde_json::json!({"access-token": config.access_token})
            .to_string()
            .as_bytes(),
    );
    let tpp = VenafiTppConfig {
        url: config.url.clone(),
        credentials_ref: SecretKeyRef {
            name: "tpp".into(),
            key: None,
        },
        ca_bundle: env::var("VENAFI_TPP_CA_BUNDLE").ok(),
    };
    Ok(VenafiClient::tpp(
        &Context::with_timeout(Duration::from_secs(30)),
        &tpp,
        &config.zone,
        &credentials,
        Duration::from_secs(30),
    )?)
}

#[test]
fn tpp_zone_configuration_is_readable() -> Result<()> {
    let config = load_tpp_config()?;
    let client = connect(&config)?;
    client.read_zone_configuration(&Context::with_timeout(Duration::from_secs(30)))?;
    Ok(())
}

#[test]
fn tpp_issues_a_certificate() -> Result<()> {
    let config = load_tpp_config()?;
    let client = connect(&config)?;
    let csr = csr_pem(&[config.dns_name.as_str()]);
    let ctx = Context::with_timeout(Duration::from_secs(300));

    let pickup = client.request_certificate(&ctx, csr.as_bytes(), Duration::ZERO, &[])?;
    loop {
        match client.retrieve_certificate(&ctx, &pickup, csr.as_bytes(), Duration::ZERO, &[]) {
            Ok(chain) => {
                let chain = String::from_utf8(chain)?;
                if !chain.contains("BEGIN CERTIFICATE") {
                    return Err(anyhow!("TPP returned a chain without certificates"));
                }
                return Ok(());
            }
            Err(IssuerError::Pending(_)) => std::thread::sleep(Duration::from_secs(5)),
            Err(err) => return Err(err.into()),
        }
    }
}
