use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use log::{debug, info, warn};
use reqwest::{
    Certificate, StatusCode,
    blocking::{Client, RequestBuilder, Response},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::core::context::Context;
use crate::issuance::http::{
    build_client, client_builder, is_transient_status, request_timeout, status_message,
};
use crate::issuance::issuer::{
    CertificateAuthority, CustomField, IssuerError, VenafiCloudConfig, VenafiTppConfig,
    ZoneConfiguration,
};
use crate::issuance::metrics::VenafiMetrics;
use crate::secrets::types::CredentialData;

pub const DEFAULT_CLOUD_URL: &str = "https://api.venafi.cloud";
const DEFAULT_API_KEY_FIELD: &str = "api-key";
const POLICY_ROOT: &str = "\\VED\\Policy\\";
const OAUTH_CLIENT_ID: &str = "vcert-sdk";
const OAUTH_SCOPE: &str = "certificate:manage";

enum Connector {
    Tpp {
        base: String,
        token: Zeroizing<String>,
    },
    Cloud {
        base: String,
        api_key: Zeroizing<String>,
        template: Mutex<Option<CloudTemplate>>,
    },
}

#[derive(Debug, Clone)]
struct CloudTemplate {
    application_id: String,
    template_id: String,
    zone: ZoneConfiguration,
}

/// Venafi TPP or Venafi Cloud, whichever the issuer configures.
pub struct VenafiClient {
    http: Client,
    timeout: Duration,
    zone: String,
    connector: Connector,
    metrics: Option<VenafiMetrics>,
}

fn service(connector: &Connector) -> &'static str {
    match connector {
        Connector::Tpp { .. } => "Venafi TPP",
        Connector::Cloud { .. } => "Venafi Cloud",
    }
}

fn transport(ctx: &Context, err: reqwest::Error) -> IssuerError {
    if let Err(cancelled) = ctx.check() {
        return IssuerError::Cancelled(cancelled);
    }
    IssuerError::Unavailable(err.to_string())
}

fn check_status(service: &str, response: Response) -> Result<Response, IssuerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let message = status_message(service, status, Some(&body));
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(IssuerError::InvalidConfig(message))
    } else if is_transient_status(status) {
        Err(IssuerError::Unavailable(message))
    } else {
        Err(IssuerError::Operation(message))
    }
}

fn decode<T: DeserializeOwned>(service: &str, response: Response) -> Result<T, IssuerError> {
    let body = response
        .bytes()
        .map_err(|err| IssuerError::Unavailable(err.to_string()))?;
    serde_json::from_slice(&body)
        .map_err(|err| IssuerError::Operation(format!("unexpected {service} response: {err}")))
}

fn trim_base(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix("/vedsdk").unwrap_or(url).to_string()
}

fn policy_dn(zone: &str) -> String {
    let zone = zone.trim_start_matches('\\');
    if zone.starts_with("VED\\") {
        format!("\\{zone}")
    } else {
        format!("{POLICY_ROOT}{zone}")
    }
}

fn trusted_client(ca_bundle: Option<&str>, timeout: Duration) -> Result<Client, IssuerError> {
    let Some(bundle) = ca_bundle.filter(|bundle| !bundle.trim().is_empty()) else {
        return Ok(build_client(timeout));
    };
    let blocks = pem::parse_many(bundle)
        .map_err(|err| IssuerError::InvalidConfig(format!("invalid TPP caBundle: {err}")))?;
    if blocks.is_empty() {
        return Err(IssuerError::InvalidConfig("TPP caBundle contains no certificates".into()));
    }
    let mut builder = client_builder(timeout);
    for block in blocks {
        let cert = Certificate::from_der(block.contents())
            .map_err(|err| IssuerError::InvalidConfig(format!("invalid TPP caBundle: {err}")))?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|err| IssuerError::InvalidConfig(format!("failed to build TPP client: {err}")))
}

#[derive(Deserialize)]
struct OauthToken {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TppRequestResponse {
    #[serde(rename = "CertificateDN")]
    certificate_dn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TppRetrieveResponse {
    certificate_data: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct TppLockedValue {
    value: Option<String>,
    values: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct TppSubjectPolicy {
    organization: TppLockedValue,
    organizational_unit: TppLockedValue,
    country: TppLockedValue,
    state: TppLockedValue,
    city: TppLockedValue,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct TppPolicy {
    subject: TppSubjectPolicy,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TppCheckPolicyResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    policy: Option<TppPolicy>,
}

#[derive(Deserialize)]
struct CloudApplication {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CloudRecommendedSettings {
    subject_o_value: Option<String>,
    subject_ou_value: Option<String>,
    subject_c_value: Option<String>,
    subject_st_value: Option<String>,
    subject_l_value: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudIssuingTemplate {
    id: String,
    #[serde(default)]
    recommended_settings: CloudRecommendedSettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudRequest {
    id: String,
    status: String,
    #[serde(default)]
    certificate_ids: Vec<String>,
    #[serde(default)]
    error_information: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudRequestList {
    certificate_requests: Vec<CloudRequest>,
}

impl VenafiClient {
    /// Authenticates against TPP with a stored access token, or with a
    /// username and password exchanged for one.
    pub fn tpp(
        ctx: &Context,
        config: &VenafiTppConfig,
        zone: &str,
        credentials: &CredentialData,
        timeout: Duration,
    ) -> Result<Self, IssuerError> {
        let http = trusted_client(config.ca_bundle.as_deref(), timeout)?;
        let base = trim_base(&config.url);
        let token = match (
            credentials.get("username"),
            credentials.get("password"),
            credentials.get("access-token"),
        ) {
            (Some(username), Some(password), _) => {
                Self::oauth_token(ctx, &http, timeout, &base, username, password)?
            }
            (_, _, Some(token)) => Zeroizing::new(token.to_string()),
            _ => {
                return Err(IssuerError::InvalidConfig(format!(
                    "credential {} needs username and password or access-token",
                    config.credentials_ref.name
                )));
            }
        };
        let client = Self {
            http,
            timeout,
            zone: zone.to_string(),
            connector: Connector::Tpp { base, token },
            metrics: VenafiMetrics::shared(),
        };
        client.verify_token(ctx)?;
        info!("[venafi] authenticated with TPP at {}", config.url);
        Ok(client)
    }

    pub fn cloud(
        config: &VenafiCloudConfig,
        zone: &str,
        credentials: &CredentialData,
        timeout: Duration,
    ) -> Result<Self, IssuerError> {
        let field = config
            .api_token_secret_ref
            .key
            .as_deref()
            .unwrap_or(DEFAULT_API_KEY_FIELD);
        let api_key = credentials.field_or_raw(field).ok_or_else(|| {
            IssuerError::InvalidConfig(format!(
                "credential {} has no {field} entry",
                config.api_token_secret_ref.name
            ))
        })?;
        if !zone.contains('\\') {
            return Err(IssuerError::InvalidConfig(format!(
                "Venafi Cloud zone {zone:?} must be <application>\\<template alias>"
            )));
        }
        let base = trim_base(config.url.as_deref().unwrap_or(DEFAULT_CLOUD_URL));
        Ok(Self {
            http: build_client(timeout),
            timeout,
            zone: zone.to_string(),
            connector: Connector::Cloud {
                base,
                api_key,
                template: Mutex::new(None),
            },
            metrics: VenafiMetrics::shared(),
        })
    }

    /// Records calls on `metrics` instead of the default registry.
    pub fn with_metrics(mut self, metrics: VenafiMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn instrumented<T>(
        &self,
        api_call: &str,
        call: impl FnOnce() -> Result<T, IssuerError>,
    ) -> Result<T, IssuerError> {
        let started = Instant::now();
        let result = call();
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(IssuerError::Pending(_)) => "pending",
                Err(_) => "error",
            };
            metrics.observe(api_call, outcome, started.elapsed());
        }
        result
    }

    fn oauth_token(
        ctx: &Context,
        http: &Client,
        timeout: Duration,
        base: &str,
        username: &str,
        password: &str,
    ) -> Result<Zeroizing<String>, IssuerError> {
        ctx.check()?;
        debug!("[venafi] requesting TPP access token for {username}");
        let response = http
            .post(format!("{base}/vedauth/authorize/oauth"))
            .timeout(request_timeout(ctx, timeout))
            .json(&json!({
                "username": username,
                "password": password,
                "client_id": OAUTH_CLIENT_ID,
                "scope": OAUTH_SCOPE,
            }))
            .send()
            .map_err(|err| transport(ctx, err))?;
        let response = check_status("Venafi TPP", response)?;
        let token: OauthToken = decode("Venafi TPP", response)?;
        Ok(Zeroizing::new(token.access_token))
    }

    fn request(&self, ctx: &Context, builder: RequestBuilder) -> Result<Response, IssuerError> {
        ctx.check()?;
        let builder = match &self.connector {
            Connector::Tpp { token, .. } => builder.bearer_auth(token.as_str()),
            Connector::Cloud { api_key, .. } => builder.header("tppl-api-key", api_key.as_str()),
        };
        let response = builder
            .timeout(request_timeout(ctx, self.timeout))
            .send()
            .map_err(|err| transport(ctx, err))?;
        check_status(service(&self.connector), response)
    }

    fn url(&self, path: &str) -> String {
        match &self.connector {
            Connector::Tpp { base, .. } | Connector::Cloud { base, .. } => format!("{base}{path}"),
        }
    }

    fn verify_token(&self, ctx: &Context) -> Result<(), IssuerError> {
        self.request(ctx, self.http.get(self.url("/vedauth/authorize/verify")))?;
        Ok(())
    }

    fn cloud_template(&self, ctx: &Context) -> Result<CloudTemplate, IssuerError> {
        let Connector::Cloud { template, .. } = &self.connector else {
            return Err(IssuerError::Operation("not a Venafi Cloud connector".into()));
        };
        if let Some(cached) = template.lock().ok().and_then(|guard| guard.clone()) {
            return Ok(cached);
        }
        let (application, alias) = self.zone.split_once('\\').ok_or_else(|| {
            IssuerError::InvalidConfig(format!("invalid Venafi Cloud zone {:?}", self.zone))
        })?;
        let app: CloudApplication = decode(
            "Venafi Cloud",
            self.request(
                ctx,
                self.http
                    .get(self.url(&format!("/outagedetection/v1/applications/name/{application}"))),
            )?,
        )?;
        let issuing: CloudIssuingTemplate = decode(
            "Venafi Cloud",
            self.request(
                ctx,
                self.http.get(self.url(&format!(
                    "/outagedetection/v1/applications/{application}/certificateissuingtemplates/{alias}"
                ))),
            )?,
        )?;
        let settings = issuing.recommended_settings;
        let resolved = CloudTemplate {
            application_id: app.id,
            template_id: issuing.id,
            zone: ZoneConfiguration {
                organization: settings.subject_o_value,
                organizational_units: settings.subject_ou_value.into_iter().collect(),
                country: settings.subject_c_value,
                province: settings.subject_st_value,
                locality: settings.subject_l_value,
            },
        };
        debug!(
            "[venafi] zone {} resolved to template {}",
            self.zone, resolved.template_id
        );
        if let Ok(mut guard) = template.lock() {
            *guard = Some(resolved.clone());
        }
        Ok(resolved)
    }

    fn csr_text(csr_pem: &[u8]) -> Result<&str, IssuerError> {
        std::str::from_utf8(csr_pem)
            .map_err(|_| IssuerError::InvalidConfig("CSR is not valid PEM text".into()))
    }
}

impl VenafiClient {
    fn submit_request(
        &self,
        ctx: &Context,
        csr_pem: &[u8],
        duration: Duration,
        custom_fields: &[CustomField],
    ) -> Result<String, IssuerError> {
        let csr = Self::csr_text(csr_pem)?;
        match &self.connector {
            Connector::Tpp { .. } => {
                if !duration.is_zero() {
                    debug!("[venafi] TPP validity comes from zone policy; ignoring requested duration");
                }
                let fields: Vec<Value> = custom_fields
                    .iter()
                    .map(|field| json!({"Name": field.name, "Values": [field.value]}))
                    .collect();
                let response = self.request(
                    ctx,
                    self.http
                        .post(self.url("/vedsdk/certificates/request"))
                        .json(&json!({
                            "PolicyDN": policy_dn(&self.zone),
                            "PKCS10": csr,
                            "CustomFields": fields,
                            "DisableAutomaticRenewal": true,
                        })),
                )?;
                let created: TppRequestResponse = decode("Venafi TPP", response)?;
                info!("[venafi] TPP request created: {}", created.certificate_dn);
                Ok(created.certificate_dn)
            }
            Connector::Cloud { .. } => {
                let template = self.cloud_template(ctx)?;
                let mut body = json!({
                    "certificateSigningRequest": csr,
                    "applicationId": template.application_id,
                    "certificateIssuingTemplateId": template.template_id,
                });
                if !duration.is_zero() {
                    body["validityPeriod"] = Value::from(format!("PT{}H", duration.as_secs() / 3600));
                }
                if !custom_fields.is_empty() {
                    body["customFields"] = json!(custom_fields
                        .iter()
                        .map(|field| json!({"name": field.name, "value": field.value}))
                        .collect::<Vec<_>>());
                }
                let response = self.request(
                    ctx,
                    self.http
                        .post(self.url("/outagedetection/v1/certificaterequests"))
                        .json(&body),
                )?;
                let created: CloudRequestList = decode("Venafi Cloud", response)?;
                let request = created.certificate_requests.into_iter().next().ok_or_else(|| {
                    IssuerError::Operation("Venafi Cloud returned no certificate request".into())
                })?;
                info!("[venafi] Cloud request created: {}", request.id);
                Ok(request.id)
            }
        }
    }

    fn pickup(&self, ctx: &Context, pickup_id: &str) -> Result<Vec<u8>, IssuerError> {
        match &self.connector {
            Connector::Tpp { .. } => {
                let response = self.request(
                    ctx,
                    self.http
                        .post(self.url("/vedsdk/certificates/retrieve"))
                        .json(&json!({
                            "CertificateDN": pickup_id,
                            "Format": "base64",
                            "IncludeChain": true,
                        })),
                )?;
                if response.status() == StatusCode::ACCEPTED {
                    return Err(IssuerError::Pending(format!("{pickup_id} is still being issued")));
                }
                let retrieved: TppRetrieveResponse = decode("Venafi TPP", response)?;
                STANDARD
                    .decode(retrieved.certificate_data.trim())
                    .map_err(|err| IssuerError::Operation(format!("invalid certificate data: {err}")))
            }
            Connector::Cloud { .. } => {
                let request: CloudRequest = decode(
                    "Venafi Cloud",
                    self.request(
                        ctx,
                        self.http.get(
                            self.url(&format!("/outagedetection/v1/certificaterequests/{pickup_id}")),
                        ),
                    )?,
                )?;
                match request.status.as_str() {
                    "ISSUED" => {}
                    "FAILED" | "REJECTED" | "CANCELLED" => {
                        let detail = request
                            .error_information
                            .map(|info| info.to_string())
                            .unwrap_or_default();
                        warn!("[venafi] request {pickup_id} ended as {}", request.status);
                        return Err(IssuerError::Operation(format!(
                            "certificate request {pickup_id} {}: {detail}",
                            request.status.to_lowercase()
                        )));
                    }
                    other => {
                        return Err(IssuerError::Pending(format!("{pickup_id} is {other}")));
                    }
                }
                let certificate_id = request.certificate_ids.first().ok_or_else(|| {
                    IssuerError::Operation(format!("request {pickup_id} issued without a certificate"))
                })?;
                let response = self.request(
                    ctx,
                    self.http
                        .get(self.url(&format!(
                            "/outagedetection/v1/certificates/{certificate_id}/contents"
                        )))
                        .query(&[("format", "PEM"), ("chainOrder", "EE_FIRST")]),
                )?;
                let body = response
                    .bytes()
                    .map_err(|err| transport(ctx, err))?;
                Ok(body.to_vec())
            }
        }
    }

    fn check_policy(&self, ctx: &Context) -> Result<ZoneConfiguration, IssuerError> {
        match &self.connector {
            Connector::Tpp { .. } => {
                let response = self.request(
                    ctx,
                    self.http
                        .post(self.url("/vedsdk/certificates/checkpolicy"))
                        .json(&json!({"PolicyDN": policy_dn(&self.zone)})),
                )?;
                let checked: TppCheckPolicyResponse = decode("Venafi TPP", response)?;
                if let Some(error) = checked.error.filter(|error| !error.is_empty()) {
                    return Err(IssuerError::InvalidConfig(error));
                }
                let subject = checked.policy.unwrap_or_default().subject;
                Ok(ZoneConfiguration {
                    organization: subject.organization.value,
                    organizational_units: subject.organizational_unit.values,
                    country: subject.country.value,
                    province: subject.state.value,
                    locality: subject.city.value,
                })
            }
            Connector::Cloud { .. } => Ok(self.cloud_template(ctx)?.zone),
        }
    }
}

impl CertificateAuthority for VenafiClient {
    fn request_certificate(
        &self,
        ctx: &Context,
        csr_pem: &[u8],
        duration: Duration,
        custom_fields: &[CustomField],
    ) -> Result<String, IssuerError> {
        self.instrumented("request_certificate", || {
            self.submit_request(ctx, csr_pem, duration, custom_fields)
        })
    }

    fn retrieve_certificate(
        &self,
        ctx: &Context,
        pickup_id: &str,
        _csr_pem: &[u8],
        _duration: Duration,
        _custom_fields: &[CustomField],
    ) -> Result<Vec<u8>, IssuerError> {
        self.instrumented("retrieve_certificate", || self.pickup(ctx, pickup_id))
    }

    fn read_zone_configuration(&self, ctx: &Context) -> Result<ZoneConfiguration, IssuerError> {
        self.instrumented("read_zone_configuration", || self.check_policy(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::Classify;
    use crate::issuance::issuer::SecretKeyRef;
    use mockito::Matcher;

    const CSR: &[u8] = b"-----BEGIN CERTIFICATE REQUEST-----\nMIIB\n-----END CERTIFICATE REQUEST-----\n";
    const CHAIN: &str = "-----BEGIN CERTIFICATE-----\nleaf\n-----END CERTIFICATE-----\n";

    fn tpp_config(url: String) -> VenafiTppConfig {
        VenafiTppConfig {
            url,
            credentials_ref: SecretKeyRef {
                name: "tpp-credentials".into(),
                key: None,
            },
            ca_bundle: None,
        }
    }

    fn cloud_config(url: String) -> VenafiCloudConfig {
        VenafiCloudConfig {
            url: Some(url),
            api_token_secret_ref: SecretKeyRef {
                name: "vaas".into(),
                key: None,
            },
        }
    }

    #[test]
    fn policy_dn_is_rooted() {
        assert_eq!(policy_dn("Certificates\\Web"), "\\VED\\Policy\\Certificates\\Web");
        assert_eq!(policy_dn("\\VED\\Policy\\Web"), "\\VED\\Policy\\Web");
        assert_eq!(trim_base("https://tpp.example.com/vedsdk/"), "https://tpp.example.com");
    }

    #[test]
    fn tpp_password_login_then_request_and_pickup() {
        let mut server = mockito::Server::new();
        let oauth = server
            .mock("POST", "/vedauth/authorize/oauth")
            .match_body(Matcher::PartialJson(json!({"username": "admin", "client_id": "vcert-sdk"})))
            .with_status(200)
            .with_body(r#"{"access_token": "tok-1", "refresh_token": "r"}"#)
            .expect(1)
            .create();
        server
            .mock("GET", "/vedauth/authorize/verify")
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body("{}")
            .create();
        let request = server
            .mock("POST", "/vedsdk/certificates/request")
            .match_body(Matcher::PartialJson(json!({
                "PolicyDN": "\\VED\\Policy\\Web",
                "CustomFields": [{"Name": "team", "Values": ["edge"]}],
            })))
            .with_status(200)
            .with_body(r#"{"CertificateDN": "\\VED\\Policy\\Web\\example.com"}"#)
            .create();
        let pending = server
            .mock("POST", "/vedsdk/certificates/retrieve")
            .with_status(202)
            .with_body(r#"{"Status": "Post processing"}"#)
            .expect(1)
            .create();
        let issued = server
            .mock("POST", "/vedsdk/certificates/retrieve")
            .with_status(200)
            .with_body(json!({"CertificateData": STANDARD.encode(CHAIN)}).to_string())
            .create();

        let ctx = Context::background();
        let credentials = CredentialData::parse(br#"{"username": "admin", "password": "secret"}"#);
        let metrics = VenafiMetrics::new(&prometheus::Registry::new()).unwrap();
        let client = VenafiClient::tpp(
            &ctx,
            &tpp_config(format!("{}/vedsdk", server.url())),
            "Web",
            &credentials,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_metrics(metrics.clone());

        let fields = [CustomField {
            name: "team".into(),
            value: "edge".into(),
        }];
        let pickup = client
            .request_certificate(&ctx, CSR, Duration::from_secs(90 * 24 * 3600), &fields)
            .unwrap();
        assert_eq!(pickup, "\\VED\\Policy\\Web\\example.com");

        let err = client
            .retrieve_certificate(&ctx, &pickup, CSR, Duration::ZERO, &fields)
            .unwrap_err();
        assert!(matches!(err, IssuerError::Pending(_)));
        assert!(err.is_retryable());

        let chain = client
            .retrieve_certificate(&ctx, &pickup, CSR, Duration::ZERO, &fields)
            .unwrap();
        assert_eq!(chain, CHAIN.as_bytes());

        assert_eq!(metrics.request_count("request_certificate", "ok"), 1.0);
        assert_eq!(metrics.request_count("retrieve_certificate", "pending"), 1.0);
        assert_eq!(metrics.request_count("retrieve_certificate", "ok"), 1.0);
        assert_eq!(metrics.latency_samples("retrieve_certificate"), 2);
        assert_eq!(metrics.latency_samples("read_zone_configuration"), 0);

        oauth.assert();
        request.assert();
        pending.assert();
        issued.assert();
    }

    #[test]
    fn tpp_rejected_token_is_a_configuration_error() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/vedauth/authorize/verify")
            .with_status(401)
            .create();

        let credentials = CredentialData::parse(br#"{"access-token": "stale"}"#);
        let err = VenafiClient::tpp(
            &Context::background(),
            &tpp_config(server.url()),
            "Web",
            &credentials,
            Duration::from_secs(5),
        )
        .err()
        .unwrap();

        assert_eq!(
            err.to_string(),
            "issuer configuration invalid: Venafi TPP authentication failed"
        );
    }

    #[test]
    fn tpp_without_credentials_is_rejected() {
        let credentials = CredentialData::parse(br#"{"username": "admin"}"#);
        let err = VenafiClient::tpp(
            &Context::background(),
            &tpp_config("http://127.0.0.1:9".into()),
            "Web",
            &credentials,
            Duration::from_secs(5),
        )
        .err()
        .unwrap();
        assert!(matches!(err, IssuerError::InvalidConfig(_)));
    }

    #[test]
    fn tpp_zone_configuration_reads_subject_policy() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/vedauth/authorize/verify").with_status(200).create();
        server
            .mock("POST", "/vedsdk/certificates/checkpolicy")
            .with_status(200)
            .with_body(
                json!({
                    "Error": null,
                    "Policy": {"Subject": {
                        "Organization": {"Locked": true, "Value": "Example Corp"},
                        "OrganizationalUnit": {"Locked": false, "Values": ["Edge", "Web"]},
                        "Country": {"Value": "US"},
                        "City": {"Value": "Salt Lake City"}
                    }}
                })
                .to_string(),
            )
            .create();

        let ctx = Context::background();
        let client = VenafiClient::tpp(
            &ctx,
            &tpp_config(server.url()),
            "Web",
            &CredentialData::parse(b"{\"access-token\": \"t\"}"),
            Duration::from_secs(5),
        )
        .unwrap();
        let zone = client.read_zone_configuration(&ctx).unwrap();

        assert_eq!(zone.organization.as_deref(), Some("Example Corp"));
        assert_eq!(zone.organizational_units, vec!["Edge", "Web"]);
        assert_eq!(zone.country.as_deref(), Some("US"));
        assert_eq!(zone.province, None);
        assert_eq!(zone.locality.as_deref(), Some("Salt Lake City"));
    }

    #[test]
    fn cloud_request_pending_then_issued() {
        let mut server = mockito::Server::new();
        let app = server
            .mock("GET", "/outagedetection/v1/applications/name/web")
            .match_header("tppl-api-key", "key-1")
            .with_status(200)
            .with_body(r#"{"id": "app-id"}"#)
            .expect(1)
            .create();
        server
            .mock(
                "GET",
                "/outagedetection/v1/applications/web/certificateissuingtemplates/default",
            )
            .with_status(200)
            .with_body(r#"{"id": "cit-id", "recommendedSettings": {"subjectOValue": "Example"}}"#)
            .create();
        server
            .mock("POST", "/outagedetection/v1/certificaterequests")
            .match_body(Matcher::PartialJson(json!({
                "applicationId": "app-id",
                "certificateIssuingTemplateId": "cit-id",
                "validityPeriod": "PT2160H",
            })))
            .with_status(201)
            .with_body(r#"{"certificateRequests": [{"id": "req-1", "status": "REQUESTED"}]}"#)
            .create();
        server
            .mock("GET", "/outagedetection/v1/certificaterequests/req-1")
            .with_status(200)
            .with_body(r#"{"id": "req-1", "status": "PENDING"}"#)
            .expect(1)
            .create();
        server
            .mock("GET", "/outagedetection/v1/certificaterequests/req-1")
            .with_status(200)
            .with_body(r#"{"id": "req-1", "status": "ISSUED", "certificateIds": ["cert-1"]}"#)
            .create();
        server
            .mock(
                "GET",
                Matcher::Regex("^/outagedetection/v1/certificates/cert-1/contents".into()),
            )
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("format".into(), "PEM".into()),
                Matcher::UrlEncoded("chainOrder".into(), "EE_FIRST".into()),
            ]))
            .with_status(200)
            .with_body(CHAIN)
            .create();

        let ctx = Context::background();
        let client = VenafiClient::cloud(
            &cloud_config(server.url()),
            "web\\default",
            &CredentialData::parse(b"{\"api-key\": \"key-1\"}"),
            Duration::from_secs(5),
        )
        .unwrap();

        let pickup = client
            .request_certificate(&ctx, CSR, Duration::from_secs(90 * 24 * 3600), &[])
            .unwrap();
        assert_eq!(pickup, "req-1");
        let zone = client.read_zone_configuration(&ctx).unwrap();
        assert_eq!(zone.organization.as_deref(), Some("Example"));

        let err = client
            .retrieve_certificate(&ctx, &pickup, CSR, Duration::ZERO, &[])
            .unwrap_err();
        assert!(matches!(err, IssuerError::Pending(_)));
        let chain = client
            .retrieve_certificate(&ctx, &pickup, CSR, Duration::ZERO, &[])
            .unwrap();
        assert_eq!(chain, CHAIN.as_bytes());
        app.assert();
    }

    #[test]
    fn cloud_failures_are_classified() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/outagedetection/v1/certificaterequests/busy")
            .with_status(503)
            .create();
        server
            .mock("GET", "/outagedetection/v1/certificaterequests/bad")
            .with_status(200)
            .with_body(r#"{"id": "bad", "status": "FAILED", "errorInformation": {"message": "policy violation"}}"#)
            .create();

        let ctx = Context::background();
        let metrics = VenafiMetrics::new(&prometheus::Registry::new()).unwrap();
        let client = VenafiClient::cloud(
            &cloud_config(server.url()),
            "web\\default",
            &CredentialData::parse(b"raw-api-key"),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_metrics(metrics.clone());

        let busy = client
            .retrieve_certificate(&ctx, "busy", CSR, Duration::ZERO, &[])
            .unwrap_err();
        assert!(matches!(busy, IssuerError::Unavailable(_)));
        let bad = client
            .retrieve_certificate(&ctx, "bad", CSR, Duration::ZERO, &[])
            .unwrap_err();
        assert!(matches!(bad, IssuerError::Operation(_)));
        assert!(bad.to_string().contains("policy violation"));
        assert!(!bad.is_retryable());
        assert_eq!(metrics.request_count("retrieve_certificate", "error"), 2.0);
        assert_eq!(metrics.request_count("retrieve_certificate", "ok"), 0.0);
    }

    #[test]
    fn cloud_zone_needs_application_and_template() {
        let err = VenafiClient::cloud(
            &cloud_config("http://127.0.0.1:9".into()),
            "web",
            &CredentialData::parse(b"key"),
            Duration::from_secs(5),
        )
        .err()
        .unwrap();
        assert!(matches!(err, IssuerError::InvalidConfig(_)));
    }
}
