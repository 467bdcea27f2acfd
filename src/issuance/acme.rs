use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context as _, Result, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use log::{debug, info, warn};
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sign::Signer,
};
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
    header::{ACCEPT, CONTENT_TYPE, LOCATION},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::core::context::Context;
use crate::issuance::client::{
    AcmeChallenge, AcmeOrder, AuthorityClient, AuthorityError, Authorization, Identifier, Problem,
};
use crate::issuance::http::{build_client, request_timeout, status_message};

const REPLAY_NONCE: &str = "Replay-Nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";
const BAD_NONCE_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SigningAlg {
    Rs256,
    Es256,
}

impl SigningAlg {
    fn name(self) -> &'static str {
        match self {
            SigningAlg::Rs256 => "RS256",
            SigningAlg::Es256 => "ES256",
        }
    }
}

/// ACME account key. RSA keys sign with RS256, P-256 keys with ES256.
pub struct AccountKey {
    key: PKey<Private>,
    alg: SigningAlg,
}

impl AccountKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let key = PKey::private_key_from_pem(pem).context("failed to parse account key PEM")?;
        Self::from_pkey(key)
    }

    pub fn generate_p256() -> Result<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = PKey::from_ec_key(EcKey::generate(&group)?)?;
        Self::from_pkey(key)
    }

    pub fn generate_rsa(bits: u32) -> Result<Self> {
        let key = PKey::from_rsa(Rsa::generate(bits)?)?;
        Self::from_pkey(key)
    }

    fn from_pkey(key: PKey<Private>) -> Result<Self> {
        let alg = match key.id() {
            Id::RSA => SigningAlg::Rs256,
            Id::EC => {
                let curve = key.ec_key()?.group().curve_name();
                if curve != Some(Nid::X9_62_PRIME256V1) {
                    return Err(anyhow!("unsupported EC curve for account key: {curve:?}"));
                }
                SigningAlg::Es256
            }
            other => return Err(anyhow!("unsupported account key type: {other:?}")),
        };
        Ok(Self { key, alg })
    }

    pub fn private_key_pem(&self) -> Result<Vec<u8>> {
        Ok(self.key.private_key_to_pem_pkcs8()?)
    }

    /// Public JWK with members in lexicographic order, as RFC 7638 hashes it.
    fn jwk_json(&self) -> Result<String> {
        match self.alg {
            SigningAlg::Rs256 => {
                let rsa = self.key.rsa()?;
                Ok(format!(
                    r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
                    URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
                    URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
                ))
            }
            SigningAlg::Es256 => {
                let ec = self.key.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;
                Ok(format!(
                    r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
                    URL_SAFE_NO_PAD.encode(x.to_vec_padded(32)?),
                    URL_SAFE_NO_PAD.encode(y.to_vec_padded(32)?),
                ))
            }
        }
    }

    fn jwk(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.jwk_json()?)?)
    }

    pub fn thumbprint(&self) -> Result<String> {
        let digest = Sha256::digest(self.jwk_json()?.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(digest))
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.update(input)?;
        let signature = signer.sign_to_vec()?;
        match self.alg {
            SigningAlg::Rs256 => Ok(signature),
            SigningAlg::Es256 => {
                // JWS wants the raw r || s pair, openssl returns DER.
                let sig = EcdsaSig::from_der(&signature)?;
                let mut raw = sig.r().to_vec_padded(32)?;
                raw.extend(sig.s().to_vec_padded(32)?);
                Ok(raw)
            }
        }
    }
}

/// Digest published in the `_acme-challenge` TXT record for a dns-01 challenge.
pub fn dns01_record_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

/// RFC 8555 client over blocking reqwest.
///
/// The account is registered (or looked up) lazily on the first signed
/// request. Replay nonces are pooled from response headers and a `badNonce`
/// rejection is retried with a fresh nonce.
pub struct AcmeHttpClient {
    http: Client,
    timeout: Duration,
    directory_url: String,
    contact_email: Option<String>,
    key: AccountKey,
    directory: Mutex<Option<Directory>>,
    account_url: Mutex<Option<String>>,
    nonces: Mutex<Vec<String>>,
}

impl AcmeHttpClient {
    pub fn new(
        directory_url: impl Into<String>,
        key: AccountKey,
        contact_email: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: build_client(timeout),
            timeout,
            directory_url: directory_url.into(),
            contact_email,
            key,
            directory: Mutex::new(None),
            account_url: Mutex::new(None),
            nonces: Mutex::new(Vec::new()),
        }
    }

    /// Skips registration for an account whose URL is already known.
    pub fn with_account_url(self, account_url: impl Into<String>) -> Self {
        *lock(&self.account_url) = Some(account_url.into());
        self
    }

    pub fn account_url(&self) -> Option<String> {
        lock(&self.account_url).clone()
    }

    fn transport(ctx: &Context, err: reqwest::Error) -> AuthorityError {
        if let Err(cancelled) = ctx.check() {
            return AuthorityError::Cancelled(cancelled);
        }
        AuthorityError::Transport(err.to_string())
    }

    fn directory(&self, ctx: &Context) -> Result<Directory, AuthorityError> {
        if let Some(directory) = lock(&self.directory).clone() {
            return Ok(directory);
        }
        ctx.check()?;
        debug!("[acme-http] fetching directory {}", self.directory_url);
        let response = self
            .http
            .get(&self.directory_url)
            .timeout(request_timeout(ctx, self.timeout))
            .send()
            .map_err(|err| Self::transport(ctx, err))?;
        let response = Self::check_status(response)?;
        let directory: Directory = Self::decode(response)?;
        *lock(&self.directory) = Some(directory.clone());
        Ok(directory)
    }

    fn remember_nonce(&self, response: &Response) {
        if let Some(nonce) = response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
        {
            lock(&self.nonces).push(nonce.to_string());
        }
    }

    fn nonce(&self, ctx: &Context) -> Result<String, AuthorityError> {
        if let Some(nonce) = lock(&self.nonces).pop() {
            return Ok(nonce);
        }
        let directory = self.directory(ctx)?;
        ctx.check()?;
        let response = self
            .http
            .head(&directory.new_nonce)
            .timeout(request_timeout(ctx, self.timeout))
            .send()
            .map_err(|err| Self::transport(ctx, err))?;
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AuthorityError::Malformed("newNonce response has no Replay-Nonce".into()))
    }

    /// Flattened JWS body. `payload == None` produces a POST-as-GET.
    fn jws(&self, url: &str, nonce: &str, payload: Option<&Value>, kid: Option<&str>) -> Result<Value> {
        let mut protected = json!({
            "alg": self.key.alg.name(),
            "nonce": nonce,
            "url": url,
        });
        match kid {
            Some(kid) => protected["kid"] = Value::from(kid),
            None => protected["jwk"] = self.key.jwk()?,
        }
        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);
        let payload_b64 = match payload {
            Some(payload) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?),
            None => String::new(),
        };
        let signature = self
            .key
            .sign(format!("{protected_b64}.{payload_b64}").as_bytes())?;
        Ok(json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        }))
    }

    fn problem_from(response: Response) -> Problem {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        match serde_json::from_str::<Problem>(&body) {
            Ok(mut problem) => {
                problem.status.get_or_insert(status.as_u16());
                problem
            }
            Err(_) => Problem {
                kind: "about:blank".into(),
                detail: status_message("ACME server", status, Some(&body)),
                status: Some(status.as_u16()),
                subproblems: Vec::new(),
                identifier: None,
            },
        }
    }

    fn check_status(response: Response) -> Result<Response, AuthorityError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(AuthorityError::Protocol(Self::problem_from(response)))
        }
    }

    fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AuthorityError> {
        let body = response
            .bytes()
            .map_err(|err| AuthorityError::Transport(err.to_string()))?;
        serde_json::from_slice(&body).map_err(|err| AuthorityError::Malformed(err.to_string()))
    }

    fn post(
        &self,
        ctx: &Context,
        url: &str,
        payload: Option<&Value>,
        kid: Option<&str>,
        accept: Option<&str>,
    ) -> Result<Response, AuthorityError> {
        for attempt in 0..=BAD_NONCE_RETRIES {
            ctx.check()?;
            let nonce = self.nonce(ctx)?;
            let body = self
                .jws(url, &nonce, payload, kid)
                .map_err(|err| AuthorityError::Malformed(format!("failed to sign request: {err}")))?;
            let mut request = self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .timeout(request_timeout(ctx, self.timeout))
                .body(body.to_string());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request.send().map_err(|err| Self::transport(ctx, err))?;
            self.remember_nonce(&response);
            if response.status().is_success() {
                return Ok(response);
            }
            let problem = Self::problem_from(response);
            if problem.short_kind() == "badNonce" && attempt < BAD_NONCE_RETRIES {
                debug!("[acme-http] badNonce from {url}; retrying ({})", attempt + 1);
                continue;
            }
            warn!("[acme-http] {url} rejected: {problem}");
            return Err(AuthorityError::Protocol(problem));
        }
        Err(AuthorityError::Malformed(format!(
            "{url} kept rejecting nonces"
        )))
    }

    /// Registers the account on first use, returning its URL (the JWS `kid`).
    pub fn ensure_account(&self, ctx: &Context) -> Result<String, AuthorityError> {
        if let Some(kid) = self.account_url() {
            return Ok(kid);
        }
        let directory = self.directory(ctx)?;
        let mut payload = json!({ "termsOfServiceAgreed": true });
        if let Some(email) = &self.contact_email {
            payload["contact"] = json!([format!("mailto:{email}")]);
        }
        let response = self.post(ctx, &directory.new_account, Some(&payload), None, None)?;
        let kid = location(&response)
            .ok_or_else(|| AuthorityError::Malformed("newAccount response has no Location".into()))?;
        if response.status() == StatusCode::CREATED {
            info!("[acme-http] registered account {kid}");
        } else {
            debug!("[acme-http] using existing account {kid}");
        }
        *lock(&self.account_url) = Some(kid.clone());
        Ok(kid)
    }

    fn signed(
        &self,
        ctx: &Context,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response, AuthorityError> {
        let kid = self.ensure_account(ctx)?;
        self.post(ctx, url, payload, Some(&kid), accept)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl AuthorityClient for AcmeHttpClient {
    fn create_order(
        &self,
        ctx: &Context,
        identifiers: &[Identifier],
    ) -> Result<AcmeOrder, AuthorityError> {
        let directory = self.directory(ctx)?;
        let payload = json!({ "identifiers": identifiers });
        let response = self.signed(ctx, &directory.new_order, Some(&payload), None)?;
        let url = location(&response)
            .ok_or_else(|| AuthorityError::Malformed("newOrder response has no Location".into()))?;
        let mut order: AcmeOrder = Self::decode(response)?;
        order.url = url;
        debug!("[acme-http] created order {} ({})", order.url, order.status);
        Ok(order)
    }

    fn get_order(&self, ctx: &Context, url: &str) -> Result<AcmeOrder, AuthorityError> {
        let response = self.signed(ctx, url, None, None)?;
        let mut order: AcmeOrder = Self::decode(response)?;
        order.url = url.to_string();
        Ok(order)
    }

    fn get_authorization(&self, ctx: &Context, url: &str) -> Result<Authorization, AuthorityError> {
        let response = self.signed(ctx, url, None, None)?;
        let mut authorization: Authorization = Self::decode(response)?;
        authorization.url = url.to_string();
        Ok(authorization)
    }

    fn accept_challenge(&self, ctx: &Context, url: &str) -> Result<AcmeChallenge, AuthorityError> {
        let response = self.signed(ctx, url, Some(&json!({})), None)?;
        Self::decode(response)
    }

    fn finalize_order(
        &self,
        ctx: &Context,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<AcmeOrder, AuthorityError> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self.signed(ctx, finalize_url, Some(&payload), None)?;
        let url = location(&response).unwrap_or_default();
        let mut order: AcmeOrder = Self::decode(response)?;
        order.url = url;
        Ok(order)
    }

    fn get_certificate(&self, ctx: &Context, url: &str) -> Result<Vec<u8>, AuthorityError> {
        let response = self.signed(ctx, url, None, Some(PEM_CHAIN))?;
        let body = response
            .bytes()
            .map_err(|err| AuthorityError::Transport(err.to_string()))?;
        Ok(body.to_vec())
    }

    fn key_authorization(&self, token: &str) -> Result<String, AuthorityError> {
        let thumbprint = self
            .key
            .thumbprint()
            .map_err(|err| AuthorityError::Malformed(format!("failed to compute thumbprint: {err}")))?;
        Ok(format!("{token}.{thumbprint}"))
    }
}
