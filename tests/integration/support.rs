use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rcgen::{CertificateParams, KeyPair};
use serde_json::json;

use acme_reconciler::core::config::{BackoffConfig, ReconcilerConfig};
use acme_reconciler::core::context::Context;
use acme_reconciler::core::errors::Classify;
use acme_reconciler::core::types::{Challenge, Order, OrderSpec, ResourceKey};
use acme_reconciler::issuance::reconciler::{Reconciler, WorkItem};
use acme_reconciler::issuance::solver::Solver;
use acme_reconciler::storage::store::ResourceStore;

pub const CHAIN: &str = "-----BEGIN CERTIFICATE-----\nMIIBleaf\n-----END CERTIFICATE-----\n\
-----BEGIN CERTIFICATE-----\nMIIBroot\n-----END CERTIFICATE-----\n";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fast_config() -> ReconcilerConfig {
    let backoff = BackoffConfig::new(1, 4, 20);
    ReconcilerConfig {
        challenge_backoff: backoff,
        presentation_backoff: backoff,
        order_backoff: backoff,
        ..ReconcilerConfig::default()
    }
}

pub fn csr_pem(names: &[&str]) -> String {
    let params = CertificateParams::new(names.iter().map(|name| name.to_string()).collect::<Vec<_>>())
        .expect("csr params");
    let key = KeyPair::generate().expect("csr key");
    params
        .serialize_request(&key)
        .expect("csr")
        .pem()
        .expect("csr pem")
}

pub fn new_order(namespace: &str, name: &str, dns_names: &[&str]) -> Order {
    Order {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..ObjectMeta::default()
        },
        spec: OrderSpec {
            request: csr_pem(dns_names),
            dns_names: dns_names.iter().map(|name| name.to_string()).collect(),
            issuer_ref: "letsencrypt".into(),
        },
        status: Default::default(),
    }
}

#[derive(Default)]
struct AuthorityState {
    challenge_valid: bool,
    finalized: bool,
    accepts: usize,
}

/// Stateful ACME authority on a mockito server. Signatures are not checked.
///
/// One order with one authorization for `dns_name`, offering http-01 and
/// dns-01. Accepting the http-01 challenge validates it immediately.
pub struct FakeAcmeServer {
    pub server: mockito::ServerGuard,
    state: Arc<Mutex<AuthorityState>>,
}

impl FakeAcmeServer {
    pub fn start(dns_name: &str) -> Self {
        let mut server = mockito::Server::new();
        let base = server.url();
        let state = Arc::new(Mutex::new(AuthorityState::default()));

        server
            .mock("GET", "/directory")
            .with_status(200)
            .with_body(
                json!({
                    "newNonce": format!("{base}/nonce"),
                    "newAccount": format!("{base}/acct"),
                    "newOrder": format!("{base}/order/new"),
                })
                .to_string(),
            )
            .create();
        server
            .mock("HEAD", "/nonce")
            .with_status(200)
            .with_header("Replay-Nonce", "nonce")
            .create();
        server
            .mock("POST", "/acct")
            .with_status(201)
            .with_header("Replay-Nonce", "nonce")
            .with_header("Location", &format!("{base}/acct/1"))
            .with_body(r#"{"status": "valid"}"#)
            .create();

        let order_body = {
            let state = state.clone();
            let base = base.clone();
            let dns_name = dns_name.to_string();
            move |status: Option<&str>| {
                let state = state.lock().unwrap();
                let computed = if state.finalized {
                    "valid"
                } else if state.challenge_valid {
                    "ready"
                } else {
                    "pending"
                };
                let mut body = json!({
                    "status": status.unwrap_or(computed),
                    "identifiers": [{"type": "dns", "value": dns_name}],
                    "authorizations": [format!("{base}/authz/1")],
                    "finalize": format!("{base}/order/1/finalize"),
                });
                if state.finalized && status.is_none() {
                    body["certificate"] = json!(format!("{base}/cert/1"));
                }
                body.to_string().into_bytes()
            }
        };
        let order_body = Arc::new(order_body);

        let body = order_body.clone();
        server
            .mock("POST", "/order/new")
            .with_status(201)
            .with_header("Replay-Nonce", "nonce")
            .with_header("Location", &format!("{base}/order/1"))
            .with_body_from_request(move |_| body(None))
            .create();
        let body = order_body.clone();
        server
            .mock("POST", "/order/1")
            .with_status(200)
            .with_header("Replay-Nonce", "nonce")
            .with_body_from_request(move |_| body(None))
            .create();
        let body = order_body.clone();
        let finalize_state = state.clone();
        server
            .mock("POST", "/order/1/finalize")
            .with_status(200)
            .with_header("Replay-Nonce", "nonce")
            .with_body_from_request(move |_| {
                finalize_state.lock().unwrap().finalized = true;
                body(Some("processing"))
            })
            .create();

        let authz_state = state.clone();
        let authz_base = base.clone();
        let authz_name = dns_name.to_string();
        server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_header("Replay-Nonce", "nonce")
            .with_body_from_request(move |_| {
                let valid = authz_state.lock().unwrap().challenge_valid;
                let http_status = if valid { "valid" } else { "pending" };
                json!({
                    "identifier": {"type": "dns", "value": authz_name},
                    "status": http_status,
                    "challenges": [
                        {"type": "http-01", "url": format!("{authz_base}/chall/1"), "token": "tok-http", "status": http_status},
                        {"type": "dns-01", "url": format!("{authz_base}/chall/2"), "token": "tok-dns", "status": "pending"},
                    ],
                })
                .to_string()
                .into_bytes()
            })
            .create();

        let accept_state = state.clone();
        let accept_base = base.clone();
        server
            .mock("POST", "/chall/1")
            .with_status(200)
            .with_header("Replay-Nonce", "nonce")
            .with_body_from_request(move |_| {
                let mut state = accept_state.lock().unwrap();
                state.accepts += 1;
                state.challenge_valid = true;
                json!({
                    "type": "http-01",
                    "url": format!("{accept_base}/chall/1"),
                    "token": "tok-http",
                    "status": "processing",
                })
                .to_string()
                .into_bytes()
            })
            .create();

        server
            .mock("POST", "/cert/1")
            .match_header("accept", "application/pem-certificate-chain")
            .with_status(200)
            .with_header("Replay-Nonce", "nonce")
            .with_header("content-type", "application/pem-certificate-chain")
            .with_body(CHAIN)
            .create();

        Self { server, state }
    }

    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.server.url())
    }

    pub fn accepts(&self) -> usize {
        self.state.lock().unwrap().accepts
    }
}

/// Solver that records the keys it was asked to present.
#[derive(Default)]
pub struct RecordingSolver {
    pub presented: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<String>>,
}

impl Solver for RecordingSolver {
    fn present(&self, _ctx: &Context, challenge: &Challenge) -> Result<()> {
        self.presented.lock().unwrap().push(challenge.spec.key.clone());
        Ok(())
    }

    fn check_presented(&self, _ctx: &Context, _challenge: &Challenge) -> Result<bool> {
        Ok(true)
    }

    fn clean_up(&self, _ctx: &Context, challenge: &Challenge) -> Result<()> {
        self.cleaned.lock().unwrap().push(challenge.spec.key.clone());
        Ok(())
    }
}

/// Runs reconciles from `start` until `done` holds or the step budget runs out.
///
/// Requeues are honoured by sleeping, so the configured backoff must be short.
pub fn drive<S: ResourceStore>(
    reconciler: &Reconciler<S>,
    ctx: &Context,
    start: WorkItem,
    mut done: impl FnMut(&S) -> bool,
) -> Result<()> {
    let mut queue = VecDeque::from([start]);
    for _ in 0..500 {
        if done(reconciler.store().as_ref()) {
            return Ok(());
        }
        let Some(item) = queue.pop_front() else {
            bail!("queue drained before the condition held");
        };
        match reconciler.reconcile(ctx, &item) {
            Ok(reconciled) => {
                for related in reconciled.wake {
                    if !queue.contains(&related) {
                        queue.push_back(related);
                    }
                }
                if let Some(after) = reconciled.action.requeue_after {
                    thread::sleep(after.min(Duration::from_millis(20)));
                    if !queue.contains(&item) {
                        queue.push_back(item);
                    }
                }
            }
            Err(err) if err.is_retryable() => {
                thread::sleep(Duration::from_millis(5));
                queue.push_back(item);
            }
            Err(err) => return Err(anyhow!("{item} failed: {err}")),
        }
    }
    if done(reconciler.store().as_ref()) {
        Ok(())
    } else {
        bail!("condition not reached within the step budget")
    }
}

pub fn order_key(namespace: &str, name: &str) -> ResourceKey {
    ResourceKey::new(namespace, name)
}
