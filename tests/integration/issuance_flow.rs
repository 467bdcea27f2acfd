use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};

use acme_reconciler::core::context::Context;
use acme_reconciler::core::types::{Challenge, HTTP01, Order, State};
use acme_reconciler::issuance::acme::{AccountKey, dns01_record_value};
use acme_reconciler::issuance::issuer::{IssuerBackend, IssuerConfig};
use acme_reconciler::issuance::orchestrator::Orchestrator;
use acme_reconciler::issuance::reconciler::{Reconciler, WorkItem};
use acme_reconciler::issuance::solver::SolverRegistry;
use acme_reconciler::secrets::memory::MemoryCredentialStore;
use acme_reconciler::storage::db::SqliteResourceStore;
use acme_reconciler::storage::store::ResourceStore;

use super::support::{
    CHAIN, FakeAcmeServer, RecordingSolver, drive, fast_config, init_logging, new_order, order_key,
};

const NAMESPACE: &str = "default";

fn acme_backend(
    ctx: &Context,
    server: &FakeAcmeServer,
    credentials: &MemoryCredentialStore,
) -> Result<IssuerBackend> {
    let config = IssuerConfig::from_json(
        &serde_json::json!({
            "type": "acme",
            "server": server.directory_url(),
            "email": "ops@example.com",
            "privateKeySecretRef": {"name": "acme-account"},
        })
        .to_string(),
    )?;
    Ok(IssuerBackend::from_config(
        ctx,
        NAMESPACE,
        &config,
        credentials,
        fast_config().http_timeout(),
    )?)
}

#[test]
fn http01_order_is_issued_and_children_released() -> Result<()> {
    init_logging();
    let ctx = Context::with_timeout(Duration::from_secs(60));
    let server = FakeAcmeServer::start("app.example.com");

    let account = AccountKey::generate_p256()?;
    let account_pem = String::from_utf8(account.private_key_pem()?)?;
    let credentials = MemoryCredentialStore::new();
    credentials.insert_fields(NAMESPACE, "acme-account", &[("tls.key", account_pem.as_str())]);

    let backend = acme_backend(&ctx, &server, &credentials)?;
    let authority = backend
        .authority()
        .ok_or_else(|| anyhow!("acme backend has no authority client"))?;
    let solver = Arc::new(RecordingSolver::default());
    let orchestrator = Orchestrator::new(
        authority,
        SolverRegistry::new().with(HTTP01, solver.clone()),
        fast_config(),
    );

    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("resources.db");
    let store = Arc::new(SqliteResourceStore::open(&db_path)?);
    store.create(&ctx, &new_order(NAMESPACE, "web", &["app.example.com"]))?;
    let reconciler = Reconciler::new(store.clone(), orchestrator);

    let key = order_key(NAMESPACE, "web");
    drive(&reconciler, &ctx, WorkItem::Order(key.clone()), |store| {
        store
            .get::<Order>(&ctx, &key)
            .map(|order| order.status.state == State::Valid)
            .unwrap_or(false)
    })?;

    let order: Order = store.get(&ctx, &key)?;
    assert_eq!(order.status.certificate.as_deref(), Some(CHAIN));
    assert!(order.status.finalized);
    assert_eq!(order.status.authorizations.len(), 1);
    assert_eq!(order.status.authorizations[0].identifier, "app.example.com");
    assert_eq!(server.accepts(), 1);

    let thumbprint = AccountKey::from_pem(account_pem.as_bytes())?.thumbprint()?;
    assert_eq!(
        solver.presented.lock().unwrap().as_slice(),
        [format!("tok-http.{thumbprint}")]
    );

    // The valid order releases its challenge; finalizing it runs clean-up.
    drive(&reconciler, &ctx, WorkItem::Order(key.clone()), |store| {
        store
            .list::<Challenge>(&ctx, NAMESPACE, None)
            .map(|children| children.is_empty())
            .unwrap_or(false)
    })?;
    assert!(!solver.cleaned.lock().unwrap().is_empty());

    drop(reconciler);
    drop(store);
    let reopened = SqliteResourceStore::open(&db_path)?;
    let persisted: Order = reopened.get(&ctx, &key)?;
    assert_eq!(persisted.status.state, State::Valid);
    assert_eq!(persisted.status.certificate.as_deref(), Some(CHAIN));
    Ok(())
}

#[test]
fn dns01_key_is_the_record_digest() -> Result<()> {
    let account = AccountKey::generate_rsa(2048)?;
    let key_authorization = format!("tok-dns.{}", account.thumbprint()?);
    let record = dns01_record_value(&key_authorization);
    assert_eq!(record.len(), 43);
    assert!(!record.contains('='));
    Ok(())
}

#[test]
fn reconciling_an_unknown_order_is_a_no_op() -> Result<()> {
    let ctx = Context::background();
    let server = FakeAcmeServer::start("app.example.com");
    let account = AccountKey::generate_p256()?;
    let credentials = MemoryCredentialStore::new();
    credentials.insert(
        NAMESPACE,
        "acme-account",
        account.private_key_pem()?,
    );
    let backend = acme_backend(&ctx, &server, &credentials)?;
    let orchestrator = Orchestrator::new(
        backend
            .authority()
            .ok_or_else(|| anyhow!("acme backend has no authority client"))?,
        SolverRegistry::new(),
        fast_config(),
    );
    let reconciler = Reconciler::new(Arc::new(SqliteResourceStore::open_in_memory()?), orchestrator);

    let reconciled = reconciler.reconcile(&ctx, &WorkItem::Order(order_key(NAMESPACE, "missing")))?;
    assert!(reconciled.action.requeue_after.is_none());
    assert!(reconciled.wake.is_empty());
    Ok(())
}
