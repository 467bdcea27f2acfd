use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::{
    config::ReconcilerConfig,
    context::{Cancelled, Context},
    domain::normalize_order_identifiers,
    errors::{Classify, ErrorClass},
    types::{
        API_GROUP, API_VERSION, AuthorizationStatus, CHALLENGE_FINALIZER, Challenge,
        ChallengeOffer, ChallengePhase, ChallengeSpec, DNS01, ORDER_NAME_LABEL, Order,
        ResourceKey, State,
    },
};
use crate::issuance::{
    acme::dns01_record_value,
    challenge_status::{SyncError, sync_challenge_status},
    client::{AcmeChallenge, AuthorityClient, AuthorityError, Identifier, Problem},
    retry::{Backoff, Poll},
    solver::{Solver, SolverRegistry},
};

/// Source of "now" for persisted backoff bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What the caller should do once a step has been persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn requeue_now() -> Self {
        Self::requeue(Duration::ZERO)
    }
}

/// Child Challenges an order step wants created or removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildPlan {
    pub create: Vec<Challenge>,
    pub delete: Vec<ResourceKey>,
}

impl ChildPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderStep {
    pub action: Action,
    pub children: ChildPlan,
}

impl OrderStep {
    fn with_action(action: Action) -> Self {
        Self {
            action,
            children: ChildPlan::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("{challenge_type} solver failed: {source:#}")]
    Solver {
        challenge_type: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no solver registered for challenge type {0}")]
    NoSolver(String),
    #[error("invalid order request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl OrchestratorError {
    /// Text recorded in `status.reason` when the error ends the resource.
    pub fn reason(&self) -> String {
        match self {
            OrchestratorError::Authority(err) => err.reason(),
            OrchestratorError::Sync(SyncError::Authority(err)) => err.reason(),
            other => other.to_string(),
        }
    }
}

impl Classify for OrchestratorError {
    fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Authority(err) => err.class(),
            OrchestratorError::Sync(err) => err.class(),
            OrchestratorError::Solver { .. } => ErrorClass::Transport,
            OrchestratorError::NoSolver(_) | OrchestratorError::InvalidRequest(_) => {
                ErrorClass::Configuration
            }
            OrchestratorError::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

/// Terminal errors end the resource; everything else is left for a retry.
fn ends_resource(err: &OrchestratorError) -> bool {
    !err.is_retryable() && err.class() != ErrorClass::NotYetCreated
}

struct OrderOwner {
    name: String,
    namespace: String,
    uid: Option<String>,
    issuer_ref: String,
}

impl OrderOwner {
    fn of(order: &Order) -> Self {
        Self {
            name: order.metadata.name.clone().unwrap_or_default(),
            namespace: order.metadata.namespace.clone().unwrap_or_default(),
            uid: order.metadata.uid.clone(),
            issuer_ref: order.spec.issuer_ref.clone(),
        }
    }
}

/// Deterministic so a lost create can be retried without duplicating the challenge.
pub fn challenge_name(order_name: &str, authorization_url: &str, challenge_type: &str) -> String {
    let digest = Sha256::digest(format!("{authorization_url}#{challenge_type}").as_bytes());
    format!("{order_name}-{}", &hex::encode(digest)[..10])
}

/// Drives Orders and Challenges through the ACME issuance state machine.
///
/// Each call performs at most one transition on the resource it is handed and
/// never sleeps; the returned `Action` says when to look again. Backoff
/// bookkeeping lives in the resource status, so a fresh process resumes where
/// the last one stopped.
pub struct Orchestrator {
    authority: Arc<dyn AuthorityClient>,
    solvers: SolverRegistry,
    config: ReconcilerConfig,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        authority: Arc<dyn AuthorityClient>,
        solvers: SolverRegistry,
        config: ReconcilerConfig,
    ) -> Self {
        Self::with_clock(authority, solvers, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        authority: Arc<dyn AuthorityClient>,
        solvers: SolverRegistry,
        config: ReconcilerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authority,
            solvers,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn solver(&self, challenge: &Challenge) -> Result<&Arc<dyn Solver>, OrchestratorError> {
        self.solvers
            .get(&challenge.spec.challenge_type)
            .ok_or_else(|| OrchestratorError::NoSolver(challenge.spec.challenge_type.clone()))
    }

    fn solver_error(challenge: &Challenge, source: anyhow::Error) -> OrchestratorError {
        OrchestratorError::Solver {
            challenge_type: challenge.spec.challenge_type.clone(),
            source,
        }
    }

    // ---- challenges ----

    /// Advances a live challenge by one phase.
    pub fn sync_challenge(
        &self,
        ctx: &Context,
        challenge: &mut Challenge,
    ) -> Result<Action, OrchestratorError> {
        ctx.check()?;
        let finalizers = challenge.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == CHALLENGE_FINALIZER) {
            finalizers.push(CHALLENGE_FINALIZER.to_string());
        }

        let phase = challenge.phase();
        debug!("[orchestrator] challenge {} in phase {phase:?}", challenge.key());
        let result = match phase {
            ChallengePhase::Created => self.start(ctx, challenge),
            ChallengePhase::Presenting => self.present(ctx, challenge),
            ChallengePhase::Accepting => self.accept(ctx, challenge),
            ChallengePhase::Polling => self.poll_challenge(ctx, challenge),
            ChallengePhase::Finished => self.clean_up_finished(ctx, challenge),
        };
        result.or_else(|err| self.settle_challenge(challenge, err))
    }

    fn settle_challenge(
        &self,
        challenge: &mut Challenge,
        err: OrchestratorError,
    ) -> Result<Action, OrchestratorError> {
        if !ends_resource(&err) {
            return Err(err);
        }
        warn!(
            "[orchestrator] challenge {} failed permanently: {err}",
            challenge.key()
        );
        challenge.status.state = State::Errored;
        challenge.status.reason = err.reason();
        Ok(Action::requeue_now())
    }

    fn start(&self, ctx: &Context, challenge: &mut Challenge) -> Result<Action, OrchestratorError> {
        if !challenge.spec.url.is_empty() {
            // Challenges the authority already settled or is validating must not be redone.
            sync_challenge_status(ctx, self.authority.as_ref(), challenge)?;
            if challenge.status.state.is_final() {
                info!(
                    "[orchestrator] challenge {} already {} at the authority",
                    challenge.key(),
                    challenge.status.state
                );
                return Ok(Action::done());
            }
            if challenge.status.state == State::Processing {
                challenge.status.presented = true;
                challenge.status.accepted = true;
            }
        }
        self.solver(challenge)?;
        challenge.status.processing = true;
        Ok(Action::requeue_now())
    }

    fn present(&self, ctx: &Context, challenge: &mut Challenge) -> Result<Action, OrchestratorError> {
        let backoff = Backoff::new(self.config.presentation_backoff);
        let now = self.clock.now();
        let attempt = match backoff.poll(challenge.status.retries, challenge.status.last_attempt, now) {
            Poll::Exhausted => {
                warn!(
                    "[orchestrator] challenge {} was never presented",
                    challenge.key()
                );
                challenge.status.state = State::Errored;
                challenge.status.reason = format!(
                    "timed out waiting for {} challenge to be presented after {} checks",
                    challenge.spec.challenge_type,
                    backoff.max_attempts()
                );
                return Ok(Action::requeue_now());
            }
            Poll::Wait(wait) => return Ok(Action::requeue(wait)),
            Poll::Due { attempt } => attempt,
        };

        challenge.status.retries += 1;
        challenge.status.last_attempt = Some(now);
        let solver = self.solver(challenge)?;
        solver
            .present(ctx, challenge)
            .map_err(|err| Self::solver_error(challenge, err))?;
        ctx.check()?;
        let ready = solver
            .check_presented(ctx, challenge)
            .map_err(|err| Self::solver_error(challenge, err))?;
        if ready {
            info!(
                "[orchestrator] {} challenge {} presented for {}",
                challenge.spec.challenge_type,
                challenge.key(),
                challenge.spec.dns_name
            );
            challenge.status.presented = true;
            Ok(Action::requeue_now())
        } else {
            debug!(
                "[orchestrator] challenge {} not yet presented (check {})",
                challenge.key(),
                attempt + 1
            );
            Ok(Action::requeue(backoff.delay_for(attempt)))
        }
    }

    fn accept(&self, ctx: &Context, challenge: &mut Challenge) -> Result<Action, OrchestratorError> {
        if challenge.spec.url.is_empty() {
            return Err(SyncError::NotYetCreated.into());
        }
        let remote = self.authority.accept_challenge(ctx, &challenge.spec.url)?;
        info!(
            "[orchestrator] accepted challenge {} ({})",
            challenge.key(),
            remote.status
        );
        apply_remote(challenge, &remote);
        challenge.status.accepted = true;
        challenge.status.processing_attempts = 0;
        challenge.status.last_attempt = Some(self.clock.now());
        if challenge.status.state.is_final() {
            return Ok(Action::requeue_now());
        }
        Ok(Action::requeue(self.config.challenge_backoff.initial()))
    }

    fn poll_challenge(
        &self,
        ctx: &Context,
        challenge: &mut Challenge,
    ) -> Result<Action, OrchestratorError> {
        let backoff = Backoff::new(self.config.challenge_backoff);
        let now = self.clock.now();
        let attempt = match backoff.poll(
            challenge.status.processing_attempts,
            challenge.status.last_attempt,
            now,
        ) {
            Poll::Exhausted => {
                warn!(
                    "[orchestrator] challenge {} still {} after {} polls",
                    challenge.key(),
                    challenge.status.state,
                    backoff.max_attempts()
                );
                challenge.status.state = State::Errored;
                challenge.status.reason = format!(
                    "timed out waiting for the authority to validate the challenge after {} attempts",
                    backoff.max_attempts()
                );
                return Ok(Action::requeue_now());
            }
            Poll::Wait(wait) => return Ok(Action::requeue(wait)),
            Poll::Due { attempt } => attempt,
        };

        // A cancelled poll must not consume an attempt.
        ctx.check()?;
        let mut observed = challenge.clone();
        sync_challenge_status(ctx, self.authority.as_ref(), &mut observed)?;
        challenge.status.state = observed.status.state;
        challenge.status.reason = observed.status.reason;
        challenge.status.processing_attempts += 1;
        challenge.status.last_attempt = Some(now);

        if challenge.status.state.is_final() {
            info!(
                "[orchestrator] challenge {} is {}",
                challenge.key(),
                challenge.status.state
            );
            return Ok(Action::requeue_now());
        }
        Ok(Action::requeue(backoff.delay_for(attempt)))
    }

    fn clean_up_finished(
        &self,
        ctx: &Context,
        challenge: &mut Challenge,
    ) -> Result<Action, OrchestratorError> {
        if challenge.status.processing {
            if let Some(solver) = self.solvers.get(&challenge.spec.challenge_type) {
                solver
                    .clean_up(ctx, challenge)
                    .map_err(|err| Self::solver_error(challenge, err))?;
            }
            challenge.status.processing = false;
        }
        Ok(Action::done())
    }

    /// Runs solver clean-up for a challenge being deleted and drops its finalizer.
    pub fn finalize_challenge(
        &self,
        ctx: &Context,
        challenge: &mut Challenge,
    ) -> Result<Action, OrchestratorError> {
        let Some(finalizers) = challenge.metadata.finalizers.as_mut() else {
            return Ok(Action::done());
        };
        if !finalizers.iter().any(|f| f == CHALLENGE_FINALIZER) {
            return Ok(Action::done());
        }
        ctx.check()?;
        match self.solvers.get(&challenge.spec.challenge_type) {
            Some(solver) => solver
                .clean_up(ctx, challenge)
                .map_err(|err| Self::solver_error(challenge, err))?,
            None => warn!(
                "[orchestrator] no {} solver to clean up {}",
                challenge.spec.challenge_type,
                challenge.key()
            ),
        }
        if let Some(finalizers) = challenge.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != CHALLENGE_FINALIZER);
        }
        debug!("[orchestrator] released challenge {}", challenge.key());
        Ok(Action::done())
    }

    // ---- orders ----

    /// Advances an order by one phase given its current child challenges.
    pub fn sync_order(
        &self,
        ctx: &Context,
        order: &mut Order,
        children: &[Challenge],
    ) -> Result<OrderStep, OrchestratorError> {
        ctx.check()?;
        if order.status.state.is_final() {
            return Ok(Self::release_children(children));
        }
        let result = if order.status.url.is_empty() {
            self.create_order(ctx, order)
        } else if order.status.authorizations.iter().any(|a| !a.fetched()) {
            self.fetch_authorizations(ctx, order)
        } else {
            self.progress(ctx, order, children)
        };
        result.or_else(|err| {
            if !ends_resource(&err) {
                return Err(err);
            }
            self.fail_order(order, State::Errored, err.reason());
            Ok(OrderStep::with_action(Action::requeue_now()))
        })
    }

    fn release_children(children: &[Challenge]) -> OrderStep {
        let delete = children
            .iter()
            .filter(|child| child.metadata.deletion_timestamp.is_none())
            .map(Challenge::key)
            .collect();
        OrderStep {
            action: Action::done(),
            children: ChildPlan {
                create: Vec::new(),
                delete,
            },
        }
    }

    fn fail_order(&self, order: &mut Order, state: State, reason: String) {
        warn!(
            "[orchestrator] order {} is {state}: {reason}",
            ResourceKey::of(&order.metadata)
        );
        order.status.state = state;
        order.status.reason = reason;
        order.status.failure_time = Some(self.clock.now());
    }

    fn create_order(&self, ctx: &Context, order: &mut Order) -> Result<OrderStep, OrchestratorError> {
        let identifiers = normalize_order_identifiers(&order.spec.dns_names)
            .map_err(|err| OrchestratorError::InvalidRequest(format!("{err:#}")))?;
        let identifiers: Vec<Identifier> = identifiers
            .iter()
            .map(|id| Identifier::dns(id.order_value()))
            .collect();
        let remote = self.authority.create_order(ctx, &identifiers)?;
        info!(
            "[orchestrator] created order {} for {} identifiers at {}",
            ResourceKey::of(&order.metadata),
            identifiers.len(),
            remote.url
        );
        order.status.url = remote.url;
        order.status.finalize_url = remote.finalize;
        order.status.authorizations = remote
            .authorizations
            .into_iter()
            .map(|url| AuthorizationStatus {
                url,
                ..AuthorizationStatus::default()
            })
            .collect();
        match remote.status {
            // A reused order: local state turns valid only once the chain is stored.
            State::Valid => {
                debug!("[orchestrator] order {} is already valid", order.status.url);
                order.status.finalized = true;
                order.status.state = State::Processing;
                order.status.certificate_url = remote.certificate.unwrap_or_default();
            }
            state if state.is_final() => {
                let reason = failure_reason(remote.error, &state);
                self.fail_order(order, state, reason);
            }
            state => order.status.state = state,
        }
        Ok(OrderStep::with_action(Action::requeue_now()))
    }

    fn fetch_authorizations(
        &self,
        ctx: &Context,
        order: &mut Order,
    ) -> Result<OrderStep, OrchestratorError> {
        for status in order.status.authorizations.iter_mut().filter(|a| !a.fetched()) {
            let authorization = self.authority.get_authorization(ctx, &status.url)?;
            status.identifier = authorization.identifier.value.clone();
            status.wildcard = authorization.wildcard;
            status.initial_state = authorization.status.clone();
            status.offered = authorization
                .challenges
                .iter()
                .map(|challenge| ChallengeOffer {
                    url: challenge.url.clone(),
                    challenge_type: challenge.kind.clone(),
                    token: challenge.token.clone(),
                })
                .collect();
            debug!(
                "[orchestrator] authorization {} for {} is {} with {} offers",
                status.url,
                status.identifier,
                status.initial_state,
                status.offered.len()
            );
        }
        Ok(OrderStep::with_action(Action::requeue_now()))
    }

    fn build_challenge(
        &self,
        owner: &OrderOwner,
        authorization: &AuthorizationStatus,
        offer: &ChallengeOffer,
    ) -> Result<Challenge, OrchestratorError> {
        let key_authorization = self.authority.key_authorization(&offer.token)?;
        let key = if offer.challenge_type == DNS01 {
            dns01_record_value(&key_authorization)
        } else {
            key_authorization
        };
        let owner_references = owner.uid.as_ref().map(|uid| {
            vec![OwnerReference {
                api_version: format!("{API_GROUP}/{API_VERSION}"),
                kind: "Order".to_string(),
                name: owner.name.clone(),
                uid: uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]
        });
        Ok(Challenge {
            metadata: ObjectMeta {
                name: Some(challenge_name(
                    &owner.name,
                    &authorization.url,
                    &offer.challenge_type,
                )),
                namespace: Some(owner.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    ORDER_NAME_LABEL.to_string(),
                    owner.name.clone(),
                )])),
                finalizers: Some(vec![CHALLENGE_FINALIZER.to_string()]),
                owner_references,
                ..ObjectMeta::default()
            },
            spec: ChallengeSpec {
                url: offer.url.clone(),
                authorization_url: authorization.url.clone(),
                dns_name: authorization.identifier.clone(),
                wildcard: authorization.wildcard,
                challenge_type: offer.challenge_type.clone(),
                token: offer.token.clone(),
                key,
                order_ref: owner.name.clone(),
                issuer_ref: owner.issuer_ref.clone(),
            },
            status: Default::default(),
        })
    }

    /// Assigns the next-ranked untried challenge type to `authorization`.
    fn assign_challenge(
        &self,
        owner: &OrderOwner,
        authorization: &mut AuthorizationStatus,
    ) -> Result<Option<Challenge>, OrchestratorError> {
        let Some(offer) = self
            .solvers
            .select(&authorization.offered, &authorization.attempted_types, &self.config)
            .cloned()
        else {
            return Ok(None);
        };
        let challenge = self.build_challenge(owner, authorization, &offer)?;
        authorization.attempted_types.push(offer.challenge_type.clone());
        authorization.challenge = challenge.metadata.name.clone();
        info!(
            "[orchestrator] solving {} with {} challenge {}",
            authorization.identifier,
            offer.challenge_type,
            challenge.key()
        );
        Ok(Some(challenge))
    }

    /// Rebuilds the assigned challenge when it is missing from the store.
    fn recreate_challenge(
        &self,
        owner: &OrderOwner,
        authorization: &AuthorizationStatus,
    ) -> Result<Option<Challenge>, OrchestratorError> {
        let Some(offer) = authorization.attempted_types.last().and_then(|kind| {
            authorization
                .offered
                .iter()
                .find(|offer| &offer.challenge_type == kind)
        }) else {
            return Ok(None);
        };
        self.build_challenge(owner, authorization, offer).map(Some)
    }

    fn progress(
        &self,
        ctx: &Context,
        order: &mut Order,
        children: &[Challenge],
    ) -> Result<OrderStep, OrchestratorError> {
        let owner = OrderOwner::of(order);
        let mut plan = ChildPlan::default();
        let mut pending = false;
        let mut failure: Option<(State, String)> = None;

        for authorization in order.status.authorizations.iter_mut() {
            if authorization.initial_state == State::Valid {
                continue;
            }
            if authorization.initial_state.is_failure() {
                failure = Some((
                    State::Invalid,
                    format!(
                        "authorization for {} is {}",
                        authorization.identifier, authorization.initial_state
                    ),
                ));
                break;
            }

            let live = authorization.challenge.as_deref().and_then(|name| {
                children
                    .iter()
                    .find(|child| child.metadata.name.as_deref() == Some(name))
            });
            match live {
                Some(child) if child.status.state == State::Valid => {}
                Some(child) if child.status.state.is_failure() && !may_be_live(child) => {
                    plan.delete.push(child.key());
                    authorization.challenge = None;
                    match self.assign_challenge(&owner, authorization)? {
                        Some(next) => {
                            info!(
                                "[orchestrator] {} challenge {} for {} is {}; falling back to {}",
                                child.spec.challenge_type,
                                child.key(),
                                authorization.identifier,
                                child.status.state,
                                next.spec.challenge_type
                            );
                            plan.create.push(next);
                            pending = true;
                        }
                        None => {
                            let reason = if child.status.reason.is_empty() {
                                format!("challenge is {}", child.status.state)
                            } else {
                                child.status.reason.clone()
                            };
                            failure = Some((
                                State::Invalid,
                                format!(
                                    "{} challenge for {} failed: {reason}",
                                    child.spec.challenge_type, authorization.identifier
                                ),
                            ));
                            break;
                        }
                    }
                }
                Some(child) if child.status.state.is_failure() => {
                    // Possibly still live at the authority, so no other type may start.
                    failure = Some((
                        State::Errored,
                        format!(
                            "{} challenge for {} errored after it was accepted: {}",
                            child.spec.challenge_type, authorization.identifier, child.status.reason
                        ),
                    ));
                    break;
                }
                Some(_) => pending = true,
                None if authorization.challenge.is_some() => {
                    if let Some(missing) = self.recreate_challenge(&owner, authorization)? {
                        debug!("[orchestrator] re-creating missing challenge {}", missing.key());
                        plan.create.push(missing);
                    }
                    pending = true;
                }
                None => match self.assign_challenge(&owner, authorization)? {
                    Some(next) => {
                        plan.create.push(next);
                        pending = true;
                    }
                    None => {
                        let offered: Vec<&str> = authorization
                            .offered
                            .iter()
                            .map(|offer| offer.challenge_type.as_str())
                            .collect();
                        failure = Some((
                            State::Invalid,
                            format!(
                                "no supported challenge type for {} (offered: {})",
                                authorization.identifier,
                                offered.join(", ")
                            ),
                        ));
                        break;
                    }
                },
            }
        }

        if let Some((state, reason)) = failure {
            self.fail_order(order, state, reason);
            let mut step = Self::release_children(children);
            step.children.create.clear();
            return Ok(step);
        }
        if pending {
            return Ok(OrderStep {
                action: Action::requeue(self.config.order_backoff.initial()),
                children: plan,
            });
        }

        let action = if order.status.certificate_url.is_empty() {
            self.await_certificate(ctx, order)?
        } else {
            self.download_certificate(ctx, order)?
        };
        Ok(OrderStep {
            action,
            children: plan,
        })
    }

    fn await_certificate(&self, ctx: &Context, order: &mut Order) -> Result<Action, OrchestratorError> {
        let backoff = Backoff::new(self.config.order_backoff);
        let now = self.clock.now();
        let attempt = match backoff.poll(order.status.poll.attempts, order.status.poll.last_attempt, now)
        {
            Poll::Exhausted => {
                let waiting_for = if order.status.finalized {
                    "the certificate to be issued"
                } else {
                    "the order to become ready"
                };
                self.fail_order(
                    order,
                    State::Errored,
                    format!(
                        "timed out waiting for {waiting_for} after {} attempts",
                        backoff.max_attempts()
                    ),
                );
                return Ok(Action::requeue_now());
            }
            Poll::Wait(wait) => return Ok(Action::requeue(wait)),
            Poll::Due { attempt } => attempt,
        };

        ctx.check()?;
        let remote = self.authority.get_order(ctx, &order.status.url)?;
        order.status.poll.record(now);
        match remote.status {
            State::Ready if !order.status.finalized => {
                let csr = csr_der(&order.spec.request)?;
                let finalized = self
                    .authority
                    .finalize_order(ctx, &order.status.finalize_url, &csr)?;
                info!(
                    "[orchestrator] finalized order {} ({})",
                    order.status.url, finalized.status
                );
                order.status.finalized = true;
                order.status.state = State::Processing;
                order.status.certificate_url = finalized.certificate.unwrap_or_default();
                order.status.poll.reset();
                Ok(Action::requeue_now())
            }
            State::Valid => {
                order.status.finalized = true;
                order.status.poll.reset();
                match remote.certificate {
                    Some(url) if !url.is_empty() => {
                        order.status.certificate_url = url;
                        Ok(Action::requeue_now())
                    }
                    _ => Err(AuthorityError::Malformed(format!(
                        "order {} is valid but has no certificate URL",
                        order.status.url
                    ))
                    .into()),
                }
            }
            state if state.is_failure() => {
                let reason = failure_reason(remote.error, &state);
                self.fail_order(order, state, reason);
                Ok(Action::requeue_now())
            }
            state => {
                if !order.status.finalized {
                    order.status.state = state;
                }
                Ok(Action::requeue(backoff.delay_for(attempt)))
            }
        }
    }

    fn download_certificate(&self, ctx: &Context, order: &mut Order) -> Result<Action, OrchestratorError> {
        let chain = self
            .authority
            .get_certificate(ctx, &order.status.certificate_url)?;
        let chain = String::from_utf8(chain).map_err(|_| {
            AuthorityError::Malformed("certificate chain is not valid UTF-8 PEM".into())
        })?;
        info!(
            "[orchestrator] order {} issued a certificate",
            ResourceKey::of(&order.metadata)
        );
        order.status.certificate = Some(chain);
        order.status.state = State::Valid;
        order.status.reason.clear();
        order.status.poll.reset();
        Ok(Action::requeue_now())
    }
}

/// Only the authority's own `invalid` or `expired` rules out a live attempt,
/// unless the challenge never got as far as being accepted.
fn may_be_live(challenge: &Challenge) -> bool {
    challenge.status.state == State::Errored && challenge.status.accepted
}

fn failure_reason(problem: Option<Problem>, state: &State) -> String {
    problem
        .map(|problem| problem.detail)
        .filter(|detail| !detail.is_empty())
        .unwrap_or_else(|| format!("order is {state}"))
}

fn apply_remote(challenge: &mut Challenge, remote: &AcmeChallenge) {
    challenge.status.state = remote.status.clone();
    challenge.status.reason = remote
        .error
        .as_ref()
        .map(|error| error.reason())
        .unwrap_or_default();
}

fn csr_der(request: &str) -> Result<Vec<u8>, OrchestratorError> {
    let parsed = pem::parse(request.trim())
        .map_err(|err| OrchestratorError::InvalidRequest(format!("failed to decode CSR: {err}")))?;
    match parsed.tag() {
        "CERTIFICATE REQUEST" | "NEW CERTIFICATE REQUEST" => Ok(parsed.into_contents()),
        other => Err(OrchestratorError::InvalidRequest(format!(
            "expected a CERTIFICATE REQUEST PEM block, found {other}"
        ))),
    }
}
