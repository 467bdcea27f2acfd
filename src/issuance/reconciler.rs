use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::core::{
    context::Context,
    errors::{Classify, ErrorClass},
    types::{Challenge, ORDER_NAME_LABEL, Order, ResourceKey, StoredResource},
};
use crate::issuance::orchestrator::{Action, ChildPlan, OrchestratorError, Orchestrator};
use crate::storage::{
    queue::WorkQueue,
    store::{ResourceStore, StoreError},
    updater::{StatusUpdater, UpdateError},
};

/// A unit of work for the reconcile workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkItem {
    Order(ResourceKey),
    Challenge(ResourceKey),
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Order(key) => write!(f, "order {key}"),
            WorkItem::Challenge(key) => write!(f, "challenge {key}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Step(#[from] OrchestratorError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    /// The step failed and persisting its partial result failed too.
    #[error("{step}; {update}")]
    Aggregate {
        step: OrchestratorError,
        update: UpdateError,
    },
}

impl Classify for ReconcileError {
    fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(err) => err.class(),
            ReconcileError::Step(err) => err.class(),
            ReconcileError::Update(err) => err.class(),
            ReconcileError::Aggregate { step, .. } => step.class(),
        }
    }
}

/// Result of one reconcile: when to come back, and which related items changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub action: Action,
    pub wake: Vec<WorkItem>,
}

fn combine(
    step: Result<Action, OrchestratorError>,
    update: Result<(), UpdateError>,
) -> Result<Action, ReconcileError> {
    match (step, update) {
        (Ok(action), Ok(())) => Ok(action),
        (Err(step), Ok(())) => Err(step.into()),
        (Ok(_), Err(update)) => Err(update.into()),
        (Err(step), Err(update)) => Err(ReconcileError::Aggregate { step, update }),
    }
}

/// Loads a resource, runs one orchestrator step on it and persists the delta.
pub struct Reconciler<S> {
    store: Arc<S>,
    updater: StatusUpdater<S>,
    orchestrator: Orchestrator,
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(store: Arc<S>, orchestrator: Orchestrator) -> Self {
        let updater = StatusUpdater::from_config(store.clone(), orchestrator.config());
        Self {
            store,
            updater,
            orchestrator,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn load<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey) -> Result<Option<R>, StoreError> {
        match self.store.get::<R>(ctx, key) {
            Ok(resource) => Ok(Some(resource)),
            Err(err) if err.is_not_found() => {
                debug!("[orchestrator] {} {key} is gone", R::kind(&()));
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn reconcile(&self, ctx: &Context, item: &WorkItem) -> Result<Reconciled, ReconcileError> {
        match item {
            WorkItem::Order(key) => self.reconcile_order(ctx, key),
            WorkItem::Challenge(key) => self.reconcile_challenge(ctx, key),
        }
    }

    pub fn reconcile_challenge(
        &self,
        ctx: &Context,
        key: &ResourceKey,
    ) -> Result<Reconciled, ReconcileError> {
        let Some(original) = self.load::<Challenge>(ctx, key)? else {
            return Ok(Reconciled::default());
        };
        let mut modified = original.clone();
        let step = if modified.metadata.deletion_timestamp.is_some() {
            self.orchestrator.finalize_challenge(ctx, &mut modified)
        } else {
            self.orchestrator.sync_challenge(ctx, &mut modified)
        };
        let step = match step {
            Err(err) if err.class() == ErrorClass::Cancelled => return Err(err.into()),
            other => other,
        };

        let state_changed = original.status.state != modified.status.state;
        let owner = modified.spec.order_ref.clone();
        let outcome = self.updater.reconcile(ctx, &original, modified);
        let action = combine(step, outcome.into_result().map(|_| ()))?;

        let mut wake = Vec::new();
        if state_changed && !owner.is_empty() {
            wake.push(WorkItem::Order(ResourceKey::new(key.namespace.clone(), owner)));
        }
        Ok(Reconciled { action, wake })
    }

    pub fn reconcile_order(
        &self,
        ctx: &Context,
        key: &ResourceKey,
    ) -> Result<Reconciled, ReconcileError> {
        let Some(original) = self.load::<Order>(ctx, key)? else {
            return Ok(Reconciled::default());
        };
        let selector = BTreeMap::from([(ORDER_NAME_LABEL.to_string(), key.name.clone())]);
        let children = self
            .store
            .list::<Challenge>(ctx, &key.namespace, Some(&selector))?;

        let mut modified = original.clone();
        let step = match self.orchestrator.sync_order(ctx, &mut modified, &children) {
            Ok(step) => step,
            Err(err) if err.class() == ErrorClass::Cancelled => return Err(err.into()),
            Err(err) => {
                let update = self
                    .updater
                    .reconcile(ctx, &original, modified)
                    .into_result()
                    .map(|_| ());
                return combine(Err(err), update).map(|action| Reconciled {
                    action,
                    wake: Vec::new(),
                });
            }
        };

        // Children are only touched once the status that names them is stored.
        self.updater
            .reconcile(ctx, &original, modified)
            .into_result()?;
        let wake = self.apply_children(ctx, &step.children)?;
        Ok(Reconciled {
            action: step.action,
            wake,
        })
    }

    fn apply_children(&self, ctx: &Context, plan: &ChildPlan) -> Result<Vec<WorkItem>, StoreError> {
        let mut wake = Vec::new();
        for key in &plan.delete {
            match self.store.delete::<Challenge>(ctx, key) {
                Ok(()) => info!("[orchestrator] deleting challenge {key}"),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            wake.push(WorkItem::Challenge(key.clone()));
        }
        for challenge in &plan.create {
            let key = challenge.key();
            match self.store.create(ctx, challenge) {
                Ok(_) => info!("[orchestrator] created challenge {key}"),
                Err(StoreError::AlreadyExists { .. }) => {
                    debug!("[orchestrator] challenge {key} already exists")
                }
                Err(err) => return Err(err),
            }
            wake.push(WorkItem::Challenge(key));
        }
        Ok(wake)
    }

    /// Processes items until the queue shuts down.
    ///
    /// `retry_after` is used for retryable failures; permanent ones are
    /// logged and dropped until something re-adds the item.
    pub fn run_worker(&self, ctx: &Context, queue: &WorkQueue<WorkItem>, retry_after: Duration) {
        while let Some(item) = queue.get() {
            if ctx.is_cancelled() {
                queue.done(&item);
                break;
            }
            match self.reconcile(ctx, &item) {
                Ok(reconciled) => {
                    for related in reconciled.wake {
                        queue.add(related);
                    }
                    queue.done(&item);
                    if let Some(after) = reconciled.action.requeue_after {
                        queue.add_after(item, after);
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!("[orchestrator] {item} failed ({}): {err}", err.class().as_str());
                    queue.done(&item);
                    queue.add_after(item, retry_after);
                }
                Err(err) => {
                    error!("[orchestrator] {item} failed permanently: {err}");
                    queue.done(&item);
                }
            }
        }
        debug!("[orchestrator] worker stopped");
    }
}
