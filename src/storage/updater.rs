use std::{fmt, sync::Arc};

use log::{debug, warn};
use thiserror::Error;

use crate::core::{
    config::{PersistMode, ReconcilerConfig},
    context::Context,
    errors::{Classify, ErrorClass},
    types::StoredResource,
};
use crate::storage::store::{ResourceStore, StoreError};

/// Which half of a resource a failed write was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Status,
    Metadata,
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Status => f.write_str("status"),
            WriteTarget::Metadata => f.write_str("metadata"),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to persist {target}: {source}")]
pub struct WriteError {
    pub target: WriteTarget,
    #[source]
    pub source: StoreError,
}

/// Every write failure from one reconcile call, status first.
#[derive(Debug)]
pub struct UpdateError(pub Vec<WriteError>);

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for UpdateError {}

impl Classify for UpdateError {
    /// The first failure decides: a status conflict outranks a later metadata error.
    fn class(&self) -> ErrorClass {
        self.0
            .first()
            .map(|err| err.source.class())
            .unwrap_or(ErrorClass::DivergedState)
    }
}

/// Result of one diff-then-write pass.
#[derive(Debug)]
pub struct UpdateOutcome<R> {
    /// Latest known copy: the store's response when a write succeeded, else `modified`.
    pub resource: R,
    pub status_persisted: bool,
    pub metadata_persisted: bool,
    pub errors: Vec<WriteError>,
}

impl<R> UpdateOutcome<R> {
    pub fn persisted(&self) -> bool {
        self.status_persisted || self.metadata_persisted
    }

    pub fn into_result(self) -> Result<R, UpdateError> {
        if self.errors.is_empty() {
            Ok(self.resource)
        } else {
            Err(UpdateError(self.errors))
        }
    }
}

/// Writes back only what a reconciliation actually changed.
///
/// Status and finalizers are compared separately against the copy that was
/// read; each changed half gets its own write, and a failure on the status
/// write does not stop the metadata write.
pub struct StatusUpdater<S> {
    store: Arc<S>,
    mode: PersistMode,
    field_manager: String,
}

impl<S: ResourceStore> StatusUpdater<S> {
    pub fn new(store: Arc<S>, mode: PersistMode, field_manager: impl Into<String>) -> Self {
        Self {
            store,
            mode,
            field_manager: field_manager.into(),
        }
    }

    pub fn from_config(store: Arc<S>, config: &ReconcilerConfig) -> Self {
        Self::new(store, config.persist_mode, config.field_manager.clone())
    }

    pub fn mode(&self) -> PersistMode {
        self.mode
    }

    pub fn reconcile<R: StoredResource>(
        &self,
        ctx: &Context,
        original: &R,
        modified: R,
    ) -> UpdateOutcome<R> {
        let key = modified.resource_key();
        let kind = R::kind(&());
        let mut outcome = UpdateOutcome {
            resource: modified,
            status_persisted: false,
            metadata_persisted: false,
            errors: Vec::new(),
        };

        if original.status() != outcome.resource.status() {
            debug!("[updater] persisting {kind} {key} status");
            match self.persist_status(ctx, &outcome.resource) {
                Ok(stored) => {
                    // Keep local metadata edits; only the version moves forward.
                    outcome.resource.meta_mut().resource_version =
                        stored.meta().resource_version.clone();
                    outcome.status_persisted = true;
                }
                Err(err) => {
                    warn!("[updater] {kind} {key} status write failed: {err}");
                    outcome.errors.push(WriteError {
                        target: WriteTarget::Status,
                        source: err,
                    });
                }
            }
        }

        if original.finalizers() != outcome.resource.finalizers() {
            debug!(
                "[updater] persisting {kind} {key} finalizers {:?}",
                outcome.resource.finalizers()
            );
            match self.persist(ctx, &outcome.resource) {
                Ok(stored) => {
                    outcome.resource = stored;
                    outcome.metadata_persisted = true;
                }
                Err(err) => {
                    warn!("[updater] {kind} {key} metadata write failed: {err}");
                    outcome.errors.push(WriteError {
                        target: WriteTarget::Metadata,
                        source: err,
                    });
                }
            }
        }

        outcome
    }

    fn persist_status<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        match self.mode {
            PersistMode::Update => self.store.update_status(ctx, resource),
            PersistMode::Apply => self.store.apply_status(ctx, resource, &self.field_manager),
        }
    }

    fn persist<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError> {
        match self.mode {
            PersistMode::Update => self.store.update(ctx, resource),
            PersistMode::Apply => self.store.apply(ctx, resource, &self.field_manager),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::types::{CHALLENGE_FINALIZER, Challenge, ResourceKey, State};
    use crate::storage::store::LabelSelector;
    use std::sync::Mutex;

    /// Records every call and fails the writes it is told to fail.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub calls: Mutex<Vec<String>>,
        pub fail_status: Mutex<bool>,
        pub fail_update: Mutex<bool>,
    }

    impl RecordingStore {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn bump<R: StoredResource>(resource: &R) -> R {
            let mut stored = resource.clone();
            let next = stored
                .meta()
                .resource_version
                .as_deref()
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            stored.meta_mut().resource_version = Some(next.to_string());
            stored
        }

        fn unavailable(call: &str) -> StoreError {
            StoreError::Unavailable(format!("{call} refused"))
        }
    }

    impl ResourceStore for RecordingStore {
        fn get<R: StoredResource>(&self, _ctx: &Context, key: &ResourceKey) -> Result<R, StoreError> {
            self.record("get");
            Err(StoreError::NotFound {
                kind: R::kind(&()).to_string(),
                key: key.clone(),
            })
        }

        fn list<R: StoredResource>(
            &self,
            _ctx: &Context,
            _namespace: &str,
            _selector: Option<&LabelSelector>,
        ) -> Result<Vec<R>, StoreError> {
            self.record("list");
            Ok(Vec::new())
        }

        fn create<R: StoredResource>(&self, _ctx: &Context, resource: &R) -> Result<R, StoreError> {
            self.record("create");
            Ok(Self::bump(resource))
        }

        fn delete<R: StoredResource>(&self, _ctx: &Context, _key: &ResourceKey) -> Result<(), StoreError> {
            self.record("delete");
            Ok(())
        }

        fn update_status<R: StoredResource>(&self, _ctx: &Context, resource: &R) -> Result<R, StoreError> {
            self.record("update_status");
            if *self.fail_status.lock().unwrap() {
                return Err(Self::unavailable("update_status"));
            }
            Ok(Self::bump(resource))
        }

        fn update<R: StoredResource>(&self, _ctx: &Context, resource: &R) -> Result<R, StoreError> {
            self.record("update");
            if *self.fail_update.lock().unwrap() {
                return Err(Self::unavailable("update"));
            }
            Ok(Self::bump(resource))
        }

        fn apply_status<R: StoredResource>(
            &self,
            _ctx: &Context,
            resource: &R,
            field_manager: &str,
        ) -> Result<R, StoreError> {
            self.record(&format!("apply_status {field_manager}"));
            Ok(Self::bump(resource))
        }

        fn apply<R: StoredResource>(
            &self,
            _ctx: &Context,
            resource: &R,
            field_manager: &str,
        ) -> Result<R, StoreError> {
            self.record(&format!("apply {field_manager}"));
            Ok(Self::bump(resource))
        }
    }

    fn challenge() -> Challenge {
        let mut ch = Challenge::default();
        ch.metadata.name = Some("ch-1".into());
        ch.metadata.namespace = Some("default".into());
        ch.metadata.resource_version = Some("7".into());
        ch.spec.url = "https://ca.example/chall/1".into();
        ch
    }

    fn updater(store: &Arc<RecordingStore>, mode: PersistMode) -> StatusUpdater<RecordingStore> {
        StatusUpdater::new(store.clone(), mode, "acme-reconciler")
    }

    #[test]
    fn unchanged_resource_issues_no_calls() {
        let store = Arc::new(RecordingStore::default());
        let original = challenge();

        let outcome = updater(&store, PersistMode::Update).reconcile(
            &Context::background(),
            &original,
            original.clone(),
        );

        assert!(!outcome.persisted());
        assert!(store.calls().is_empty());
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn second_reconcile_with_no_local_change_is_silent() {
        let store = Arc::new(RecordingStore::default());
        let updater = updater(&store, PersistMode::Update);
        let ctx = Context::background();
        let original = challenge();
        let mut modified = original.clone();
        modified.status.state = State::Valid;
        modified.metadata.finalizers = Some(vec![CHALLENGE_FINALIZER.into()]);

        let first = updater.reconcile(&ctx, &original, modified.clone());
        assert_eq!(store.calls(), ["update_status", "update"]);
        let persisted = first.into_result().unwrap();

        let second = updater.reconcile(&ctx, &persisted, persisted.clone());
        assert!(!second.persisted());
        assert_eq!(store.calls().len(), 2);
    }

    #[test]
    fn status_only_change_skips_metadata_write() {
        let store = Arc::new(RecordingStore::default());
        let original = challenge();
        let mut modified = original.clone();
        modified.status.reason = "Incorrect TXT record".into();

        let outcome =
            updater(&store, PersistMode::Update).reconcile(&Context::background(), &original, modified);

        assert_eq!(store.calls(), ["update_status"]);
        assert!(outcome.status_persisted);
        assert_eq!(outcome.resource.metadata.resource_version.as_deref(), Some("8"));
    }

    #[test]
    fn missing_and_empty_finalizers_are_equal() {
        let store = Arc::new(RecordingStore::default());
        let original = challenge();
        let mut modified = original.clone();
        modified.metadata.finalizers = Some(Vec::new());

        let outcome =
            updater(&store, PersistMode::Update).reconcile(&Context::background(), &original, modified);

        assert!(!outcome.persisted());
        assert!(store.calls().is_empty());
    }

    #[test]
    fn metadata_write_uses_version_from_status_write() {
        let store = Arc::new(RecordingStore::default());
        let original = challenge();
        let mut modified = original.clone();
        modified.status.processing = true;
        modified.metadata.finalizers = Some(vec![CHALLENGE_FINALIZER.into()]);

        let outcome =
            updater(&store, PersistMode::Update).reconcile(&Context::background(), &original, modified);

        let resource = outcome.into_result().unwrap();
        // 7 -> 8 on status, 8 -> 9 on metadata.
        assert_eq!(resource.metadata.resource_version.as_deref(), Some("9"));
        assert_eq!(resource.finalizers(), [CHALLENGE_FINALIZER.to_string()]);
    }

    #[test]
    fn status_failure_does_not_block_metadata_write() {
        let store = Arc::new(RecordingStore::default());
        *store.fail_status.lock().unwrap() = true;
        *store.fail_update.lock().unwrap() = true;
        let original = challenge();
        let mut modified = original.clone();
        modified.status.state = State::Errored;
        modified.metadata.finalizers = Some(vec![CHALLENGE_FINALIZER.into()]);

        let outcome =
            updater(&store, PersistMode::Update).reconcile(&Context::background(), &original, modified);

        assert_eq!(store.calls(), ["update_status", "update"]);
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.0.len(), 2);
        assert_eq!(err.0[0].target, WriteTarget::Status);
        assert_eq!(err.0[1].target, WriteTarget::Metadata);
        assert_eq!(err.class(), ErrorClass::Transport);
        let message = err.to_string();
        assert!(message.find("status").unwrap() < message.find("metadata").unwrap());
    }

    #[test]
    fn apply_mode_uses_field_manager() {
        let store = Arc::new(RecordingStore::default());
        let original = challenge();
        let mut modified = original.clone();
        modified.status.presented = true;
        modified.metadata.finalizers = Some(vec![CHALLENGE_FINALIZER.into()]);

        let outcome =
            updater(&store, PersistMode::Apply).reconcile(&Context::background(), &original, modified);

        assert!(outcome.status_persisted && outcome.metadata_persisted);
        assert_eq!(
            store.calls(),
            ["apply_status acme-reconciler", "apply acme-reconciler"]
        );
    }
}
