use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::{
    context::{Cancelled, Context},
    errors::{Classify, ErrorClass},
    types::{ResourceKey, StoredResource},
};

/// Equality-based label selector; an empty map matches everything.
pub type LabelSelector = BTreeMap<String, String>;

pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Errors produced by resource store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ResourceKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ResourceKey },
    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: String,
        key: ResourceKey,
        expected: String,
        actual: String,
    },
    #[error("{kind} {key} is invalid: {reason}")]
    Invalid {
        kind: String,
        key: ResourceKey,
        reason: String,
    },
    #[error("resource store unavailable: {0}")]
    Unavailable(String),
    #[error("resource serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound { .. }
            | StoreError::AlreadyExists { .. }
            | StoreError::Conflict { .. } => ErrorClass::DivergedState,
            StoreError::Invalid { .. } | StoreError::Serialization(_) => ErrorClass::Configuration,
            StoreError::Unavailable(_) => ErrorClass::Transport,
            StoreError::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

/// Persistence for Challenge and Order resources.
///
/// `update_status`, `update` and their apply counterparts compare the
/// resource version carried in the written object against the stored one and
/// fail with `StoreError::Conflict` on mismatch. Status writes never touch
/// spec or metadata; full writes never touch status.
pub trait ResourceStore: Send + Sync {
    fn get<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey) -> Result<R, StoreError>;

    fn list<R: StoredResource>(
        &self,
        ctx: &Context,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<R>, StoreError>;

    fn create<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError>;

    /// Removes the resource, or marks it for deletion while finalizers remain.
    fn delete<R: StoredResource>(&self, ctx: &Context, key: &ResourceKey)
    -> Result<(), StoreError>;

    fn update_status<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
    ) -> Result<R, StoreError>;

    fn update<R: StoredResource>(&self, ctx: &Context, resource: &R) -> Result<R, StoreError>;

    fn apply_status<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: &str,
    ) -> Result<R, StoreError>;

    fn apply<R: StoredResource>(
        &self,
        ctx: &Context,
        resource: &R,
        field_manager: &str,
    ) -> Result<R, StoreError>;
}
