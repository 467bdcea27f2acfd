//! Reconciliation of ACME orders and challenges against a resource store.
//!
//! [`issuance::reconciler::Reconciler`] loads a resource, lets the
//! [`issuance::orchestrator::Orchestrator`] advance it one step against the
//! authority, and persists the result through the
//! [`storage::updater::StatusUpdater`]. Non-ACME issuers are reached through
//! [`issuance::issuer::IssuerBackend`].

pub mod core;
pub mod issuance;
pub mod secrets;
pub mod storage;

pub use crate::core::config::ReconcilerConfig;
pub use crate::core::context::{CancelHandle, Cancelled, Context};
pub use crate::core::errors::{Classify, ErrorClass};
pub use crate::core::types::{Challenge, Order, ResourceKey, State};
pub use crate::issuance::client::{AuthorityClient, AuthorityError};
pub use crate::issuance::issuer::{IssuerBackend, IssuerConfig, IssuerError};
pub use crate::issuance::orchestrator::Orchestrator;
pub use crate::issuance::reconciler::{Reconciler, WorkItem};
pub use crate::issuance::solver::{Solver, SolverRegistry};
pub use crate::storage::store::{ResourceStore, StoreError};
