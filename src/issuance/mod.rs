pub mod acme;
pub mod ca;
pub mod challenge_status;
pub mod client;
pub mod http;
pub mod issuer;
pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;
pub mod solver;
pub mod venafi;
