pub mod db;
pub mod kube;
pub mod queue;
pub mod store;
pub mod updater;
