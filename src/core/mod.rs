pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod types;
