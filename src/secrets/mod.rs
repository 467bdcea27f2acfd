pub mod keyring_store;
pub mod memory;
pub mod store;
pub mod types;
