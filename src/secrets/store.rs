use thiserror::Error;
use zeroize::Zeroizing;

use crate::core::{
    context::{Cancelled, Context},
    errors::{Classify, ErrorClass},
};

/// Errors produced by credential storage backends.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store error: {0}")]
    Store(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Classify for SecretStoreError {
    fn class(&self) -> ErrorClass {
        match self {
            SecretStoreError::NotFound(_) => ErrorClass::Configuration,
            SecretStoreError::Unavailable(_) => ErrorClass::Transport,
            SecretStoreError::Store(_) => ErrorClass::Configuration,
            SecretStoreError::Cancelled(_) => ErrorClass::Cancelled,
        }
    }
}

/// Read access to the credential material issuer backends are built from.
pub trait CredentialStore: Send + Sync {
    fn get_credential(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecretStoreError>;
}

/// Identifier a credential is filed under: `namespace/name`.
pub fn credential_id(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
