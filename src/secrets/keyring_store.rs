use keyring::Entry;
use log::debug;
use zeroize::Zeroizing;

use super::store::{CredentialStore, SecretStoreError, credential_id};
use crate::core::context::Context;

/// OS-backed credential storage using the `keyring` crate (Keychain/Credential Manager/Secret Service).
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, id: &str) -> Result<Entry, SecretStoreError> {
        Entry::new(&self.service, id).map_err(|err| map_error(id, err))
    }

    pub fn store(&self, namespace: &str, name: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        let id = credential_id(namespace, name);
        let value = std::str::from_utf8(value)
            .map_err(|_| SecretStoreError::Store(format!("credential {id} is not valid UTF-8")))?;
        self.entry(&id)?
            .set_password(value)
            .map_err(|err| map_error(&id, err))
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Result<(), SecretStoreError> {
        let id = credential_id(namespace, name);
        self.entry(&id)?
            .delete_password()
            .map_err(|err| map_error(&id, err))
    }
}

fn map_error(id: &str, err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound(id.to_string()),
        keyring::Error::NoStorageAccess(inner) | keyring::Error::PlatformFailure(inner) => {
            SecretStoreError::Unavailable(inner.to_string())
        }
        other => SecretStoreError::Store(other.to_string()),
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get_credential(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        ctx.check()?;
        let id = credential_id(namespace, name);
        debug!("[secrets] reading credential {id} from keyring service {}", self.service);
        let secret = Zeroizing::new(
            self.entry(&id)?
                .get_password()
                .map_err(|err| map_error(&id, err))?,
        );
        Ok(Zeroizing::new(secret.as_bytes().to_vec()))
    }
}
