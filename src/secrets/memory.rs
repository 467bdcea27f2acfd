use std::{collections::HashMap, sync::RwLock};

use zeroize::Zeroizing;

use super::store::{CredentialStore, SecretStoreError, credential_id};
use crate::core::context::Context;

/// Process-local credential store, for tests and embedding callers that
/// already hold their credentials.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str, value: impl Into<Vec<u8>>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(credential_id(namespace, name), Zeroizing::new(value.into()));
    }

    /// Files a JSON object of string values, the layout `CredentialData` parses.
    pub fn insert_fields(&self, namespace: &str, name: &str, fields: &[(&str, &str)]) {
        let object: serde_json::Map<String, serde_json::Value> = fields
            .iter()
            .map(|(key, value)| (key.to_string(), serde_json::Value::from(*value)))
            .collect();
        self.insert(namespace, name, serde_json::Value::Object(object).to_string());
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(&credential_id(namespace, name));
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_credential(
        &self,
        ctx: &Context,
        namespace: &str,
        name: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SecretStoreError> {
        ctx.check()?;
        let id = credential_id(namespace, name);
        let entries = self
            .entries
            .read()
            .map_err(|err| SecretStoreError::Unavailable(format!("credential map poisoned: {err}")))?;
        entries
            .get(&id)
            .cloned()
            .ok_or(SecretStoreError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_inserted_credentials_by_namespace() {
        let store = MemoryCredentialStore::new();
        store.insert("team-a", "cloud", "key-a");
        let ctx = Context::background();

        assert_eq!(
            store.get_credential(&ctx, "team-a", "cloud").unwrap().as_slice(),
            b"key-a"
        );
        assert!(matches!(
            store.get_credential(&ctx, "team-b", "cloud"),
            Err(SecretStoreError::NotFound(id)) if id == "team-b/cloud"
        ));

        store.remove("team-a", "cloud");
        assert!(store.get_credential(&ctx, "team-a", "cloud").is_err());
    }
}
