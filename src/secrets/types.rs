use std::{collections::BTreeMap, fmt};

use zeroize::Zeroizing;

/// Decoded credential payload.
///
/// Credentials are stored either as a JSON object of string values (for
/// example `{"username": "...", "password": "..."}`) or as a single raw value.
pub struct CredentialData {
    fields: BTreeMap<String, Zeroizing<String>>,
    raw: Zeroizing<Vec<u8>>,
}

impl CredentialData {
    pub fn parse(bytes: &[u8]) -> Self {
        let fields = serde_json::from_slice::<BTreeMap<String, String>>(bytes)
            .map(|map| {
                map.into_iter()
                    .map(|(key, value)| (key, Zeroizing::new(value)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            fields,
            raw: Zeroizing::new(bytes.to_vec()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Named field, or the whole payload when it is not a JSON object.
    pub fn field_or_raw(&self, key: &str) -> Option<Zeroizing<String>> {
        if let Some(value) = self.get(key) {
            return Some(Zeroizing::new(value.to_string()));
        }
        if self.has_fields() {
            return None;
        }
        std::str::from_utf8(&self.raw)
            .ok()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Zeroizing::new(value.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialData")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
