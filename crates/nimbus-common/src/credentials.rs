use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tenant-supplied provider keys (access key pairs, service principals, ...).
///
/// Passed by value into each operation and never persisted. The field names
/// are provider specific; only the adapter interprets them.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderCredentials {
    fields: BTreeMap<String, String>,
}

impl ProviderCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Reject an empty credential set or any blank value.
    pub fn validate(&self) -> Result<(), String> {
        if self.fields.is_empty() {
            return Err("credentials are required".to_string());
        }
        if let Some((key, _)) = self.fields.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(format!("credential '{}' is empty", key));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.fields.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}
