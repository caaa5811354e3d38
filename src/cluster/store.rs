//! Cluster record store contract and the in-memory implementation.
//!
//! Every mutation rewrites the full document. `replace` is a single
//! compare-and-swap on `version`, so two writers racing on one record end
//! with exactly one winner and never a half-written document.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use nimbus_common::{ClusterKey, ClusterRecord};

use crate::errors::StoreError;

pub type SharedStore = Arc<dyn ClusterStore>;

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &ClusterKey) -> Result<ClusterRecord, StoreError>;

    /// Records of `tenant_id` whose project is in `project_ids`, ordered by
    /// project id. The id set comes from the caller's authorization.
    async fn get_all(
        &self,
        tenant_id: &str,
        project_ids: &HashSet<String>,
    ) -> Result<Vec<ClusterRecord>, StoreError>;

    /// Fails with `AlreadyExists` if a record holds the key.
    async fn insert(&self, record: &ClusterRecord) -> Result<(), StoreError>;

    async fn delete(&self, key: &ClusterKey) -> Result<(), StoreError>;

    /// Rewrite the whole record if the stored version equals
    /// `record.version`. The stored copy keeps its `created_at`, gets a fresh
    /// `modified_at` and `version + 1`; that copy is returned.
    async fn replace(&self, record: &ClusterRecord) -> Result<ClusterRecord, StoreError>;
}

/// Stamp the fields `replace` owns.
pub(crate) fn next_revision(stored: &ClusterRecord, incoming: &ClusterRecord) -> ClusterRecord {
    let mut next = incoming.clone();
    next.project_id = stored.project_id.clone();
    next.tenant_id = stored.tenant_id.clone();
    next.cloud_kind = stored.cloud_kind;
    next.created_at = stored.created_at;
    next.modified_at = Utc::now().max(stored.modified_at);
    next.version = stored.version + 1;
    next
}

/// Process-local store for dev mode and tests.
#[derive(Default, Clone)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<ClusterKey, ClusterRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ClusterKey, ClusterRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, key: &ClusterKey) -> Result<ClusterRecord, StoreError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn get_all(
        &self,
        tenant_id: &str,
        project_ids: &HashSet<String>,
    ) -> Result<Vec<ClusterRecord>, StoreError> {
        let mut records: Vec<ClusterRecord> = self
            .lock()?
            .values()
            .filter(|r| r.tenant_id == tenant_id && project_ids.contains(&r.project_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(records)
    }

    async fn insert(&self, record: &ClusterRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let key = record.key();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn delete(&self, key: &ClusterKey) -> Result<(), StoreError> {
        self.lock()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn replace(&self, record: &ClusterRecord) -> Result<ClusterRecord, StoreError> {
        let mut records = self.lock()?;
        let key = record.key();
        let stored = records.get(&key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if stored.version != record.version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: record.version,
                actual: stored.version,
            });
        }
        let next = next_revision(stored, record);
        records.insert(key, next.clone());
        Ok(next)
    }
}
