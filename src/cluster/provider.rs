//! Provider adapter contract and the per-cloud registry.
//!
//! The state machine, dispatcher and reconciler never branch on the cloud;
//! they look up the adapter for `record.cloud_kind` and call it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nimbus_common::{CloudKind, ClusterRecord, ProviderCredentials};
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// Live state of one node pool as the provider reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Position of the pool in the record's `properties.nodePools`.
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
}

/// Result of a provider status query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Provider-side state string, informational only.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub node_pools: Vec<NodePoolStatus>,
}

/// One cloud backend. Calls may take minutes and may fail transiently or
/// permanently; callers own any deadline.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn cloud_kind(&self) -> CloudKind;

    /// Check that `credentials` can talk to the provider at all.
    async fn authenticate(&self, credentials: &ProviderCredentials) -> Result<(), ProviderError>;

    async fn create_cluster(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError>;

    async fn delete_cluster(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError>;

    async fn cluster_status(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<ProviderStatus, ProviderError>;
}

/// Adapters keyed by cloud kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<CloudKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its own cloud kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.cloud_kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: CloudKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<CloudKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
