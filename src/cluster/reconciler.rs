//! On-demand status path: stored record plus live provider state.
//!
//! The merged view is returned to the caller and never written back. If the
//! provider cannot be reached or rejects the credentials, the stored record
//! is returned as-is and the snapshot is flagged as degraded.

use std::time::Duration;

use nimbus_common::{ClusterKey, ClusterRecord, ProviderCredentials};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Instrument;

use super::provider::{NodePoolStatus, ProviderRegistry};
use super::store::SharedStore;
use crate::context::RequestContext;
use crate::errors::{ClusterError, ProviderError};

const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a pool index reported by a provider. Larger indexes are
/// dropped instead of padding the stored array out to them.
pub const MAX_NODE_POOLS: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub record: ClusterRecord,
    /// True when live provider state could not be merged in.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: SharedStore,
    providers: ProviderRegistry,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(store: SharedStore, providers: ProviderRegistry) -> Self {
        Self {
            store,
            providers,
            timeout: DEFAULT_STATUS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn fetch_status(
        &self,
        ctx: &RequestContext,
        key: &ClusterKey,
        credentials: &ProviderCredentials,
    ) -> Result<StatusSnapshot, ClusterError> {
        let span = ctx.operation_span("status", &key.project_id);
        async {
            let record = self
                .store
                .get(key)
                .await
                .map_err(|e| e.into_cluster_error(&key.project_id))?;

            match self.query_provider(&record, credentials).await {
                Ok(pools) => {
                    let mut merged = record;
                    merge_node_pools(&mut merged.properties, &pools);
                    Ok(StatusSnapshot {
                        record: merged,
                        degraded: false,
                        reason: None,
                    })
                }
                Err(reason) => {
                    tracing::warn!(%reason, "live status unavailable; returning stored record");
                    Ok(StatusSnapshot {
                        record,
                        degraded: true,
                        reason: Some(reason),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn query_provider(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<Vec<NodePoolStatus>, String> {
        let adapter = self
            .providers
            .get(record.cloud_kind)
            .ok_or_else(|| ClusterError::UnsupportedCloud(record.cloud_kind).to_string())?;

        let call = async {
            adapter.authenticate(credentials).await?;
            adapter.cluster_status(record, credentials).await
        };
        let status = tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.timeout.as_secs())))
            .map_err(|e| e.friendly())?;

        if let Some(state) = &status.state {
            tracing::debug!(
                provider_state = %state,
                pools = status.node_pools.len(),
                "live status fetched"
            );
        }
        Ok(status.node_pools)
    }
}

/// Merge live pool fields into `properties.nodePools[index]`.
///
/// Only fields the provider reported overwrite stored ones. Pools beyond the
/// stored array are appended; indexes at or above [`MAX_NODE_POOLS`] are
/// skipped. A `properties` value that is not an object is left untouched.
pub fn merge_node_pools(properties: &mut Value, pools: &[NodePoolStatus]) {
    let Some(obj) = properties.as_object_mut() else {
        return;
    };
    let entry = obj
        .entry("nodePools")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    let Some(stored) = entry.as_array_mut() else {
        return;
    };

    for pool in pools {
        if pool.index >= MAX_NODE_POOLS {
            tracing::warn!(index = pool.index, "node pool index out of range; skipped");
            continue;
        }
        while stored.len() <= pool.index {
            stored.push(Value::Object(Map::new()));
        }
        let slot = &mut stored[pool.index];
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Some(fields) = slot.as_object_mut() else {
            continue;
        };
        if let Some(vm_size) = &pool.vm_size {
            fields.insert("vmSize".into(), Value::from(vm_size.as_str()));
        }
        if let Some(count) = pool.count {
            fields.insert("count".into(), Value::from(count));
        }
        if let Some(subnet_id) = &pool.subnet_id {
            fields.insert("subnetId".into(), Value::from(subnet_id.as_str()));
        }
        if let Some(disk) = pool.disk_size_gb {
            fields.insert("diskSizeGb".into(), Value::from(disk));
        }
    }
}
