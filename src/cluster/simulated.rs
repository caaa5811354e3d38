//! In-process provider adapter.
//!
//! Pretends to provision: it sleeps for the configured latency, remembers
//! which clusters exist, and reports synthetic node-pool details. Failures
//! can be injected per operation. Used in dev mode and throughout the tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{CloudKind, ClusterKey, ClusterRecord, ProviderCredentials};

use super::provider::{NodePoolStatus, ProviderAdapter, ProviderStatus};
use crate::errors::ProviderError;

/// Which adapter call a failure is injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    Authenticate,
    Create,
    Delete,
    Status,
}

#[derive(Default)]
struct CallCounts {
    authenticate: AtomicUsize,
    create: AtomicUsize,
    delete: AtomicUsize,
    status: AtomicUsize,
}

pub struct SimulatedProvider {
    kind: CloudKind,
    latency: Duration,
    clusters: Mutex<HashSet<ClusterKey>>,
    failures: Mutex<Vec<(SimulatedOp, ProviderError)>>,
    calls: CallCounts,
}

impl SimulatedProvider {
    pub fn new(kind: CloudKind) -> Self {
        Self {
            kind,
            latency: Duration::ZERO,
            clusters: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            calls: CallCounts::default(),
        }
    }

    /// Delay applied to create and delete.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every later `op` call fail with `error`.
    pub fn fail(&self, op: SimulatedOp, error: ProviderError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.retain(|(o, _)| *o != op);
            failures.push((op, error));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    pub fn calls(&self, op: SimulatedOp) -> usize {
        self.counter(op).load(Ordering::SeqCst)
    }

    pub fn is_provisioned(&self, key: &ClusterKey) -> bool {
        self.clusters
            .lock()
            .map(|c| c.contains(key))
            .unwrap_or(false)
    }

    fn counter(&self, op: SimulatedOp) -> &AtomicUsize {
        match op {
            SimulatedOp::Authenticate => &self.calls.authenticate,
            SimulatedOp::Create => &self.calls.create,
            SimulatedOp::Delete => &self.calls.delete,
            SimulatedOp::Status => &self.calls.status,
        }
    }

    fn enter(&self, op: SimulatedOp) -> Result<(), ProviderError> {
        self.counter(op).fetch_add(1, Ordering::SeqCst);
        let failures = self
            .failures
            .lock()
            .map_err(|_| ProviderError::Unreachable("simulator state poisoned".into()))?;
        match failures.iter().find(|(o, _)| *o == op) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn clusters(&self) -> Result<std::sync::MutexGuard<'_, HashSet<ClusterKey>>, ProviderError> {
        self.clusters
            .lock()
            .map_err(|_| ProviderError::Unreachable("simulator state poisoned".into()))
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    fn cloud_kind(&self) -> CloudKind {
        self.kind
    }

    async fn authenticate(&self, credentials: &ProviderCredentials) -> Result<(), ProviderError> {
        self.enter(SimulatedOp::Authenticate)?;
        credentials.validate().map_err(ProviderError::Authentication)
    }

    async fn create_cluster(
        &self,
        record: &ClusterRecord,
        _credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError> {
        self.enter(SimulatedOp::Create)?;
        tokio::time::sleep(self.latency).await;
        let mut clusters = self.clusters()?;
        if !clusters.insert(record.key()) {
            return Err(ProviderError::Api(format!(
                "AlreadyExists: cluster {} already provisioned",
                record.name
            )));
        }
        Ok(())
    }

    async fn delete_cluster(
        &self,
        record: &ClusterRecord,
        _credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError> {
        self.enter(SimulatedOp::Delete)?;
        tokio::time::sleep(self.latency).await;
        // Deleting a cluster that never came up (CreationFailed) is a no-op.
        self.clusters()?.remove(&record.key());
        Ok(())
    }

    async fn cluster_status(
        &self,
        record: &ClusterRecord,
        _credentials: &ProviderCredentials,
    ) -> Result<ProviderStatus, ProviderError> {
        self.enter(SimulatedOp::Status)?;
        if !self.clusters()?.contains(&record.key()) {
            return Err(ProviderError::Api(format!(
                "ResourceNotFound: cluster {} does not exist",
                record.name
            )));
        }
        let pools = record
            .properties
            .get("nodePools")
            .and_then(|p| p.as_array())
            .map(|p| p.len())
            .unwrap_or(0)
            .max(1);
        let node_pools = (0..pools)
            .map(|index| NodePoolStatus {
                index,
                vm_size: None,
                count: None,
                subnet_id: Some(format!("{}-{}-subnet-{}", self.kind, record.name, index)),
                disk_size_gb: Some(128),
            })
            .collect();
        Ok(ProviderStatus {
            state: Some("Running".to_string()),
            node_pools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::NewCluster;

    fn record() -> ClusterRecord {
        ClusterRecord::new(
            ClusterKey::new("p1", "t1"),
            CloudKind::Gke,
            NewCluster {
                name: "c1".into(),
                properties: serde_json::json!({"nodePools": [{}, {}]}),
                ..Default::default()
            },
        )
    }

    fn creds() -> ProviderCredentials {
        ProviderCredentials::new().with("service_account_json", "{}")
    }

    #[tokio::test]
    async fn test_create_then_status_reports_pools() {
        let provider = SimulatedProvider::new(CloudKind::Gke);
        let r = record();
        provider.create_cluster(&r, &creds()).await.unwrap();
        assert!(provider.is_provisioned(&r.key()));

        let status = provider.cluster_status(&r, &creds()).await.unwrap();
        assert_eq!(status.node_pools.len(), 2);
        assert_eq!(
            status.node_pools[1].subnet_id.as_deref(),
            Some("gke-c1-subnet-1")
        );
    }

    #[tokio::test]
    async fn test_status_of_unknown_cluster_fails() {
        let provider = SimulatedProvider::new(CloudKind::Gke);
        let err = provider.cluster_status(&record(), &creds()).await.unwrap_err();
        assert!(err.to_string().contains("ResourceNotFound"));
    }

    #[tokio::test]
    async fn test_injected_failure_and_call_counts() {
        let provider = SimulatedProvider::new(CloudKind::Gke);
        provider.fail(SimulatedOp::Create, ProviderError::Api("QuotaExceeded".into()));
        let err = provider.create_cluster(&record(), &creds()).await.unwrap_err();
        assert_eq!(err, ProviderError::Api("QuotaExceeded".into()));
        assert_eq!(provider.calls(SimulatedOp::Create), 1);
        assert_eq!(provider.calls(SimulatedOp::Delete), 0);

        provider.clear_failures();
        provider.create_cluster(&record(), &creds()).await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_rejects_empty_credentials() {
        let provider = SimulatedProvider::new(CloudKind::Gke);
        let err = provider
            .authenticate(&ProviderCredentials::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Authentication(_)));
        assert!(provider.authenticate(&creds()).await.is_ok());
    }
}
