use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud::CloudKind;
use crate::status::ClusterStatus;

/// Identity of a cluster record. Never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub project_id: String,
    pub tenant_id: String,
}

impl ClusterKey {
    pub fn new(project_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.project_id)
    }
}

/// Fields a caller supplies when creating or updating a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCluster {
    pub name: String,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Provider-specific settings, passed to the adapter unexamined.
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// One tenant's cluster and its lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub project_id: String,
    pub tenant_id: String,
    pub cloud_kind: CloudKind,
    pub name: String,
    pub status: ClusterStatus,
    pub resource_group: Option<String>,
    pub location: Option<String>,
    pub properties: serde_json::Value,
    /// Friendly provider error recorded with a failed status.
    pub failure_reason: Option<String>,
    /// Bumped on every replace; used for compare-and-swap.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ClusterRecord {
    /// A fresh record in `New` status at version 1.
    pub fn new(key: ClusterKey, cloud_kind: CloudKind, spec: NewCluster) -> Self {
        let now = Utc::now();
        Self {
            project_id: key.project_id,
            tenant_id: key.tenant_id,
            cloud_kind,
            name: spec.name,
            status: ClusterStatus::New,
            resource_group: spec.resource_group,
            location: spec.location,
            properties: normalize_properties(spec.properties),
            failure_reason: None,
            version: 1,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.project_id.clone(), self.tenant_id.clone())
    }

    /// Copy of this record with `status` changed and the failure reason
    /// replaced. Identity, timestamps and version are left for the store.
    pub fn with_status(&self, status: ClusterStatus, failure_reason: Option<String>) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.failure_reason = failure_reason;
        next
    }

    /// Copy of this record with the user-editable fields replaced.
    pub fn with_spec(&self, spec: NewCluster) -> Self {
        let mut next = self.clone();
        next.name = spec.name;
        next.resource_group = spec.resource_group;
        next.location = spec.location;
        next.properties = normalize_properties(spec.properties);
        next
    }
}

fn normalize_properties(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    }
}
