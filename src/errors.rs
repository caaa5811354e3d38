//! Typed error hierarchy for the Nimbus orchestrator.
//!
//! - `ClusterError`: lifecycle operations, returned to API callers
//! - `StoreError`: record store primitives
//! - `ProviderError`: provider adapter calls
//! - `NotifierError`: change-notifier initialization
//! - `AuthError`: bearer-token resolution

use std::sync::LazyLock;

use nimbus_common::{CloudKind, ClusterStatus};
use regex::Regex;
use thiserror::Error;

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Cluster for project {project_id} not found")]
    NotFound { project_id: String },

    #[error("Cluster for project {project_id} already exists")]
    AlreadyExists { project_id: String },

    #[error("Cannot {operation} cluster in status {status}: {reason}")]
    StateConflict {
        operation: &'static str,
        status: ClusterStatus,
        reason: String,
    },

    #[error("Cluster for project {project_id} was modified concurrently (expected version {expected})")]
    VersionConflict { project_id: String, expected: u64 },

    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("No provider adapter registered for cloud kind {0}")]
    UnsupportedCloud(CloudKind),

    #[error("Change notifier unavailable: {0}")]
    NotifierUnavailable(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn state_conflict(
        operation: &'static str,
        status: ClusterStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::StateConflict {
            operation,
            status,
            reason: reason.into(),
        }
    }
}

/// Errors from the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record {key} not found")]
    NotFound { key: String },

    #[error("Record {key} already exists")]
    AlreadyExists { key: String },

    #[error("Record {key} is at version {actual}, expected {expected}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Lift into the API-facing taxonomy. `project_id` names the record in
    /// messages, since the tenant is implied by the caller.
    pub fn into_cluster_error(self, project_id: &str) -> ClusterError {
        match self {
            StoreError::NotFound { .. } => ClusterError::NotFound {
                project_id: project_id.to_string(),
            },
            StoreError::AlreadyExists { .. } => ClusterError::AlreadyExists {
                project_id: project_id.to_string(),
            },
            StoreError::VersionConflict { expected, .. } => ClusterError::VersionConflict {
                project_id: project_id.to_string(),
                expected,
            },
            StoreError::Backend(e) => ClusterError::Store(e),
        }
    }
}

/// Errors from a provider adapter call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Api(String),

    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider call timed out after {0}s")]
    Timeout(u64),
}

impl ProviderError {
    /// Human-readable description, pattern matched against known provider
    /// messages. Unknown messages pass through verbatim.
    pub fn friendly(&self) -> String {
        friendly_provider_message(&self.to_string())
    }

    pub fn into_cluster_error(self) -> ClusterError {
        let message = self.friendly();
        match self {
            ProviderError::Authentication(_) => ClusterError::ProviderAuth(message),
            _ => ClusterError::Provider(message),
        }
    }
}

/// Errors raised while bringing up a notification publisher.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Invalid notifier endpoint {url}: {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("Failed to initialize notifier: {0}")]
    Init(String),
}

/// Errors from resolving a bearer token to a principal.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Policy service unavailable: {0}")]
    Unavailable(String),
}

/// Known provider error fragments and the description shown instead.
static FRIENDLY_MESSAGES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)InvalidClientTokenId|SignatureDoesNotMatch|UnrecognizedClientException",
            "The access key or secret supplied for this cloud account is invalid",
        ),
        (
            r"(?i)AADSTS7000215|invalid client secret|AuthenticationFailed",
            "The client secret for the service principal is invalid or expired",
        ),
        (
            r"(?i)AuthorizationFailed|AccessDenied|PERMISSION_DENIED|does not have authorization",
            "The supplied credentials lack permission for this operation",
        ),
        (
            r"(?i)ResourceGroupNotFound",
            "The resource group does not exist in this subscription",
        ),
        (
            r"(?i)InvalidSubnet|SubnetNotFound|InvalidSubnetID",
            "The requested subnet does not exist or is not usable",
        ),
        (
            r"(?i)ResourceNotFound|NOT_FOUND|NoSuchEntity",
            "The cluster no longer exists on the provider side",
        ),
        (
            r"(?i)AlreadyExists|ResourceInUseException|ALREADY_EXISTS",
            "A cluster with this name already exists on the provider side",
        ),
        (
            r"(?i)InvalidParameterValue|InvalidParameter|INVALID_ARGUMENT",
            "The provider rejected one of the cluster parameters",
        ),
    ]
    .into_iter()
    .map(|(pattern, friendly)| (Regex::new(pattern).unwrap(), friendly))
    .collect()
});

static QUOTA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)QuotaExceeded|LimitExceeded|RESOURCE_EXHAUSTED|OperationNotAllowed.*quota")
        .unwrap()
});

/// Map a raw provider message to a friendlier description.
///
/// Quota and billing codes pass through behind a `quota:` prefix so callers
/// can still see the provider's own wording.
pub fn friendly_provider_message(raw: &str) -> String {
    if QUOTA_PATTERN.is_match(raw) {
        return format!("quota: {}", raw.trim());
    }
    FRIENDLY_MESSAGES
        .iter()
        .find(|(re, _)| re.is_match(raw))
        .map(|(_, friendly)| (*friendly).to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}
