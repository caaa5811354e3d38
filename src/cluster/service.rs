//! Lifecycle operations as the request surface sees them.
//!
//! `ClusterService` validates input, loads the record for the caller's
//! tenant, consults the state machine and then either writes the store
//! directly (create, update, delete) or hands off to the dispatcher and
//! reconciler (start, terminate, status).

use std::collections::HashSet;
use std::sync::LazyLock;

use nimbus_common::{CloudKind, ClusterKey, ClusterRecord, NewCluster, ProviderCredentials};
use regex::Regex;
use serde::Deserialize;
use tracing::Instrument;

use super::dispatcher::Dispatcher;
use super::lifecycle;
use super::reconciler::{Reconciler, StatusSnapshot};
use super::store::SharedStore;
use crate::context::RequestContext;
use crate::errors::ClusterError;

static PROJECT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

static CLUSTER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct CreateClusterRequest {
    pub project_id: String,
    pub cloud_kind: CloudKind,
    #[serde(flatten)]
    pub spec: NewCluster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateClusterRequest {
    /// When set, the update only applies if the stored version matches.
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub spec: NewCluster,
}

pub fn validate_project_id(project_id: &str) -> Result<(), ClusterError> {
    if PROJECT_ID.is_match(project_id) {
        Ok(())
    } else {
        Err(ClusterError::Validation(format!(
            "project id '{}' must be 1-128 characters of letters, digits, '.', '_' or '-'",
            project_id
        )))
    }
}

fn validate_spec(spec: &NewCluster) -> Result<(), ClusterError> {
    if spec.name.trim().is_empty() {
        return Err(ClusterError::Validation("cluster name is required".into()));
    }
    if !CLUSTER_NAME.is_match(&spec.name) {
        return Err(ClusterError::Validation(format!(
            "cluster name '{}' must be 1-63 characters of letters, digits, '_' or '-'",
            spec.name
        )));
    }
    if !spec.properties.is_null() && !spec.properties.is_object() {
        return Err(ClusterError::Validation(
            "properties must be a JSON object".into(),
        ));
    }
    Ok(())
}

fn validate_credentials(credentials: &ProviderCredentials) -> Result<(), ClusterError> {
    credentials.validate().map_err(ClusterError::Validation)
}

#[derive(Clone)]
pub struct ClusterService {
    store: SharedStore,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
}

impl ClusterService {
    pub fn new(store: SharedStore, dispatcher: Dispatcher, reconciler: Reconciler) -> Self {
        Self {
            store,
            dispatcher,
            reconciler,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn key(ctx: &RequestContext, project_id: &str) -> ClusterKey {
        ClusterKey::new(project_id, ctx.tenant_id.clone())
    }

    async fn load(
        &self,
        ctx: &RequestContext,
        project_id: &str,
    ) -> Result<ClusterRecord, ClusterError> {
        self.store
            .get(&Self::key(ctx, project_id))
            .await
            .map_err(|e| e.into_cluster_error(project_id))
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        request: CreateClusterRequest,
    ) -> Result<ClusterRecord, ClusterError> {
        let span = ctx.operation_span("create", &request.project_id);
        async {
            validate_project_id(&request.project_id)?;
            validate_spec(&request.spec)?;
            if !self.dispatcher.providers().kinds().contains(&request.cloud_kind) {
                return Err(ClusterError::UnsupportedCloud(request.cloud_kind));
            }
            let record = ClusterRecord::new(
                Self::key(ctx, &request.project_id),
                request.cloud_kind,
                request.spec,
            );
            self.store
                .insert(&record)
                .await
                .map_err(|e| e.into_cluster_error(&record.project_id))?;
            tracing::info!(cloud_kind = %record.cloud_kind, "cluster record created");
            Ok(record)
        }
        .instrument(span)
        .await
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        project_id: &str,
    ) -> Result<ClusterRecord, ClusterError> {
        self.load(ctx, project_id).await
    }

    /// Records of the caller's tenant restricted to `projects`.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        projects: &HashSet<String>,
    ) -> Result<Vec<ClusterRecord>, ClusterError> {
        self.store
            .get_all(&ctx.tenant_id, projects)
            .await
            .map_err(|e| ClusterError::Store(e.into()))
    }

    pub async fn update(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        request: UpdateClusterRequest,
    ) -> Result<ClusterRecord, ClusterError> {
        let span = ctx.operation_span("update", project_id);
        async {
            validate_spec(&request.spec)?;
            let current = self.load(ctx, project_id).await?;
            lifecycle::check_update(current.status)?;
            if let Some(expected) = request.version
                && expected != current.version
            {
                return Err(ClusterError::VersionConflict {
                    project_id: project_id.to_string(),
                    expected,
                });
            }
            let updated = self
                .store
                .replace(&current.with_spec(request.spec))
                .await
                .map_err(|e| e.into_cluster_error(project_id))?;
            tracing::info!(version = updated.version, "cluster record updated");
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        force: bool,
    ) -> Result<(), ClusterError> {
        let span = ctx.operation_span("delete", project_id);
        async {
            let current = self.load(ctx, project_id).await?;
            lifecycle::check_delete(current.status, force)?;
            if force && current.status.is_in_transition() {
                tracing::warn!(status = %current.status, "force delete with work in flight");
            }
            self.store
                .delete(&current.key())
                .await
                .map_err(|e| e.into_cluster_error(project_id))?;
            tracing::info!(force, "cluster record deleted");
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn start(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        credentials: ProviderCredentials,
    ) -> Result<ClusterRecord, ClusterError> {
        validate_credentials(&credentials)?;
        let record = self.load(ctx, project_id).await?;
        self.dispatcher
            .start_deployment(ctx, record, credentials)
            .await
    }

    pub async fn terminate(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        credentials: ProviderCredentials,
    ) -> Result<ClusterRecord, ClusterError> {
        validate_credentials(&credentials)?;
        let record = self.load(ctx, project_id).await?;
        self.dispatcher
            .start_termination(ctx, record, credentials)
            .await
    }

    pub async fn status(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        credentials: &ProviderCredentials,
    ) -> Result<StatusSnapshot, ClusterError> {
        self.reconciler
            .fetch_status(ctx, &Self::key(ctx, project_id), credentials)
            .await
    }
}
