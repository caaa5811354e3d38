//! Deployment dispatcher: runs provider create/delete outside the request.
//!
//! A request flips the record into its in-transition status, hands the
//! provider call to a background task and returns. The task writes the
//! terminal status and fires the notifier exactly once.
//!
//! Tasks are tracked per cluster key so `shutdown` can abort them and mark
//! the records failed. Once the provider call returns, a task claims its
//! completion; `shutdown` waits for claimed tasks instead of aborting them,
//! so each task writes and notifies exactly once. Completion writes are
//! version-checked; a completion whose record has moved on (force delete)
//! is dropped with a warning instead of writing an illegal transition.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nimbus_common::{ClusterKey, ClusterRecord, ClusterStatus, ProviderCredentials};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::lifecycle::{self, transition};
use super::notifier::SharedNotifier;
use super::provider::{ProviderAdapter, ProviderRegistry};
use super::store::SharedStore;
use crate::config::DispatcherSection;
use crate::context::RequestContext;
use crate::errors::{ClusterError, ProviderError, StoreError};

pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

/// Background operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Deploy,
    Terminate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Deploy => "start",
            Operation::Terminate => "terminate",
        }
    }

    fn in_transition(self) -> ClusterStatus {
        match self {
            Operation::Deploy => ClusterStatus::Deploying,
            Operation::Terminate => ClusterStatus::Terminating,
        }
    }

    fn succeeded(self) -> ClusterStatus {
        match self {
            Operation::Deploy => ClusterStatus::Created,
            Operation::Terminate => ClusterStatus::Terminated,
        }
    }

    fn failed(self) -> ClusterStatus {
        match self {
            Operation::Deploy => ClusterStatus::CreationFailed,
            Operation::Terminate => ClusterStatus::TerminationFailed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub provision_timeout: Duration,
    pub termination_timeout: Duration,
    pub completion_write_retries: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&DispatcherSection::default())
    }
}

impl From<&DispatcherSection> for DispatcherSettings {
    fn from(section: &DispatcherSection) -> Self {
        Self {
            provision_timeout: section.provision_timeout(),
            termination_timeout: section.termination_timeout(),
            completion_write_retries: section.completion_write_retries,
        }
    }
}

struct InFlight {
    task_id: Uuid,
    operation: Operation,
    handle: JoinHandle<()>,
    /// Set once the provider call returned and the task owns the completion.
    completing: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: SharedStore,
    providers: ProviderRegistry,
    notifier: SharedNotifier,
    settings: DispatcherSettings,
    in_flight: Arc<tokio::sync::Mutex<HashMap<ClusterKey, InFlight>>>,
}

impl Dispatcher {
    pub fn new(
        store: SharedStore,
        providers: ProviderRegistry,
        notifier: SharedNotifier,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            providers,
            notifier,
            settings,
            in_flight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Number of background tasks still running.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Flip `record` to `Deploying` and provision it in the background.
    ///
    /// Credentials are checked against the provider before the task is
    /// spawned. If they are rejected the record goes straight to
    /// `CreationFailed` and the caller gets the authentication error.
    pub async fn start_deployment(
        &self,
        ctx: &RequestContext,
        record: ClusterRecord,
        credentials: ProviderCredentials,
    ) -> Result<ClusterRecord, ClusterError> {
        let span = ctx.operation_span("start", &record.project_id);
        self.begin_deployment(record, credentials, span.clone())
            .instrument(span)
            .await
    }

    async fn begin_deployment(
        &self,
        record: ClusterRecord,
        credentials: ProviderCredentials,
        span: Span,
    ) -> Result<ClusterRecord, ClusterError> {
        lifecycle::check_start(record.status)?;
        self.notifier
            .ensure_ready()
            .await
            .map_err(|e| ClusterError::NotifierUnavailable(e.to_string()))?;
        let adapter = self.adapter_for(&record)?;
        let deploying = self.flip(&record, Operation::Deploy).await?;

        let deadline = self.settings.provision_timeout;
        if let Err(e) = with_deadline(deadline, adapter.authenticate(&credentials)).await {
            tracing::warn!(error = %e, "provider rejected credentials; deployment not started");
            self.finish(&deploying.key(), Operation::Deploy, Err(e.friendly()))
                .await;
            self.notifier.notify(&deploying.key()).await;
            return Err(e.into_cluster_error());
        }

        self.spawn(Operation::Deploy, adapter, deploying.clone(), credentials, span)
            .await;
        tracing::info!(version = deploying.version, "deployment dispatched");
        Ok(deploying)
    }

    /// Flip `record` to `Terminating` and delete it on the provider in the
    /// background.
    pub async fn start_termination(
        &self,
        ctx: &RequestContext,
        record: ClusterRecord,
        credentials: ProviderCredentials,
    ) -> Result<ClusterRecord, ClusterError> {
        let span = ctx.operation_span("terminate", &record.project_id);
        self.begin_termination(record, credentials, span.clone())
            .instrument(span)
            .await
    }

    async fn begin_termination(
        &self,
        record: ClusterRecord,
        credentials: ProviderCredentials,
        span: Span,
    ) -> Result<ClusterRecord, ClusterError> {
        lifecycle::check_terminate(record.status)?;
        let adapter = self.adapter_for(&record)?;
        let terminating = self.flip(&record, Operation::Terminate).await?;
        self.spawn(
            Operation::Terminate,
            adapter,
            terminating.clone(),
            credentials,
            span,
        )
        .await;
        tracing::info!(version = terminating.version, "termination dispatched");
        Ok(terminating)
    }

    /// Abort every task still waiting on its provider and mark its record
    /// failed. Tasks already writing their completion are awaited.
    pub async fn shutdown(&self) {
        let ctx = RequestContext::system("shutdown");
        let drained: Vec<(ClusterKey, InFlight)> = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.drain().collect()
        };
        for (key, task) in drained {
            let span = ctx.operation_span(task.operation.as_str(), &key.project_id);
            self.stop_task(key, task).instrument(span).await;
        }
    }

    async fn stop_task(&self, key: ClusterKey, task: InFlight) {
        if task.completing {
            tracing::info!(%key, "waiting for task to write its completion");
            if let Err(e) = task.handle.await {
                tracing::error!(%key, error = %e, "task ended abnormally during shutdown");
            }
            return;
        }
        tracing::warn!(%key, operation = task.operation.as_str(), "aborting in-flight task");
        task.handle.abort();
        if self
            .finish(&key, task.operation, Err(SHUTDOWN_REASON.to_string()))
            .await
            .is_some()
        {
            self.notifier.notify(&key).await;
        }
    }

    fn adapter_for(
        &self,
        record: &ClusterRecord,
    ) -> Result<Arc<dyn ProviderAdapter>, ClusterError> {
        self.providers
            .get(record.cloud_kind)
            .ok_or(ClusterError::UnsupportedCloud(record.cloud_kind))
    }

    async fn flip(
        &self,
        record: &ClusterRecord,
        op: Operation,
    ) -> Result<ClusterRecord, ClusterError> {
        let next = transition(record, op.in_transition(), None)?;
        self.store
            .replace(&next)
            .await
            .map_err(|e| e.into_cluster_error(&record.project_id))
    }

    fn deadline(&self, op: Operation) -> Duration {
        match op {
            Operation::Deploy => self.settings.provision_timeout,
            Operation::Terminate => self.settings.termination_timeout,
        }
    }

    async fn spawn(
        &self,
        op: Operation,
        adapter: Arc<dyn ProviderAdapter>,
        record: ClusterRecord,
        credentials: ProviderCredentials,
        span: Span,
    ) {
        let key = record.key();
        let task_id = Uuid::new_v4();
        let deadline = self.deadline(op);
        let this = self.clone();

        // Held across spawn so the task cannot release its entry before it
        // has been registered.
        let mut in_flight = self.in_flight.lock().await;
        let handle = tokio::spawn(
            async move {
                let call = async {
                    match op {
                        Operation::Deploy => adapter.create_cluster(&record, &credentials).await,
                        Operation::Terminate => adapter.delete_cluster(&record, &credentials).await,
                    }
                };
                let outcome = with_deadline(deadline, call).await;
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, operation = op.as_str(), "provider call failed");
                }
                let key = record.key();
                if !this.claim_completion(&key, task_id).await {
                    tracing::debug!("task no longer tracked; completion left to shutdown");
                    return;
                }
                this.finish(&key, op, outcome.map_err(|e| e.friendly())).await;
                this.notifier.notify(&key).await;
                this.release(&key, task_id).await;
            }
            .instrument(span),
        );
        in_flight.insert(
            key,
            InFlight {
                task_id,
                operation: op,
                handle,
                completing: false,
            },
        );
    }

    /// Mark the task as owning its completion. False when shutdown already
    /// drained the entry and will write the completion itself.
    async fn claim_completion(&self, key: &ClusterKey, task_id: Uuid) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        match in_flight.get_mut(key) {
            Some(task) if task.task_id == task_id => {
                task.completing = true;
                true
            }
            _ => false,
        }
    }

    async fn release(&self, key: &ClusterKey, task_id: Uuid) {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.get(key).is_some_and(|t| t.task_id == task_id) {
            in_flight.remove(key);
        }
    }

    /// Write the terminal status for `op`. Returns the stored record, or
    /// `None` when the write was skipped or failed.
    async fn finish(
        &self,
        key: &ClusterKey,
        op: Operation,
        outcome: Result<(), String>,
    ) -> Option<ClusterRecord> {
        let (target, reason) = match outcome {
            Ok(()) => (op.succeeded(), None),
            Err(reason) => (op.failed(), Some(reason)),
        };

        for attempt in 0..=self.settings.completion_write_retries {
            let current = match self.store.get(key).await {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => {
                    tracing::warn!(%target, "record removed during the task; status not written");
                    return None;
                }
                Err(e) => {
                    tracing::error!(error = %e, %target, "failed to load record for completion");
                    return None;
                }
            };
            if current.status != op.in_transition() {
                tracing::warn!(
                    current = %current.status,
                    %target,
                    "record left {} while the task ran; completion skipped",
                    op.in_transition()
                );
                return None;
            }
            let next = match transition(&current, target, reason.clone()) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(error = %e, "completion transition rejected");
                    return None;
                }
            };
            match self.store.replace(&next).await {
                Ok(stored) => {
                    tracing::info!(
                        status = %stored.status,
                        version = stored.version,
                        "completion written"
                    );
                    return Some(stored);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(attempt, "completion write lost a version race; retrying");
                }
                Err(e) => {
                    tracing::error!(error = %e, %target, "failed to write completion status");
                    return None;
                }
            }
        }

        tracing::error!(%target, "completion write retries exhausted");
        None
    }
}

async fn with_deadline<F>(deadline: Duration, call: F) -> Result<(), ProviderError>
where
    F: Future<Output = Result<(), ProviderError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(ProviderError::Timeout(deadline.as_secs())))
}
