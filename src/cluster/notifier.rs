//! Change notification: "status for project X is available".
//!
//! Publishing is fire-and-forget. `notify` never fails the caller; only
//! `ensure_ready` can, and the dispatcher checks it before starting new work.

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_common::ClusterKey;
use tokio::sync::{OnceCell, broadcast};

use super::ws::{WsMessage, broadcast_message};
use crate::errors::NotifierError;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Bring the publisher up if it is not already.
    async fn ensure_ready(&self) -> Result<(), NotifierError>;

    /// Best-effort publish. Delivery problems are logged, not returned.
    async fn notify(&self, key: &ClusterKey);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Publishes onto the channel feeding `/ws` subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn ensure_ready(&self) -> Result<(), NotifierError> {
        Ok(())
    }

    async fn notify(&self, key: &ClusterKey) {
        broadcast_message(&self.tx, &WsMessage::status_available(key));
        tracing::debug!(%key, "published status change");
    }
}

/// POSTs each event to a configured URL. The HTTP client is built on first
/// use.
pub struct WebhookNotifier {
    url: String,
    client: OnceCell<reqwest::Client>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&reqwest::Client, NotifierError> {
        self.client
            .get_or_try_init(|| async {
                let parsed = reqwest::Url::parse(&self.url).map_err(|e| {
                    NotifierError::InvalidEndpoint {
                        url: self.url.clone(),
                        message: e.to_string(),
                    }
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(NotifierError::InvalidEndpoint {
                        url: self.url.clone(),
                        message: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
                reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(10))
                    .build()
                    .map_err(|e| NotifierError::Init(e.to_string()))
            })
            .await
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn ensure_ready(&self) -> Result<(), NotifierError> {
        self.client().await.map(|_| ())
    }

    async fn notify(&self, key: &ClusterKey) {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(%key, error = %e, "webhook notifier not ready; event dropped");
                return;
            }
        };
        let result = client
            .post(&self.url)
            .json(&WsMessage::status_available(key))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = result {
            tracing::warn!(%key, error = %e, "webhook delivery failed");
        }
    }
}

/// Sends every event to each inner notifier. Ready only when all are.
#[derive(Default)]
pub struct FanoutNotifier {
    inner: Vec<SharedNotifier>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: SharedNotifier) -> Self {
        self.inner.push(notifier);
        self
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn ensure_ready(&self) -> Result<(), NotifierError> {
        for notifier in &self.inner {
            notifier.ensure_ready().await?;
        }
        Ok(())
    }

    async fn notify(&self, key: &ClusterKey) {
        for notifier in &self.inner {
            notifier.notify(key).await;
        }
    }
}
