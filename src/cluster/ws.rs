use axum::{
    Extension,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use nimbus_common::ClusterKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use super::auth::Principal;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before the connection counts as dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

/// Change events published to subscribers. Consumers re-read the record
/// through the status endpoint; the event carries no cluster data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    ClusterStatusAvailable {
        project_id: String,
        tenant_id: String,
        at: DateTime<Utc>,
    },
}

impl WsMessage {
    pub fn status_available(key: &ClusterKey) -> Self {
        WsMessage::ClusterStatusAvailable {
            project_id: key.project_id.clone(),
            tenant_id: key.tenant_id.clone(),
            at: Utc::now(),
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            WsMessage::ClusterStatusAvailable { project_id, .. } => project_id,
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            WsMessage::ClusterStatusAvailable { tenant_id, .. } => tenant_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub project_id: Option<String>,
}

/// Events one connection may see: its principal's tenant and projects,
/// optionally narrowed to a single project.
#[derive(Debug, Clone)]
struct Subscription {
    tenant_id: String,
    projects: HashSet<String>,
    project_filter: Option<String>,
}

impl Subscription {
    fn new(principal: Principal, project_filter: Option<String>) -> Self {
        Self {
            tenant_id: principal.tenant_id,
            projects: principal.projects,
            project_filter,
        }
    }

    fn accepts(&self, raw: &str) -> bool {
        let Ok(msg) = serde_json::from_str::<WsMessage>(raw) else {
            return false;
        };
        msg.tenant_id() == self.tenant_id
            && self.projects.contains(msg.project_id())
            && self
                .project_filter
                .as_deref()
                .is_none_or(|wanted| wanted == msg.project_id())
    }
}

// ── Handler ──────────────────────────────────────────────────────────

/// Mounted behind the auth middleware. A `project_id` filter outside the
/// principal's projects is rejected before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ApiError> {
    if let Some(project_id) = &query.project_id {
        principal.require(project_id)?;
    }
    let subscription = Subscription::new(principal, query.project_id);
    let rx = state.ws_tx.subscribe();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, rx, subscription)))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<String>,
    subscription: Subscription,
) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, subscription).await;
}

/// Forward broadcast events the subscription accepts until the client goes
/// away or stops answering pings.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("websocket client stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !subscription.accepts(&msg) {
                            continue;
                        }
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "websocket subscriber lagged; events dropped");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a message to every connected subscriber.
/// Having no subscribers is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize websocket message");
        }
    }
}
