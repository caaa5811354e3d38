use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use nimbus_common::{ClusterRecord, ClusterStatus, ProviderCredentials};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::auth::{Principal, SharedAuthorizer, auth_middleware};
use super::service::{ClusterService, CreateClusterRequest, UpdateClusterRequest};
use super::ws::ws_handler;
use crate::context::RequestContext;
use crate::errors::{AuthError, ClusterError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: ClusterService,
    pub authorizer: SharedAuthorizer,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub credentials: ProviderCredentials,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub status: ClusterStatus,
    pub record: ClusterRecord,
}

impl From<ClusterRecord> for OperationResponse {
    fn from(record: ClusterRecord) -> Self {
        Self {
            status: record.status,
            record,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        let message = err.to_string();
        match err {
            ClusterError::Validation(_) | ClusterError::UnsupportedCloud(_) => {
                ApiError::BadRequest(message)
            }
            ClusterError::Forbidden(_) => ApiError::Forbidden(message),
            ClusterError::NotFound { .. } => ApiError::NotFound(message),
            ClusterError::AlreadyExists { .. }
            | ClusterError::StateConflict { .. }
            | ClusterError::VersionConflict { .. } => ApiError::Conflict(message),
            ClusterError::ProviderAuth(_) | ClusterError::Provider(_) => {
                ApiError::BadGateway(message)
            }
            ClusterError::NotifierUnavailable(_) => ApiError::Unavailable(message),
            ClusterError::Store(_) | ClusterError::Other(_) => ApiError::Internal(message),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken => {
                ApiError::Unauthorized(err.to_string())
            }
            AuthError::Unavailable(_) => ApiError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error while handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: &SharedState) -> Router<SharedState> {
    let clusters = Router::new()
        .route("/api/clusters", get(list_clusters).post(create_cluster))
        .route(
            "/api/clusters/{project_id}",
            get(get_cluster).put(update_cluster).delete(delete_cluster),
        )
        .route("/api/clusters/{project_id}/start", post(start_cluster))
        .route("/api/clusters/{project_id}/terminate", post(terminate_cluster))
        .route("/api/clusters/{project_id}/status", post(cluster_status))
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(clusters)
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_clusters(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<Vec<ClusterRecord>>, ApiError> {
    let records = state.service.list(&ctx, &principal.projects).await?;
    Ok(Json(records))
}

async fn create_cluster(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateClusterRequest>,
) -> Result<(StatusCode, Json<ClusterRecord>), ApiError> {
    principal.require(&req.project_id)?;
    let record = state.service.create(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_cluster(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Path(project_id): Path<String>,
) -> Result<Json<ClusterRecord>, ApiError> {
    principal.require(&project_id)?;
    let record = state.service.get(&ctx, &project_id).await?;
    Ok(Json(record))
}

async fn update_cluster(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Path(project_id): Path<String>,
    Json(req): Json<UpdateClusterRequest>,
) -> Result<Json<ClusterRecord>, ApiError> {
    principal.require(&project_id)?;
    let record = state.service.update(&ctx, &project_id, req).await?;
    Ok(Json(record))
}

async fn delete_cluster(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Path(project_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    principal.require(&project_id)?;
    state.service.delete(&ctx, &project_id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_cluster(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Path(project_id): Path<String>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    principal.require(&project_id)?;
    let record = state
        .service
        .start(&ctx, &project_id, req.credentials)
        .await?;
    Ok(Json(record.into()))
}

async fn terminate_cluster(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Path(project_id): Path<String>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    principal.require(&project_id)?;
    let record = state
        .service
        .terminate(&ctx, &project_id, req.credentials)
        .await?;
    Ok(Json(record.into()))
}

/// Live status. Answers 206 when the provider could not be queried and the
/// stored record is returned instead.
async fn cluster_status(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(ctx): Extension<RequestContext>,
    Path(project_id): Path<String>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Response, ApiError> {
    principal.require(&project_id)?;
    let snapshot = state
        .service
        .status(&ctx, &project_id, &req.credentials)
        .await?;
    let code = if snapshot.degraded {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Ok((code, Json(snapshot)).into_response())
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::auth::StaticAuthorizer;
    use crate::cluster::dispatcher::{Dispatcher, DispatcherSettings};
    use crate::cluster::notifier::BroadcastNotifier;
    use crate::cluster::provider::ProviderRegistry;
    use crate::cluster::reconciler::Reconciler;
    use crate::cluster::simulated::SimulatedProvider;
    use crate::cluster::store::MemoryStore;
    use crate::config::TokenEntry;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use nimbus_common::CloudKind;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_app_with(latency: Duration) -> Router {
        let store = Arc::new(MemoryStore::new());
        let providers = ProviderRegistry::new().with(Arc::new(
            SimulatedProvider::new(CloudKind::Aks).with_latency(latency),
        ));
        let (ws_tx, _) = broadcast::channel(16);
        let dispatcher = Dispatcher::new(
            store.clone(),
            providers.clone(),
            Arc::new(BroadcastNotifier::new(ws_tx.clone())),
            DispatcherSettings::default(),
        );
        let reconciler = Reconciler::new(store.clone(), providers);
        let authorizer = Arc::new(StaticAuthorizer::new(&[TokenEntry {
            token: TOKEN.into(),
            tenant_id: "acme".into(),
            projects: vec!["p1".into(), "p2".into()],
        }]));
        let state = Arc::new(AppState {
            service: ClusterService::new(store, dispatcher, reconciler),
            authorizer,
            ws_tx,
        });
        api_router(&state).with_state(state)
    }

    fn test_app() -> Router {
        test_app_with(Duration::ZERO)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", TOKEN))
            .header("x-request-id", "test-request");
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn create_body(project_id: &str) -> Value {
        json!({
            "project_id": project_id,
            "cloud_kind": "aks",
            "name": "analytics",
            "resource_group": "rg-analytics",
            "location": "westeurope",
            "properties": {"nodePools": [{"name": "system", "count": 3}]}
        })
    }

    fn creds_body() -> Value {
        json!({"credentials": {"client_id": "id", "client_secret": "secret", "tenant": "t"}})
    }

    async fn create(app: &Router, project_id: &str) -> StatusCode {
        app.clone()
            .oneshot(request("POST", "/api/clusters", Some(create_body(project_id))))
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_or_unknown_token_is_unauthorized() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/clusters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/clusters")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_ws_requires_token() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/ws?project_id=p1")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_and_get_cluster() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(request("POST", "/api/clusters", Some(create_body("p1"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let record: Value = body_json(response.into_body()).await;
        assert_eq!(record["status"], "New");
        assert_eq!(record["tenant_id"], "acme");

        let response = app
            .oneshot(request("GET", "/api/clusters/p1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record: Value = body_json(response.into_body()).await;
        assert_eq!(record["name"], "analytics");
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let app = test_app();
        assert_eq!(create(&app, "p1").await, StatusCode::CREATED);
        assert_eq!(create(&app, "p1").await, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_project_outside_token_scope_is_forbidden() {
        let app = test_app();
        assert_eq!(create(&app, "p9").await, StatusCode::FORBIDDEN);
        let response = app
            .oneshot(request("GET", "/api/clusters/p9", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_get_missing_cluster_is_not_found() {
        let app = test_app();
        let response = app
            .oneshot(request("GET", "/api/clusters/p2", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_name_is_bad_request() {
        let app = test_app();
        let mut body = create_body("p1");
        body["name"] = json!("not a valid name!");
        let response = app
            .oneshot(request("POST", "/api/clusters", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_returns_scoped_records() {
        let app = test_app();
        create(&app, "p1").await;
        create(&app, "p2").await;
        let response = app
            .oneshot(request("GET", "/api/clusters", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let records: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["project_id"], "p1");
    }

    #[tokio::test]
    async fn test_start_returns_deploying() {
        let app = test_app_with(Duration::from_millis(200));
        create(&app, "p1").await;
        let response = app
            .clone()
            .oneshot(request("POST", "/api/clusters/p1/start", Some(creds_body())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "Deploying");
        assert_eq!(body["record"]["version"], 2);

        // Second start while deploying
        let response = app
            .clone()
            .oneshot(request("POST", "/api/clusters/p1/start", Some(creds_body())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Update while deploying
        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/clusters/p1",
                Some(json!({"name": "renamed"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Delete while deploying, then forced
        let response = app
            .clone()
            .oneshot(request("DELETE", "/api/clusters/p1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = app
            .oneshot(request("DELETE", "/api/clusters/p1?force=true", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_start_with_empty_credentials_is_bad_request() {
        let app = test_app();
        create(&app, "p1").await;
        let response = app
            .oneshot(request(
                "POST",
                "/api/clusters/p1/start",
                Some(json!({"credentials": {}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_terminate_new_cluster_conflicts() {
        let app = test_app();
        create(&app, "p1").await;
        let response = app
            .oneshot(request(
                "POST",
                "/api/clusters/p1/terminate",
                Some(creds_body()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = body_json(response.into_body()).await;
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("cannot terminate a new cluster")
        );
    }

    #[tokio::test]
    async fn test_status_degraded_is_partial_content() {
        let app = test_app();
        create(&app, "p1").await;
        // Never provisioned, so the provider has nothing to report.
        let response = app
            .oneshot(request("POST", "/api/clusters/p1/status", Some(creds_body())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["degraded"], true);
        assert_eq!(body["record"]["status"], "New");
        assert!(body["reason"].is_string());
    }

    #[tokio::test]
    async fn test_status_after_deployment_merges_live_pools() {
        let app = test_app();
        create(&app, "p1").await;
        app.clone()
            .oneshot(request("POST", "/api/clusters/p1/start", Some(creds_body())))
            .await
            .unwrap();

        let mut last = Value::Null;
        for _ in 0..200 {
            let response = app
                .clone()
                .oneshot(request("POST", "/api/clusters/p1/status", Some(creds_body())))
                .await
                .unwrap();
            if response.status() == StatusCode::OK {
                last = body_json(response.into_body()).await;
                if last["record"]["status"] == "Created" {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(last["record"]["status"], "Created");
        assert_eq!(last["degraded"], false);
        assert_eq!(
            last["record"]["properties"]["nodePools"][0]["subnetId"],
            "aks-analytics-subnet-0"
        );
        assert_eq!(last["record"]["properties"]["nodePools"][0]["count"], 3);
    }

    #[test]
    fn test_error_mapping() {
        let cases: Vec<(ClusterError, StatusCode)> = vec![
            (ClusterError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ClusterError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (
                ClusterError::VersionConflict {
                    project_id: "p".into(),
                    expected: 1,
                },
                StatusCode::CONFLICT,
            ),
            (ClusterError::ProviderAuth("x".into()), StatusCode::BAD_GATEWAY),
            (
                ClusterError::NotifierUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ClusterError::Store(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
