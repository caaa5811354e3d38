//! Provider adapter that forwards calls to a per-cloud provider gateway.
//!
//! The gateway owns the actual cloud SDK. Credentials travel in the request
//! body and are never logged.

use async_trait::async_trait;
use nimbus_common::{CloudKind, ClusterRecord, ProviderCredentials};
use serde::Serialize;

use super::provider::{ProviderAdapter, ProviderStatus};
use crate::errors::ProviderError;

pub struct HttpProvider {
    kind: CloudKind,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CredentialsBody<'a> {
    credentials: &'a ProviderCredentials,
}

#[derive(Serialize)]
struct ClusterBody<'a> {
    cloud_kind: CloudKind,
    name: &'a str,
    resource_group: Option<&'a str>,
    location: Option<&'a str>,
    properties: &'a serde_json::Value,
    credentials: &'a ProviderCredentials,
}

impl<'a> ClusterBody<'a> {
    fn new(record: &'a ClusterRecord, credentials: &'a ProviderCredentials) -> Self {
        Self {
            cloud_kind: record.cloud_kind,
            name: &record.name,
            resource_group: record.resource_group.as_deref(),
            location: record.location.as_deref(),
            properties: &record.properties,
            credentials,
        }
    }
}

impl HttpProvider {
    pub fn new(kind: CloudKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(self.url(path))
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        check_status(resp).await
    }
}

/// Turn non-2xx responses into provider errors carrying the body text.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        format!("gateway returned {}", status)
    } else {
        body.trim().to_string()
    };
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(ProviderError::Authentication(message))
    } else {
        Err(ProviderError::Api(message))
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn cloud_kind(&self) -> CloudKind {
        self.kind
    }

    async fn authenticate(&self, credentials: &ProviderCredentials) -> Result<(), ProviderError> {
        credentials
            .validate()
            .map_err(ProviderError::Authentication)?;
        self.post("auth/verify", &CredentialsBody { credentials })
            .await
            .map(|_| ())
    }

    async fn create_cluster(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError> {
        self.post("clusters", &ClusterBody::new(record, credentials))
            .await
            .map(|_| ())
    }

    async fn delete_cluster(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProviderError> {
        self.post(
            &format!("clusters/{}/delete", record.name),
            &ClusterBody::new(record, credentials),
        )
        .await
        .map(|_| ())
    }

    async fn cluster_status(
        &self,
        record: &ClusterRecord,
        credentials: &ProviderCredentials,
    ) -> Result<ProviderStatus, ProviderError> {
        self.post(
            &format!("clusters/{}/status", record.name),
            &ClusterBody::new(record, credentials),
        )
        .await?
        .json::<ProviderStatus>()
        .await
        .map_err(|e| ProviderError::Api(format!("invalid status response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use nimbus_common::{ClusterKey, NewCluster};

    async fn spawn_gateway(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn record() -> ClusterRecord {
        ClusterRecord::new(
            ClusterKey::new("p1", "t1"),
            CloudKind::Aks,
            NewCluster {
                name: "c1".into(),
                ..Default::default()
            },
        )
    }

    fn creds() -> ProviderCredentials {
        ProviderCredentials::new()
            .with("client_id", "id")
            .with("client_secret", "secret")
    }

    #[tokio::test]
    async fn test_status_parses_gateway_response() {
        let router = Router::new().route(
            "/clusters/c1/status",
            post(|| async {
                Json(serde_json::json!({
                    "state": "Succeeded",
                    "nodePools": [{"index": 0, "count": 5}]
                }))
            }),
        );
        let endpoint = spawn_gateway(router).await;
        let provider = HttpProvider::new(CloudKind::Aks, format!("{}/", endpoint));

        let status = provider.cluster_status(&record(), &creds()).await.unwrap();
        assert_eq!(status.state.as_deref(), Some("Succeeded"));
        assert_eq!(status.node_pools[0].count, Some(5));
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_authentication_error() {
        let router = Router::new().route(
            "/auth/verify",
            post(|| async { (StatusCode::FORBIDDEN, "AuthorizationFailed: no access") }),
        );
        let endpoint = spawn_gateway(router).await;
        let provider = HttpProvider::new(CloudKind::Aks, endpoint);

        let err = provider.authenticate(&creds()).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Authentication("AuthorizationFailed: no access".into())
        );
    }

    #[tokio::test]
    async fn test_server_error_maps_to_api_error() {
        let router = Router::new().route(
            "/clusters",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "") }),
        );
        let endpoint = spawn_gateway(router).await;
        let provider = HttpProvider::new(CloudKind::Aks, endpoint);

        let err = provider.create_cluster(&record(), &creds()).await.unwrap_err();
        match err {
            ProviderError::Api(msg) => assert!(msg.contains("500")),
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_gateway() {
        let provider = HttpProvider::new(CloudKind::Aks, "http://127.0.0.1:1");
        let err = provider.delete_cluster(&record(), &creds()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_authenticate_validates_locally_first() {
        let provider = HttpProvider::new(CloudKind::Aks, "http://127.0.0.1:1");
        let err = provider
            .authenticate(&ProviderCredentials::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Authentication(_)));
    }
}
