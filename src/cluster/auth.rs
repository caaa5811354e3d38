//! Bearer-token authorization for the `/api` routes and the `/ws` stream.
//!
//! A token resolves to a `Principal`: the tenant it acts for and the set of
//! projects it may touch. Resolution is delegated to an `Authorizer`, either
//! a static table from config or a remote policy service.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

use super::api::{ApiError, SharedState};
use crate::config::{AuthSection, TokenEntry};
use crate::context::RequestContext;
use crate::errors::{AuthError, ClusterError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Principal {
    pub tenant_id: String,
    #[serde(default)]
    pub projects: HashSet<String>,
}

impl Principal {
    pub fn can_access(&self, project_id: &str) -> bool {
        self.projects.contains(project_id)
    }

    pub fn require(&self, project_id: &str) -> Result<(), ClusterError> {
        if self.can_access(project_id) {
            Ok(())
        } else {
            Err(ClusterError::Forbidden(format!(
                "project {} is not accessible with this token",
                project_id
            )))
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<Principal, AuthError>;
}

pub type SharedAuthorizer = Arc<dyn Authorizer>;

/// Tokens listed in `[[auth.tokens]]`.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    tokens: HashMap<String, Principal>,
}

impl StaticAuthorizer {
    pub fn new(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    Principal {
                        tenant_id: entry.tenant_id.clone(),
                        projects: entry.projects.iter().cloned().collect(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Asks an external policy service. The token is forwarded as a bearer
/// header; the service answers with `{"tenant_id": .., "projects": [..]}`.
pub struct PolicyAuthorizer {
    url: String,
    client: reqwest::Client,
}

impl PolicyAuthorizer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Principal, AuthError> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidToken);
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!(
                "policy service returned {}",
                status
            )));
        }
        resp.json::<Principal>()
            .await
            .map_err(|e| AuthError::Unavailable(format!("invalid policy response: {}", e)))
    }
}

/// Pick the authorizer the config asks for.
pub fn authorizer_from_config(section: &AuthSection) -> SharedAuthorizer {
    match &section.policy_url {
        Some(url) => Arc::new(PolicyAuthorizer::new(url.clone())),
        None => Arc::new(StaticAuthorizer::new(&section.tokens)),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve the caller and attach `Principal` and `RequestContext` to the
/// request extensions.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized(
        AuthError::MissingToken.to_string(),
    ))?;
    let principal = state.authorizer.authorize(&token).await.map_err(|e| {
        tracing::warn!(error = %e, "request rejected by authorizer");
        ApiError::from(e)
    })?;

    let correlation_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ctx = RequestContext::new(principal.tenant_id.clone(), correlation_id);

    request.extensions_mut().insert(principal);
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}
