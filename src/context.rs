//! Request-scoped context threaded through every lifecycle operation.

use tracing::Span;
use uuid::Uuid;

/// Who is asking, and under which correlation id.
///
/// Each operation logs inside `span`; background tasks spawned on behalf of
/// the request are instrumented with it, so their log lines stay attributable
/// after the request has returned.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: String,
    pub correlation_id: String,
    span: Span,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, correlation_id: Option<String>) -> Self {
        let tenant_id = tenant_id.into();
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "request",
            tenant_id = %tenant_id,
            correlation_id = %correlation_id,
        );
        Self {
            tenant_id,
            correlation_id,
            span,
        }
    }

    /// Context for work not tied to an API request (shutdown, CLI).
    pub fn system(reason: &str) -> Self {
        Self::new("system", Some(format!("{}-{}", reason, Uuid::new_v4())))
    }

    /// Child span for one operation on one project.
    pub fn operation_span(&self, operation: &'static str, project_id: &str) -> Span {
        tracing::info_span!(parent: &self.span, "cluster_op", operation, project_id = %project_id)
    }
}
