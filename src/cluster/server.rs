use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use nimbus_common::CloudKind;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::auth::authorizer_from_config;
use super::db::SqliteStore;
use super::dispatcher::{Dispatcher, DispatcherSettings};
use super::http_provider::HttpProvider;
use super::notifier::{BroadcastNotifier, FanoutNotifier, SharedNotifier, WebhookNotifier};
use super::provider::ProviderRegistry;
use super::reconciler::Reconciler;
use super::service::ClusterService;
use super::simulated::SimulatedProvider;
use super::store::{MemoryStore, SharedStore};
use crate::config::{NimbusConfig, NotifierSection, ProviderMode, StoreBackend, StoreSection};

/// Configuration for the orchestrator server.
pub struct ServerConfig {
    pub settings: NimbusConfig,
    /// Memory store, simulated adapters for every cloud, permissive CORS.
    pub dev_mode: bool,
}

/// Open the record store selected in `[store]`.
pub fn open_store(section: &StoreSection) -> Result<SharedStore> {
    match section.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            if let Some(parent) = section.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            let store = SqliteStore::open(&section.path).with_context(|| {
                format!("Failed to open cluster store at {}", section.path.display())
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// One adapter per configured cloud. With no `[providers]` table, or in dev
/// mode, every cloud gets a simulated adapter.
pub fn build_providers(config: &NimbusConfig, dev_mode: bool) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let sections = config.provider_sections();

    if dev_mode || sections.is_empty() {
        for kind in CloudKind::ALL {
            let latency = sections
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, s)| s.simulated_latency_ms)
                .unwrap_or(0);
            registry.register(Arc::new(
                SimulatedProvider::new(kind).with_latency(Duration::from_millis(latency)),
            ));
        }
        return registry;
    }

    for (kind, section) in sections {
        match (section.mode, section.endpoint) {
            (ProviderMode::Simulated, _) => registry.register(Arc::new(
                SimulatedProvider::new(kind)
                    .with_latency(Duration::from_millis(section.simulated_latency_ms)),
            )),
            (ProviderMode::Http, Some(endpoint)) => {
                registry.register(Arc::new(HttpProvider::new(kind, endpoint)))
            }
            (ProviderMode::Http, None) => {
                tracing::warn!(cloud_kind = %kind, "http provider has no endpoint; cloud disabled");
            }
        }
    }
    registry
}

/// Broadcast to `/ws` subscribers, plus the webhook when configured.
pub fn build_notifier(
    section: &NotifierSection,
    ws_tx: broadcast::Sender<String>,
) -> SharedNotifier {
    let broadcast: SharedNotifier = Arc::new(BroadcastNotifier::new(ws_tx));
    match &section.webhook_url {
        Some(url) => Arc::new(
            FanoutNotifier::new()
                .with(broadcast)
                .with(Arc::new(WebhookNotifier::new(url.clone()))),
        ),
        None => broadcast,
    }
}

/// Wire store, adapters, notifier and authorizer into the shared state.
pub fn build_state(config: &NimbusConfig, store: SharedStore, dev_mode: bool) -> SharedState {
    let (ws_tx, _rx) = broadcast::channel::<String>(config.notifier.channel_capacity.max(1));
    let providers = build_providers(config, dev_mode);
    let notifier = build_notifier(&config.notifier, ws_tx.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        providers.clone(),
        notifier,
        DispatcherSettings::from(&config.dispatcher),
    );
    let reconciler = Reconciler::new(store.clone(), providers)
        .with_timeout(config.dispatcher.status_timeout());
    Arc::new(AppState {
        service: ClusterService::new(store, dispatcher, reconciler),
        authorizer: authorizer_from_config(&config.auth),
        ws_tx,
    })
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router(&state)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the orchestrator server and run until Ctrl+C or SIGTERM.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let ServerConfig {
        mut settings,
        dev_mode,
    } = config;
    if dev_mode {
        settings.store.backend = StoreBackend::Memory;
    }

    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }

    let store = open_store(&settings.store)?;
    let state = build_state(&settings, store, dev_mode);
    tracing::info!(
        clouds = ?state.service.dispatcher().providers().kinds(),
        store = ?settings.store.backend,
        "provider adapters registered"
    );

    let mut app = build_router(Arc::clone(&state));
    if dev_mode || settings.server.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.server.bind))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, dev_mode, "nimbus listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.service.dispatcher().shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderSection, TokenEntry};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn config_with_token() -> NimbusConfig {
        let mut config = NimbusConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.auth.tokens.push(TokenEntry {
            token: "t".into(),
            tenant_id: "acme".into(),
            projects: vec!["p1".into()],
        });
        config
    }

    fn test_router() -> Router {
        let config = config_with_token();
        let store = open_store(&config.store).unwrap();
        build_router(build_state(&config, store, false))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted_behind_auth() {
        let app = test_router();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/clusters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/clusters")
                    .header("authorization", "Bearer t")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_empty_provider_table_registers_every_cloud() {
        let registry = build_providers(&NimbusConfig::default(), false);
        assert_eq!(registry.kinds(), CloudKind::ALL.to_vec());
    }

    #[test]
    fn test_configured_providers_only() {
        let mut config = NimbusConfig::default();
        config.providers.insert(
            "aks".into(),
            ProviderSection {
                mode: ProviderMode::Http,
                endpoint: Some("http://gateway:8080".into()),
                simulated_latency_ms: 0,
            },
        );
        config.providers.insert(
            "eks".into(),
            ProviderSection {
                mode: ProviderMode::Http,
                endpoint: None,
                simulated_latency_ms: 0,
            },
        );
        config
            .providers
            .insert("gke".into(), ProviderSection::default());

        let registry = build_providers(&config, false);
        assert_eq!(registry.kinds(), vec![CloudKind::Aks, CloudKind::Gke]);

        let dev = build_providers(&config, true);
        assert_eq!(dev.kinds().len(), CloudKind::ALL.len());
    }

    #[test]
    fn test_sqlite_store_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let section = StoreSection {
            backend: StoreBackend::Sqlite,
            path: dir.path().join("nested").join("clusters.db"),
        };
        open_store(&section).unwrap();
        assert!(section.path.exists());
    }
}
