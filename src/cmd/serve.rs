//! API server command: `nimbus serve`.

use anyhow::Result;

use nimbus::cluster::server::{ServerConfig, start_server};
use nimbus::config::{NimbusConfig, StoreBackend};

pub async fn cmd_serve(
    mut config: NimbusConfig,
    bind: Option<String>,
    dev: bool,
    memory: bool,
) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if memory {
        config.store.backend = StoreBackend::Memory;
    }

    start_server(ServerConfig {
        settings: config,
        dev_mode: dev,
    })
    .await
}
