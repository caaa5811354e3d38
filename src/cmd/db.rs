//! Store initialization command: `nimbus init-db`.

use anyhow::{Context, Result};
use std::path::PathBuf;

use nimbus::cluster::db::ClusterDb;
use nimbus::config::NimbusConfig;

pub fn cmd_init_db(config: &NimbusConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.store.path.clone());
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    ClusterDb::new(&db_path)?;
    println!("Cluster store initialized at {}", db_path.display());
    Ok(())
}
