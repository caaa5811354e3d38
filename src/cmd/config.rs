//! Configuration view and validation commands: `nimbus config`.

use anyhow::{Context, Result};
use std::path::Path;

use nimbus::config::NimbusConfig;

use super::super::ConfigCommands;

/// Copy of `config` with bearer tokens masked, for display.
fn redacted(config: &NimbusConfig) -> NimbusConfig {
    let mut shown = config.clone();
    for entry in &mut shown.auth.tokens {
        entry.token = "<redacted>".to_string();
    }
    shown
}

pub fn cmd_config(
    config_path: &Path,
    config: &NimbusConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Nimbus Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No nimbus.toml found at {}; using defaults.", config_path.display());
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let rendered = toml::to_string_pretty(&redacted(config))
                .context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("nimbus.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            NimbusConfig::default().save(config_path)?;

            println!("Created nimbus.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] bind, cors_permissive");
            println!("  - [store] backend, path");
            println!("  - [[auth.tokens]] token, tenant_id, projects");
            println!("  - [providers.<cloud>] mode, endpoint");
            println!();
        }
    }

    Ok(())
}
