//! Configuration for the Nimbus orchestrator.
//!
//! Settings are read from `.nimbus/nimbus.toml` (or the path given with
//! `--config` / `NIMBUS_CONFIG`), then environment overrides are applied,
//! then CLI flags. Every field has a default, so an absent file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:3150"
//! cors_permissive = false
//!
//! [store]
//! backend = "sqlite"
//! path = ".nimbus/clusters.db"
//!
//! [dispatcher]
//! provision_timeout_secs = 3600
//! termination_timeout_secs = 3600
//! status_timeout_secs = 60
//! completion_write_retries = 3
//!
//! [notifier]
//! channel_capacity = 256
//! webhook_url = "https://hooks.example.com/nimbus"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! directory = ".nimbus/logs"
//!
//! [auth]
//! policy_url = "https://policy.internal/v1/authorize"
//!
//! [[auth.tokens]]
//! token = "dev-token"
//! tenant_id = "tenant-a"
//! projects = ["p1", "p2"]
//!
//! [providers.aks]
//! mode = "http"
//! endpoint = "https://aks-gateway.internal"
//!
//! [providers.aws]
//! mode = "simulated"
//! simulated_latency_ms = 2000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use nimbus_common::CloudKind;
use serde::{Deserialize, Serialize};

/// Default directory holding the config file, database and logs.
pub const NIMBUS_DIR: &str = ".nimbus";

/// File name of the configuration inside [`NIMBUS_DIR`].
pub const CONFIG_FILE: &str = "nimbus.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Permissive CORS for local UI development.
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_bind() -> String {
    "127.0.0.1:3150".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(NIMBUS_DIR).join("clusters.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    /// Deadline for a background create before the record is marked failed.
    #[serde(default = "default_timeout_secs")]
    pub provision_timeout_secs: u64,
    /// Deadline for a background delete before the record is marked failed.
    #[serde(default = "default_timeout_secs")]
    pub termination_timeout_secs: u64,
    /// Deadline for a live status query before the snapshot is degraded.
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    /// Attempts for a completion write that loses a version race.
    #[serde(default = "default_completion_write_retries")]
    pub completion_write_retries: u32,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_status_timeout_secs() -> u64 {
    60
}

fn default_completion_write_retries() -> u32 {
    3
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            provision_timeout_secs: default_timeout_secs(),
            termination_timeout_secs: default_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
            completion_write_retries: default_completion_write_retries(),
        }
    }
}

impl DispatcherSection {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSection {
    /// Buffer size of the in-process broadcast channel feeding `/ws`.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// External endpoint that also receives every change event.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `nimbus=debug,tower_http=info`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// A static bearer token and the principal it resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub tenant_id: String,
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Remote policy service. Takes precedence over the static token table.
    #[serde(default)]
    pub policy_url: Option<String>,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// In-process adapter that pretends to provision.
    #[default]
    Simulated,
    /// Adapter calling a provider gateway over HTTP.
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub mode: ProviderMode,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub simulated_latency_ms: u64,
}

/// The complete nimbus.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NimbusConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub notifier: NotifierSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub auth: AuthSection,
    /// Keyed by cloud kind (`aws`, `aks`, ...). Empty means every cloud
    /// gets a simulated adapter.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
}

impl NimbusConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse nimbus.toml")
    }

    /// Load from `path`, or return defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the config path, load it and apply environment overrides.
    /// `.env` in the working directory is honoured.
    pub fn resolve(explicit: Option<&Path>) -> Result<(PathBuf, Self)> {
        dotenvy::dotenv().ok();
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => std::env::var("NIMBUS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_config_path()),
        };
        let mut config = Self::load_or_default(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok((path, config))
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize nimbus.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `NIMBUS_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("NIMBUS_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = lookup("NIMBUS_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("NIMBUS_LOG") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("NIMBUS_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(url) = lookup("NIMBUS_WEBHOOK_URL") {
            self.notifier.webhook_url = Some(url);
        }
        Ok(())
    }

    /// Provider sections with parsed cloud kinds. Unknown keys are skipped
    /// and reported by [`NimbusConfig::validate`].
    pub fn provider_sections(&self) -> Vec<(CloudKind, ProviderSection)> {
        self.providers
            .iter()
            .filter_map(|(key, section)| {
                CloudKind::from_str(key)
                    .ok()
                    .map(|kind| (kind, section.clone()))
            })
            .collect()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            warnings.push(format!(
                "Invalid server.bind '{}': expected host:port",
                self.server.bind
            ));
        }

        if self.dispatcher.provision_timeout_secs == 0
            || self.dispatcher.termination_timeout_secs == 0
            || self.dispatcher.status_timeout_secs == 0
        {
            warnings.push(
                "Dispatcher timeouts of 0 seconds fail every provisioning call".to_string(),
            );
        }

        if self.auth.policy_url.is_none() && self.auth.tokens.is_empty() {
            warnings.push(
                "No auth.policy_url and no auth.tokens configured: every API request will be rejected"
                    .to_string(),
            );
        }

        for entry in &self.auth.tokens {
            if entry.projects.is_empty() {
                warnings.push(format!(
                    "Token for tenant '{}' grants no projects",
                    entry.tenant_id
                ));
            }
        }

        if self.providers.is_empty() {
            warnings.push(
                "No [providers] configured: every cloud uses the simulated adapter and nothing is provisioned"
                    .to_string(),
            );
        }

        for (key, section) in &self.providers {
            if CloudKind::from_str(key).is_err() {
                warnings.push(format!("Unknown provider section 'providers.{}'", key));
                continue;
            }
            if section.mode == ProviderMode::Http && section.endpoint.is_none() {
                warnings.push(format!(
                    "Provider '{}' uses http mode but has no endpoint",
                    key
                ));
            }
        }

        if let Some(url) = &self.notifier.webhook_url
            && reqwest::Url::parse(url).is_err()
        {
            warnings.push(format!("Invalid notifier.webhook_url '{}'", url));
        }

        warnings
    }
}

/// `.nimbus/nimbus.toml` relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(NIMBUS_DIR).join(CONFIG_FILE)
}
