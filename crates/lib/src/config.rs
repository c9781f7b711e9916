//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.botrelay/config.json`) and environment.
//! Every section is optional; a missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// NLU runtime endpoints.
    #[serde(default)]
    pub nlu: NluConfig,

    /// Container runtime used to provision bot instances.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub tenancy: TenancyConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NluConfig {
    /// Shared base runtime used when a number has no running dedicated instance.
    #[serde(default = "default_nlu_url")]
    pub default_url: String,

    #[serde(default = "default_nlu_timeout_secs")]
    pub timeout_secs: u64,

    /// Host that dedicated instances' published ports are reachable on.
    #[serde(default = "default_instance_host")]
    pub instance_host: String,
}

fn default_nlu_url() -> String {
    "http://rasa:5005".to_string()
}

fn default_nlu_timeout_secs() -> u64 {
    10
}

fn default_instance_host() -> String {
    "localhost".to_string()
}

impl Default for NluConfig {
    fn default() -> Self {
        Self {
            default_url: default_nlu_url(),
            timeout_secs: default_nlu_timeout_secs(),
            instance_host: default_instance_host(),
        }
    }
}

impl NluConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Container CLI binary (default "docker").
    #[serde(default = "default_cli")]
    pub cli: String,

    #[serde(default = "default_image")]
    pub image: String,

    /// Prepended to the requested instance name to form the container name.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// First port handed out when no instance exists.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Action server host port = instance port + offset.
    #[serde(default = "default_action_port_offset")]
    pub action_port_offset: u16,

    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_action_container_port")]
    pub action_container_port: u16,

    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,

    /// Command the container runs: the action server and the NLU REST API side by side.
    /// Empty keeps the image's own command.
    #[serde(default = "default_container_command")]
    pub command: Vec<String>,

    /// Grace period for `stop` before the runtime kills the container.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Upper bound for create/start/remove invocations.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_cli() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "docubot-rasa:latest".to_string()
}

fn default_name_prefix() -> String {
    "rasa_".to_string()
}

fn default_base_port() -> u16 {
    6000
}

fn default_action_port_offset() -> u16 {
    50
}

fn default_container_port() -> u16 {
    5005
}

fn default_action_container_port() -> u16 {
    5055
}

fn default_restart_policy() -> String {
    "unless-stopped".to_string()
}

fn default_container_command() -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        "rasa run actions --port 5055 --debug & rasa run --enable-api --cors '*' --port 5005 --debug"
            .to_string(),
    ]
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cli: default_cli(),
            image: default_image(),
            name_prefix: default_name_prefix(),
            base_port: default_base_port(),
            action_port_offset: default_action_port_offset(),
            container_port: default_container_port(),
            action_container_port: default_action_container_port(),
            restart_policy: default_restart_policy(),
            command: default_container_command(),
            stop_timeout_secs: default_stop_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// JSON data file. When absent the store is in-memory only. Relative paths are resolved
    /// against the config file's parent.
    pub data_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenancyConfig {
    /// Organization used when a connection or request names none.
    #[serde(default = "default_org_slug")]
    pub default_organization: String,

    #[serde(default = "default_org_name")]
    pub default_organization_name: String,
}

fn default_org_slug() -> String {
    "default".to_string()
}

fn default_org_name() -> String {
    "Default Organization".to_string()
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            default_organization: default_org_slug(),
            default_organization_name: default_org_name(),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Apply `BOTRELAY_PORT`, `BOTRELAY_NLU_URL` and `BOTRELAY_DATA_PATH` on top of the file.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(port) = env_nonempty("BOTRELAY_PORT") {
        match port.parse() {
            Ok(p) => config.gateway.port = p,
            Err(_) => log::warn!("ignoring BOTRELAY_PORT={}: not a port number", port),
        }
    }
    if let Some(url) = env_nonempty("BOTRELAY_NLU_URL") {
        config.nlu.default_url = url;
    }
    if let Some(path) = env_nonempty("BOTRELAY_DATA_PATH") {
        config.store.data_path = Some(PathBuf::from(path));
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("BOTRELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".botrelay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, `BOTRELAY_CONFIG_PATH`, or the default. Missing file =>
/// default config. Environment overrides are applied last.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok((config, path))
}

/// Data file location: `store.dataPath` (relative to the config file's parent) if set.
pub fn resolve_data_path(config: &Config, config_path: &Path) -> Option<PathBuf> {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.store.data_path {
        Some(d) if !d.as_os_str().is_empty() => Some(if d.is_absolute() {
            d.clone()
        } else {
            config_parent.join(d)
        }),
        _ => None,
    }
}

/// Create the config directory and write a default `config.json` if missing.
/// Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let mut config = Config::default();
        config.store.data_path = Some(PathBuf::from("data.json"));
        let json = serde_json::to_string_pretty(&config).context("serializing default config")?;
        std::fs::write(config_path, json)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }
    Ok(config_dir.to_path_buf())
}
