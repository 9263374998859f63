// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

// Bot Host Configuration Types
//
// Defines the configuration schema for a Warden bot host process:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Upstream endpoint and credentials
// - Bot identity (marketable name + version, target group, declared tools)
// - Worker drain loop, restart policy and tool-call mode
// - Heartbeat and subscription reconnect cadence
// - Logging settings consumed by the CLI

use crate::domain::supervisor::RestartPolicy;
use crate::domain::upstream::{Heartbeat, SubscriptionParams};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "warden.dev/v1";
pub const KIND: &str = "BotHost";

/// Top-level Kubernetes-style bot host manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotHostManifest {
    /// API version (must be "warden.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "BotHost")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: BotHostSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable host name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotHostSpec {
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub bot: BotIdentity,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub subscription: SubscriptionConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API
    pub endpoint: String,

    /// API key (supports "env:VAR_NAME" for environment variables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Timeout for unary requests (heartbeat, tool results)
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// Resolve `env:VAR` indirection for the API key.
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        match self.api_key.as_deref() {
            None => Ok(None),
            Some(value) => match value.strip_prefix("env:") {
                Some(var) => std::env::var(var)
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("API key environment variable '{}' is not set", var)),
                None => Ok(Some(value.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotIdentity {
    /// Marketplace name of the bot this process hosts
    pub marketable_name: String,

    pub marketable_version: u32,

    /// Group whose personas this host serves
    pub group_id: String,

    /// Tools this process implements; every worker must register exactly these
    #[serde(default)]
    pub tools: Vec<String>,

    /// Cap on concurrently tracked threads (upstream evicts before exceeding it)
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

impl Default for BotIdentity {
    fn default() -> Self {
        Self {
            marketable_name: String::new(),
            marketable_version: 0,
            group_id: String::new(),
            tools: Vec::new(),
            max_threads: default_max_threads(),
        }
    }
}

impl BotIdentity {
    pub fn declared_tools(&self) -> BTreeSet<String> {
        self.tools.iter().cloned().collect()
    }

    pub fn subscription_params(&self) -> SubscriptionParams {
        SubscriptionParams {
            group_id: self.group_id.clone(),
            marketable_name: self.marketable_name.clone(),
            marketable_version: self.marketable_version,
            inprocess_tool_names: self.tools.clone(),
            max_threads: self.max_threads,
        }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            marketable_name: self.marketable_name.clone(),
            marketable_version: self.marketable_version,
            group_id: self.group_id.clone(),
        }
    }
}

/// Whether a worker's tool calls run one at a time or side by side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallMode {
    /// Await each call before starting the next (at most one in flight)
    #[default]
    Sequential,
    /// Spawn each call as a background task
    Concurrent,
}

/// What to do when the tracked-thread table would exceed `max_threads`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadOverflowPolicy {
    /// Treat it as an upstream contract violation and stop the host
    #[default]
    Fail,
    /// Evict the least recently updated threads with a warning
    EvictOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Longest a worker sleeps in one idle drain tick
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(default)]
    pub tool_call_mode: ToolCallMode,

    #[serde(default)]
    pub restart: RestartPolicy,

    /// How many times the router re-checks a worker that has not registered a tool yet
    #[serde(default = "default_poll_attempts")]
    pub tool_handler_poll_attempts: u32,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub tool_handler_poll_interval: Duration,

    #[serde(default)]
    pub thread_overflow: ThreadOverflowPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            tool_call_mode: ToolCallMode::default(),
            restart: RestartPolicy::default(),
            tool_handler_poll_attempts: default_poll_attempts(),
            tool_handler_poll_interval: default_poll_interval(),
            thread_overflow: ThreadOverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Delay before retrying after a failed heartbeat
    #[serde(default = "default_heartbeat_retry", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_heartbeat_interval(),
            retry_delay: default_heartbeat_retry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Pause between a dropped feed and the next subscribe attempt
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Bounded wait for workers to finish once shutdown is requested
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: default_reconnect_delay(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8008".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_threads() -> usize {
    500
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_attempts() -> u32 {
    20
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_retry() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for BotHostManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "warden-host".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: BotHostSpec::default(),
        }
    }
}

impl BotHostManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. WARDEN_CONFIG_PATH environment variable
    /// 2. ./warden-config.yaml (working directory)
    /// 3. ~/.warden/config.yaml (user home)
    /// 4. /etc/warden/config.yaml (Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("WARDEN_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./warden-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".warden").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/warden/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows container deployments to override config via env vars
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("WARDEN_UPSTREAM_ENDPOINT") {
            tracing::info!("Environment override: WARDEN_UPSTREAM_ENDPOINT={}", val);
            self.spec.upstream.endpoint = val;
        }

        if std::env::var("WARDEN_API_KEY").is_ok() {
            tracing::info!("Environment override: WARDEN_API_KEY");
            self.spec.upstream.api_key = Some("env:WARDEN_API_KEY".to_string());
        }

        if let Ok(val) = std::env::var("WARDEN_GROUP_ID") {
            tracing::info!("Environment override: WARDEN_GROUP_ID={}", val);
            self.spec.bot.group_id = val;
        }

        if let Ok(val) = std::env::var("WARDEN_MAX_THREADS") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: WARDEN_MAX_THREADS={}", n);
                    self.spec.bot.max_threads = n;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for WARDEN_MAX_THREADS: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let upstream = &self.spec.upstream;
        if !(upstream.endpoint.starts_with("http://") || upstream.endpoint.starts_with("https://")) {
            anyhow::bail!(
                "spec.upstream.endpoint must be an http(s) URL, got '{}'",
                upstream.endpoint
            );
        }

        let bot = &self.spec.bot;
        if bot.marketable_name.is_empty() {
            anyhow::bail!("spec.bot.marketable_name cannot be empty");
        }

        if bot.group_id.is_empty() {
            anyhow::bail!("spec.bot.group_id cannot be empty");
        }

        if bot.max_threads == 0 {
            anyhow::bail!("spec.bot.max_threads must be greater than zero");
        }

        let mut seen = BTreeSet::new();
        for tool in &bot.tools {
            if tool.is_empty() {
                anyhow::bail!("spec.bot.tools contains an empty tool name");
            }
            if !seen.insert(tool) {
                anyhow::bail!("spec.bot.tools declares '{}' more than once", tool);
            }
        }

        if self.spec.worker.idle_timeout.is_zero() {
            anyhow::bail!("spec.worker.idle_timeout must be greater than zero");
        }

        if self.spec.heartbeat.enabled && self.spec.heartbeat.interval.is_zero() {
            anyhow::bail!("spec.heartbeat.interval must be greater than zero");
        }

        if let RestartPolicy::Backoff { cooldown, max_cooldown } = &self.spec.worker.restart {
            if cooldown > max_cooldown {
                anyhow::bail!("spec.worker.restart.cooldown cannot exceed max_cooldown");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_manifest() -> BotHostManifest {
        let mut manifest = BotHostManifest::default();
        manifest.spec.bot.marketable_name = "support".to_string();
        manifest.spec.bot.marketable_version = 2;
        manifest.spec.bot.group_id = "grp-1".to_string();
        manifest
    }

    #[test]
    fn test_default_manifest() {
        let manifest = BotHostManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.bot.max_threads, 500);
        assert_eq!(manifest.spec.worker.tool_call_mode, ToolCallMode::Sequential);
        assert_eq!(manifest.spec.worker.restart, RestartPolicy::default());
        assert_eq!(manifest.spec.worker.thread_overflow, ThreadOverflowPolicy::Fail);
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
apiVersion: warden.dev/v1
kind: BotHost
metadata:
  name: support-host
spec:
  upstream:
    endpoint: https://upstream.example.com
    api_key: env:SUPPORT_KEY
  bot:
    marketable_name: support
    marketable_version: 4
    group_id: grp-9
    tools: [search, escalate]
    max_threads: 50
  worker:
    idle_timeout: 15s
    tool_call_mode: concurrent
    restart:
      policy: backoff
      cooldown: 5s
      max_cooldown: 5m
    thread_overflow: evict_oldest
  heartbeat:
    interval: 2m
"#;
        let manifest = BotHostManifest::from_yaml_str(yaml).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.spec.bot.declared_tools().len(), 2);
        assert_eq!(manifest.spec.worker.idle_timeout, Duration::from_secs(15));
        assert_eq!(manifest.spec.worker.tool_call_mode, ToolCallMode::Concurrent);
        assert_eq!(manifest.spec.worker.thread_overflow, ThreadOverflowPolicy::EvictOldest);
        assert_eq!(manifest.spec.heartbeat.interval, Duration::from_secs(120));
        assert_eq!(manifest.spec.heartbeat.retry_delay, Duration::from_secs(10));
        assert_eq!(manifest.spec.worker.tool_handler_poll_attempts, 20);

        let params = manifest.spec.bot.subscription_params();
        assert_eq!(params.max_threads, 50);
        assert_eq!(params.inprocess_tool_names, vec!["search", "escalate"]);
    }

    #[test]
    fn test_validation() {
        let mut manifest = valid_manifest();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.bot.group_id.clear();
        assert!(manifest.validate().is_err());
        manifest.spec.bot.group_id = "grp-1".to_string();

        manifest.spec.bot.max_threads = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.bot.max_threads = 10;

        manifest.spec.bot.tools = vec!["search".to_string(), "search".to_string()];
        assert!(manifest.validate().is_err());
        manifest.spec.bot.tools = vec!["search".to_string()];

        manifest.spec.upstream.endpoint = "ftp://nope".to_string();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden-config.yaml");
        let manifest = valid_manifest();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = BotHostManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.spec.bot.marketable_name, "support");
        assert_eq!(loaded.spec.worker.idle_timeout, manifest.spec.worker.idle_timeout);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = BotHostManifest::load_or_default(Some(dir.path().join("missing.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_literal_api_key() {
        let upstream = UpstreamConfig {
            api_key: Some("sk-literal".to_string()),
            ..UpstreamConfig::default()
        };
        assert_eq!(upstream.resolved_api_key().unwrap(), Some("sk-literal".to_string()));

        let missing = UpstreamConfig {
            api_key: Some("env:WARDEN_TEST_SURELY_UNSET_VAR".to_string()),
            ..UpstreamConfig::default()
        };
        assert!(missing.resolved_api_key().is_err());
    }
}
