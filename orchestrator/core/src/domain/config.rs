// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Core Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) that sizes and
// tunes the orchestration core:
// - Event bus observer buffering
// - Memory retention and content limits
// - Consensus defaults (timeout, participation floor, expiry sweep)
// - Audit chain checkpointing and trace store backend
// - Logging

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const API_VERSION: &str = "covenant.io/v1";
pub const KIND: &str = "CoreConfig";

/// Top-level core configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfigManifest {
    /// API version (must be "covenant.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "CoreConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: CoreConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfigSpec {
    #[serde(default)]
    pub event_bus: EventBusConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Broadcast buffer for passive observers; slower observers lag.
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Subtrees entirely older than this are pruned by `compact`.
    /// `None` keeps everything.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub retention: Option<Duration>,

    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Used when `propose` is not given a timeout.
    #[serde(default = "default_proposal_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Minimum approve+reject+abstain weight before commit.
    #[serde(default)]
    pub participation_floor: u64,

    /// How often the background reaper expires overdue proposals.
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,

    #[serde(default = "default_true")]
    pub reaper_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// A trusted checkpoint is recorded every N appended entries.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    #[serde(default)]
    pub store: TraceStoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TraceStoreConfig {
    Memory,
    Sled { path: PathBuf },
}

impl Default for TraceStoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_observer_capacity() -> usize {
    1024
}

fn default_max_content_bytes() -> usize {
    1024 * 1024
}

fn default_proposal_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_checkpoint_interval() -> u64 {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            observer_capacity: default_observer_capacity(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention: None,
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_proposal_timeout(),
            participation_floor: 0,
            reaper_interval: default_reaper_interval(),
            reaper_enabled: true,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            store: TraceStoreConfig::Memory,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Compact,
        }
    }
}

impl Default for CoreConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "covenant-core".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: CoreConfigSpec::default(),
        }
    }
}

/// Names the manifest to load when no explicit path is given.
pub const CONFIG_PATH_ENV: &str = "COVENANT_CONFIG_PATH";

impl CoreConfigManifest {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid core config manifest")
    }

    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::from_yaml_str(&yaml)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn save_file(&self, path: &Path) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Loads `explicit`, else the file named by `COVENANT_CONFIG_PATH`, else
    /// `~/.covenant/config.yaml` if it exists, else defaults. A named file
    /// that cannot be loaded is an error. Environment overrides apply last.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        let path = named.or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".covenant").join("config.yaml"))
                .filter(|path| path.exists())
        });

        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading core configuration");
                Self::load_file(&path)?
            }
            None => {
                debug!("No core configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// `COVENANT_LOG_LEVEL`, `COVENANT_LOG_FORMAT`, `COVENANT_TRACE_STORE_PATH`
    /// and `COVENANT_CHECKPOINT_INTERVAL` override the loaded values.
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("COVENANT_LOG_LEVEL") {
            self.spec.observability.log_level = level;
        }

        if let Ok(format) = std::env::var("COVENANT_LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => self.spec.observability.log_format = LogFormat::Json,
                "compact" => self.spec.observability.log_format = LogFormat::Compact,
                _ => warn!(value = %format, "Ignoring invalid COVENANT_LOG_FORMAT"),
            }
        }

        if let Some(path) = std::env::var_os("COVENANT_TRACE_STORE_PATH") {
            self.spec.audit.store = TraceStoreConfig::Sled {
                path: PathBuf::from(path),
            };
        }

        if let Ok(interval) = std::env::var("COVENANT_CHECKPOINT_INTERVAL") {
            match interval.parse::<u64>() {
                Ok(n) => self.spec.audit.checkpoint_interval = n,
                Err(_) => warn!(value = %interval, "Ignoring invalid COVENANT_CHECKPOINT_INTERVAL"),
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

        if self.spec.event_bus.observer_capacity == 0 {
            anyhow::bail!("spec.event_bus.observer_capacity must be greater than zero");
        }

        if self.spec.memory.max_content_bytes == 0 {
            anyhow::bail!("spec.memory.max_content_bytes must be greater than zero");
        }

        if self.spec.consensus.default_timeout.is_zero() {
            anyhow::bail!("spec.consensus.default_timeout must be greater than zero");
        }

        if self.spec.consensus.reaper_enabled && self.spec.consensus.reaper_interval.is_zero() {
            anyhow::bail!("spec.consensus.reaper_interval must be greater than zero");
        }

        if self.spec.audit.checkpoint_interval == 0 {
            anyhow::bail!("spec.audit.checkpoint_interval must be greater than zero");
        }

        if let TraceStoreConfig::Sled { path } = &self.spec.audit.store {
            if path.as_os_str().is_empty() {
                anyhow::bail!("spec.audit.store.path cannot be empty");
            }
        }

        Ok(())
    }
}
