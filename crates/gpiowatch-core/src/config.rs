//! Shared configuration defaults and loader.
//!
//! Well-known addresses, subjects and timeouts live here so the agent, its
//! tests and the CLI agree on them. [`AgentConfig`] is read from a TOML file;
//! every field has a default, and a few can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Bus addresses and subjects.
pub mod addresses {
    /// Mailbox address of the GPIO agent.
    pub const AGENT: &str = "gpio-sensor-agent";
    /// Mailbox address of the asset-management service.
    pub const ASSET_AGENT: &str = "asset-agent";

    /// Subject of the asset list query.
    pub const SUBJECT_ASSETS: &str = "ASSETS";
    /// Subject of the per-asset detail query.
    pub const SUBJECT_ASSET_DETAIL: &str = "ASSET_DETAIL";
    /// Subject of the output-state side channel.
    pub const SUBJECT_GPOSTATE: &str = "GPOSTATE";
}

/// Stream names.
pub mod streams {
    /// Asset change notifications.
    pub const ASSETS: &str = "ASSETS";
    /// Sensor metrics produced by the agent.
    pub const METRICS_SENSOR: &str = "_METRICS_SENSOR";
    /// Subject pattern matching every asset notification.
    pub const ASSETS_PATTERN: &str = ".*";
}

/// Timing defaults.
pub mod timeouts {
    use std::time::Duration;

    /// Bus connection timeout.
    pub const CONNECT: Duration = Duration::from_millis(5000);
    /// Wait for a request/reply answer.
    pub const REQUEST: Duration = Duration::from_millis(5000);
    /// Fire-and-forget side-channel sends.
    pub const GPOSTATE_SEND: Duration = Duration::from_millis(1000);
}

/// Default template directory.
pub const DEFAULT_TEMPLATE_DIR: &str = "/usr/share/gpiowatch/templates";

/// Default bus endpoint.
pub const DEFAULT_ENDPOINT: &str = "mqtt://127.0.0.1:1883";

/// Environment variable names.
pub mod env_vars {
    pub const ENDPOINT: &str = "GPIOWATCH_ENDPOINT";
    pub const TEMPLATE_DIR: &str = "GPIOWATCH_TEMPLATE_DIR";
    pub const TEST_MODE: &str = "GPIOWATCH_TEST_MODE";
    pub const LOG_JSON: &str = "GPIOWATCH_LOG_JSON";
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Bus section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub endpoint: String,
    /// Mailbox address of this agent.
    pub address: String,
    /// Mailbox address of the asset service.
    pub asset_agent: String,
    pub producer: String,
    pub consumer_stream: String,
    pub consumer_pattern: String,
    pub request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            address: addresses::AGENT.to_string(),
            asset_agent: addresses::ASSET_AGENT.to_string(),
            producer: streams::METRICS_SENSOR.to_string(),
            consumer_stream: streams::ASSETS.to_string(),
            consumer_pattern: streams::ASSETS_PATTERN.to_string(),
            request_timeout_ms: timeouts::REQUEST.as_millis() as u64,
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Agent section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSection {
    pub template_dir: PathBuf,
    /// Bypass hardware capacity checks and use the virtual sysfs root.
    pub test_mode: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            test_mode: false,
        }
    }
}

/// Hardware section: GPIO register layout of the controller.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub base_address: u32,
    pub gpi_offset: u32,
    pub gpo_offset: u32,
    pub gpi_count: u32,
    pub gpo_count: u32,
    /// Root under which `sys/class/gpio` is simulated in test mode.
    pub virtual_root: Option<PathBuf>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            base_address: 488,
            gpi_offset: 0,
            gpo_offset: 10,
            gpi_count: 10,
            gpo_count: 5,
            virtual_root: None,
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub bus: BusConfig,
    pub agent: AgentSection,
    pub hardware: HardwareConfig,
}

impl AgentConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(env_vars::ENDPOINT) {
            self.bus.endpoint = endpoint;
        }
        if let Some(dir) = lookup(env_vars::TEMPLATE_DIR) {
            self.agent.template_dir = PathBuf::from(dir);
        }
        if let Some(test) = lookup(env_vars::TEST_MODE).and_then(|v| v.parse().ok()) {
            self.agent.test_mode = test;
        }
    }

    /// Control commands that bring an agent up with this configuration.
    ///
    /// PRODUCER comes last since it starts the initial asset discovery.
    pub fn control_commands(&self) -> Vec<Vec<String>> {
        let mut commands = vec![
            vec!["CONNECT".to_string(), self.bus.endpoint.clone()],
            vec![
                "TEMPLATE_DIR".to_string(),
                self.agent.template_dir.display().to_string(),
            ],
        ];
        if self.agent.test_mode {
            commands.push(vec!["TEST".to_string()]);
        }
        commands.push(vec![
            "CONSUMER".to_string(),
            self.bus.consumer_stream.clone(),
            self.bus.consumer_pattern.clone(),
        ]);
        commands.push(vec!["PRODUCER".to_string(), self.bus.producer.clone()]);
        commands
    }
}
