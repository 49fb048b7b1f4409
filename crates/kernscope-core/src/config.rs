//! Configuration for kernscope
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Attach-time probe parameters (capacities, policies, depth, channel layout)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use kernscope_common::{DEFAULT_PATH_DEPTH, MAX_PATH_DEPTH};

use crate::correlation::CorrelationKey;
use crate::emitter::{ChannelMode, CpuIdSource};
use crate::filter::FilterPolicy;
use crate::layout::KernelLayout;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Probe attach-time parameters
    pub probes: ProbeConfig,

    /// Where decoded records are written
    pub export: ExportSettings,
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// JSONL export settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Output file path; stdout when unset
    pub path: Option<String>,

    /// Pretty print JSON
    pub pretty: bool,
}

/// Everything a probe set needs at attach time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub correlation: CorrelationSettings,
    pub filter: FilterSettings,
    pub path: PathSettings,
    pub volume: VolumeSettings,
    pub output: OutputSettings,
    pub network: NetworkSettings,
    pub dns: DnsSettings,
    pub syscall: SyscallSettings,
    pub layout: KernelLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Maximum pending operations per table
    pub capacity: usize,

    /// Key granularity: thread or process
    pub key: CorrelationKey,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            capacity: 10240,
            key: CorrelationKey::Thread,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Maximum number of inode rules
    pub capacity: usize,

    /// default-deny or default-record
    pub policy: FilterPolicy,

    /// Inodes whose subtrees are always reported
    pub record: Vec<u64>,

    /// Inodes whose subtrees are never reported
    pub ignore: Vec<u64>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            capacity: 10240,
            policy: FilterPolicy::DefaultDeny,
            record: Vec::new(),
            ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Ancestor walk ceiling
    pub depth: usize,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            depth: DEFAULT_PATH_DEPTH,
        }
    }
}

/// When a file record is emitted for a (task, inode) key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileReportMode {
    /// Only the first access after the key enters the aggregator
    #[default]
    FirstAccess,
    /// Every access, each carrying the running totals
    EveryAccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSettings {
    pub file_capacity: usize,
    pub socket_capacity: usize,
    pub report: FileReportMode,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            file_capacity: 10240,
            socket_capacity: 10240,
            report: FileReportMode::FirstAccess,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Number of per-CPU channels
    pub cpus: usize,

    /// Records buffered per channel before drops begin
    pub capacity: usize,

    pub mode: ChannelMode,

    pub cpu_source: CpuIdSource,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            capacity: 1024,
            mode: ChannelMode::PerCpu,
            cpu_source: CpuIdSource::Invocation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Only report UDP traffic to or from `dns_port`
    pub udp_dns_only: bool,

    pub dns_port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            udp_dns_only: true,
            dns_port: 53,
        }
    }
}

/// What the DNS classifier returns for a packet it cannot parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    #[default]
    Pass,
    Drop,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub on_malformed: MalformedPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyscallSettings {
    /// Process id whose syscalls are never reported (usually the consumer)
    pub ignore_pid: Option<u32>,
}

impl ProbeConfig {
    /// Reject values the probes cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let nonzero = [
            ("correlation.capacity", self.correlation.capacity),
            ("filter.capacity", self.filter.capacity),
            ("volume.file_capacity", self.volume.file_capacity),
            ("volume.socket_capacity", self.volume.socket_capacity),
            ("output.cpus", self.output.cpus),
            ("output.capacity", self.output.capacity),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} cannot be 0",
                    name
                )));
            }
        }

        if !(1..=MAX_PATH_DEPTH).contains(&self.path.depth) {
            return Err(ConfigError::ValidationError(format!(
                "path.depth must be between 1 and {}, got {}",
                MAX_PATH_DEPTH, self.path.depth
            )));
        }

        let rules = self.filter.record.len() + self.filter.ignore.len();
        if rules > self.filter.capacity {
            return Err(ConfigError::ValidationError(format!(
                "{} filter rules exceed filter.capacity {}",
                rules, self.filter.capacity
            )));
        }
        if let Some(ino) = self
            .filter
            .record
            .iter()
            .find(|ino| self.filter.ignore.contains(ino))
        {
            return Err(ConfigError::ValidationError(format!(
                "inode {} is listed as both record and ignore",
                ino
            )));
        }

        if self.network.dns_port == 0 {
            return Err(ConfigError::ValidationError(
                "network.dns_port cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. KERNSCOPE_CONFIG environment variable
    /// 3. $XDG_CONFIG_HOME/kernscope/config.toml
    /// 4. /etc/kernscope/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                SensorConfig::default()
            }
        };

        apply_overrides(&mut config, |key| std::env::var(key).ok());

        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("KERNSCOPE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("KERNSCOPE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        let path = PathBuf::from("/etc/kernscope/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self, config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        config.probes.validate()
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Per-user config file location
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("kernscope").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `KERNSCOPE_*` overrides. Unparseable values are ignored with a
/// warning and the file value is kept.
fn apply_overrides<F>(config: &mut SensorConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("KERNSCOPE_LOG_LEVEL") {
        config.sensor.log_level = val;
    }

    if let Some(val) = lookup("KERNSCOPE_PATH_DEPTH") {
        match val.parse() {
            Ok(depth) => config.probes.path.depth = depth,
            Err(_) => warn!("Ignoring KERNSCOPE_PATH_DEPTH={}: not a number", val),
        }
    }

    if let Some(val) = lookup("KERNSCOPE_FILTER_POLICY") {
        match val.parse() {
            Ok(policy) => config.probes.filter.policy = policy,
            Err(e) => warn!("Ignoring KERNSCOPE_FILTER_POLICY: {}", e),
        }
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
