use crate::sample::FrameLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const MIN_SETTLE_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FrameConfig {
    #[serde(default)]
    pub layout: FrameLayout,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GpuConfig {
    #[serde(default = "default_gpu_enabled")]
    pub enabled: bool,
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_gpu_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub cpu_temp_celsius: f64,
    #[serde(default = "default_ram_temp_celsius")]
    pub ram_temp_celsius: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            interval_secs: default_interval_secs(),
            frame: FrameConfig::default(),
            gpu: GpuConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: default_gpu_enabled(),
            nvidia_smi: default_nvidia_smi(),
            index: 0,
            timeout_ms: default_gpu_timeout_ms(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cpu_temp_celsius: 0.0,
            ram_temp_celsius: default_ram_temp_celsius(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load_from_file(path) {
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_serial(&self.serial)?;
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.gpu.enabled && self.gpu.nvidia_smi.trim().is_empty() {
            return Err(ConfigError::Validation(
                "gpu.nvidia_smi must not be empty when gpu.enabled".to_string(),
            ));
        }
        if self.gpu.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "gpu.timeout_ms must be > 0".to_string(),
            ));
        }
        if !self.fallback.cpu_temp_celsius.is_finite() {
            return Err(ConfigError::Validation(
                "fallback.cpu_temp_celsius must be a finite number".to_string(),
            ));
        }
        if !self.fallback.ram_temp_celsius.is_finite() {
            return Err(ConfigError::Validation(
                "fallback.ram_temp_celsius must be a finite number".to_string(),
            ));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl GpuConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn validate_serial(cfg: &SerialConfig) -> Result<(), ConfigError> {
    if cfg.port.trim().is_empty() {
        return Err(ConfigError::Validation(
            "serial.port is required".to_string(),
        ));
    }
    if cfg.baud_rate == 0 {
        return Err(ConfigError::Validation(
            "serial.baud_rate must be > 0".to_string(),
        ));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "serial.timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.settle_delay_ms < MIN_SETTLE_DELAY_MS {
        return Err(ConfigError::Validation(format!(
            "serial.settle_delay_ms must be >= {MIN_SETTLE_DELAY_MS}"
        )));
    }
    Ok(())
}

fn default_port() -> String {
    if cfg!(target_os = "windows") {
        "COM5".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

const fn default_baud_rate() -> u32 {
    115_200
}

const fn default_timeout_ms() -> u64 {
    1000
}

const fn default_settle_delay_ms() -> u64 {
    MIN_SETTLE_DELAY_MS
}

const fn default_interval_secs() -> u64 {
    1
}

const fn default_gpu_enabled() -> bool {
    true
}

fn default_nvidia_smi() -> String {
    "nvidia-smi".to_string()
}

const fn default_gpu_timeout_ms() -> u64 {
    2000
}

const fn default_ram_temp_celsius() -> f64 {
    40.0
}
