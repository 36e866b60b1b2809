pub mod gpu;
pub mod system;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostReading {
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuReading {
    pub utilization_percent: f64,
    pub temperature_celsius: f64,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("no CPUs reported by the OS")]
    NoCpus,
    #[error("total memory reported as zero")]
    NoMemory,
    #[error("{metric} reading is not a finite number")]
    NonFinite { metric: &'static str },
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no CPU temperature sensor exposed")]
    NotExposed,
    #[error("temperature sensor {sensor} reported {value}")]
    OutOfRange { sensor: String, value: f64 },
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Exit {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("{tool} did not answer within {after_ms} ms")]
    Timeout { tool: String, after_ms: u128 },
    #[error("GPU index {index} not reported")]
    DeviceNotFound { index: u32 },
    #[error("unparsable GPU query output: {0:?}")]
    Parse(String),
}

pub trait HostMetrics {
    fn read_host(&mut self) -> Result<HostReading, MetricsError>;
}

pub trait CpuTempSource {
    fn read_cpu_temp(&mut self) -> Result<f64, SensorError>;
}

pub trait GpuSource {
    fn read_gpu(&mut self) -> Result<GpuReading, GpuError>;
}
