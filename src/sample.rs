use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub cpu_usage: f64,
    pub cpu_temp: f64,
    pub ram_usage: f64,
    pub ram_temp: f64,
    pub gpu_usage: f64,
    pub gpu_temp: f64,
}

impl Sample {
    pub fn is_finite(&self) -> bool {
        [
            self.cpu_usage,
            self.cpu_temp,
            self.ram_usage,
            self.ram_temp,
            self.gpu_usage,
            self.gpu_temp,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLayout {
    /// `cpu_usage,cpu_temp,ram_usage,ram_temp,gpu_usage,gpu_temp`
    #[default]
    Full,
    /// `cpu,ram,gpu`
    Reduced,
}

impl FrameLayout {
    pub const fn field_count(self) -> usize {
        match self {
            FrameLayout::Full => 6,
            FrameLayout::Reduced => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FrameLayout::Full => "full",
            FrameLayout::Reduced => "reduced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuCapability {
    Present,
    Absent,
}

impl GpuCapability {
    pub fn is_present(self) -> bool {
        matches!(self, GpuCapability::Present)
    }

    pub fn demote(&mut self) {
        *self = GpuCapability::Absent;
    }
}
