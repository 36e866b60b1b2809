use crate::collectors::{CpuTempSource, HostMetrics, HostReading, MetricsError, SensorError};
#[cfg(target_os = "linux")]
use std::fs;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};
use tracing::debug;

const PLAUSIBLE_CELSIUS: std::ops::RangeInclusive<f64> = 0.0..=130.0;
const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];
const CPU_MARKERS: [&str; 6] = ["cpu", "package", "tctl", "tdie", "coretemp", "k10temp"];
const ACPI_MARKERS: [&str; 3] = ["acpi", "thermal zone", "_tz"];

#[derive(Debug, Clone, PartialEq)]
pub struct TempStat {
    pub sensor: String,
    pub temperature_celsius: f64,
}

pub struct SysinfoHost {
    system: System,
}

impl SysinfoHost {
    pub fn new() -> Self {
        let mut system = System::new();
        // Usage is a delta between refreshes; prime it so the first tick has a window.
        system.refresh_cpu();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for SysinfoHost {
    fn read_host(&mut self) -> Result<HostReading, MetricsError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(MetricsError::NoCpus);
        }
        let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        let cpu_usage_percent = (sum / cpus.len() as f32) as f64;

        let total = self.system.total_memory();
        if total == 0 {
            return Err(MetricsError::NoMemory);
        }
        let ram_usage_percent = (self.system.used_memory() as f64 / total as f64) * 100.0;

        Ok(HostReading {
            cpu_usage_percent,
            ram_usage_percent,
        })
    }
}

pub struct SysinfoCpuTemp {
    system: System,
}

impl SysinfoCpuTemp {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_components_list();
        Self { system }
    }

    fn collect_temps(&mut self) -> Vec<TempStat> {
        self.system.refresh_components();
        let mut temps: Vec<TempStat> = self
            .system
            .components()
            .iter()
            .map(|c| TempStat {
                sensor: c.label().to_string(),
                temperature_celsius: c.temperature() as f64,
            })
            .filter(|t| t.temperature_celsius > 0.0)
            .collect();

        let sys_count = temps.len();
        let lin = collect_linux_temps();
        debug!(
            sysinfo_temps = sys_count,
            linux_temps = lin.len(),
            "collected temperature candidates"
        );
        temps.extend(lin);
        temps
    }
}

impl Default for SysinfoCpuTemp {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTempSource for SysinfoCpuTemp {
    fn read_cpu_temp(&mut self) -> Result<f64, SensorError> {
        let temps = self.collect_temps();
        pick_cpu_temp(&temps)
    }
}

// Labelled CPU sensors first, ACPI thermal zones second. Anything else (nvme,
// wifi, chipset) is not a CPU temperature.
pub fn pick_cpu_temp(temps: &[TempStat]) -> Result<f64, SensorError> {
    let plausible = || {
        temps
            .iter()
            .filter(|t| PLAUSIBLE_CELSIUS.contains(&t.temperature_celsius))
    };
    if let Some(v) = hottest(plausible().filter(|t| is_cpu_sensor(&t.sensor))) {
        return Ok(v);
    }
    if let Some(v) = hottest(plausible().filter(|t| is_acpi_sensor(&t.sensor))) {
        return Ok(v);
    }

    match temps
        .iter()
        .find(|t| is_cpu_sensor(&t.sensor) || is_acpi_sensor(&t.sensor))
    {
        Some(t) => Err(SensorError::OutOfRange {
            sensor: t.sensor.clone(),
            value: t.temperature_celsius,
        }),
        None => Err(SensorError::NotExposed),
    }
}

fn is_cpu_sensor(sensor: &str) -> bool {
    let s = sensor.to_lowercase();
    has_any(&s, &CPU_MARKERS) && !has_any(&s, &GPU_MARKERS) && !has_any(&s, &ACPI_MARKERS)
}

fn is_acpi_sensor(sensor: &str) -> bool {
    let s = sensor.to_lowercase();
    has_any(&s, &ACPI_MARKERS) && !has_any(&s, &GPU_MARKERS)
}

fn hottest<'a>(temps: impl Iterator<Item = &'a TempStat>) -> Option<f64> {
    temps
        .map(|t| t.temperature_celsius)
        .max_by(|a, b| a.total_cmp(b))
}

fn has_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| haystack.contains(m))
}

#[cfg(target_os = "linux")]
fn collect_linux_temps() -> Vec<TempStat> {
    let Ok(entries) = fs::read_dir("/sys/class/thermal") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with("thermal_zone") {
            continue;
        }

        let Ok(temp_raw) = fs::read_to_string(path.join("temp")) else {
            continue;
        };
        let typ = fs::read_to_string(path.join("type"))
            .ok()
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| name.to_string());
        let Ok(v) = temp_raw.trim().parse::<f64>() else {
            continue;
        };
        if let Some(celsius) = normalize_thermal_zone(v) {
            out.push(TempStat {
                sensor: typ,
                temperature_celsius: celsius,
            });
        }
    }

    out
}

#[cfg(not(target_os = "linux"))]
fn collect_linux_temps() -> Vec<TempStat> {
    Vec::new()
}

// sysfs reports millidegrees; some drivers report plain degrees.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn normalize_thermal_zone(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    Some(if raw > 1000.0 { raw / 1000.0 } else { raw })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(sensor: &str, v: f64) -> TempStat {
        TempStat {
            sensor: sensor.to_string(),
            temperature_celsius: v,
        }
    }

    #[test]
    fn prefers_cpu_package_over_gpu_and_acpi() {
        let temps = vec![
            t("acpitz temp1", 70.0),
            t("amdgpu edge", 80.0),
            t("coretemp Package id 0", 52.0),
            t("nvme Composite", 45.0),
        ];
        assert_eq!(pick_cpu_temp(&temps).unwrap(), 52.0);
    }

    #[test]
    fn falls_back_to_acpi_zone() {
        let temps = vec![t("acpitz", 38.0), t("amdgpu edge", 66.0)];
        assert_eq!(pick_cpu_temp(&temps).unwrap(), 38.0);
    }

    #[test]
    fn unlabelled_sensors_are_not_cpu() {
        let temps = vec![t("nvme Composite", 45.0), t("iwlwifi_1", 48.0)];
        assert!(matches!(pick_cpu_temp(&temps), Err(SensorError::NotExposed)));

        let temps = vec![t("nvme Composite", 45.0), t("nvidia gpu", 66.0)];
        assert!(matches!(pick_cpu_temp(&temps), Err(SensorError::NotExposed)));

        // Once a real zone shows up it wins over the unrelated sensors.
        let temps = vec![t("nvme Composite", 45.0), t("iwlwifi_1", 48.0), t("acpitz", 36.0)];
        assert_eq!(pick_cpu_temp(&temps).unwrap(), 36.0);
    }

    #[test]
    fn no_candidates_is_not_exposed() {
        assert!(matches!(pick_cpu_temp(&[]), Err(SensorError::NotExposed)));
        let only_gpu = vec![t("amdgpu edge", 60.0)];
        assert!(matches!(
            pick_cpu_temp(&only_gpu),
            Err(SensorError::NotExposed)
        ));
    }

    #[test]
    fn implausible_reading_is_rejected() {
        let temps = vec![t("coretemp Package id 0", 255.0)];
        assert!(matches!(
            pick_cpu_temp(&temps),
            Err(SensorError::OutOfRange { .. })
        ));
    }

    #[test]
    fn thermal_zone_millidegrees_are_scaled() {
        assert_eq!(normalize_thermal_zone(47000.0), Some(47.0));
        assert_eq!(normalize_thermal_zone(47.0), Some(47.0));
        assert_eq!(normalize_thermal_zone(0.0), None);
        assert_eq!(normalize_thermal_zone(f64::NAN), None);
    }
}
