use crate::collectors::{
    CpuTempSource, GpuError, GpuReading, GpuSource, HostMetrics, MetricsError, SensorError,
};
use crate::config::FallbackConfig;
use crate::sample::{GpuCapability, Sample};
use tracing::{debug, info, warn};

pub struct Aggregator {
    host: Box<dyn HostMetrics>,
    cpu_temp: Box<dyn CpuTempSource>,
    gpu: Option<Box<dyn GpuSource>>,
    fallback: FallbackConfig,
    cpu_temp_missing: bool,
}

impl Aggregator {
    pub fn new(
        host: Box<dyn HostMetrics>,
        cpu_temp: Box<dyn CpuTempSource>,
        gpu: Option<Box<dyn GpuSource>>,
        fallback: FallbackConfig,
    ) -> Self {
        Self {
            host,
            cpu_temp,
            gpu,
            fallback,
            cpu_temp_missing: false,
        }
    }

    pub fn detect_gpu(&mut self) -> GpuCapability {
        let Some(gpu) = self.gpu.as_mut() else {
            info!("GPU monitoring disabled, mirroring CPU values");
            return GpuCapability::Absent;
        };
        match read_gpu_checked(&mut **gpu) {
            Ok(reading) => {
                info!(
                    utilization = reading.utilization_percent,
                    temperature = reading.temperature_celsius,
                    "GPU detected"
                );
                GpuCapability::Present
            }
            Err(err) => {
                warn!(error = %err, "no GPU detected, mirroring CPU values");
                GpuCapability::Absent
            }
        }
    }

    pub fn aggregate(&mut self, capability: &mut GpuCapability) -> Result<Sample, MetricsError> {
        let host = self.host.read_host()?;
        let cpu_usage = finite_percent(host.cpu_usage_percent, "cpu_usage")?;
        let ram_usage = finite_percent(host.ram_usage_percent, "ram_usage")?;

        let cpu_temp = match read_cpu_temp_checked(&mut *self.cpu_temp) {
            Ok(v) => {
                if self.cpu_temp_missing {
                    info!(cpu_temp = v, "CPU temperature sensor available again");
                    self.cpu_temp_missing = false;
                }
                v
            }
            Err(err) => {
                // Warn once per outage, repeats go to debug.
                if !self.cpu_temp_missing {
                    warn!(
                        error = %err,
                        placeholder = self.fallback.cpu_temp_celsius,
                        "CPU temperature unavailable, using placeholder"
                    );
                    self.cpu_temp_missing = true;
                } else {
                    debug!(error = %err, "CPU temperature still unavailable");
                }
                self.fallback.cpu_temp_celsius
            }
        };

        let (gpu_usage, gpu_temp) = match self.read_gpu(capability) {
            Some(r) => (
                r.utilization_percent.clamp(0.0, 100.0),
                r.temperature_celsius,
            ),
            None => (cpu_usage, cpu_temp),
        };

        let sample = Sample {
            cpu_usage,
            cpu_temp,
            ram_usage,
            ram_temp: self.fallback.ram_temp_celsius,
            gpu_usage,
            gpu_temp,
        };
        debug_assert!(sample.is_finite(), "unfinished fallback: {sample:?}");
        Ok(sample)
    }

    fn read_gpu(&mut self, capability: &mut GpuCapability) -> Option<GpuReading> {
        if !capability.is_present() {
            return None;
        }
        let Some(gpu) = self.gpu.as_mut() else {
            capability.demote();
            return None;
        };
        match read_gpu_checked(&mut **gpu) {
            Ok(r) => Some(r),
            Err(err) => {
                warn!(error = %err, "GPU query failed, disabling GPU monitoring for this run");
                capability.demote();
                None
            }
        }
    }
}

fn finite_percent(v: f64, metric: &'static str) -> Result<f64, MetricsError> {
    if !v.is_finite() {
        return Err(MetricsError::NonFinite { metric });
    }
    Ok(v.clamp(0.0, 100.0))
}

fn read_cpu_temp_checked(source: &mut dyn CpuTempSource) -> Result<f64, SensorError> {
    let v = source.read_cpu_temp()?;
    if !v.is_finite() {
        return Err(SensorError::OutOfRange {
            sensor: "cpu".to_string(),
            value: v,
        });
    }
    Ok(v)
}

fn read_gpu_checked(source: &mut dyn GpuSource) -> Result<GpuReading, GpuError> {
    let r = source.read_gpu()?;
    if !r.utilization_percent.is_finite() || !r.temperature_celsius.is_finite() {
        return Err(GpuError::Parse(format!(
            "non-finite reading {}/{}",
            r.utilization_percent, r.temperature_celsius
        )));
    }
    Ok(r)
}

#[cfg(test)]
pub(crate) mod stubs {
    use crate::collectors::{
        CpuTempSource, GpuError, GpuReading, GpuSource, HostMetrics, HostReading, MetricsError,
        SensorError,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub struct FixedHost {
        pub cpu: f64,
        pub ram: f64,
    }

    impl HostMetrics for FixedHost {
        fn read_host(&mut self) -> Result<HostReading, MetricsError> {
            Ok(HostReading {
                cpu_usage_percent: self.cpu,
                ram_usage_percent: self.ram,
            })
        }
    }

    pub struct ScriptedHost {
        pub script: VecDeque<Result<HostReading, MetricsError>>,
    }

    impl HostMetrics for ScriptedHost {
        fn read_host(&mut self) -> Result<HostReading, MetricsError> {
            match self.script.pop_front() {
                Some(r) => r,
                None => Ok(HostReading {
                    cpu_usage_percent: 1.0,
                    ram_usage_percent: 1.0,
                }),
            }
        }
    }

    pub struct FixedTemp(pub Option<f64>);

    impl CpuTempSource for FixedTemp {
        fn read_cpu_temp(&mut self) -> Result<f64, SensorError> {
            self.0.ok_or(SensorError::NotExposed)
        }
    }

    pub struct CountingGpu {
        pub calls: Arc<AtomicUsize>,
        pub script: VecDeque<Result<GpuReading, GpuError>>,
    }

    impl GpuSource for CountingGpu {
        fn read_gpu(&mut self) -> Result<GpuReading, GpuError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .pop_front()
                .unwrap_or(Err(GpuError::DeviceNotFound { index: 0 }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stubs::*;
    use super::*;
    use crate::frame::encode;
    use crate::sample::FrameLayout;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fallback() -> FallbackConfig {
        FallbackConfig {
            cpu_temp_celsius: 0.0,
            ram_temp_celsius: 40.0,
        }
    }

    fn reading(util: f64, temp: f64) -> Result<GpuReading, GpuError> {
        Ok(GpuReading {
            utilization_percent: util,
            temperature_celsius: temp,
        })
    }

    #[test]
    fn reduced_frame_without_gpu_mirrors_cpu() {
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 37.5,
                ram: 62.0,
            }),
            Box::new(FixedTemp(Some(50.0))),
            None,
            fallback(),
        );
        let mut cap = agg.detect_gpu();
        assert_eq!(cap, GpuCapability::Absent);

        let sample = agg.aggregate(&mut cap).unwrap();
        assert_eq!(encode(&sample, FrameLayout::Reduced), "37.5,62.0,37.5\n");
    }

    #[test]
    fn missing_cpu_temp_uses_placeholder() {
        let mut fb = fallback();
        fb.cpu_temp_celsius = 45.0;
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 10.0,
                ram: 20.0,
            }),
            Box::new(FixedTemp(None)),
            None,
            fb,
        );
        let mut cap = GpuCapability::Absent;
        for _ in 0..3 {
            let s = agg.aggregate(&mut cap).unwrap();
            assert_eq!(s.cpu_temp, 45.0);
            assert_eq!(s.gpu_temp, 45.0);
            assert_eq!(s.ram_temp, 40.0);
            assert!(s.is_finite());
        }
    }

    #[test]
    fn non_finite_cpu_temp_uses_placeholder() {
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 10.0,
                ram: 20.0,
            }),
            Box::new(FixedTemp(Some(f64::NAN))),
            None,
            fallback(),
        );
        let s = agg.aggregate(&mut GpuCapability::Absent).unwrap();
        assert_eq!(s.cpu_temp, 0.0);
        assert!(s.is_finite());
    }

    #[test]
    fn gpu_present_uses_gpu_values() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 10.0,
                ram: 20.0,
            }),
            Box::new(FixedTemp(Some(50.0))),
            Some(Box::new(CountingGpu {
                calls: calls.clone(),
                script: VecDeque::from([reading(5.0, 40.0), reading(77.0, 68.0)]),
            })),
            fallback(),
        );
        let mut cap = agg.detect_gpu();
        assert!(cap.is_present());

        let s = agg.aggregate(&mut cap).unwrap();
        assert_eq!((s.gpu_usage, s.gpu_temp), (77.0, 68.0));
        assert_eq!((s.cpu_usage, s.cpu_temp), (10.0, 50.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gpu_failure_demotes_for_rest_of_process() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 33.0,
                ram: 20.0,
            }),
            Box::new(FixedTemp(Some(51.0))),
            Some(Box::new(CountingGpu {
                calls: calls.clone(),
                script: VecDeque::from([
                    reading(5.0, 40.0),
                    Err(GpuError::DeviceNotFound { index: 0 }),
                    reading(99.0, 99.0),
                ]),
            })),
            fallback(),
        );
        let mut cap = agg.detect_gpu();
        assert!(cap.is_present());

        for _ in 0..5 {
            let s = agg.aggregate(&mut cap).unwrap();
            assert_eq!(s.gpu_usage, s.cpu_usage);
            assert_eq!(s.gpu_temp, s.cpu_temp);
        }
        assert_eq!(cap, GpuCapability::Absent);
        // detection + the one failing query, never retried
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_detection_never_queries_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 12.0,
                ram: 20.0,
            }),
            Box::new(FixedTemp(None)),
            Some(Box::new(CountingGpu {
                calls: calls.clone(),
                script: VecDeque::new(),
            })),
            fallback(),
        );
        let mut cap = agg.detect_gpu();
        for _ in 0..3 {
            agg.aggregate(&mut cap).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timed_out_query_mirrors_cpu() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 21.0,
                ram: 30.0,
            }),
            Box::new(FixedTemp(Some(47.0))),
            Some(Box::new(CountingGpu {
                calls: calls.clone(),
                script: VecDeque::from([
                    reading(5.0, 40.0),
                    Err(GpuError::Timeout {
                        tool: "nvidia-smi".to_string(),
                        after_ms: 2000,
                    }),
                ]),
            })),
            fallback(),
        );
        let mut cap = agg.detect_gpu();
        assert!(cap.is_present());

        let s = agg.aggregate(&mut cap).unwrap();
        assert_eq!((s.gpu_usage, s.gpu_temp), (21.0, 47.0));
        assert_eq!(cap, GpuCapability::Absent);
        agg.aggregate(&mut cap).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn host_failure_propagates() {
        let mut agg = Aggregator::new(
            Box::new(ScriptedHost {
                script: VecDeque::from([
                    Err(MetricsError::NoCpus),
                    Ok(crate::collectors::HostReading {
                        cpu_usage_percent: f64::NAN,
                        ram_usage_percent: 1.0,
                    }),
                ]),
            }),
            Box::new(FixedTemp(Some(50.0))),
            None,
            fallback(),
        );
        let mut cap = GpuCapability::Absent;
        assert!(matches!(
            agg.aggregate(&mut cap),
            Err(MetricsError::NoCpus)
        ));
        assert!(matches!(
            agg.aggregate(&mut cap),
            Err(MetricsError::NonFinite { metric: "cpu_usage" })
        ));
        assert!(agg.aggregate(&mut cap).is_ok());
    }

    #[test]
    fn usage_is_clamped() {
        let mut agg = Aggregator::new(
            Box::new(FixedHost {
                cpu: 100.4,
                ram: -0.1,
            }),
            Box::new(FixedTemp(Some(50.0))),
            None,
            fallback(),
        );
        let s = agg.aggregate(&mut GpuCapability::Absent).unwrap();
        assert_eq!(s.cpu_usage, 100.0);
        assert_eq!(s.ram_usage, 0.0);
    }
}
