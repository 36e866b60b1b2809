use crate::collectors::{GpuError, GpuReading, GpuSource};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const QUERY: &str = "--query-gpu=index,utilization.gpu,temperature.gpu";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct NvidiaSmi {
    tool: String,
    index: u32,
    timeout: Duration,
}

struct QueryOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl NvidiaSmi {
    pub fn new(tool: impl Into<String>, index: u32, timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            index,
            timeout,
        }
    }

    fn spawn(&self) -> Result<Child, GpuError> {
        let args = [QUERY, "--format=csv,noheader,nounits"];
        let spawn = |tool: &str| {
            Command::new(tool)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
        };
        match spawn(self.tool.as_str()) {
            Ok(child) => Ok(child),
            #[cfg(target_os = "windows")]
            Err(_) if self.tool == "nvidia-smi" => spawn(r"C:\Windows\System32\nvidia-smi.exe")
                .map_err(|source| GpuError::Spawn {
                    tool: self.tool.clone(),
                    source,
                }),
            Err(source) => Err(GpuError::Spawn {
                tool: self.tool.clone(),
                source,
            }),
        }
    }

    fn run(&self) -> Result<QueryOutput, GpuError> {
        let mut child = self.spawn()?;
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stdout = Vec::new();
                    let mut stderr = Vec::new();
                    if let Some(mut out) = child.stdout.take() {
                        let _ = out.read_to_end(&mut stdout);
                    }
                    if let Some(mut err) = child.stderr.take() {
                        let _ = err.read_to_end(&mut stderr);
                    }
                    return Ok(QueryOutput {
                        status,
                        stdout,
                        stderr,
                    });
                }
                Ok(None) => {
                    if start.elapsed() >= self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(GpuError::Timeout {
                            tool: self.tool.clone(),
                            after_ms: self.timeout.as_millis(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GpuError::Spawn {
                        tool: self.tool.clone(),
                        source,
                    });
                }
            }
        }
    }
}

impl GpuSource for NvidiaSmi {
    fn read_gpu(&mut self) -> Result<GpuReading, GpuError> {
        let output = self.run()?;
        if !output.status.success() {
            return Err(GpuError::Exit {
                tool: self.tool.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_query_output(&text, self.index)
    }
}

pub fn parse_query_output(text: &str, index: u32) -> Result<GpuReading, GpuError> {
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            return Err(GpuError::Parse(line.to_string()));
        }
        if parts[0].parse::<u32>().ok() != Some(index) {
            continue;
        }

        // "[N/A]" and "[Not Supported]" show up on some boards; treat as a failed query.
        let utilization = parse_f64_loose(parts[1]).filter(|v| v.is_finite());
        let temperature = parse_f64_loose(parts[2]).filter(|v| v.is_finite());
        return match (utilization, temperature) {
            (Some(utilization_percent), Some(temperature_celsius)) => Ok(GpuReading {
                utilization_percent,
                temperature_celsius,
            }),
            _ => Err(GpuError::Parse(line.to_string())),
        };
    }
    Err(GpuError::DeviceNotFound { index })
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
