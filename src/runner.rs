use crate::aggregator::Aggregator;
use crate::frame::encode;
use crate::sample::{FrameLayout, GpuCapability};
use crate::transport::FrameSink;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Interrupted,
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub ticks: u64,
    pub frames_sent: u64,
    pub failed_ticks: u64,
    pub exit: ExitReason,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub settle_delay: Duration,
    pub interval: Duration,
}

enum TickOutcome {
    Sent,
    Failed,
    LinkLost,
}

pub struct SamplingLoop<S: FrameSink> {
    aggregator: Aggregator,
    sink: S,
    layout: FrameLayout,
    timing: LoopTiming,
    phase: Phase,
}

impl<S: FrameSink> SamplingLoop<S> {
    pub fn new(aggregator: Aggregator, sink: S, layout: FrameLayout, timing: LoopTiming) -> Self {
        Self {
            aggregator,
            sink,
            layout,
            timing,
            phase: Phase::Starting,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopReport {
        let started = Instant::now();
        let mut report = LoopReport {
            ticks: 0,
            frames_sent: 0,
            failed_ticks: 0,
            exit: ExitReason::Interrupted,
        };

        debug!(
            settle_ms = self.timing.settle_delay.as_millis() as u64,
            "waiting for device to settle"
        );
        if wait_or_shutdown(&mut shutdown, self.timing.settle_delay).await {
            self.drain(&report, started);
            return report;
        }
        let mut capability = self.aggregator.detect_gpu();
        self.transition(Phase::Running);
        info!(
            layout = self.layout.as_str(),
            fields = self.layout.field_count(),
            gpu = capability.is_present(),
            "streaming telemetry"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            report.ticks += 1;
            match self.tick(&mut capability) {
                TickOutcome::Sent => report.frames_sent += 1,
                TickOutcome::Failed => report.failed_ticks += 1,
                TickOutcome::LinkLost => {
                    report.failed_ticks += 1;
                    report.exit = ExitReason::LinkLost;
                    break;
                }
            }

            if wait_or_shutdown(&mut shutdown, self.timing.interval).await {
                break;
            }
        }

        self.drain(&report, started);
        report
    }

    fn tick(&mut self, capability: &mut GpuCapability) -> TickOutcome {
        let sample = match self.aggregator.aggregate(capability) {
            Ok(sample) => sample,
            Err(err) => {
                error!(error = %err, "failed to sample host metrics, skipping tick");
                return TickOutcome::Failed;
            }
        };
        let frame = encode(&sample, self.layout);

        match self.sink.write_frame(&frame) {
            Ok(()) => {
                info!(frame = frame.trim_end(), "sent");
                TickOutcome::Sent
            }
            Err(err) if err.is_link_lost() => {
                error!(error = %err, "serial device gone, shutting down");
                TickOutcome::LinkLost
            }
            Err(err) => {
                warn!(error = %err, "frame not sent");
                TickOutcome::Failed
            }
        }
    }

    fn drain(&mut self, report: &LoopReport, started: Instant) {
        self.transition(Phase::Draining);
        self.sink.close();
        self.transition(Phase::Stopped);

        let uptime = Duration::from_secs(started.elapsed().as_secs());
        info!(
            ticks = report.ticks,
            frames_sent = report.frames_sent,
            failed_ticks = report.failed_ticks,
            exit = ?report.exit,
            uptime = %humantime::format_duration(uptime),
            "sampling loop stopped"
        );
    }

    fn transition(&mut self, next: Phase) {
        debug!(from = ?self.phase, to = ?next, "sampling loop phase");
        self.phase = next;
    }
}

// A dropped sender counts as shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(dur) => false,
    }
}
